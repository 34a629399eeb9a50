// Copyright 2022 The Engula Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

mod global;
mod mem;
mod raided;

use bytes::Bytes;

pub use self::{global::GlobalStore, mem::MemKv, raided::RaidedKv};
use crate::Result;

/// The shared key-value collaborator behind the global location store.
///
/// Implementations must provide an atomic compare-and-set; everything the
/// location service needs for machine allocation and lease election is built
/// on it.
#[crate::async_trait]
pub trait GlobalKv: Send + Sync {
    async fn get(&self, key: &[u8]) -> Result<Option<Bytes>>;

    /// Returns true iff the key was absent and has been set.
    async fn set_if_not_exists(&self, key: &[u8], value: Bytes) -> Result<bool>;

    /// Returns true iff the current value matched `expected` (`None` meaning
    /// absent) and has been replaced.
    async fn compare_and_set(
        &self,
        key: &[u8],
        expected: Option<&[u8]>,
        value: Bytes,
    ) -> Result<bool>;

    async fn scan(&self, prefix: &[u8]) -> Result<Vec<(Bytes, Bytes)>>;

    /// Returns true iff the key existed.
    async fn delete(&self, key: &[u8]) -> Result<bool>;

    /// Removes every key the predicate accepts, returning the count.
    async fn delete_matching(
        &self,
        predicate: &(dyn for<'r> Fn(&'r [u8]) -> bool + Send + Sync),
    ) -> Result<usize>;
}
