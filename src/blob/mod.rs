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

mod mem;

pub use self::mem::MemBlobStore;
use crate::{hash::ContentHash, time::UnixMillis, Result};

/// The slice of the on-disk blob store this plane consumes. Streaming and
/// placement stay with the store itself.
#[crate::async_trait]
pub trait BlobStore: Send + Sync {
    /// Every hash currently on disk, with its size.
    async fn enumerate_local_hashes(&self) -> Result<Vec<(ContentHash, i64)>>;

    async fn contains(&self, hash: &ContentHash) -> Result<bool>;

    async fn last_access_time(&self, hash: &ContentHash) -> Result<Option<UnixMillis>>;

    async fn size(&self, hash: &ContentHash) -> Result<Option<i64>>;
}
