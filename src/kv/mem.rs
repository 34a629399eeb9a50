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

use std::{
    collections::BTreeMap,
    sync::atomic::{AtomicBool, Ordering},
};

use bytes::Bytes;
use tokio::sync::Mutex;

use crate::{Error, Result};

/// In-memory [`crate::kv::GlobalKv`] backend. One instance stands in for one
/// shared KV server; tests hand the same instance to every machine.
pub struct MemKv {
    data: Mutex<BTreeMap<Vec<u8>, Bytes>>,
    failing: AtomicBool,
}

impl Default for MemKv {
    fn default() -> Self {
        MemKv {
            data: Mutex::new(BTreeMap::new()),
            failing: AtomicBool::new(false),
        }
    }
}

impl MemKv {
    /// Makes every operation fail with a transient error until cleared, to
    /// exercise the raided fallback paths.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check(&self) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::Transient("kv instance unavailable".to_owned()));
        }
        Ok(())
    }
}

#[crate::async_trait]
impl crate::kv::GlobalKv for MemKv {
    async fn get(&self, key: &[u8]) -> Result<Option<Bytes>> {
        self.check()?;
        let data = self.data.lock().await;
        Ok(data.get(key).cloned())
    }

    async fn set_if_not_exists(&self, key: &[u8], value: Bytes) -> Result<bool> {
        self.check()?;
        let mut data = self.data.lock().await;
        if data.contains_key(key) {
            return Ok(false);
        }
        data.insert(key.to_vec(), value);
        Ok(true)
    }

    async fn compare_and_set(
        &self,
        key: &[u8],
        expected: Option<&[u8]>,
        value: Bytes,
    ) -> Result<bool> {
        self.check()?;
        let mut data = self.data.lock().await;
        let current = data.get(key).map(|v| v.as_ref());
        if current != expected {
            return Ok(false);
        }
        data.insert(key.to_vec(), value);
        Ok(true)
    }

    async fn scan(&self, prefix: &[u8]) -> Result<Vec<(Bytes, Bytes)>> {
        self.check()?;
        let data = self.data.lock().await;
        Ok(data
            .range(prefix.to_vec()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (Bytes::from(k.clone()), v.clone()))
            .collect())
    }

    async fn delete(&self, key: &[u8]) -> Result<bool> {
        self.check()?;
        let mut data = self.data.lock().await;
        Ok(data.remove(key).is_some())
    }

    async fn delete_matching(
        &self,
        predicate: &(dyn for<'r> Fn(&'r [u8]) -> bool + Send + Sync),
    ) -> Result<usize> {
        self.check()?;
        let mut data = self.data.lock().await;
        let all_keys = data.keys().cloned().collect::<Vec<_>>();
        let mut doomed = Vec::new();
        for k in all_keys {
            if predicate(k.as_slice()) {
                doomed.push(k);
            }
        }
        for key in &doomed {
            data.remove(key);
        }
        Ok(doomed.len())
    }
}
