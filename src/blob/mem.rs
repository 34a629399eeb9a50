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

use std::{collections::HashMap, sync::Mutex};

use super::BlobStore;
use crate::{hash::ContentHash, time::UnixMillis, Result};

#[derive(Clone, Copy, Debug)]
struct BlobInfo {
    size: i64,
    last_access_time: UnixMillis,
}

/// In-memory [`BlobStore`] for tests and the integration harness.
#[derive(Default)]
pub struct MemBlobStore {
    blobs: Mutex<HashMap<ContentHash, BlobInfo>>,
}

impl MemBlobStore {
    pub fn put(&self, hash: ContentHash, size: i64, now: UnixMillis) {
        let mut blobs = self.blobs.lock().unwrap();
        blobs.insert(
            hash,
            BlobInfo {
                size,
                last_access_time: now,
            },
        );
    }

    pub fn remove(&self, hash: &ContentHash) -> bool {
        self.blobs.lock().unwrap().remove(hash).is_some()
    }

    pub fn access(&self, hash: &ContentHash, now: UnixMillis) {
        let mut blobs = self.blobs.lock().unwrap();
        if let Some(info) = blobs.get_mut(hash) {
            info.last_access_time = now;
        }
    }

    pub fn len(&self) -> usize {
        self.blobs.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.lock().unwrap().is_empty()
    }
}

#[crate::async_trait]
impl BlobStore for MemBlobStore {
    async fn enumerate_local_hashes(&self) -> Result<Vec<(ContentHash, i64)>> {
        let blobs = self.blobs.lock().unwrap();
        let mut hashes = blobs
            .iter()
            .map(|(hash, info)| (*hash, info.size))
            .collect::<Vec<_>>();
        hashes.sort_by_key(|(hash, _)| *hash);
        Ok(hashes)
    }

    async fn contains(&self, hash: &ContentHash) -> Result<bool> {
        Ok(self.blobs.lock().unwrap().contains_key(hash))
    }

    async fn last_access_time(&self, hash: &ContentHash) -> Result<Option<UnixMillis>> {
        let blobs = self.blobs.lock().unwrap();
        Ok(blobs.get(hash).map(|info| info.last_access_time))
    }

    async fn size(&self, hash: &ContentHash) -> Result<Option<i64>> {
        let blobs = self.blobs.lock().unwrap();
        Ok(blobs.get(hash).map(|info| info.size))
    }
}
