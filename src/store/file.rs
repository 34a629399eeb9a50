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
    collections::{BTreeMap, BTreeSet},
    path::{Path, PathBuf},
    sync::Mutex,
};

use bytes::Bytes;
use tracing::debug;

use super::engine::{decode_table, encode_table, DbEngine, Op, WriteBatch};
use crate::Result;

/// File-backed [`DbEngine`]. The working set lives in memory; flushes
/// rewrite only the shard table files touched since the last flush, so
/// unchanged shards keep their bytes (and content hash) across checkpoints.
pub struct FileEngine {
    dir: PathBuf,
    shard_count: usize,
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    map: BTreeMap<Vec<u8>, Bytes>,
    dirty: BTreeSet<usize>,
}

impl FileEngine {
    pub async fn open(dir: impl Into<PathBuf>, shard_count: usize) -> Result<FileEngine> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;
        let mut inner = Inner::default();
        for name in table_files(&dir).await? {
            let raw = tokio::fs::read(dir.join(&name)).await?;
            inner.map.extend(decode_table(&name, &raw)?);
        }
        debug!(dir = %dir.display(), entries = inner.map.len(), "opened file engine");
        Ok(FileEngine {
            dir,
            shard_count,
            inner: Mutex::new(inner),
        })
    }

    fn shard_of(&self, key: &[u8]) -> usize {
        let folded = key
            .iter()
            .fold(0u32, |acc, b| acc.wrapping_mul(31).wrapping_add(*b as u32));
        folded as usize % self.shard_count
    }

    fn shard_file(shard: usize) -> String {
        format!("shard-{shard:03}.tbl")
    }

    /// Snapshot of the dirty shards' contents, taken under the lock.
    fn collect_dirty(&self) -> Vec<(usize, Bytes)> {
        let mut inner = self.inner.lock().unwrap();
        let dirty = std::mem::take(&mut inner.dirty);
        dirty
            .into_iter()
            .map(|shard| {
                let image = encode_table(
                    inner
                        .map
                        .iter()
                        .filter(|(key, _)| self.shard_of(key) == shard),
                );
                (shard, image)
            })
            .collect()
    }

    async fn write_shards(&self, shards: Vec<(usize, Bytes)>) -> Result<()> {
        for (shard, image) in shards {
            let name = Self::shard_file(shard);
            let path = self.dir.join(&name);
            // Empty shards drop their file so checkpoints only ship data.
            if image.len() == TABLE_HEADER_LEN {
                if tokio::fs::try_exists(&path).await? {
                    tokio::fs::remove_file(&path).await?;
                }
                continue;
            }
            let tmp = self.dir.join(format!("{name}.tmp"));
            tokio::fs::write(&tmp, &image).await?;
            tokio::fs::rename(&tmp, &path).await?;
        }
        Ok(())
    }
}

const TABLE_HEADER_LEN: usize = 8;

async fn table_files(dir: &Path) -> Result<Vec<String>> {
    let mut names = Vec::new();
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.ends_with(".tbl") {
            names.push(name);
        }
    }
    names.sort();
    Ok(names)
}

#[crate::async_trait]
impl DbEngine for FileEngine {
    async fn get(&self, key: &[u8]) -> Result<Option<Bytes>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.map.get(key).cloned())
    }

    async fn write(&self, batch: WriteBatch) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        for op in batch.mutations {
            match op {
                Op::Put((key, value)) => {
                    let shard = self.shard_of(&key);
                    inner.map.insert(key, value);
                    inner.dirty.insert(shard);
                }
                Op::Delete(key) => {
                    if inner.map.remove(&key).is_some() {
                        let shard = self.shard_of(&key);
                        inner.dirty.insert(shard);
                    }
                }
            }
        }
        Ok(())
    }

    async fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Bytes, Bytes)>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .map
            .range(prefix.to_vec()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (Bytes::from(k.clone()), v.clone()))
            .collect())
    }

    async fn flush(&self) -> Result<()> {
        let shards = self.collect_dirty();
        self.write_shards(shards).await
    }

    async fn checkpoint(&self, staging: &Path) -> Result<Vec<PathBuf>> {
        self.flush().await?;
        tokio::fs::create_dir_all(staging).await?;
        let mut files = Vec::new();
        for name in table_files(&self.dir).await? {
            let dest = staging.join(&name);
            tokio::fs::copy(self.dir.join(&name), &dest).await?;
            files.push(dest);
        }
        Ok(files)
    }

    async fn restore(&self, dir: &Path) -> Result<()> {
        let mut map = BTreeMap::new();
        for name in table_files(dir).await? {
            let raw = tokio::fs::read(dir.join(&name)).await?;
            map.extend(decode_table(&name, &raw)?);
        }
        {
            let mut inner = self.inner.lock().unwrap();
            inner.map = map;
            inner.dirty = (0..self.shard_count).collect();
        }
        // Drop any shard file the snapshot no longer covers, then persist.
        for name in table_files(&self.dir).await? {
            tokio::fs::remove_file(self.dir.join(&name)).await?;
        }
        self.flush().await
    }
}
