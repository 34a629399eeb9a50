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
    path::{Path, PathBuf},
    sync::Mutex,
};

use bytes::Bytes;

use super::engine::{decode_table, encode_table, DbEngine, Op, WriteBatch};
use crate::Result;

const DUMP_FILE: &str = "dump.tbl";

/// Volatile [`DbEngine`] used by unit tests; checkpoints dump to a single
/// table file.
#[derive(Default)]
pub struct MemEngine {
    data: Mutex<BTreeMap<Vec<u8>, Bytes>>,
}

#[crate::async_trait]
impl DbEngine for MemEngine {
    async fn get(&self, key: &[u8]) -> Result<Option<Bytes>> {
        let data = self.data.lock().unwrap();
        Ok(data.get(key).cloned())
    }

    async fn write(&self, batch: WriteBatch) -> Result<()> {
        let mut data = self.data.lock().unwrap();
        for op in batch.mutations {
            match op {
                Op::Put((key, value)) => {
                    data.insert(key, value);
                }
                Op::Delete(key) => {
                    data.remove(&key);
                }
            }
        }
        Ok(())
    }

    async fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Bytes, Bytes)>> {
        let data = self.data.lock().unwrap();
        Ok(data
            .range(prefix.to_vec()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (Bytes::from(k.clone()), v.clone()))
            .collect())
    }

    async fn flush(&self) -> Result<()> {
        Ok(())
    }

    async fn checkpoint(&self, staging: &Path) -> Result<Vec<PathBuf>> {
        let image = {
            let data = self.data.lock().unwrap();
            encode_table(data.iter())
        };
        tokio::fs::create_dir_all(staging).await?;
        let path = staging.join(DUMP_FILE);
        tokio::fs::write(&path, &image).await?;
        Ok(vec![path])
    }

    async fn restore(&self, dir: &Path) -> Result<()> {
        let path = dir.join(DUMP_FILE);
        let raw = tokio::fs::read(&path).await?;
        let records = decode_table(DUMP_FILE, &raw)?;
        let mut data = self.data.lock().unwrap();
        data.clear();
        data.extend(records);
        Ok(())
    }
}
