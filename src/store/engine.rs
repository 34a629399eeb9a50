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

use std::path::{Path, PathBuf};

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::{Error, Result};

pub(crate) enum Op {
    Put((Vec<u8>, Bytes)),
    Delete(Vec<u8>),
}

/// An atomic multi-key mutation applied to a [`DbEngine`].
#[derive(Default)]
pub struct WriteBatch {
    pub(crate) mutations: Vec<Op>,
}

impl WriteBatch {
    pub fn put(&mut self, key: Vec<u8>, value: Bytes) {
        self.mutations.push(Op::Put((key, value)));
    }

    pub fn delete(&mut self, key: Vec<u8>) {
        self.mutations.push(Op::Delete(key));
    }

    pub fn is_empty(&self) -> bool {
        self.mutations.is_empty()
    }

    pub fn len(&self) -> usize {
        self.mutations.len()
    }
}

/// The persistent layer under the location db. Opaque to callers; supports
/// range scans, atomic write batches, and snapshotting for checkpoints.
#[crate::async_trait]
pub trait DbEngine: Send + Sync {
    async fn get(&self, key: &[u8]) -> Result<Option<Bytes>>;

    async fn write(&self, batch: WriteBatch) -> Result<()>;

    async fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Bytes, Bytes)>>;

    /// Makes every applied batch durable.
    async fn flush(&self) -> Result<()>;

    /// Writes a consistent snapshot of the database into `staging` and
    /// returns the snapshot's files.
    async fn checkpoint(&self, staging: &Path) -> Result<Vec<PathBuf>>;

    /// Replaces the database contents with the snapshot found in `dir`.
    async fn restore(&self, dir: &Path) -> Result<()>;
}

const TABLE_MAGIC: &[u8; 8] = b"LOCTBL01";

/// Serializes sorted records into a table file image.
pub(crate) fn encode_table<'a>(
    records: impl Iterator<Item = (&'a Vec<u8>, &'a Bytes)>,
) -> Bytes {
    let mut buf = BytesMut::new();
    buf.put_slice(TABLE_MAGIC);
    for (key, value) in records {
        buf.put_u32(key.len() as u32);
        buf.put_u32(value.len() as u32);
        buf.put_slice(key);
        buf.put_slice(value);
    }
    buf.freeze()
}

pub(crate) fn decode_table(name: &str, mut raw: &[u8]) -> Result<Vec<(Vec<u8>, Bytes)>> {
    if raw.remaining() < TABLE_MAGIC.len() || &raw[..TABLE_MAGIC.len()] != TABLE_MAGIC {
        return Err(Error::Corrupt(format!("table {name} header")));
    }
    raw.advance(TABLE_MAGIC.len());
    let mut records = Vec::new();
    while raw.has_remaining() {
        if raw.remaining() < 8 {
            return Err(Error::Corrupt(format!("table {name} record header")));
        }
        let key_len = raw.get_u32() as usize;
        let value_len = raw.get_u32() as usize;
        if raw.remaining() < key_len + value_len {
            return Err(Error::Corrupt(format!("table {name} record body")));
        }
        let key = raw[..key_len].to_vec();
        raw.advance(key_len);
        let value = Bytes::copy_from_slice(&raw[..value_len]);
        raw.advance(value_len);
        records.push((key, value));
    }
    Ok(records)
}
