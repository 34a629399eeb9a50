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

mod central;
mod distributed;
mod manager;

use serde::{Deserialize, Serialize};

pub use self::{
    central::{CentralStore, LocalDiskCentralStore},
    distributed::{DistributedCentralStorage, FileFetcher},
    manager::{CheckpointManager, CheckpointOptions},
};
use crate::Result;

/// One file of a checkpoint snapshot. `content_hash` is the lowercase hex
/// sha-256 of the file's bytes; incremental checkpoints reference prior
/// uploads through it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestFile {
    pub name: String,
    pub content_hash: String,
    pub size: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub checkpoint_id: String,
    pub epoch: String,
    /// Monotonically increasing within an epoch.
    pub sequence_number: u64,
    pub files: Vec<ManifestFile>,
}

impl Manifest {
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    pub fn decode(raw: &[u8]) -> Result<Manifest> {
        serde_json::from_slice(raw)
            .map_err(|err| crate::Error::Corrupt(format!("checkpoint manifest: {err}")))
    }
}

pub(crate) fn manifest_blob(checkpoints_key: &str, sequence: u64) -> String {
    format!("checkpoints/{checkpoints_key}/{sequence:020}.manifest")
}

pub(crate) fn manifest_prefix(checkpoints_key: &str) -> String {
    format!("checkpoints/{checkpoints_key}/")
}

pub(crate) fn file_blob(checkpoints_key: &str, epoch: &str, hash_hex: &str) -> String {
    format!("checkpoints/{checkpoints_key}/files/{epoch}/{hash_hex}")
}

pub(crate) fn parse_manifest_sequence(blob: &str) -> Option<u64> {
    let name = blob.rsplit('/').next()?;
    let digits = name.strip_suffix(".manifest")?;
    digits.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manifest_blob_names_sort_by_sequence() {
        let a = manifest_blob("default", 9);
        let b = manifest_blob("default", 10);
        assert!(a < b);
        assert_eq!(parse_manifest_sequence(&a), Some(9));
        assert_eq!(parse_manifest_sequence(&b), Some(10));
        assert_eq!(parse_manifest_sequence("checkpoints/default/files/e/ab"), None);
    }

    #[test]
    fn manifest_codec_round_trip() {
        let manifest = Manifest {
            checkpoint_id: "epoch-0:3".to_owned(),
            epoch: "epoch-0".to_owned(),
            sequence_number: 3,
            files: vec![ManifestFile {
                name: "shard-000.tbl".to_owned(),
                content_hash: "ab".repeat(32),
                size: 128,
            }],
        };
        let decoded = Manifest::decode(&manifest.encode().unwrap()).unwrap();
        assert_eq!(decoded, manifest);
        assert!(Manifest::decode(b"{not json").is_err());
    }
}
