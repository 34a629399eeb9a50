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

use std::{path::Path, sync::Arc};

use tracing::debug;

use super::{CentralStore, ManifestFile};
use crate::{
    cluster::{ClusterHandle, MachineId, MachineLocation},
    counters::Counters,
    hash::{ContentHash, HashAlgorithm, ShortHash, CONTENT_HASH_LEN},
    store::LocationDb,
    Error, Result,
};

const MAX_PEER_ATTEMPTS: usize = 3;

/// Transfers one checkpoint file from a peer's local holdings.
#[crate::async_trait]
pub trait FileFetcher: Send + Sync {
    async fn fetch(&self, from: &MachineLocation, hash_hex: &str, dest: &Path) -> Result<()>;
}

/// Peer-assisted checkpoint storage: files are advertised through the
/// location index itself, so workers prefer pulling them from each other
/// over the central store.
pub struct DistributedCentralStorage {
    db: Arc<LocationDb>,
    cluster: ClusterHandle,
    fetcher: Arc<dyn FileFetcher>,
    machine: MachineId,
    counters: Arc<Counters>,
}

impl DistributedCentralStorage {
    pub fn new(
        db: Arc<LocationDb>,
        cluster: ClusterHandle,
        fetcher: Arc<dyn FileFetcher>,
        machine: MachineId,
        counters: Arc<Counters>,
    ) -> Self {
        DistributedCentralStorage {
            db,
            cluster,
            fetcher,
            machine,
            counters,
        }
    }

    fn short_of(file: &ManifestFile) -> Result<ShortHash> {
        let raw = hex::decode(&file.content_hash)
            .map_err(|_| Error::Corrupt(format!("manifest file hash '{}'", file.content_hash)))?;
        if raw.len() != CONTENT_HASH_LEN {
            return Err(Error::Corrupt(format!(
                "manifest file hash '{}'",
                file.content_hash
            )));
        }
        let mut bytes = [0u8; CONTENT_HASH_LEN];
        bytes.copy_from_slice(&raw);
        Ok(ContentHash::new(HashAlgorithm::Sha256, bytes).short())
    }

    /// Records this machine as a holder of the file in the location index.
    pub async fn advertise(&self, file: &ManifestFile) -> Result<()> {
        let short = Self::short_of(file)?;
        self.db
            .location_added(&short, self.machine, file.size as i64)
            .await
    }

    /// Fetches `file` into `dest`, preferring live peers advertised in the
    /// index and falling back to the central store.
    pub async fn try_get_file(
        &self,
        file: &ManifestFile,
        blob: &str,
        dest: &Path,
        central: &Arc<dyn CentralStore>,
    ) -> Result<bool> {
        let short = Self::short_of(file)?;
        let cluster = self.cluster.current();
        let peers = match self.db.try_get(&short).await? {
            Some(entry) => entry
                .machines
                .iter()
                .filter(|peer| *peer != self.machine)
                .filter(|peer| {
                    cluster
                        .as_ref()
                        .map(|state| !state.is_inactive(*peer))
                        .unwrap_or(false)
                })
                .filter_map(|peer| {
                    cluster
                        .as_ref()
                        .and_then(|state| state.location_of(peer).cloned())
                })
                .collect::<Vec<_>>(),
            None => Vec::new(),
        };

        for location in peers.into_iter().take(MAX_PEER_ATTEMPTS) {
            match self
                .fetcher
                .fetch(&location, &file.content_hash, dest)
                .await
            {
                Ok(()) => {
                    self.counters.file_from_peer.inc();
                    return Ok(true);
                }
                Err(err) => {
                    debug!(peer = %location, err = ?err, "peer checkpoint fetch failed");
                }
            }
        }

        if central.try_get_file(blob, dest).await? {
            self.counters.file_from_fallback.inc();
            return Ok(true);
        }
        Ok(false)
    }
}
