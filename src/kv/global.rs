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

use std::sync::Arc;

use bytes::Bytes;

use crate::{
    cluster::{ClusterStateRecord, MachineId, MachineLocation},
    hash::ShortHash,
    kv::GlobalKv,
    store::{Entry, UNKNOWN_SIZE},
    time::{Clock, UnixMillis},
    Error, Result,
};

const CAS_ATTEMPTS: usize = 16;

/// The global location store: location entries, cluster state and the master
/// lease, all layered over a [`GlobalKv`] (normally the raided pair).
pub struct GlobalStore {
    kv: Arc<dyn GlobalKv>,
    prefix: String,
    epoch: String,
    clock: Arc<dyn Clock>,
}

impl GlobalStore {
    pub fn new(
        kv: Arc<dyn GlobalKv>,
        prefix: impl Into<String>,
        epoch: impl Into<String>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        GlobalStore {
            kv,
            prefix: prefix.into(),
            epoch: epoch.into(),
            clock,
        }
    }

    pub fn kv(&self) -> &Arc<dyn GlobalKv> {
        &self.kv
    }

    pub fn epoch(&self) -> &str {
        &self.epoch
    }

    pub fn location_key(&self, hash: &ShortHash) -> Vec<u8> {
        format!("{}loc/{}", self.prefix, hash).into_bytes()
    }

    pub fn cluster_state_key(&self) -> Vec<u8> {
        format!("{}clusterState/v{}", self.prefix, self.epoch).into_bytes()
    }

    pub fn master_lease_key(&self) -> Vec<u8> {
        format!("{}masterLease/v{}", self.prefix, self.epoch).into_bytes()
    }

    // ---- cluster state ----

    pub async fn read_cluster_record(&self) -> Result<ClusterStateRecord> {
        let key = self.cluster_state_key();
        match self.kv.get(&key).await? {
            Some(raw) => Ok(serde_json::from_slice(&raw)?),
            None => Ok(ClusterStateRecord::new(self.epoch.clone())),
        }
    }

    /// Read-modify-write of the cluster-state record through the KV's CAS.
    pub async fn update_cluster_record<R>(
        &self,
        mutate: impl Fn(&mut ClusterStateRecord) -> R,
    ) -> Result<(ClusterStateRecord, R)> {
        let key = self.cluster_state_key();
        for _ in 0..CAS_ATTEMPTS {
            let current = self.kv.get(&key).await?;
            let mut record = match &current {
                Some(raw) => serde_json::from_slice(raw)?,
                None => ClusterStateRecord::new(self.epoch.clone()),
            };
            let output = mutate(&mut record);
            let encoded = Bytes::from(serde_json::to_vec(&record)?);
            if self
                .kv
                .compare_and_set(&key, current.as_deref(), encoded)
                .await?
            {
                return Ok((record, output));
            }
        }
        Err(Error::Transient(
            "cluster state update lost every cas race".to_owned(),
        ))
    }

    /// Idempotent: an already-bound location gets its existing id back.
    pub async fn register_machine(&self, location: &MachineLocation) -> Result<MachineId> {
        let (_, machine) = self
            .update_cluster_record(|record| record.register(location))
            .await?;
        Ok(machine)
    }

    pub async fn heartbeat(&self, machine: MachineId) -> Result<ClusterStateRecord> {
        let now = self.clock.now();
        let (record, _) = self
            .update_cluster_record(|record| record.heartbeat(machine, now))
            .await?;
        Ok(record)
    }

    // ---- location entries ----

    pub async fn get_bulk(&self, hashes: &[ShortHash]) -> Result<Vec<Option<Entry>>> {
        let mut entries = Vec::with_capacity(hashes.len());
        for hash in hashes {
            let key = self.location_key(hash);
            let entry = match self.kv.get(&key).await? {
                Some(raw) => Some(Entry::decode(&raw)?),
                None => None,
            };
            entries.push(entry);
        }
        Ok(entries)
    }

    /// Sets the machine bit for each hash, recording sizes first seen.
    pub async fn register_location(
        &self,
        machine: MachineId,
        items: &[(ShortHash, i64)],
    ) -> Result<()> {
        let now = self.clock.now();
        for (hash, size) in items {
            self.mutate_entry(hash, now, |entry| {
                entry.set_location(machine);
                entry.observe_size(*size);
                entry.touch(now);
            })
            .await?;
        }
        Ok(())
    }

    /// Clears this machine's bit for each hash. Unknown hashes are ignored.
    pub async fn trim_bulk(&self, machine: MachineId, hashes: &[ShortHash]) -> Result<()> {
        for hash in hashes {
            let key = self.location_key(hash);
            for _ in 0..CAS_ATTEMPTS {
                let current = match self.kv.get(&key).await? {
                    Some(raw) => raw,
                    None => break,
                };
                let mut entry = Entry::decode(&current)?;
                if !entry.clear_location(machine) {
                    break;
                }
                let encoded = entry.encode();
                if self
                    .kv
                    .compare_and_set(&key, Some(current.as_ref()), encoded)
                    .await?
                {
                    break;
                }
            }
        }
        Ok(())
    }

    pub async fn touch_bulk(&self, hashes: &[ShortHash], now: UnixMillis) -> Result<()> {
        for hash in hashes {
            let key = self.location_key(hash);
            if self.kv.get(&key).await?.is_some() {
                self.mutate_entry(hash, now, |entry| entry.touch(now)).await?;
            }
        }
        Ok(())
    }

    async fn mutate_entry(
        &self,
        hash: &ShortHash,
        now: UnixMillis,
        mutate: impl Fn(&mut Entry),
    ) -> Result<()> {
        let key = self.location_key(hash);
        for _ in 0..CAS_ATTEMPTS {
            let current = self.kv.get(&key).await?;
            let mut entry = match &current {
                Some(raw) => Entry::decode(raw)?,
                None => Entry::new(UNKNOWN_SIZE, now),
            };
            mutate(&mut entry);
            let encoded = entry.encode();
            if self
                .kv
                .compare_and_set(&key, current.as_deref(), encoded)
                .await?
            {
                return Ok(());
            }
        }
        Err(Error::Transient(format!(
            "location update for {hash} lost every cas race"
        )))
    }
}
