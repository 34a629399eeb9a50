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

mod engine;
mod entry;
mod file;
mod mem;
mod write_cache;

use std::{
    path::{Path, PathBuf},
    sync::{Arc, RwLock},
    time::Duration,
};

use tracing::{debug, info};

pub use self::{
    engine::{DbEngine, WriteBatch},
    entry::{Entry, MachineSet, UNKNOWN_SIZE},
    file::FileEngine,
    mem::MemEngine,
};
use self::write_cache::WriteCache;
use crate::{
    cluster::{ClusterState, ClusterStateRecord, MachineId},
    hash::ShortHash,
    metrics,
    time::{millis_between, Clock, UnixMillis},
    Result,
};

const LOC_PREFIX: &[u8] = b"loc/";
const CLUSTER_STATE_KEY: &[u8] = b"clusterState";

fn entry_key(hash: &ShortHash) -> Vec<u8> {
    let mut key = Vec::with_capacity(LOC_PREFIX.len() + 12);
    key.extend_from_slice(LOC_PREFIX);
    key.extend_from_slice(&hash.encode());
    key
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GcSummary {
    pub scanned: usize,
    /// Entries rewritten with inactive machine bits masked out.
    pub cleaned: usize,
    /// Entries deleted outright.
    pub collected: usize,
}

/// The local location store: a persistent short-hash -> entry map fronted by
/// a bounded coalescing write cache.
pub struct LocationDb {
    engine: Arc<dyn DbEngine>,
    cache: RwLock<WriteCache>,
    /// Serializes cache writers; readers only take the map lock.
    writer: tokio::sync::Mutex<()>,
    clock: Arc<dyn Clock>,
    flush_threshold: usize,
    entry_expiry: Duration,
    last_flush: RwLock<UnixMillis>,
}

impl LocationDb {
    pub fn new(
        engine: Arc<dyn DbEngine>,
        clock: Arc<dyn Clock>,
        flush_threshold: usize,
        entry_expiry: Duration,
    ) -> Self {
        let now = clock.now();
        LocationDb {
            engine,
            cache: RwLock::new(WriteCache::default()),
            writer: tokio::sync::Mutex::new(()),
            clock,
            flush_threshold,
            entry_expiry,
            last_flush: RwLock::new(now),
        }
    }

    pub async fn try_get(&self, hash: &ShortHash) -> Result<Option<Entry>> {
        if let Some(entry) = self.cache.read().unwrap().get(hash) {
            return Ok(Some(entry));
        }
        match self.engine.get(&entry_key(hash)).await? {
            Some(raw) => Ok(Some(Entry::decode(&raw)?)),
            None => Ok(None),
        }
    }

    pub async fn location_added(
        &self,
        hash: &ShortHash,
        machine: MachineId,
        size: i64,
    ) -> Result<()> {
        let now = self.clock.now();
        self.mutate(hash, |entry| {
            entry.set_location(machine);
            entry.observe_size(size);
            entry.touch(now);
        })
        .await
    }

    pub async fn location_removed(&self, hash: &ShortHash, machine: MachineId) -> Result<()> {
        self.mutate(hash, |entry| {
            entry.clear_location(machine);
        })
        .await
    }

    pub async fn touch(&self, hash: &ShortHash) -> Result<()> {
        let now = self.clock.now();
        self.mutate(hash, |entry| entry.touch(now)).await
    }

    /// Applies a size observation without claiming a location bit.
    pub async fn metadata_updated(&self, hash: &ShortHash, size: i64) -> Result<()> {
        let now = self.clock.now();
        self.mutate(hash, |entry| {
            entry.observe_size(size);
            entry.touch(now);
        })
        .await
    }

    async fn mutate(&self, hash: &ShortHash, apply: impl FnOnce(&mut Entry)) -> Result<()> {
        let _writer = self.writer.lock().await;
        let cached = self.cache.read().unwrap().get(hash);
        let mut entry = match cached {
            Some(entry) => entry,
            None => match self.engine.get(&entry_key(hash)).await? {
                Some(raw) => Entry::decode(&raw)?,
                None => Entry::new(UNKNOWN_SIZE, self.clock.now()),
            },
        };
        apply(&mut entry);
        let over_threshold = {
            let mut cache = self.cache.write().unwrap();
            cache.insert(*hash, entry);
            cache.len() >= self.flush_threshold
        };
        if over_threshold {
            self.flush_locked().await?;
        }
        Ok(())
    }

    /// Drains the write cache into the persistent layer.
    pub async fn force_cache_flush(&self) -> Result<()> {
        let _writer = self.writer.lock().await;
        self.flush_locked().await
    }

    /// Drains the cache when `interval` has passed since the last drain.
    pub async fn flush_if_due(&self, interval: Duration) -> Result<bool> {
        let now = self.clock.now();
        let due = {
            let last = self.last_flush.read().unwrap();
            millis_between(*last, now) >= interval.as_millis() as u64
        };
        if due {
            self.force_cache_flush().await?;
        }
        Ok(due)
    }

    async fn flush_locked(&self) -> Result<()> {
        let drained = self.cache.write().unwrap().drain();
        if !drained.is_empty() {
            let mut batch = WriteBatch::default();
            for (hash, entry) in drained {
                batch.put(entry_key(&hash), entry.encode());
            }
            debug!(entries = batch.len(), "flushing location write cache");
            self.engine.write(batch).await?;
        }
        self.engine.flush().await?;
        *self.last_flush.write().unwrap() = self.clock.now();
        Ok(())
    }

    /// Removes entries with no live location: empty bitsets past the entry
    /// expiry and bitsets whose every machine is inactive. Entries with a
    /// mix of live and inactive machines get the inactive bits masked out.
    pub async fn garbage_collect(&self, cluster: &ClusterState) -> Result<GcSummary> {
        let _timer = metrics::GC_DURATION_SECONDS.start_timer();
        let _writer = self.writer.lock().await;
        self.flush_locked().await?;

        let now = self.clock.now();
        let expiry = self.entry_expiry.as_millis() as u64;
        let mut summary = GcSummary::default();
        let mut batch = WriteBatch::default();
        for (key, raw) in self.engine.scan_prefix(LOC_PREFIX).await? {
            summary.scanned += 1;
            let mut entry = Entry::decode(&raw)?;
            if entry.machines.is_empty() {
                if millis_between(entry.last_access_time, now) > expiry {
                    batch.delete(key.to_vec());
                    summary.collected += 1;
                }
            } else if entry.machines.is_subset_of(&cluster.inactive) {
                batch.delete(key.to_vec());
                summary.collected += 1;
            } else if entry.machines.mask_out(&cluster.inactive) > 0 {
                batch.put(key.to_vec(), entry.encode());
                summary.cleaned += 1;
            }
        }
        if !batch.is_empty() {
            self.engine.write(batch).await?;
        }
        info!(
            scanned = summary.scanned,
            cleaned = summary.cleaned,
            collected = summary.collected,
            "location db garbage collection"
        );
        Ok(summary)
    }

    /// Every persisted entry, cache drained first. Used by reconciliation
    /// and the integration harness; not a hot path.
    pub async fn scan_entries(&self) -> Result<Vec<(ShortHash, Entry)>> {
        self.force_cache_flush().await?;
        let mut entries = Vec::new();
        for (key, raw) in self.engine.scan_prefix(LOC_PREFIX).await? {
            let hash = ShortHash::decode(&key[LOC_PREFIX.len()..])?;
            entries.push((hash, Entry::decode(&raw)?));
        }
        Ok(entries)
    }

    // ---- cluster state mirror ----

    pub async fn write_cluster_state(&self, record: &ClusterStateRecord) -> Result<()> {
        let mut batch = WriteBatch::default();
        batch.put(
            CLUSTER_STATE_KEY.to_vec(),
            bytes::Bytes::from(serde_json::to_vec(record)?),
        );
        self.engine.write(batch).await
    }

    pub async fn read_cluster_state(&self) -> Result<Option<ClusterStateRecord>> {
        match self.engine.get(CLUSTER_STATE_KEY).await? {
            Some(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            None => Ok(None),
        }
    }

    // ---- checkpointing ----

    pub async fn checkpoint(&self, staging: &Path) -> Result<Vec<PathBuf>> {
        let _writer = self.writer.lock().await;
        self.flush_locked().await?;
        self.engine.checkpoint(staging).await
    }

    pub async fn restore(&self, dir: &Path) -> Result<()> {
        let _writer = self.writer.lock().await;
        self.cache.write().unwrap().clear();
        self.engine.restore(dir).await
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;
    use crate::{
        hash::{ContentHash, HashAlgorithm},
        time::ManualClock,
    };

    fn short(byte: u8) -> ShortHash {
        ContentHash::new(HashAlgorithm::Vso0, [byte; 32]).short()
    }

    fn db(clock: ManualClock) -> LocationDb {
        LocationDb::new(
            Arc::new(MemEngine::default()),
            Arc::new(clock),
            1_000,
            Duration::from_secs(3600),
        )
    }

    fn cluster_with_inactive(inactive: &[MachineId]) -> ClusterState {
        ClusterState {
            record: ClusterStateRecord::new("epoch-0"),
            inactive: inactive.iter().copied().collect::<BTreeSet<_>>(),
            observed_at: 0,
        }
    }

    #[tokio::test]
    async fn added_location_is_visible_before_and_after_flush() {
        let clock = ManualClock::new(1_000);
        let db = db(clock.clone());
        let hash = short(1);

        db.location_added(&hash, MachineId(2), 64).await.unwrap();
        let entry = db.try_get(&hash).await.unwrap().unwrap();
        assert!(entry.machines.contains(MachineId(2)));

        db.force_cache_flush().await.unwrap();
        let entry = db.try_get(&hash).await.unwrap().unwrap();
        assert!(entry.machines.contains(MachineId(2)));
        assert_eq!(entry.size, 64);
    }

    #[tokio::test]
    async fn touch_only_bumps_access_time() {
        let clock = ManualClock::new(1_000);
        let db = db(clock.clone());
        let hash = short(3);

        db.location_added(&hash, MachineId(1), 10).await.unwrap();
        clock.advance(Duration::from_secs(30));
        db.touch(&hash).await.unwrap();

        let entry = db.try_get(&hash).await.unwrap().unwrap();
        assert_eq!(entry.last_access_time, 31_000);
        assert_eq!(entry.creation_time, 1_000);
    }

    #[tokio::test]
    async fn gc_collects_empty_and_all_inactive_entries() {
        let clock = ManualClock::new(1_000);
        let db = db(clock.clone());
        let emptied = short(1);
        let dead = short(2);
        let mixed = short(3);

        db.location_added(&emptied, MachineId(1), 1).await.unwrap();
        db.location_removed(&emptied, MachineId(1)).await.unwrap();
        db.location_added(&dead, MachineId(7), 1).await.unwrap();
        db.location_added(&mixed, MachineId(7), 1).await.unwrap();
        db.location_added(&mixed, MachineId(8), 1).await.unwrap();

        // Empty entries linger until the entry expiry elapses.
        clock.advance(Duration::from_secs(3601));
        let summary = db
            .garbage_collect(&cluster_with_inactive(&[MachineId(7)]))
            .await
            .unwrap();

        assert_eq!(summary.scanned, 3);
        assert_eq!(summary.collected, 2);
        assert_eq!(summary.cleaned, 1);
        assert!(db.try_get(&emptied).await.unwrap().is_none());
        assert!(db.try_get(&dead).await.unwrap().is_none());
        let entry = db.try_get(&mixed).await.unwrap().unwrap();
        assert!(!entry.machines.contains(MachineId(7)));
        assert!(entry.machines.contains(MachineId(8)));
    }

    #[tokio::test]
    async fn fresh_empty_entry_survives_gc() {
        let clock = ManualClock::new(1_000);
        let db = db(clock.clone());
        let hash = short(9);
        db.location_added(&hash, MachineId(1), 1).await.unwrap();
        db.location_removed(&hash, MachineId(1)).await.unwrap();

        let summary = db.garbage_collect(&cluster_with_inactive(&[])).await.unwrap();
        assert_eq!(summary.collected, 0);
        assert!(db.try_get(&hash).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn cluster_state_mirror_round_trip() {
        let clock = ManualClock::new(1_000);
        let db = db(clock);
        assert!(db.read_cluster_state().await.unwrap().is_none());

        let mut record = ClusterStateRecord::new("epoch-0");
        record.register(&crate::cluster::MachineLocation("node-a".to_owned()));
        db.write_cluster_state(&record).await.unwrap();
        assert_eq!(db.read_cluster_state().await.unwrap().unwrap(), record);
    }
}
