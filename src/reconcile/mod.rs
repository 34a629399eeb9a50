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
    sync::{Arc, Mutex},
    time::Duration,
};

use tracing::{info, warn};

use crate::{
    blob::BlobStore,
    config::Config,
    counters::Counters,
    events::{AddItem, EventStore},
    store::LocationDb,
    time::{millis_between, Clock, UnixMillis},
    Result,
};

#[derive(Clone, Copy, Debug)]
pub struct ReconcilerOptions {
    pub max_cycle_size: usize,
    pub cycle_frequency: Duration,
    pub location_entry_expiry: Duration,
    pub allow_skip: bool,
    pub disabled: bool,
}

impl From<&Config> for ReconcilerOptions {
    fn from(cfg: &Config) -> Self {
        ReconcilerOptions {
            max_cycle_size: cfg.reconciliation_max_cycle_size,
            cycle_frequency: cfg.reconciliation_cycle_frequency,
            location_entry_expiry: cfg.location_entry_expiry,
            allow_skip: cfg.allow_skip_reconciliation,
            disabled: cfg.unsafe_disable_reconciliation,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReconcileSummary {
    pub skipped: bool,
    pub added: usize,
    pub removed: usize,
    /// Work pushed to the next cycle once the cycle budget filled up.
    pub deferred: usize,
}

#[derive(Default)]
struct ReconcileState {
    last_reconciled: Option<UnixMillis>,
    last_attempt: Option<UnixMillis>,
}

/// Converges the index's view of this machine with what is actually on
/// disk, one bounded cycle at a time.
pub struct Reconciler {
    db: Arc<LocationDb>,
    events: Arc<EventStore>,
    blob: Arc<dyn BlobStore>,
    opts: ReconcilerOptions,
    clock: Arc<dyn Clock>,
    counters: Arc<Counters>,
    state: Mutex<ReconcileState>,
}

impl Reconciler {
    pub fn new(
        db: Arc<LocationDb>,
        events: Arc<EventStore>,
        blob: Arc<dyn BlobStore>,
        opts: ReconcilerOptions,
        clock: Arc<dyn Clock>,
        counters: Arc<Counters>,
    ) -> Self {
        Reconciler {
            db,
            events,
            blob,
            opts,
            clock,
            counters,
            state: Mutex::new(ReconcileState::default()),
        }
    }

    /// Sets or clears the last-reconciled cursor.
    pub fn mark_reconciled(&self, reconciled: bool) {
        let mut state = self.state.lock().unwrap();
        state.last_reconciled = reconciled.then(|| self.clock.now());
    }

    /// True iff the cursor's timestamp is within the entry expiry window.
    pub fn is_reconcile_up_to_date(&self) -> bool {
        let state = self.state.lock().unwrap();
        state
            .last_reconciled
            .map(|at| {
                millis_between(at, self.clock.now())
                    <= self.opts.location_entry_expiry.as_millis() as u64
            })
            .unwrap_or(false)
    }

    pub async fn reconcile_if_due(&self, force: bool) -> Result<ReconcileSummary> {
        if self.opts.disabled {
            return Ok(ReconcileSummary {
                skipped: true,
                ..Default::default()
            });
        }
        let now = self.clock.now();
        if !force {
            if self.opts.allow_skip && self.is_reconcile_up_to_date() {
                return Ok(ReconcileSummary {
                    skipped: true,
                    ..Default::default()
                });
            }
            let too_soon = {
                let state = self.state.lock().unwrap();
                state
                    .last_attempt
                    .map(|at| {
                        millis_between(at, now) < self.opts.cycle_frequency.as_millis() as u64
                    })
                    .unwrap_or(false)
            };
            if too_soon {
                return Ok(ReconcileSummary {
                    skipped: true,
                    ..Default::default()
                });
            }
        }
        self.state.lock().unwrap().last_attempt = Some(now);

        let machine = self.events.machine();
        let on_disk = self
            .blob
            .enumerate_local_hashes()
            .await?
            .into_iter()
            .map(|(hash, size)| (hash.short(), size))
            .collect::<BTreeMap<_, _>>();
        let indexed = self
            .db
            .scan_entries()
            .await?
            .into_iter()
            .filter(|(_, entry)| entry.machines.contains(machine))
            .map(|(hash, _)| hash)
            .collect::<BTreeSet<_>>();

        // Both differences iterate in hash order, keeping cycles
        // deterministic.
        let to_add = on_disk
            .iter()
            .filter(|(hash, _)| !indexed.contains(*hash))
            .map(|(hash, size)| AddItem {
                hash: *hash,
                size: *size,
            });
        let to_remove = indexed.iter().filter(|hash| !on_disk.contains_key(*hash));

        // Additions count against the budget first.
        let mut adds = Vec::new();
        let mut removes = Vec::new();
        let mut deferred = 0usize;
        for item in to_add {
            if adds.len() < self.opts.max_cycle_size {
                adds.push(item);
            } else {
                deferred += 1;
            }
        }
        let remove_budget = self.opts.max_cycle_size - adds.len();
        for hash in to_remove {
            if removes.len() < remove_budget {
                removes.push(*hash);
            } else {
                deferred += 1;
            }
        }

        if adds.is_empty() && removes.is_empty() && deferred == 0 {
            self.mark_reconciled(true);
            return Ok(ReconcileSummary {
                skipped: false,
                ..Default::default()
            });
        }

        let summary = ReconcileSummary {
            skipped: false,
            added: adds.len(),
            removed: removes.len(),
            deferred,
        };
        self.events.publish_reconcile(adds, removes).await?;
        self.counters.reconciliation_cycles.inc();
        self.mark_reconciled(deferred == 0);
        if deferred > 0 {
            warn!(deferred, "reconciliation cycle budget filled, deferring");
        }
        info!(
            added = summary.added,
            removed = summary.removed,
            deferred = summary.deferred,
            "reconciliation cycle published"
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        blob::MemBlobStore,
        cluster::MachineId,
        events::{EventDispatcher, EventHub, EventStoreOptions, MemHub},
        hash::{ContentHash, HashAlgorithm},
        kv::{GlobalStore, MemKv},
        store::MemEngine,
        time::ManualClock,
    };

    fn hash_of(byte: u8) -> ContentHash {
        ContentHash::new(HashAlgorithm::Vso0, [byte; 32])
    }

    struct Fixture {
        clock: ManualClock,
        hub: Arc<MemHub>,
        db: Arc<LocationDb>,
        blob: Arc<MemBlobStore>,
        reconciler: Reconciler,
    }

    fn fixture(max_cycle_size: usize) -> Fixture {
        let clock = ManualClock::new(1_000_000);
        let counters = Counters::new();
        let hub = Arc::new(MemHub::default());
        let db = Arc::new(LocationDb::new(
            Arc::new(MemEngine::default()),
            Arc::new(clock.clone()),
            1_000,
            Duration::from_secs(3600),
        ));
        let global = Arc::new(GlobalStore::new(
            Arc::new(MemKv::default()),
            "",
            "epoch-0",
            Arc::new(clock.clone()),
        ));
        let events = Arc::new(EventStore::new(
            hub.clone(),
            global,
            db.clone(),
            MachineId(1),
            "epoch-0",
            EventStoreOptions {
                machine_location_update_window: Duration::from_secs(300),
                touch_frequency: Duration::from_secs(600),
                safe_to_lazily_update_machine_count_threshold: 8,
            },
            Arc::new(clock.clone()),
            counters.clone(),
        ));
        let blob = Arc::new(MemBlobStore::default());
        let reconciler = Reconciler::new(
            db.clone(),
            events,
            blob.clone(),
            ReconcilerOptions {
                max_cycle_size,
                cycle_frequency: Duration::from_secs(0),
                location_entry_expiry: Duration::from_secs(3600),
                allow_skip: true,
                disabled: false,
            },
            Arc::new(clock.clone()),
            counters,
        );
        Fixture {
            clock,
            hub,
            db,
            blob,
            reconciler,
        }
    }

    #[tokio::test]
    async fn reconcile_converges_disk_and_index() {
        let f = fixture(1_000);
        // Ten hashes on disk the index has never heard of.
        for byte in 0..10u8 {
            f.blob.put(hash_of(byte), 64, f.clock.now());
        }
        // A phantom hash the index claims this machine holds.
        let phantom = hash_of(0xEE);
        f.db.location_added(&phantom.short(), MachineId(1), 64)
            .await
            .unwrap();

        let summary = f.reconciler.reconcile_if_due(false).await.unwrap();
        assert_eq!(summary.added, 10);
        assert_eq!(summary.removed, 1);
        assert_eq!(summary.deferred, 0);

        // A master applying the published cycle converges its view.
        let master_db = Arc::new(LocationDb::new(
            Arc::new(MemEngine::default()),
            Arc::new(f.clock.clone()),
            1_000,
            Duration::from_secs(3600),
        ));
        master_db
            .location_added(&phantom.short(), MachineId(1), 64)
            .await
            .unwrap();
        let dispatcher =
            EventDispatcher::new(f.hub.clone(), master_db.clone(), "epoch-0", Counters::new());
        dispatcher.poll_once(100).await.unwrap();

        for byte in 0..10u8 {
            let entry = master_db
                .try_get(&hash_of(byte).short())
                .await
                .unwrap()
                .unwrap();
            assert!(entry.machines.contains(MachineId(1)), "hash {byte}");
        }
        let entry = master_db.try_get(&phantom.short()).await.unwrap().unwrap();
        assert!(!entry.machines.contains(MachineId(1)));
    }

    #[tokio::test]
    async fn oversized_work_defers_to_next_cycle() {
        let f = fixture(4);
        for byte in 0..10u8 {
            f.blob.put(hash_of(byte), 64, f.clock.now());
        }
        let summary = f.reconciler.reconcile_if_due(false).await.unwrap();
        assert_eq!(summary.added, 4);
        assert_eq!(summary.deferred, 6);
        assert!(!f.reconciler.is_reconcile_up_to_date());
    }

    #[tokio::test]
    async fn up_to_date_machine_skips_until_forced() {
        let f = fixture(1_000);
        f.blob.put(hash_of(1), 64, f.clock.now());
        let first = f.reconciler.reconcile_if_due(false).await.unwrap();
        assert!(!first.skipped);
        assert!(f.reconciler.is_reconcile_up_to_date());

        let second = f.reconciler.reconcile_if_due(false).await.unwrap();
        assert!(second.skipped);

        let forced = f.reconciler.reconcile_if_due(true).await.unwrap();
        assert!(!forced.skipped);
    }

    #[tokio::test]
    async fn disabled_reconciliation_never_runs() {
        let mut f = fixture(1_000);
        f.reconciler.opts.disabled = true;
        f.blob.put(hash_of(1), 64, f.clock.now());
        let summary = f.reconciler.reconcile_if_due(true).await.unwrap();
        assert!(summary.skipped);
        assert_eq!(f.hub.last_cursor("epoch-0").await.unwrap(), 0);
    }
}
