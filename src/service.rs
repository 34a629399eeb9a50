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
    path::PathBuf,
    sync::{Arc, Mutex},
};

use tracing::{info, warn};

use crate::{
    blob::BlobStore,
    checkpoint::{
        CentralStore, CheckpointManager, CheckpointOptions, DistributedCentralStorage,
        FileFetcher,
    },
    cluster::{ClusterHandle, ClusterState, MachineId, MachineLocation},
    config::Config,
    copy::{CopyClient, ProactiveCopyEngine},
    counters::Counters,
    events::{AddItem, EventDispatcher, EventHub, EventStore},
    evict::EvictionRanker,
    hash::{ContentHash, ShortHash},
    kv::{GlobalKv, GlobalStore, RaidedKv},
    metrics,
    reconcile::{ReconcileSummary, Reconciler},
    role::{MasterElection, Role},
    store::{DbEngine, Entry, GcSummary, LocationDb},
    time::{millis_between, Clock, UnixMillis},
    Error, Result,
};

const MAX_DISPATCH_BATCHES: usize = 1024;

/// External collaborators injected at bootstrap. Production wires real
/// back-ends; the integration harness hands every machine the same shared
/// in-memory instances.
pub struct Collaborators {
    pub kv_primary: Arc<dyn GlobalKv>,
    pub kv_secondary: Option<Arc<dyn GlobalKv>>,
    pub hub: Arc<dyn EventHub>,
    pub central: Arc<dyn CentralStore>,
    pub blob: Arc<dyn BlobStore>,
    pub copy_client: Arc<dyn CopyClient>,
    pub file_fetcher: Arc<dyn FileFetcher>,
    pub engine: Arc<dyn DbEngine>,
    pub clock: Arc<dyn Clock>,
    pub work_dir: PathBuf,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct HeartbeatSummary {
    pub role: Option<Role>,
    pub events_applied: usize,
    pub checkpoint_created: bool,
    pub checkpoint_restored: bool,
    pub gc: Option<GcSummary>,
    pub reconcile: Option<ReconcileSummary>,
    pub replicated: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GetBulkOrigin {
    /// Answer from the local db only.
    Local,
    /// Ask the global store for authoritative recent state.
    Global,
}

#[derive(Default)]
struct HeartbeatState {
    last_gc: Option<UnixMillis>,
    last_mirror: Option<UnixMillis>,
}

/// One machine's location service: the local db, its publisher/consumer
/// sides of the event log, election, checkpoints, reconciliation and the
/// copy engine, driven by [`LocationService::heartbeat`].
pub struct LocationService {
    cfg: Config,
    machine: MachineId,
    location: MachineLocation,
    clock: Arc<dyn Clock>,
    counters: Arc<Counters>,
    db: Arc<LocationDb>,
    global: Arc<GlobalStore>,
    events: Arc<EventStore>,
    dispatcher: EventDispatcher,
    election: MasterElection,
    checkpoints: CheckpointManager,
    reconciler: Reconciler,
    ranker: Arc<EvictionRanker>,
    copier: ProactiveCopyEngine,
    cluster: ClusterHandle,
    heartbeat_state: Mutex<HeartbeatState>,
}

impl LocationService {
    pub async fn bootstrap(
        cfg: Config,
        location: MachineLocation,
        collaborators: Collaborators,
    ) -> Result<Arc<LocationService>> {
        cfg.validate()?;
        let counters = Counters::new();
        let clock = collaborators.clock;

        let raided: Arc<dyn GlobalKv> = Arc::new(RaidedKv::new(
            collaborators.kv_primary,
            collaborators.kv_secondary,
            cfg.retry_window,
            counters.clone(),
        ));
        let global = Arc::new(GlobalStore::new(
            raided.clone(),
            cfg.key_space_prefix.clone(),
            cfg.event_hub_epoch.clone(),
            clock.clone(),
        ));
        let machine = global.register_machine(&location).await?;
        info!(machine = %machine, location = %location, "registered in cluster");

        let db = Arc::new(LocationDb::new(
            collaborators.engine,
            clock.clone(),
            cfg.db.cache_flush_threshold,
            cfg.location_entry_expiry,
        ));
        let events = Arc::new(EventStore::new(
            collaborators.hub.clone(),
            global.clone(),
            db.clone(),
            machine,
            cfg.event_hub_epoch.clone(),
            (&cfg).into(),
            clock.clone(),
            counters.clone(),
        ));
        let dispatcher = EventDispatcher::new(
            collaborators.hub,
            db.clone(),
            cfg.event_hub_epoch.clone(),
            counters.clone(),
        );
        let election = MasterElection::new(
            raided,
            global.master_lease_key(),
            machine,
            cfg.is_master_eligible,
            cfg.master_lease_expiry_time,
            cfg.master_lease_renewal_threshold,
            clock.clone(),
        );
        let cluster = ClusterHandle::default();
        let distributed = if cfg.use_distributed_central_storage {
            Some(Arc::new(DistributedCentralStorage::new(
                db.clone(),
                cluster.clone(),
                collaborators.file_fetcher,
                machine,
                counters.clone(),
            )))
        } else {
            None
        };
        let checkpoints = CheckpointManager::new(
            db.clone(),
            collaborators.central,
            distributed,
            CheckpointOptions::from_config(&cfg),
            collaborators.work_dir.join("checkpoints"),
            clock.clone(),
            counters.clone(),
        );
        let ranker = Arc::new(EvictionRanker::new(
            db.clone(),
            cfg.replica_credit,
            cfg.eviction_min_age,
            cfg.eviction_page_size,
            clock.clone(),
            counters.clone(),
        ));
        let reconciler = Reconciler::new(
            db.clone(),
            events.clone(),
            collaborators.blob.clone(),
            (&cfg).into(),
            clock.clone(),
            counters.clone(),
        );
        let copier = ProactiveCopyEngine::new(
            db.clone(),
            collaborators.blob,
            cluster.clone(),
            ranker.clone(),
            collaborators.copy_client,
            machine,
            location.clone(),
            (&cfg).into(),
            clock.clone(),
            counters.clone(),
        );

        Ok(Arc::new(LocationService {
            cfg,
            machine,
            location,
            clock,
            counters,
            db,
            global,
            events,
            dispatcher,
            election,
            checkpoints,
            reconciler,
            ranker,
            copier,
            cluster,
            heartbeat_state: Mutex::new(HeartbeatState::default()),
        }))
    }

    pub fn machine(&self) -> MachineId {
        self.machine
    }

    pub fn location(&self) -> &MachineLocation {
        &self.location
    }

    pub fn counters(&self) -> &Arc<Counters> {
        &self.counters
    }

    pub fn db(&self) -> &Arc<LocationDb> {
        &self.db
    }

    pub fn global(&self) -> &Arc<GlobalStore> {
        &self.global
    }

    pub fn ranker(&self) -> &Arc<EvictionRanker> {
        &self.ranker
    }

    pub fn reconciler(&self) -> &Reconciler {
        &self.reconciler
    }

    pub fn checkpoints(&self) -> &CheckpointManager {
        &self.checkpoints
    }

    pub fn cluster(&self) -> &ClusterHandle {
        &self.cluster
    }

    pub fn current_role(&self) -> Option<Role> {
        self.election.current_role()
    }

    /// One control-plane tick: cluster state, election, checkpoint work,
    /// cache flush, GC, reconciliation and background replication.
    pub async fn heartbeat(&self) -> Result<HeartbeatSummary> {
        let _timer = metrics::HEARTBEAT_DURATION_SECONDS.start_timer();
        match self.heartbeat_inner().await {
            Ok(summary) => Ok(summary),
            Err(err) => {
                metrics::HEARTBEAT_FAIL_TOTAL.inc();
                Err(err)
            }
        }
    }

    async fn heartbeat_inner(&self) -> Result<HeartbeatSummary> {
        let now = self.clock.now();
        let expiry = self.cfg.machine_expiry.as_millis() as u64;

        // A machine whose previous heartbeat aged out was masked from the
        // cluster; publish its re-appearing content eagerly for a window.
        let prior = self.global.read_cluster_record().await?;
        let was_inactive = prior
            .heartbeats
            .get(&self.machine.0)
            .map(|last| millis_between(*last, now) > expiry)
            .unwrap_or(false);
        if was_inactive {
            info!(machine = %self.machine, "re-joining after inactivity");
            self.events.mark_recently_inactive(
                now + self.cfg.machine_location_update_window.as_millis() as u64,
            );
        }

        let record = self.global.heartbeat(self.machine).await?;
        let state = ClusterState::from_record(record.clone(), self.cfg.machine_expiry, now);
        self.cluster.publish(state.clone());

        if self.cfg.store_cluster_state_in_database {
            let mirror_due = {
                let hb = self.heartbeat_state.lock().unwrap();
                hb.last_mirror
                    .map(|last| {
                        millis_between(last, now)
                            >= self.cfg.cluster_state_mirror_interval.as_millis() as u64
                    })
                    .unwrap_or(true)
            };
            if mirror_due {
                self.db.write_cluster_state(&record).await?;
                self.heartbeat_state.lock().unwrap().last_mirror = Some(now);
            }
        }

        let role = self.election.step().await?;
        let mut summary = HeartbeatSummary {
            role: Some(role),
            ..Default::default()
        };

        match role {
            Role::Master => {
                summary.events_applied = self.dispatcher.poll_once(MAX_DISPATCH_BATCHES).await?;
                summary.checkpoint_created =
                    self.checkpoints.create_if_due(false).await?.is_some();
            }
            Role::Worker => {
                summary.checkpoint_restored = match self.checkpoints.restore_if_due(false).await {
                    Ok(restored) => restored,
                    Err(err @ Error::Corrupt(_)) => {
                        warn!(err = %err, "checkpoint restore aborted, forcing full resync");
                        self.checkpoints.invalidate().await;
                        false
                    }
                    Err(err) => return Err(err),
                };
            }
        }

        self.db.flush_if_due(self.cfg.db.cache_flush_interval).await?;

        let gc_due = {
            let hb = self.heartbeat_state.lock().unwrap();
            hb.last_gc
                .map(|last| {
                    millis_between(last, now) >= self.cfg.db.gc_interval.as_millis() as u64
                })
                .unwrap_or(true)
        };
        if gc_due {
            summary.gc = Some(self.db.garbage_collect(&state).await?);
            self.heartbeat_state.lock().unwrap().last_gc = Some(now);
        }

        summary.reconcile = Some(self.reconciler.reconcile_if_due(false).await?);
        summary.replicated = self.copier.replicate_batch().await?;
        Ok(summary)
    }

    // ---- content entry points ----

    /// Local put: index the new blob and let the copy engine raise its
    /// replica count.
    pub async fn add_content(&self, hash: &ContentHash, size: i64) -> Result<()> {
        let short = hash.short();
        self.db.location_added(&short, self.machine, size).await?;
        self.events
            .notify_added(&[AddItem { hash: short, size }])
            .await?;
        if let Err(err) = self.copier.on_put(hash).await {
            // Replication is advisory on the put path.
            warn!(hash = %hash, err = ?err, "proactive copy on put failed");
        }
        Ok(())
    }

    /// Indexes content that arrived through a proactive copy. Same as a
    /// put, minus the copy trigger, so copies never cascade.
    pub async fn receive_copy(&self, hash: &ContentHash, size: i64) -> Result<()> {
        let short = hash.short();
        self.db.location_added(&short, self.machine, size).await?;
        self.events
            .notify_added(&[AddItem { hash: short, size }])
            .await
    }

    pub async fn remove_content(&self, hash: &ContentHash) -> Result<()> {
        let short = hash.short();
        self.db.location_removed(&short, self.machine).await?;
        self.events.notify_removed(&[short]).await
    }

    /// Records a size observed without holding the content, e.g. from a
    /// metadata-only probe.
    pub async fn update_metadata(&self, hash: &ContentHash, size: i64) -> Result<()> {
        let short = hash.short();
        self.db.metadata_updated(&short, size).await?;
        self.events
            .notify_metadata(&[AddItem { hash: short, size }])
            .await
    }

    pub async fn touch_content(&self, hashes: &[ContentHash]) -> Result<()> {
        let shorts = hashes.iter().map(|hash| hash.short()).collect::<Vec<_>>();
        for short in &shorts {
            self.db.touch(short).await?;
        }
        self.events.notify_touched(&shorts).await
    }

    /// Pin requires at least one live replica somewhere in the cluster.
    pub async fn pin(&self, hash: &ContentHash) -> Result<()> {
        let entries = self.get_bulk(&[hash.short()], GetBulkOrigin::Local).await?;
        let live = entries[0]
            .as_ref()
            .map(|entry| entry.replica_count())
            .unwrap_or(0);
        if live == 0 {
            return Err(Error::ContentNotFound(hash.to_string()));
        }
        if let Err(err) = self.copier.on_pin(hash).await {
            warn!(hash = %hash, err = ?err, "proactive copy on pin failed");
        }
        Ok(())
    }

    /// Bulk lookup with inactive machines masked out of every result.
    pub async fn get_bulk(
        &self,
        hashes: &[ShortHash],
        origin: GetBulkOrigin,
    ) -> Result<Vec<Option<Entry>>> {
        let mut entries = match origin {
            GetBulkOrigin::Local => {
                let mut entries = Vec::with_capacity(hashes.len());
                for hash in hashes {
                    entries.push(self.db.try_get(hash).await?);
                }
                entries
            }
            GetBulkOrigin::Global => self.global.get_bulk(hashes).await?,
        };
        if let Some(state) = self.cluster.current() {
            for entry in entries.iter_mut().flatten() {
                entry.machines.mask_out(&state.inactive);
            }
        }
        Ok(entries)
    }

    /// Clears this machine's bit everywhere: the local db, the global
    /// store, and (through the remove event) the master's view.
    pub async fn trim_bulk(&self, hashes: &[ShortHash]) -> Result<()> {
        for hash in hashes {
            self.db.location_removed(hash, self.machine).await?;
        }
        self.events.notify_removed(hashes).await
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.election.release_role_if_necessary().await?;
        self.db.force_cache_flush().await?;
        info!(machine = %self.machine, "location service stopped");
        Ok(())
    }
}
