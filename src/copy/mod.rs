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

use std::{sync::Arc, time::Duration};

use rand::seq::SliceRandom;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::{
    cluster::{ClusterHandle, MachineId, MachineLocation},
    config::Config,
    counters::Counters,
    evict::EvictionRanker,
    hash::ContentHash,
    metrics,
    store::LocationDb,
    time::{millis_between, Clock, UnixMillis},
    Error, Result,
};

/// Peer-side transport for replication. Push streams local content to the
/// target; pull asks the target to fetch it from us.
#[crate::async_trait]
pub trait CopyClient: Send + Sync {
    async fn push(&self, target: &MachineLocation, hash: &ContentHash) -> Result<()>;

    async fn request_pull(
        &self,
        target: &MachineLocation,
        from: &MachineLocation,
        hash: &ContentHash,
    ) -> Result<()>;

    /// Last-access time of the most recently evicted content at the target,
    /// `None` if it never evicted. Targets advertise this so senders can
    /// prefer peers least likely to evict the copy right away.
    async fn eviction_watermark(&self, target: &MachineLocation) -> Result<Option<UnixMillis>>;
}

/// Receiver policy for push copies: content whose last access predates what
/// the receiver is already evicting would be evicted immediately, so
/// accepting it is pointless.
pub fn should_reject_push(
    candidate_last_access: UnixMillis,
    eviction_watermark: Option<UnixMillis>,
    reject_old_content: bool,
) -> bool {
    match eviction_watermark {
        Some(watermark) if reject_old_content => candidate_last_access < watermark,
        _ => false,
    }
}

#[derive(Clone, Debug)]
pub struct CopyOptions {
    pub enable_proactive_copy: bool,
    pub push_copies: bool,
    pub on_put: bool,
    pub on_pin: bool,
    pub use_preferred_locations: bool,
    pub enable_replication: bool,
    pub replication_batch: usize,
    pub desired_replica_count: usize,
    pub gate_permits: usize,
}

impl From<&Config> for CopyOptions {
    fn from(cfg: &Config) -> Self {
        CopyOptions {
            enable_proactive_copy: cfg.enable_proactive_copy,
            push_copies: cfg.push_proactive_copies,
            on_put: cfg.proactive_copy_on_put,
            on_pin: cfg.proactive_copy_on_pin,
            use_preferred_locations: cfg.proactive_copy_use_preferred_locations,
            enable_replication: cfg.enable_proactive_replication,
            replication_batch: cfg.proactive_replication_batch,
            desired_replica_count: cfg.desired_replica_count,
            gate_permits: cfg.copy_gate_permits,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CopyOutcome {
    Copied,
    /// The receiver refused the copy; handled, not a failure.
    Rejected,
    NoCandidate,
    Disabled,
}

/// Replicates local content to peers to raise effective replica counts.
pub struct ProactiveCopyEngine {
    db: Arc<LocationDb>,
    blob: Arc<dyn crate::blob::BlobStore>,
    cluster: ClusterHandle,
    /// Non-owning handle used to weigh how soon content would be evicted.
    ranker: Arc<EvictionRanker>,
    client: Arc<dyn CopyClient>,
    machine: MachineId,
    location: MachineLocation,
    opts: CopyOptions,
    clock: Arc<dyn Clock>,
    counters: Arc<Counters>,
    gate: Semaphore,
}

impl ProactiveCopyEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db: Arc<LocationDb>,
        blob: Arc<dyn crate::blob::BlobStore>,
        cluster: ClusterHandle,
        ranker: Arc<EvictionRanker>,
        client: Arc<dyn CopyClient>,
        machine: MachineId,
        location: MachineLocation,
        opts: CopyOptions,
        clock: Arc<dyn Clock>,
        counters: Arc<Counters>,
    ) -> Self {
        let gate = Semaphore::new(opts.gate_permits);
        ProactiveCopyEngine {
            db,
            blob,
            cluster,
            ranker,
            client,
            machine,
            location,
            opts,
            clock,
            counters,
            gate,
        }
    }

    pub async fn on_put(&self, hash: &ContentHash) -> Result<CopyOutcome> {
        if !self.opts.enable_proactive_copy || !self.opts.on_put {
            return Ok(CopyOutcome::Disabled);
        }
        self.copy_once(hash).await
    }

    pub async fn on_pin(&self, hash: &ContentHash) -> Result<CopyOutcome> {
        if !self.opts.enable_proactive_copy || !self.opts.on_pin {
            return Ok(CopyOutcome::Disabled);
        }
        self.copy_once(hash).await
    }

    /// Background replication: one heartbeat's batch of under-replicated
    /// local hashes, enumerated from the blob store so full hashes are
    /// available to the transport.
    pub async fn replicate_batch(&self) -> Result<usize> {
        if !self.opts.enable_replication {
            return Ok(0);
        }
        let mut batch = Vec::new();
        for (hash, _) in self.blob.enumerate_local_hashes().await? {
            let replicas = self
                .db
                .try_get(&hash.short())
                .await?
                .map(|entry| entry.replica_count())
                .unwrap_or(1);
            if replicas < self.opts.desired_replica_count {
                batch.push(hash);
                if batch.len() >= self.opts.replication_batch {
                    break;
                }
            }
        }

        let mut copied = 0;
        for hash in batch {
            match self.copy_once(&hash).await {
                Ok(CopyOutcome::Copied) => copied += 1,
                Ok(_) => {}
                Err(err) => warn!(hash = %hash, err = ?err, "background replication failed"),
            }
        }
        Ok(copied)
    }

    async fn copy_once(&self, hash: &ContentHash) -> Result<CopyOutcome> {
        let Some(cluster) = self.cluster.current() else {
            return Ok(CopyOutcome::NoCandidate);
        };
        let holders = self
            .db
            .try_get(&hash.short())
            .await?
            .map(|entry| entry.machines)
            .unwrap_or_default();

        // Never the local machine, never an existing holder, never an
        // inactive machine.
        let mut candidates = cluster
            .live_machines()
            .into_iter()
            .filter(|peer| *peer != self.machine)
            .filter(|peer| !holders.contains(*peer))
            .filter_map(|peer| cluster.location_of(peer).cloned().map(|loc| (peer, loc)))
            .collect::<Vec<_>>();
        if candidates.is_empty() {
            return Ok(CopyOutcome::NoCandidate);
        }

        if self.opts.use_preferred_locations {
            self.order_by_preference(&mut candidates).await;
        } else {
            candidates.shuffle(&mut rand::thread_rng());
        }

        let started = std::time::Instant::now();
        let _permit = self.gate.acquire().await.map_err(|_| Error::Canceled)?;
        metrics::COPY_GATE_ACQUIRE_DURATION_SECONDS.observe(started.elapsed().as_secs_f64());

        let mut last_err = None;
        for (peer, location) in candidates.into_iter().take(2) {
            let attempt = if self.opts.push_copies {
                self.client.push(&location, hash).await
            } else {
                self.client.request_pull(&location, &self.location, hash).await
            };
            match attempt {
                Ok(()) => {
                    debug!(hash = %hash, peer = %peer, "proactive copy placed");
                    return Ok(CopyOutcome::Copied);
                }
                Err(err) if err.is_rejection() => {
                    self.counters.proactive_copies_rejected.inc();
                    debug!(hash = %hash, peer = %peer, err = %err, "proactive copy rejected");
                    return Ok(CopyOutcome::Rejected);
                }
                Err(err) => {
                    warn!(hash = %hash, peer = %peer, err = ?err, "proactive copy failed");
                    last_err = Some(err);
                }
            }
        }
        Err(last_err.unwrap_or(Error::Canceled))
    }

    /// Sorts candidates so peers least likely to evict the copy soon come
    /// first: the lower a peer's eviction watermark, the older the content
    /// it is still willing to keep.
    async fn order_by_preference(&self, candidates: &mut Vec<(MachineId, MachineLocation)>) {
        let now = self.clock.now();
        let mut keyed = Vec::with_capacity(candidates.len());
        for (peer, location) in candidates.drain(..) {
            let watermark = self
                .client
                .eviction_watermark(&location)
                .await
                .ok()
                .flatten();
            // A peer that never evicted ranks ahead of every evicting peer.
            let key = watermark
                .map(|at| self.ranker.effective_age(millis_between(at, now), 1))
                .unwrap_or(i64::MAX);
            keyed.push((key, peer, location));
        }
        // Larger effective age of the watermark means the peer evicts only
        // genuinely cold content.
        keyed.sort_by(|a, b| b.0.cmp(&a.0));
        candidates.extend(keyed.into_iter().map(|(_, peer, location)| (peer, location)));
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::HashMap,
        sync::Mutex,
    };

    use super::*;
    use crate::{
        cluster::{ClusterState, ClusterStateRecord},
        hash::HashAlgorithm,
        store::MemEngine,
        time::ManualClock,
    };

    #[derive(Default)]
    struct RecordingClient {
        pushes: Mutex<Vec<(MachineLocation, ContentHash)>>,
        pulls: Mutex<Vec<(MachineLocation, ContentHash)>>,
        watermarks: Mutex<HashMap<String, UnixMillis>>,
        reject: Mutex<bool>,
    }

    #[crate::async_trait]
    impl CopyClient for RecordingClient {
        async fn push(&self, target: &MachineLocation, hash: &ContentHash) -> Result<()> {
            if *self.reject.lock().unwrap() {
                return Err(Error::Rejected("older than evicted".to_owned()));
            }
            self.pushes.lock().unwrap().push((target.clone(), *hash));
            Ok(())
        }

        async fn request_pull(
            &self,
            target: &MachineLocation,
            _from: &MachineLocation,
            hash: &ContentHash,
        ) -> Result<()> {
            self.pulls.lock().unwrap().push((target.clone(), *hash));
            Ok(())
        }

        async fn eviction_watermark(
            &self,
            target: &MachineLocation,
        ) -> Result<Option<UnixMillis>> {
            Ok(self.watermarks.lock().unwrap().get(&target.0).copied())
        }
    }

    struct Fixture {
        clock: ManualClock,
        db: Arc<LocationDb>,
        cluster: ClusterHandle,
        client: Arc<RecordingClient>,
        counters: Arc<Counters>,
    }

    fn fixture(machines: u32) -> Fixture {
        let clock = ManualClock::new(10_000_000);
        let db = Arc::new(LocationDb::new(
            Arc::new(MemEngine::default()),
            Arc::new(clock.clone()),
            1_000,
            Duration::from_secs(3600),
        ));
        let cluster = ClusterHandle::default();
        let mut record = ClusterStateRecord::new("epoch-0");
        for index in 1..=machines {
            let location = MachineLocation(format!("node-{index}:7878"));
            let machine = record.register(&location);
            record.heartbeat(machine, clock.now());
        }
        cluster.publish(ClusterState::from_record(
            record,
            Duration::from_secs(1800),
            clock.now(),
        ));
        Fixture {
            clock,
            db,
            cluster,
            client: Arc::new(RecordingClient::default()),
            counters: Counters::new(),
        }
    }

    fn engine(f: &Fixture, opts: CopyOptions) -> ProactiveCopyEngine {
        let ranker = Arc::new(EvictionRanker::new(
            f.db.clone(),
            Duration::from_secs(1800),
            Duration::from_secs(60),
            100,
            Arc::new(f.clock.clone()),
            f.counters.clone(),
        ));
        ProactiveCopyEngine::new(
            f.db.clone(),
            Arc::new(crate::blob::MemBlobStore::default()),
            f.cluster.clone(),
            ranker,
            f.client.clone(),
            MachineId(1),
            MachineLocation("node-1:7878".to_owned()),
            opts,
            Arc::new(f.clock.clone()),
            f.counters.clone(),
        )
    }

    fn opts() -> CopyOptions {
        CopyOptions {
            enable_proactive_copy: true,
            push_copies: true,
            on_put: true,
            on_pin: false,
            use_preferred_locations: false,
            enable_replication: false,
            replication_batch: 10,
            desired_replica_count: 3,
            gate_permits: 4,
        }
    }

    fn hash_of(byte: u8) -> ContentHash {
        ContentHash::new(HashAlgorithm::Vso0, [byte; 32])
    }

    #[tokio::test]
    async fn put_triggers_a_push_to_a_non_holder() {
        let f = fixture(3);
        let engine = engine(&f, opts());
        let hash = hash_of(1);
        f.db.location_added(&hash.short(), MachineId(1), 64)
            .await
            .unwrap();
        f.db.location_added(&hash.short(), MachineId(2), 64)
            .await
            .unwrap();

        let outcome = engine.on_put(&hash).await.unwrap();
        assert_eq!(outcome, CopyOutcome::Copied);
        let pushes = f.client.pushes.lock().unwrap();
        assert_eq!(pushes.len(), 1);
        // Machine 3 is the only candidate left.
        assert_eq!(pushes[0].0 .0, "node-3:7878");
    }

    #[tokio::test]
    async fn pull_mode_requests_instead_of_pushing() {
        let f = fixture(2);
        let engine = engine(
            &f,
            CopyOptions {
                push_copies: false,
                ..opts()
            },
        );
        let hash = hash_of(2);
        f.db.location_added(&hash.short(), MachineId(1), 64)
            .await
            .unwrap();
        assert_eq!(engine.on_put(&hash).await.unwrap(), CopyOutcome::Copied);
        assert_eq!(f.client.pulls.lock().unwrap().len(), 1);
        assert!(f.client.pushes.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn rejection_is_handled_not_failed() {
        let f = fixture(2);
        let engine = engine(&f, opts());
        *f.client.reject.lock().unwrap() = true;
        let hash = hash_of(3);
        f.db.location_added(&hash.short(), MachineId(1), 64)
            .await
            .unwrap();

        let outcome = engine.on_put(&hash).await.unwrap();
        assert_eq!(outcome, CopyOutcome::Rejected);
        assert_eq!(f.counters.proactive_copies_rejected.get(), 1);
    }

    #[tokio::test]
    async fn fully_replicated_content_has_no_candidates() {
        let f = fixture(2);
        let engine = engine(&f, opts());
        let hash = hash_of(4);
        for machine in 1..=2u32 {
            f.db.location_added(&hash.short(), MachineId(machine), 64)
                .await
                .unwrap();
        }
        assert_eq!(
            engine.on_put(&hash).await.unwrap(),
            CopyOutcome::NoCandidate
        );
    }

    #[tokio::test]
    async fn preferred_locations_pick_the_safest_evictor() {
        let f = fixture(3);
        let engine = engine(
            &f,
            CopyOptions {
                use_preferred_locations: true,
                ..opts()
            },
        );
        // node-2 recently evicted warm content, node-3 only evicts cold
        // content, so node-3 is the safer home for a copy.
        {
            let mut watermarks = f.client.watermarks.lock().unwrap();
            watermarks.insert("node-2:7878".to_owned(), f.clock.now() - 10_000);
            watermarks.insert("node-3:7878".to_owned(), f.clock.now() - 9_000_000);
        }
        let hash = hash_of(5);
        f.db.location_added(&hash.short(), MachineId(1), 64)
            .await
            .unwrap();

        assert_eq!(engine.on_put(&hash).await.unwrap(), CopyOutcome::Copied);
        let pushes = f.client.pushes.lock().unwrap();
        assert_eq!(pushes[0].0 .0, "node-3:7878");
    }

    #[test]
    fn push_rejection_policy() {
        assert!(should_reject_push(1_000, Some(5_000), true));
        assert!(!should_reject_push(9_000, Some(5_000), true));
        assert!(!should_reject_push(1_000, Some(5_000), false));
        assert!(!should_reject_push(1_000, None, true));
    }
}
