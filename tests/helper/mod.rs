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
    collections::HashMap,
    path::Path,
    sync::{Arc, Mutex},
    time::Duration,
};

use locstore::{
    blob::{BlobStore, MemBlobStore},
    checkpoint::{FileFetcher, LocalDiskCentralStore},
    cluster::MachineLocation,
    copy::{should_reject_push, CopyClient},
    events::MemHub,
    hash::{ContentHash, HashAlgorithm},
    kv::MemKv,
    store::FileEngine,
    time::{Clock, ManualClock, UnixMillis},
    Collaborators, Config, Error, LocationService, Result,
};
use tempdir::TempDir;

pub fn hash_of(byte: u8) -> ContentHash {
    ContentHash::new(HashAlgorithm::Vso0, [byte; 32])
}

#[derive(Clone)]
pub struct MachineHandle {
    pub service: Arc<LocationService>,
    pub blob: Arc<MemBlobStore>,
    pub reject_old_content: bool,
    pub eviction_watermark: Arc<Mutex<Option<UnixMillis>>>,
}

type Registry = Arc<Mutex<HashMap<String, MachineHandle>>>;

/// Delivers proactive copies between in-process machines.
struct LoopbackCopyClient {
    registry: Registry,
    source: String,
    clock: ManualClock,
}

impl LoopbackCopyClient {
    fn lookup(&self, location: &str) -> Result<MachineHandle> {
        self.registry
            .lock()
            .unwrap()
            .get(location)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("machine '{location}'")))
    }

    async fn deliver(&self, target: &MachineLocation, hash: &ContentHash) -> Result<()> {
        let target_handle = self.lookup(&target.0)?;
        let source_handle = self.lookup(&self.source).ok();
        let now = self.clock.now();

        let last_access = match &source_handle {
            Some(source) => source
                .blob
                .last_access_time(hash)
                .await?
                .unwrap_or(now),
            None => now,
        };
        let watermark = *target_handle.eviction_watermark.lock().unwrap();
        if should_reject_push(last_access, watermark, target_handle.reject_old_content) {
            target_handle
                .service
                .counters()
                .rejected_push_copy_older_than_evicted
                .inc();
            return Err(Error::Rejected(
                "older than most recently evicted".to_owned(),
            ));
        }

        let size = match &source_handle {
            Some(source) => source.blob.size(hash).await?.unwrap_or(64),
            None => 64,
        };
        target_handle.blob.put(*hash, size, now);
        target_handle.service.receive_copy(hash, size).await
    }
}

#[locstore::async_trait]
impl CopyClient for LoopbackCopyClient {
    async fn push(&self, target: &MachineLocation, hash: &ContentHash) -> Result<()> {
        self.deliver(target, hash).await
    }

    async fn request_pull(
        &self,
        target: &MachineLocation,
        _from: &MachineLocation,
        hash: &ContentHash,
    ) -> Result<()> {
        self.deliver(target, hash).await
    }

    async fn eviction_watermark(
        &self,
        target: &MachineLocation,
    ) -> Result<Option<UnixMillis>> {
        let handle = self.lookup(&target.0)?;
        let watermark = *handle.eviction_watermark.lock().unwrap();
        Ok(watermark)
    }
}

/// Serves checkpoint files out of a peer's local checkpoint cache.
struct LoopbackFetcher {
    registry: Registry,
}

#[locstore::async_trait]
impl FileFetcher for LoopbackFetcher {
    async fn fetch(&self, from: &MachineLocation, hash_hex: &str, dest: &Path) -> Result<()> {
        let handle = {
            self.registry
                .lock()
                .unwrap()
                .get(&from.0)
                .cloned()
                .ok_or_else(|| Error::NotFound(format!("machine '{from}'")))?
        };
        let path = handle.service.checkpoints().cache_dir().join(hash_hex);
        if !tokio::fs::try_exists(&path).await? {
            return Err(Error::NotFound(format!("peer file {hash_hex}")));
        }
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::copy(&path, dest).await?;
        Ok(())
    }
}

pub struct TestMachine {
    pub service: Arc<LocationService>,
    pub blob: Arc<MemBlobStore>,
    _work: TempDir,
}

/// An in-process cluster: every machine shares the same raided KV pair,
/// event hub, central store and manual clock.
pub struct TestCluster {
    pub clock: ManualClock,
    pub primary: Arc<MemKv>,
    pub secondary: Arc<MemKv>,
    pub hub: Arc<MemHub>,
    pub machines: Vec<TestMachine>,
    registry: Registry,
    _central_dir: TempDir,
}

impl TestCluster {
    pub async fn start(
        count: usize,
        tweak: impl Fn(usize, &mut Config),
    ) -> Result<TestCluster> {
        let clock = ManualClock::new(1_700_000_000_000);
        let primary = Arc::new(MemKv::default());
        let secondary = Arc::new(MemKv::default());
        let hub = Arc::new(MemHub::default());
        let central_dir = TempDir::new("locstore-central")?;
        let central = Arc::new(LocalDiskCentralStore::new(central_dir.path()));
        let registry: Registry = Arc::new(Mutex::new(HashMap::new()));

        let mut machines = Vec::with_capacity(count);
        for index in 1..=count {
            let mut cfg = Config::default();
            cfg.event_hub_epoch = "epoch-test".to_owned();
            tweak(index, &mut cfg);
            let location = format!("node-{index}:7878");
            let work = TempDir::new(&format!("locstore-{index}"))?;
            let engine = Arc::new(
                FileEngine::open(work.path().join("db"), cfg.db.shard_count).await?,
            );
            let blob = Arc::new(MemBlobStore::default());
            let copy_client = Arc::new(LoopbackCopyClient {
                registry: registry.clone(),
                source: location.clone(),
                clock: clock.clone(),
            });
            let fetcher = Arc::new(LoopbackFetcher {
                registry: registry.clone(),
            });
            let service = LocationService::bootstrap(
                cfg,
                MachineLocation(location.clone()),
                Collaborators {
                    kv_primary: primary.clone(),
                    kv_secondary: Some(secondary.clone()),
                    hub: hub.clone(),
                    central: central.clone(),
                    blob: blob.clone(),
                    copy_client,
                    file_fetcher: fetcher,
                    engine,
                    clock: Arc::new(clock.clone()),
                    work_dir: work.path().to_path_buf(),
                },
            )
            .await?;
            registry.lock().unwrap().insert(
                location,
                MachineHandle {
                    service: service.clone(),
                    blob: blob.clone(),
                    reject_old_content: false,
                    eviction_watermark: Arc::new(Mutex::new(None)),
                },
            );
            machines.push(TestMachine {
                service,
                blob,
                _work: work,
            });
        }

        Ok(TestCluster {
            clock,
            primary,
            secondary,
            hub,
            machines,
            registry,
            _central_dir: central_dir,
        })
    }

    pub fn service(&self, index: usize) -> &Arc<LocationService> {
        &self.machines[index].service
    }

    pub fn blob(&self, index: usize) -> &Arc<MemBlobStore> {
        &self.machines[index].blob
    }

    pub fn handle(&self, index: usize) -> MachineHandle {
        let location = self.machines[index].service.location().0.clone();
        self.registry.lock().unwrap()[&location].clone()
    }

    pub fn set_reject_old_content(&self, index: usize, reject: bool) {
        let location = self.machines[index].service.location().0.clone();
        self.registry
            .lock()
            .unwrap()
            .get_mut(&location)
            .unwrap()
            .reject_old_content = reject;
    }

    pub fn set_eviction_watermark(&self, index: usize, watermark: Option<UnixMillis>) {
        let handle = self.handle(index);
        *handle.eviction_watermark.lock().unwrap() = watermark;
    }

    pub fn advance(&self, delta: Duration) {
        self.clock.advance(delta);
    }

    pub fn now(&self) -> UnixMillis {
        self.clock.now()
    }

    /// Put content on a machine's disk and index it.
    pub async fn put_content(&self, index: usize, hash: &ContentHash, size: i64) -> Result<()> {
        self.blob(index).put(*hash, size, self.now());
        self.service(index).add_content(hash, size).await
    }
}
