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

use std::{path::PathBuf, sync::Arc, time::Duration};

use sha2::{Digest, Sha256};
use tracing::{debug, info};

use super::{
    file_blob, manifest_blob, manifest_prefix, parse_manifest_sequence, CentralStore,
    DistributedCentralStorage, Manifest, ManifestFile,
};
use crate::{
    config::Config,
    counters::Counters,
    metrics,
    store::LocationDb,
    time::{millis_between, Clock, UnixMillis},
    Error, Result,
};

#[derive(Clone, Debug)]
pub struct CheckpointOptions {
    pub checkpoints_key: String,
    pub epoch: String,
    pub create_interval: Duration,
    pub restore_age_threshold: Duration,
    pub use_incremental: bool,
}

impl CheckpointOptions {
    pub fn from_config(cfg: &Config) -> Self {
        CheckpointOptions {
            checkpoints_key: cfg.checkpoints_key.clone(),
            epoch: cfg.event_hub_epoch.clone(),
            create_interval: cfg.create_checkpoint_interval,
            restore_age_threshold: cfg.restore_checkpoint_age_threshold,
            use_incremental: cfg.use_incremental_checkpointing,
        }
    }
}

#[derive(Default)]
struct CheckpointState {
    last_create: Option<UnixMillis>,
    sequence: u64,
    restored_sequence: Option<u64>,
    last_restore: Option<UnixMillis>,
}

/// Produces checkpoints on the master and restores them on workers.
pub struct CheckpointManager {
    db: Arc<LocationDb>,
    central: Arc<dyn CentralStore>,
    distributed: Option<Arc<DistributedCentralStorage>>,
    opts: CheckpointOptions,
    work_dir: PathBuf,
    clock: Arc<dyn Clock>,
    counters: Arc<Counters>,
    state: tokio::sync::Mutex<CheckpointState>,
}

fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

impl CheckpointManager {
    pub fn new(
        db: Arc<LocationDb>,
        central: Arc<dyn CentralStore>,
        distributed: Option<Arc<DistributedCentralStorage>>,
        opts: CheckpointOptions,
        work_dir: impl Into<PathBuf>,
        clock: Arc<dyn Clock>,
        counters: Arc<Counters>,
    ) -> Self {
        CheckpointManager {
            db,
            central,
            distributed,
            opts,
            work_dir: work_dir.into(),
            clock,
            counters,
            state: tokio::sync::Mutex::new(CheckpointState::default()),
        }
    }

    /// Where this machine keeps checkpoint files by content hash; peers pull
    /// from here.
    pub fn cache_dir(&self) -> PathBuf {
        self.work_dir.join("files").join(&self.opts.epoch)
    }

    pub async fn last_restored_sequence(&self) -> Option<u64> {
        self.state.lock().await.restored_sequence
    }

    /// Abandons restored state so the next round performs a full resync.
    /// Called after a `Corrupt` restore.
    pub async fn invalidate(&self) {
        let mut state = self.state.lock().await;
        state.restored_sequence = None;
        state.last_restore = None;
        let _ = tokio::fs::remove_dir_all(self.cache_dir()).await;
    }

    /// Master side: snapshot the db and publish a manifest when the create
    /// interval has elapsed.
    pub async fn create_if_due(&self, force: bool) -> Result<Option<Manifest>> {
        let mut state = self.state.lock().await;
        let now = self.clock.now();
        if !force {
            if let Some(last) = state.last_create {
                if millis_between(last, now) < self.opts.create_interval.as_millis() as u64 {
                    return Ok(None);
                }
            }
        }
        let _timer = metrics::CHECKPOINT_CREATE_DURATION_SECONDS.start_timer();

        let sequence = state.sequence + 1;
        let staging = self
            .work_dir
            .join("staging")
            .join(format!("create-{sequence:020}"));
        let _ = tokio::fs::remove_dir_all(&staging).await;
        tokio::fs::create_dir_all(&staging).await?;

        let files = self.db.checkpoint(&staging).await?;
        let cache = self.cache_dir();
        tokio::fs::create_dir_all(&cache).await?;

        let mut manifest_files = Vec::with_capacity(files.len());
        for path in &files {
            let data = tokio::fs::read(path).await?;
            let content_hash = sha256_hex(&data);
            let name = path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .ok_or_else(|| Error::InvalidData("snapshot file name".to_owned()))?;
            let blob = file_blob(&self.opts.checkpoints_key, &self.opts.epoch, &content_hash);
            if self.opts.use_incremental && self.central.contains(&blob).await? {
                self.counters.incremental_files_upload_skipped.inc();
            } else {
                self.central.put_file(path, &blob).await?;
            }
            let cached = cache.join(&content_hash);
            if !tokio::fs::try_exists(&cached).await? {
                tokio::fs::copy(path, &cached).await?;
            }
            manifest_files.push(ManifestFile {
                name,
                content_hash,
                size: data.len() as u64,
            });
        }

        let manifest = Manifest {
            checkpoint_id: format!("{}:{}", self.opts.epoch, sequence),
            epoch: self.opts.epoch.clone(),
            sequence_number: sequence,
            files: manifest_files,
        };
        let manifest_path = staging.join("MANIFEST.json");
        tokio::fs::write(&manifest_path, manifest.encode()?).await?;
        self.central
            .put_file(
                &manifest_path,
                &manifest_blob(&self.opts.checkpoints_key, sequence),
            )
            .await?;

        if let Some(distributed) = &self.distributed {
            for file in &manifest.files {
                distributed.advertise(file).await?;
            }
        }

        state.sequence = sequence;
        state.last_create = Some(now);
        drop(state);
        let _ = tokio::fs::remove_dir_all(&staging).await;
        info!(
            sequence,
            files = manifest.files.len(),
            "created location checkpoint"
        );
        Ok(Some(manifest))
    }

    /// Worker side: fetch and swap in the latest checkpoint when ours is
    /// older than the age threshold (strictly) or absent.
    pub async fn restore_if_due(&self, force: bool) -> Result<bool> {
        let mut state = self.state.lock().await;
        let now = self.clock.now();
        let threshold = self.opts.restore_age_threshold.as_millis() as u64;
        let stale = state
            .last_restore
            .map(|last| millis_between(last, now) > threshold)
            .unwrap_or(true);
        if !force && state.restored_sequence.is_some() && !stale {
            self.counters.restore_checkpoints_skipped.inc();
            return Ok(false);
        }

        let blobs = self
            .central
            .list(&manifest_prefix(&self.opts.checkpoints_key))
            .await?;
        let latest = blobs
            .iter()
            .filter_map(|blob| parse_manifest_sequence(blob).map(|seq| (seq, blob.clone())))
            .max_by_key(|(seq, _)| *seq);
        let Some((sequence, blob)) = latest else {
            debug!("no checkpoint manifest published yet");
            return Ok(false);
        };
        let _timer = metrics::CHECKPOINT_RESTORE_DURATION_SECONDS.start_timer();

        let staging = self
            .work_dir
            .join("staging")
            .join(format!("restore-{sequence:020}"));
        let _ = tokio::fs::remove_dir_all(&staging).await;
        tokio::fs::create_dir_all(&staging).await?;

        let manifest_path = staging.join("MANIFEST.json");
        if !self.central.try_get_file(&blob, &manifest_path).await? {
            return Err(Error::Corrupt(format!("checkpoint manifest {blob} vanished")));
        }
        let manifest = Manifest::decode(&tokio::fs::read(&manifest_path).await?)?;
        if manifest.epoch != self.opts.epoch {
            debug!(
                manifest_epoch = %manifest.epoch,
                "latest checkpoint is from another epoch, ignoring"
            );
            let _ = tokio::fs::remove_dir_all(&staging).await;
            return Ok(false);
        }

        let cache = self.cache_dir();
        tokio::fs::create_dir_all(&cache).await?;
        for file in &manifest.files {
            let dest = staging.join(&file.name);
            if self.reuse_cached(file, &dest, &cache).await? {
                self.counters.incremental_files_download_skipped.inc();
                continue;
            }
            let file_blob_name =
                file_blob(&self.opts.checkpoints_key, &manifest.epoch, &file.content_hash);
            let fetched = match &self.distributed {
                Some(distributed) => {
                    distributed
                        .try_get_file(file, &file_blob_name, &dest, &self.central)
                        .await?
                }
                None => {
                    let fetched = self.central.try_get_file(&file_blob_name, &dest).await?;
                    if fetched {
                        self.counters.file_from_fallback.inc();
                    }
                    fetched
                }
            };
            if !fetched {
                return Err(Error::Corrupt(format!(
                    "checkpoint file {} referenced by manifest {sequence} is gone",
                    file.content_hash
                )));
            }
            let data = tokio::fs::read(&dest).await?;
            if sha256_hex(&data) != file.content_hash {
                return Err(Error::Corrupt(format!(
                    "checkpoint file {} failed its hash check",
                    file.content_hash
                )));
            }
            tokio::fs::write(cache.join(&file.content_hash), &data).await?;
        }

        tokio::fs::remove_file(&manifest_path).await?;
        self.db.restore(&staging).await?;
        // The cache dir now holds every file of this checkpoint; make that
        // visible so peers can pull from us.
        if let Some(distributed) = &self.distributed {
            for file in &manifest.files {
                distributed.advertise(file).await?;
            }
        }
        state.restored_sequence = Some(sequence);
        state.last_restore = Some(now);
        state.sequence = state.sequence.max(sequence);
        drop(state);
        let _ = tokio::fs::remove_dir_all(&staging).await;
        info!(sequence, "restored location checkpoint");
        Ok(true)
    }

    async fn reuse_cached(
        &self,
        file: &ManifestFile,
        dest: &std::path::Path,
        cache: &std::path::Path,
    ) -> Result<bool> {
        let cached = cache.join(&file.content_hash);
        if !tokio::fs::try_exists(&cached).await? {
            return Ok(false);
        }
        let data = tokio::fs::read(&cached).await?;
        if sha256_hex(&data) != file.content_hash {
            // A damaged cache copy never poisons a restore.
            let _ = tokio::fs::remove_file(&cached).await;
            return Ok(false);
        }
        tokio::fs::write(dest, &data).await?;
        Ok(true)
    }
}
