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

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    /// Whether this machine may claim the master lease.
    pub is_master_eligible: bool,

    /// Prefix applied to every key written to the global KV.
    pub key_space_prefix: String,

    /// Configuration-versioning string. Events and checkpoints from
    /// different epochs are incompatible.
    pub event_hub_epoch: String,

    /// Name under which checkpoints are grouped in the central store.
    pub checkpoints_key: String,

    // liveness
    pub machine_expiry: Duration,
    pub heartbeat_interval: Duration,
    pub recompute_inactive_machines_expiry: Duration,
    pub cluster_state_mirror_interval: Duration,
    pub store_cluster_state_in_database: bool,

    // location entries
    pub location_entry_expiry: Duration,
    pub content_hash_bump_time: Duration,
    pub touch_frequency: Duration,
    pub machine_location_update_window: Duration,
    pub safe_to_lazily_update_machine_count_threshold: usize,

    // master lease
    pub master_lease_expiry_time: Duration,
    pub master_lease_renewal_threshold: Duration,

    // checkpoints
    pub create_checkpoint_interval: Duration,
    pub restore_checkpoint_age_threshold: Duration,
    pub use_incremental_checkpointing: bool,
    pub use_distributed_central_storage: bool,

    // raided global KV
    pub retry_window: Duration,

    // eviction
    pub replica_credit: Duration,
    pub eviction_min_age: Duration,
    pub eviction_page_size: usize,

    // reconciliation
    pub reconciliation_max_cycle_size: usize,
    pub reconciliation_cycle_frequency: Duration,
    pub allow_skip_reconciliation: bool,
    pub unsafe_disable_reconciliation: bool,

    // proactive copies
    pub enable_proactive_copy: bool,
    pub push_proactive_copies: bool,
    pub proactive_copy_on_put: bool,
    pub proactive_copy_on_pin: bool,
    pub proactive_copy_use_preferred_locations: bool,
    pub proactive_copy_reject_old_content: bool,
    pub enable_proactive_replication: bool,
    pub proactive_replication_batch: usize,
    pub desired_replica_count: usize,
    pub copy_gate_permits: usize,

    // event hub
    pub event_hub_max_message_size: usize,

    #[serde(default)]
    pub db: DbConfig,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DbConfig {
    /// Number of coalesced entries the write cache holds before a flush is
    /// forced.
    pub cache_flush_threshold: usize,

    /// How often the heartbeat drains the write cache regardless of size.
    pub cache_flush_interval: Duration,

    /// How often garbage collection runs.
    pub gc_interval: Duration,

    /// Shard table files kept by the file engine.
    pub shard_count: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            is_master_eligible: true,
            key_space_prefix: String::new(),
            event_hub_epoch: "epoch-0".to_owned(),
            checkpoints_key: "default".to_owned(),

            machine_expiry: Duration::from_secs(30 * 60),
            heartbeat_interval: Duration::from_secs(60),
            recompute_inactive_machines_expiry: Duration::from_secs(60),
            cluster_state_mirror_interval: Duration::from_secs(5 * 60),
            store_cluster_state_in_database: true,

            location_entry_expiry: Duration::from_secs(2 * 60 * 60),
            content_hash_bump_time: Duration::from_secs(30 * 60),
            touch_frequency: Duration::from_secs(10 * 60),
            machine_location_update_window: Duration::from_secs(5 * 60),
            safe_to_lazily_update_machine_count_threshold: 8,

            master_lease_expiry_time: Duration::from_secs(5 * 60),
            master_lease_renewal_threshold: Duration::from_secs(2 * 60),

            create_checkpoint_interval: Duration::from_secs(10 * 60),
            restore_checkpoint_age_threshold: Duration::from_secs(10 * 60),
            use_incremental_checkpointing: true,
            use_distributed_central_storage: true,

            retry_window: Duration::from_secs(5),

            replica_credit: Duration::from_secs(30 * 60),
            eviction_min_age: Duration::from_secs(10 * 60),
            eviction_page_size: 500,

            reconciliation_max_cycle_size: 100_000,
            reconciliation_cycle_frequency: Duration::from_secs(30 * 60),
            allow_skip_reconciliation: true,
            unsafe_disable_reconciliation: false,

            enable_proactive_copy: false,
            push_proactive_copies: true,
            proactive_copy_on_put: true,
            proactive_copy_on_pin: false,
            proactive_copy_use_preferred_locations: false,
            proactive_copy_reject_old_content: false,
            enable_proactive_replication: false,
            proactive_replication_batch: 10,
            desired_replica_count: 3,
            copy_gate_permits: 4,

            event_hub_max_message_size: 192 * 1024,

            db: DbConfig::default(),
        }
    }
}

impl Default for DbConfig {
    fn default() -> Self {
        DbConfig {
            cache_flush_threshold: 10_000,
            cache_flush_interval: Duration::from_secs(60),
            gc_interval: Duration::from_secs(10 * 60),
            shard_count: 16,
        }
    }
}

impl Config {
    /// Fatal at startup only; a service never runs with an invalid config.
    pub fn validate(&self) -> Result<()> {
        if self.event_hub_epoch.is_empty() {
            return Err(Error::Configuration("event_hub_epoch is empty".to_owned()));
        }
        if self.checkpoints_key.is_empty() {
            return Err(Error::Configuration("checkpoints_key is empty".to_owned()));
        }
        if self.master_lease_renewal_threshold >= self.master_lease_expiry_time {
            return Err(Error::Configuration(
                "master_lease_renewal_threshold must be below master_lease_expiry_time".to_owned(),
            ));
        }
        if self.reconciliation_max_cycle_size == 0 {
            return Err(Error::Configuration(
                "reconciliation_max_cycle_size must be positive".to_owned(),
            ));
        }
        if self.eviction_page_size == 0 {
            return Err(Error::Configuration(
                "eviction_page_size must be positive".to_owned(),
            ));
        }
        if self.copy_gate_permits == 0 {
            return Err(Error::Configuration(
                "copy_gate_permits must be positive".to_owned(),
            ));
        }
        if self.db.shard_count == 0 || self.db.shard_count > 256 {
            return Err(Error::Configuration(
                "db.shard_count must be in 1..=256".to_owned(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn validate_rejects_bad_lease_thresholds() {
        let cfg = Config {
            master_lease_renewal_threshold: Duration::from_secs(600),
            master_lease_expiry_time: Duration::from_secs(300),
            ..Default::default()
        };
        assert!(matches!(cfg.validate(), Err(Error::Configuration(_))));
    }
}
