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
    sync::{Arc, Mutex},
    time::Duration,
};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::{
    cluster::MachineId,
    kv::GlobalKv,
    time::{Clock, UnixMillis},
    Result,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Master,
    Worker,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct LeaseRecord {
    machine: u32,
    lease_expiry: UnixMillis,
}

/// Master election over a single lease key in the global KV.
///
/// Safety rests on the KV's compare-and-set: a failed swap is never papered
/// over as success, the loser steps down to worker.
pub struct MasterElection {
    kv: Arc<dyn GlobalKv>,
    key: Vec<u8>,
    machine: MachineId,
    eligible: bool,
    lease_expiry_time: Duration,
    renewal_threshold: Duration,
    clock: Arc<dyn Clock>,
    role: Mutex<Option<Role>>,
}

impl MasterElection {
    pub fn new(
        kv: Arc<dyn GlobalKv>,
        key: Vec<u8>,
        machine: MachineId,
        eligible: bool,
        lease_expiry_time: Duration,
        renewal_threshold: Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        MasterElection {
            kv,
            key,
            machine,
            eligible,
            lease_expiry_time,
            renewal_threshold,
            clock,
            role: Mutex::new(None),
        }
    }

    pub fn current_role(&self) -> Option<Role> {
        *self.role.lock().unwrap()
    }

    fn set_role(&self, role: Role) -> Role {
        let mut current = self.role.lock().unwrap();
        if *current != Some(role) {
            info!(machine = %self.machine, role = ?role, "role changed");
        }
        *current = Some(role);
        role
    }

    fn new_lease(&self, now: UnixMillis) -> Result<Bytes> {
        let record = LeaseRecord {
            machine: self.machine.0,
            lease_expiry: now + self.lease_expiry_time.as_millis() as u64,
        };
        Ok(Bytes::from(serde_json::to_vec(&record)?))
    }

    /// One election step, run on every heartbeat.
    pub async fn step(&self) -> Result<Role> {
        if !self.eligible {
            return Ok(self.set_role(Role::Worker));
        }
        let now = self.clock.now();
        let current = self.kv.get(&self.key).await?;
        let lease = match &current {
            Some(raw) => Some(serde_json::from_slice::<LeaseRecord>(raw)?),
            None => None,
        };

        match lease {
            // Free or expired: try to claim it.
            None => {
                if self.kv.set_if_not_exists(&self.key, self.new_lease(now)?).await? {
                    return Ok(self.set_role(Role::Master));
                }
                Ok(self.set_role(Role::Worker))
            }
            Some(lease) if lease.lease_expiry <= now => {
                let claimed = self
                    .kv
                    .compare_and_set(&self.key, current.as_deref(), self.new_lease(now)?)
                    .await?;
                if claimed {
                    Ok(self.set_role(Role::Master))
                } else {
                    // Lost the CAS race; whoever won holds the lease.
                    Ok(self.set_role(Role::Worker))
                }
            }
            // Owned by self: renew when the expiry gets close.
            Some(lease) if lease.machine == self.machine.0 => {
                let remaining = lease.lease_expiry.saturating_sub(now);
                if remaining < self.renewal_threshold.as_millis() as u64 {
                    let renewed = self
                        .kv
                        .compare_and_set(&self.key, current.as_deref(), self.new_lease(now)?)
                        .await?;
                    if !renewed {
                        warn!(machine = %self.machine, "master lease renewal lost a race");
                        return Ok(self.set_role(Role::Worker));
                    }
                }
                Ok(self.set_role(Role::Master))
            }
            // Owned by a live peer.
            Some(_) => Ok(self.set_role(Role::Worker)),
        }
    }

    /// Best-effort release of a self-owned lease on shutdown.
    pub async fn release_role_if_necessary(&self) -> Result<()> {
        if self.current_role() != Some(Role::Master) {
            return Ok(());
        }
        if let Some(raw) = self.kv.get(&self.key).await? {
            let lease: LeaseRecord = serde_json::from_slice(&raw)?;
            if lease.machine == self.machine.0 {
                self.kv.delete(&self.key).await?;
                info!(machine = %self.machine, "released master lease");
            }
        }
        *self.role.lock().unwrap() = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{kv::MemKv, time::ManualClock};

    fn election(
        kv: Arc<MemKv>,
        clock: ManualClock,
        machine: u32,
        eligible: bool,
    ) -> MasterElection {
        MasterElection::new(
            kv,
            b"masterLease/v0".to_vec(),
            MachineId(machine),
            eligible,
            Duration::from_secs(300),
            Duration::from_secs(120),
            Arc::new(clock),
        )
    }

    #[tokio::test]
    async fn first_eligible_machine_becomes_master() {
        let kv = Arc::new(MemKv::default());
        let clock = ManualClock::new(1_000);
        let a = election(kv.clone(), clock.clone(), 1, true);
        let b = election(kv.clone(), clock.clone(), 2, true);

        assert_eq!(a.step().await.unwrap(), Role::Master);
        assert_eq!(b.step().await.unwrap(), Role::Worker);
        // Stable on re-election.
        assert_eq!(a.step().await.unwrap(), Role::Master);
    }

    #[tokio::test]
    async fn lease_expiry_hands_off_mastership() {
        let kv = Arc::new(MemKv::default());
        let clock = ManualClock::new(1_000);
        let a = election(kv.clone(), clock.clone(), 1, true);
        let b = election(kv.clone(), clock.clone(), 2, true);

        assert_eq!(a.step().await.unwrap(), Role::Master);
        clock.advance(Duration::from_secs(301));
        // B heartbeats first and claims the expired lease.
        assert_eq!(b.step().await.unwrap(), Role::Master);
        assert_eq!(a.step().await.unwrap(), Role::Worker);
    }

    #[tokio::test]
    async fn master_renews_before_expiry() {
        let kv = Arc::new(MemKv::default());
        let clock = ManualClock::new(1_000);
        let a = election(kv.clone(), clock.clone(), 1, true);

        assert_eq!(a.step().await.unwrap(), Role::Master);
        // Inside the renewal threshold but before expiry.
        clock.advance(Duration::from_secs(250));
        assert_eq!(a.step().await.unwrap(), Role::Master);

        // The renewal pushed the expiry out past the original lease.
        clock.advance(Duration::from_secs(250));
        let b = election(kv.clone(), clock.clone(), 2, true);
        assert_eq!(b.step().await.unwrap(), Role::Worker);
    }

    #[tokio::test]
    async fn ineligible_machine_is_always_worker() {
        let kv = Arc::new(MemKv::default());
        let clock = ManualClock::new(1_000);
        let a = election(kv.clone(), clock.clone(), 1, false);
        assert_eq!(a.step().await.unwrap(), Role::Worker);
        assert_eq!(kv.get(b"masterLease/v0").await.unwrap(), None);
    }

    #[tokio::test]
    async fn release_frees_the_lease_for_peers() {
        let kv = Arc::new(MemKv::default());
        let clock = ManualClock::new(1_000);
        let a = election(kv.clone(), clock.clone(), 1, true);
        let b = election(kv.clone(), clock.clone(), 2, true);

        assert_eq!(a.step().await.unwrap(), Role::Master);
        a.release_role_if_necessary().await.unwrap();
        assert_eq!(b.step().await.unwrap(), Role::Master);
    }
}
