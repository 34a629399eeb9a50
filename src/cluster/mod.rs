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
    fmt,
    sync::{Arc, RwLock},
    time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::time::{millis_between, UnixMillis};

/// A 32-bit machine index, >= 1, allocated monotonically within an epoch and
/// never reused within it.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct MachineId(pub u32);

impl MachineId {
    pub fn is_valid(&self) -> bool {
        self.0 >= 1
    }
}

impl fmt::Display for MachineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "M{}", self.0)
    }
}

/// An opaque endpoint address, unique per physical machine.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MachineLocation(pub String);

impl fmt::Display for MachineLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The authoritative cluster-state record as persisted in the global KV and
/// mirrored into the location db.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ClusterStateRecord {
    pub epoch: String,
    pub max_machine_id: u32,
    /// MachineId -> location binding. Never shrinks within an epoch.
    pub machines: BTreeMap<u32, MachineLocation>,
    /// MachineId -> last heartbeat timestamp.
    pub heartbeats: BTreeMap<u32, UnixMillis>,
}

impl ClusterStateRecord {
    pub fn new(epoch: impl Into<String>) -> Self {
        ClusterStateRecord {
            epoch: epoch.into(),
            ..Default::default()
        }
    }

    pub fn id_of(&self, location: &MachineLocation) -> Option<MachineId> {
        self.machines
            .iter()
            .find(|(_, loc)| *loc == location)
            .map(|(id, _)| MachineId(*id))
    }

    /// Idempotent registration: an already-bound location keeps its id,
    /// otherwise `max_machine_id + 1` is allocated.
    pub fn register(&mut self, location: &MachineLocation) -> MachineId {
        if let Some(id) = self.id_of(location) {
            return id;
        }
        self.max_machine_id += 1;
        self.machines
            .insert(self.max_machine_id, location.clone());
        MachineId(self.max_machine_id)
    }

    pub fn heartbeat(&mut self, machine: MachineId, now: UnixMillis) {
        self.heartbeats.insert(machine.0, now);
    }

    pub fn location_of(&self, machine: MachineId) -> Option<&MachineLocation> {
        self.machines.get(&machine.0)
    }
}

/// A point-in-time view of the record with the inactive set derived from
/// heartbeat ages.
#[derive(Clone, Debug)]
pub struct ClusterState {
    pub record: ClusterStateRecord,
    pub inactive: BTreeSet<MachineId>,
    pub observed_at: UnixMillis,
}

impl ClusterState {
    pub fn from_record(
        record: ClusterStateRecord,
        machine_expiry: Duration,
        now: UnixMillis,
    ) -> Self {
        let expiry = machine_expiry.as_millis() as u64;
        let inactive = record
            .machines
            .keys()
            .filter(|id| {
                match record.heartbeats.get(id) {
                    Some(last) => millis_between(*last, now) > expiry,
                    // Registered but never heartbeated; treated as inactive
                    // until the first heartbeat lands.
                    None => true,
                }
            })
            .map(|id| MachineId(*id))
            .collect();
        ClusterState {
            record,
            inactive,
            observed_at: now,
        }
    }

    pub fn epoch(&self) -> &str {
        &self.record.epoch
    }

    pub fn is_inactive(&self, machine: MachineId) -> bool {
        self.inactive.contains(&machine)
    }

    pub fn location_of(&self, machine: MachineId) -> Option<&MachineLocation> {
        self.record.location_of(machine)
    }

    /// Machines currently considered alive, in id order.
    pub fn live_machines(&self) -> Vec<MachineId> {
        self.record
            .machines
            .keys()
            .map(|id| MachineId(*id))
            .filter(|id| !self.inactive.contains(id))
            .collect()
    }
}

/// Shared, refreshed-on-heartbeat view handed to components that need to
/// resolve machines without owning the cluster lifecycle.
#[derive(Clone, Default)]
pub struct ClusterHandle {
    state: Arc<RwLock<Option<ClusterState>>>,
}

impl ClusterHandle {
    pub fn publish(&self, state: ClusterState) {
        *self.state.write().unwrap() = Some(state);
    }

    pub fn current(&self) -> Option<ClusterState> {
        self.state.read().unwrap().clone()
    }
}
