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

mod mem;
mod store;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

pub use self::{
    mem::MemHub,
    store::{EventDispatcher, EventStore, EventStoreOptions},
};
use crate::{cluster::MachineId, hash::ShortHash, Result};

/// Position in the hub's log. Cursor 0 is "before the first batch".
pub type Cursor = u64;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddItem {
    pub hash: ShortHash,
    pub size: i64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum LocationEvent {
    AddLocation {
        machine: MachineId,
        items: Vec<AddItem>,
    },
    RemoveLocation {
        machine: MachineId,
        hashes: Vec<ShortHash>,
    },
    TouchLocation {
        machine: MachineId,
        hashes: Vec<ShortHash>,
    },
    UpdateMetadata {
        machine: MachineId,
        items: Vec<AddItem>,
    },
    Reconcile {
        machine: MachineId,
        adds: Vec<AddItem>,
        removes: Vec<ShortHash>,
    },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EventBatch {
    pub epoch: String,
    pub machine: MachineId,
    /// Per-publisher sequence number.
    pub sequence: u64,
    pub events: Vec<LocationEvent>,
}

impl EventBatch {
    pub fn encode(&self) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    pub fn decode(raw: &[u8]) -> Result<EventBatch> {
        Ok(serde_json::from_slice(raw)?)
    }
}

/// A published batch as stored by the hub.
#[derive(Clone, Debug)]
pub struct SealedBatch {
    pub cursor: Cursor,
    pub payload: Bytes,
}

impl SealedBatch {
    pub fn open(&self) -> Result<EventBatch> {
        EventBatch::decode(&self.payload)
    }
}

/// The ordered pub/sub collaborator. Each machine is an independent
/// publisher; batches from one publisher are delivered in publish order.
#[crate::async_trait]
pub trait EventHub: Send + Sync {
    /// Appends a payload under the epoch's log, returning its cursor.
    /// Payloads above [`EventHub::max_message_size`] are rejected.
    async fn publish(&self, epoch: &str, payload: Bytes) -> Result<Cursor>;

    /// Batches strictly after `from`, oldest first, at most `max`.
    async fn read(&self, epoch: &str, from: Cursor, max: usize) -> Result<Vec<SealedBatch>>;

    /// The cursor of the most recently published batch.
    async fn last_cursor(&self, epoch: &str) -> Result<Cursor>;

    fn max_message_size(&self) -> usize;
}
