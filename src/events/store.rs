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
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use futures::future::BoxFuture;
use tracing::debug;

use super::{AddItem, Cursor, EventBatch, EventHub, LocationEvent};
use crate::{
    cluster::MachineId,
    config::Config,
    counters::Counters,
    hash::ShortHash,
    kv::GlobalStore,
    metrics,
    store::LocationDb,
    time::{millis_between, Clock, UnixMillis},
    Error, Result,
};

#[derive(Clone, Copy, Debug)]
pub struct EventStoreOptions {
    pub machine_location_update_window: Duration,
    pub touch_frequency: Duration,
    pub safe_to_lazily_update_machine_count_threshold: usize,
}

impl From<&Config> for EventStoreOptions {
    fn from(cfg: &Config) -> Self {
        EventStoreOptions {
            machine_location_update_window: cfg.machine_location_update_window,
            touch_frequency: cfg.touch_frequency,
            safe_to_lazily_update_machine_count_threshold: cfg
                .safe_to_lazily_update_machine_count_threshold,
        }
    }
}

#[derive(Default)]
struct Recent {
    adds: HashMap<ShortHash, UnixMillis>,
    removes: HashMap<ShortHash, UnixMillis>,
    touches: HashMap<ShortHash, UnixMillis>,
}

/// One machine's publisher side of the event log, applying the add
/// suppression and promotion discipline before anything reaches the hub or
/// the global KV.
pub struct EventStore {
    hub: Arc<dyn EventHub>,
    global: Arc<GlobalStore>,
    db: Arc<LocationDb>,
    machine: MachineId,
    epoch: String,
    opts: EventStoreOptions,
    clock: Arc<dyn Clock>,
    counters: Arc<Counters>,
    sequence: AtomicU64,
    recent: Mutex<Recent>,
    recently_inactive_until: AtomicU64,
}

impl EventStore {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        hub: Arc<dyn EventHub>,
        global: Arc<GlobalStore>,
        db: Arc<LocationDb>,
        machine: MachineId,
        epoch: impl Into<String>,
        opts: EventStoreOptions,
        clock: Arc<dyn Clock>,
        counters: Arc<Counters>,
    ) -> Self {
        EventStore {
            hub,
            global,
            db,
            machine,
            epoch: epoch.into(),
            opts,
            clock,
            counters,
            sequence: AtomicU64::new(0),
            recent: Mutex::new(Recent::default()),
            recently_inactive_until: AtomicU64::new(0),
        }
    }

    pub fn machine(&self) -> MachineId {
        self.machine
    }

    /// Publishes adds eagerly until `until`, used after this machine was
    /// marked inactive cluster-wide so its index entries recover quickly.
    pub fn mark_recently_inactive(&self, until: UnixMillis) {
        self.recently_inactive_until
            .fetch_max(until, Ordering::SeqCst);
    }

    pub async fn notify_added(&self, items: &[AddItem]) -> Result<()> {
        let now = self.clock.now();
        let window = self.opts.machine_location_update_window.as_millis() as u64;
        let touch_frequency = self.opts.touch_frequency.as_millis() as u64;
        let self_inactive = now < self.recently_inactive_until.load(Ordering::SeqCst);

        let mut eager = Vec::new();
        let mut queued = Vec::new();
        let mut lazy_touches = Vec::new();
        for item in items {
            let (recent_add, recent_remove, last_touch) = {
                let recent = self.recent.lock().unwrap();
                (
                    recent
                        .adds
                        .get(&item.hash)
                        .map(|at| millis_between(*at, now) < window)
                        .unwrap_or(false),
                    recent
                        .removes
                        .get(&item.hash)
                        .map(|at| millis_between(*at, now) < window)
                        .unwrap_or(false),
                    recent.touches.get(&item.hash).copied(),
                )
            };

            if recent_remove {
                eager.push(*item);
                self.counters.add_recent_remove_eager.inc();
            } else if self_inactive {
                eager.push(*item);
                self.counters.add_recent_inactive_eager.inc();
            } else if recent_add {
                self.counters.redundant_recent_add_skipped.inc();
                let touch_due = last_touch
                    .map(|at| millis_between(at, now) >= touch_frequency)
                    .unwrap_or(true);
                if touch_due {
                    lazy_touches.push(item.hash);
                    self.counters.lazy_touch_event_only.inc();
                    let mut recent = self.recent.lock().unwrap();
                    recent.touches.insert(item.hash, now);
                }
                continue;
            } else {
                let replicas = self
                    .db
                    .try_get(&item.hash)
                    .await?
                    .map(|entry| entry.replica_count())
                    .unwrap_or(0);
                if replicas > self.opts.safe_to_lazily_update_machine_count_threshold {
                    queued.push(*item);
                    self.counters.add_queued.inc();
                } else {
                    eager.push(*item);
                    self.counters.add_eager.inc();
                }
            }
            // A published add also conveys access freshness.
            let mut recent = self.recent.lock().unwrap();
            recent.adds.insert(item.hash, now);
            recent.touches.insert(item.hash, now);
        }

        if !eager.is_empty() {
            let pairs = eager
                .iter()
                .map(|item| (item.hash, item.size))
                .collect::<Vec<_>>();
            self.global.register_location(self.machine, &pairs).await?;
            self.counters
                .register_local_location
                .inc_by(eager.len() as u64);
        }

        let mut published = eager;
        published.extend(queued);
        if !published.is_empty() {
            self.publish_event(LocationEvent::AddLocation {
                machine: self.machine,
                items: published,
            })
            .await?;
        }
        if !lazy_touches.is_empty() {
            self.publish_event(LocationEvent::TouchLocation {
                machine: self.machine,
                hashes: lazy_touches,
            })
            .await?;
        }
        Ok(())
    }

    pub async fn notify_removed(&self, hashes: &[ShortHash]) -> Result<()> {
        if hashes.is_empty() {
            return Ok(());
        }
        let now = self.clock.now();
        {
            let mut recent = self.recent.lock().unwrap();
            for hash in hashes {
                recent.removes.insert(*hash, now);
                recent.adds.remove(hash);
            }
        }
        self.global.trim_bulk(self.machine, hashes).await?;
        self.publish_event(LocationEvent::RemoveLocation {
            machine: self.machine,
            hashes: hashes.to_vec(),
        })
        .await
    }

    pub async fn notify_touched(&self, hashes: &[ShortHash]) -> Result<()> {
        let now = self.clock.now();
        let touch_frequency = self.opts.touch_frequency.as_millis() as u64;
        let due = {
            let mut recent = self.recent.lock().unwrap();
            hashes
                .iter()
                .filter(|hash| {
                    let fresh = recent
                        .touches
                        .get(*hash)
                        .map(|at| millis_between(*at, now) < touch_frequency)
                        .unwrap_or(false);
                    if !fresh {
                        recent.touches.insert(**hash, now);
                    }
                    !fresh
                })
                .copied()
                .collect::<Vec<_>>()
        };
        if due.is_empty() {
            return Ok(());
        }
        self.publish_event(LocationEvent::TouchLocation {
            machine: self.machine,
            hashes: due,
        })
        .await
    }

    /// Size observations that carry no location claim.
    pub async fn notify_metadata(&self, items: &[AddItem]) -> Result<()> {
        if items.is_empty() {
            return Ok(());
        }
        self.publish_event(LocationEvent::UpdateMetadata {
            machine: self.machine,
            items: items.to_vec(),
        })
        .await
    }

    pub async fn publish_reconcile(
        &self,
        adds: Vec<AddItem>,
        removes: Vec<ShortHash>,
    ) -> Result<()> {
        if adds.is_empty() && removes.is_empty() {
            return Ok(());
        }
        self.publish_event(LocationEvent::Reconcile {
            machine: self.machine,
            adds,
            removes,
        })
        .await
    }

    /// Publishes one event, splitting it when the serialized batch exceeds
    /// the hub's message size.
    fn publish_event<'a>(&'a self, event: LocationEvent) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
            let batch = EventBatch {
                epoch: self.epoch.clone(),
                machine: self.machine,
                sequence,
                events: vec![event],
            };
            let payload = batch.encode()?;
            if payload.len() <= self.hub.max_message_size() {
                self.hub.publish(&self.epoch, payload).await?;
                return Ok(());
            }
            let event = batch.events.into_iter().next().expect("one event");
            let (left, right) = split_event(event).ok_or_else(|| {
                Error::InvalidArgument("unsplittable event exceeds hub message size".to_owned())
            })?;
            debug!("splitting oversized event batch");
            self.publish_event(left).await?;
            self.publish_event(right).await
        })
    }
}

fn split_half<T: Clone>(items: &[T]) -> (Vec<T>, Vec<T>) {
    let mid = items.len() / 2;
    (items[..mid].to_vec(), items[mid..].to_vec())
}

fn split_event(event: LocationEvent) -> Option<(LocationEvent, LocationEvent)> {
    match event {
        LocationEvent::AddLocation { machine, items } if items.len() > 1 => {
            let (a, b) = split_half(&items);
            Some((
                LocationEvent::AddLocation { machine, items: a },
                LocationEvent::AddLocation { machine, items: b },
            ))
        }
        LocationEvent::RemoveLocation { machine, hashes } if hashes.len() > 1 => {
            let (a, b) = split_half(&hashes);
            Some((
                LocationEvent::RemoveLocation { machine, hashes: a },
                LocationEvent::RemoveLocation { machine, hashes: b },
            ))
        }
        LocationEvent::TouchLocation { machine, hashes } if hashes.len() > 1 => {
            let (a, b) = split_half(&hashes);
            Some((
                LocationEvent::TouchLocation { machine, hashes: a },
                LocationEvent::TouchLocation { machine, hashes: b },
            ))
        }
        LocationEvent::UpdateMetadata { machine, items } if items.len() > 1 => {
            let (a, b) = split_half(&items);
            Some((
                LocationEvent::UpdateMetadata { machine, items: a },
                LocationEvent::UpdateMetadata { machine, items: b },
            ))
        }
        LocationEvent::Reconcile {
            machine,
            adds,
            removes,
        } if adds.len() + removes.len() > 1 => {
            if adds.len() > 1 {
                let (a, b) = split_half(&adds);
                Some((
                    LocationEvent::Reconcile {
                        machine,
                        adds: a,
                        removes: Vec::new(),
                    },
                    LocationEvent::Reconcile {
                        machine,
                        adds: b,
                        removes,
                    },
                ))
            } else if removes.len() > 1 {
                let (a, b) = split_half(&removes);
                Some((
                    LocationEvent::Reconcile {
                        machine,
                        adds,
                        removes: a,
                    },
                    LocationEvent::Reconcile {
                        machine,
                        adds: Vec::new(),
                        removes: b,
                    },
                ))
            } else {
                Some((
                    LocationEvent::Reconcile {
                        machine,
                        adds,
                        removes: Vec::new(),
                    },
                    LocationEvent::Reconcile {
                        machine,
                        adds: Vec::new(),
                        removes,
                    },
                ))
            }
        }
        _ => None,
    }
}

/// The master's consumer side: applies every event to the local db in
/// publisher order so the master's view equals the acknowledged log prefix.
pub struct EventDispatcher {
    hub: Arc<dyn EventHub>,
    db: Arc<LocationDb>,
    epoch: String,
    cursor: tokio::sync::Mutex<Cursor>,
    counters: Arc<Counters>,
}

impl EventDispatcher {
    pub fn new(
        hub: Arc<dyn EventHub>,
        db: Arc<LocationDb>,
        epoch: impl Into<String>,
        counters: Arc<Counters>,
    ) -> Self {
        EventDispatcher {
            hub,
            db,
            epoch: epoch.into(),
            cursor: tokio::sync::Mutex::new(0),
            counters,
        }
    }

    /// On epoch change in-flight state is abandoned and consumption starts
    /// over.
    pub async fn reset_cursor(&self) {
        *self.cursor.lock().await = 0;
    }

    pub async fn cursor(&self) -> Cursor {
        *self.cursor.lock().await
    }

    /// Applies every available batch, returning the number of events.
    pub async fn poll_once(&self, max_batches: usize) -> Result<usize> {
        let mut cursor = self.cursor.lock().await;
        let batches = self.hub.read(&self.epoch, *cursor, max_batches).await?;
        let mut applied = 0;
        for sealed in batches {
            let batch = sealed.open()?;
            if batch.epoch != self.epoch {
                return Err(Error::InvalidData(format!(
                    "event batch from epoch {}",
                    batch.epoch
                )));
            }
            for event in &batch.events {
                self.apply(event).await?;
                applied += 1;
            }
            *cursor = sealed.cursor;
        }
        if applied > 0 {
            self.counters.events_dispatched.inc_by(applied as u64);
            metrics::EVENTS_DISPATCHED_TOTAL.inc_by(applied as u64);
        }
        Ok(applied)
    }

    async fn apply(&self, event: &LocationEvent) -> Result<()> {
        match event {
            LocationEvent::AddLocation { machine, items } => {
                for item in items {
                    self.db
                        .location_added(&item.hash, *machine, item.size)
                        .await?;
                }
            }
            LocationEvent::RemoveLocation { machine, hashes } => {
                for hash in hashes {
                    self.db.location_removed(hash, *machine).await?;
                }
            }
            LocationEvent::TouchLocation { hashes, .. } => {
                for hash in hashes {
                    self.db.touch(hash).await?;
                }
            }
            LocationEvent::UpdateMetadata { items, .. } => {
                for item in items {
                    self.db.metadata_updated(&item.hash, item.size).await?;
                }
            }
            LocationEvent::Reconcile {
                machine,
                adds,
                removes,
            } => {
                for item in adds {
                    self.db
                        .location_added(&item.hash, *machine, item.size)
                        .await?;
                }
                for hash in removes {
                    self.db.location_removed(hash, *machine).await?;
                }
            }
        }
        Ok(())
    }
}
