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
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

/// Milliseconds since the unix epoch.
pub type UnixMillis = u64;

pub trait Clock: Send + Sync {
    fn now(&self) -> UnixMillis;
}

/// Wall clock used by production services.
#[derive(Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> UnixMillis {
        use std::time::{SystemTime, UNIX_EPOCH};
        let since_the_epoch = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        since_the_epoch.as_millis() as UnixMillis
    }
}

/// A clock that only moves when told to. Shared across every component of an
/// in-process cluster so tests can step through expiry windows.
#[derive(Clone, Default)]
pub struct ManualClock {
    now: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new(start: UnixMillis) -> Self {
        ManualClock {
            now: Arc::new(AtomicU64::new(start)),
        }
    }

    pub fn set(&self, now: UnixMillis) {
        self.now.store(now, Ordering::SeqCst);
    }

    pub fn advance(&self, delta: Duration) {
        self.now
            .fetch_add(delta.as_millis() as u64, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> UnixMillis {
        self.now.load(Ordering::SeqCst)
    }
}

/// `now - earlier`, saturating at zero when the clock moved backwards.
pub fn millis_between(earlier: UnixMillis, now: UnixMillis) -> u64 {
    now.saturating_sub(earlier)
}
