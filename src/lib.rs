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

//! A distributed content-addressed cache location service: every machine
//! keeps a local index of which machine holds which blob, kept fresh
//! through a shared event log, a raided global KV and shipped checkpoints.

mod error;
pub use error::{Error, Result};

mod config;
pub use config::{Config, DbConfig};

mod counters;
mod metrics;
mod service;
pub use counters::Counters;
pub use service::{Collaborators, GetBulkOrigin, HeartbeatSummary, LocationService};

pub mod blob;
pub mod checkpoint;
pub mod cluster;
pub mod copy;
pub mod events;
pub mod evict;
pub mod hash;
pub mod kv;
pub mod reconcile;
pub mod role;
pub mod store;
pub mod time;

pub use async_trait::async_trait;
