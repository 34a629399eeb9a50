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

use lazy_static::lazy_static;
use prometheus::*;

lazy_static! {
    pub static ref HEARTBEAT_DURATION_SECONDS: Histogram = register_histogram!(
        "locstore_heartbeat_duration_seconds",
        "the duration of one heartbeat round",
        exponential_buckets(0.0005, 2.0, 20).unwrap(),
    )
    .unwrap();
    pub static ref HEARTBEAT_FAIL_TOTAL: IntCounter = register_int_counter!(
        "locstore_heartbeat_fail_total",
        "the count of failed heartbeat rounds"
    )
    .unwrap();
    pub static ref CHECKPOINT_CREATE_DURATION_SECONDS: Histogram = register_histogram!(
        "locstore_checkpoint_create_duration_seconds",
        "the duration of creating one checkpoint",
        exponential_buckets(0.001, 2.0, 20).unwrap(),
    )
    .unwrap();
    pub static ref CHECKPOINT_RESTORE_DURATION_SECONDS: Histogram = register_histogram!(
        "locstore_checkpoint_restore_duration_seconds",
        "the duration of restoring one checkpoint",
        exponential_buckets(0.001, 2.0, 20).unwrap(),
    )
    .unwrap();
    pub static ref GC_DURATION_SECONDS: Histogram = register_histogram!(
        "locstore_location_gc_duration_seconds",
        "the duration of one location db garbage collection",
        exponential_buckets(0.0005, 2.0, 20).unwrap(),
    )
    .unwrap();
    pub static ref EVENTS_DISPATCHED_TOTAL: IntCounter = register_int_counter!(
        "locstore_events_dispatched_total",
        "the count of location events applied by masters"
    )
    .unwrap();
    pub static ref COPY_GATE_ACQUIRE_DURATION_SECONDS: Histogram = register_histogram!(
        "locstore_copy_gate_acquire_duration_seconds",
        "time spent waiting for the outbound copy gate",
        exponential_buckets(0.0001, 2.0, 22).unwrap(),
    )
    .unwrap();
}
