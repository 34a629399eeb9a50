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

use std::sync::Arc;

use prometheus::IntCounter;

/// Operation counters scoped to one machine's location service.
///
/// These are deliberately unregistered so several in-process machines (the
/// integration harness) each keep their own counts; the registered service
/// metrics live in [`crate::metrics`].
pub struct Counters {
    // event publish discipline
    pub redundant_recent_add_skipped: IntCounter,
    pub lazy_touch_event_only: IntCounter,
    pub add_recent_remove_eager: IntCounter,
    pub add_recent_inactive_eager: IntCounter,
    pub add_queued: IntCounter,
    pub add_eager: IntCounter,
    pub register_local_location: IntCounter,

    // raided KV
    pub raided_read_cancellations: IntCounter,
    pub raided_read_cancel_failures: IntCounter,

    // checkpoints
    pub incremental_files_upload_skipped: IntCounter,
    pub incremental_files_download_skipped: IntCounter,
    pub restore_checkpoints_skipped: IntCounter,
    pub file_from_peer: IntCounter,
    pub file_from_fallback: IntCounter,

    // eviction + copies
    pub eviction_min_age_ineligible: IntCounter,
    pub rejected_push_copy_older_than_evicted: IntCounter,
    pub proactive_copies_rejected: IntCounter,

    // reconciliation + dispatch
    pub reconciliation_cycles: IntCounter,
    pub events_dispatched: IntCounter,
}

fn counter(name: &str, help: &str) -> IntCounter {
    IntCounter::new(name, help).expect("counter name")
}

impl Counters {
    pub fn new() -> Arc<Counters> {
        Arc::new(Counters {
            redundant_recent_add_skipped: counter(
                "redundant_recent_location_add_skipped",
                "adds dropped because an add was published within the update window",
            ),
            lazy_touch_event_only: counter(
                "lazy_touch_event_only",
                "suppressed adds that emitted only a touch",
            ),
            add_recent_remove_eager: counter(
                "location_add_recent_remove_eager",
                "adds published eagerly because the hash was recently removed",
            ),
            add_recent_inactive_eager: counter(
                "location_add_recent_inactive_eager",
                "adds published eagerly because this machine was recently inactive",
            ),
            add_queued: counter(
                "location_add_queued",
                "adds conveyed by event only, above the lazy-update threshold",
            ),
            add_eager: counter(
                "location_add_eager",
                "adds published to both the event hub and the global KV",
            ),
            register_local_location: counter(
                "register_local_location",
                "location registrations written to the global KV",
            ),
            raided_read_cancellations: counter(
                "raided_read_cancellations",
                "raced reads whose slower side was cancelled",
            ),
            raided_read_cancel_failures: counter(
                "raided_read_cancel_failures",
                "raced reads whose loser did not acknowledge cancellation",
            ),
            incremental_files_upload_skipped: counter(
                "incremental_checkpoint_files_upload_skipped",
                "checkpoint files referenced instead of re-uploaded",
            ),
            incremental_files_download_skipped: counter(
                "incremental_checkpoint_files_download_skipped",
                "checkpoint files reused locally instead of downloaded",
            ),
            restore_checkpoints_skipped: counter(
                "restore_checkpoints_skipped",
                "restore rounds skipped because the local checkpoint is fresh",
            ),
            file_from_peer: counter(
                "try_get_file_from_peer_succeeded",
                "checkpoint files fetched from a peer",
            ),
            file_from_fallback: counter(
                "try_get_file_from_fallback",
                "checkpoint files fetched from the central store",
            ),
            eviction_min_age_ineligible: counter(
                "eviction_min_age",
                "eviction candidates below the minimum age",
            ),
            rejected_push_copy_older_than_evicted: counter(
                "rejected_push_copy_older_than_evicted",
                "push copies rejected as older than the receiver's eviction watermark",
            ),
            proactive_copies_rejected: counter(
                "proactive_copies_rejected",
                "proactive copies the receiver refused; handled, not failed",
            ),
            reconciliation_cycles: counter(
                "reconciliation_cycles",
                "reconciliation cycles emitted",
            ),
            events_dispatched: counter(
                "events_dispatched",
                "location events applied to the local db by the master",
            ),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_are_instance_scoped() {
        let a = Counters::new();
        let b = Counters::new();
        a.add_eager.inc();
        assert_eq!(a.add_eager.get(), 1);
        assert_eq!(b.add_eager.get(), 0);
    }
}
