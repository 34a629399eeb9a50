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

use std::{sync::Arc, time::Duration};

use crate::{
    counters::Counters,
    hash::ShortHash,
    store::LocationDb,
    time::{millis_between, Clock, UnixMillis},
    Result,
};

#[derive(Clone, Copy, Debug)]
pub struct EvictionCandidate {
    pub hash: ShortHash,
    pub last_access_time: UnixMillis,
}

#[derive(Clone, Copy, Debug)]
pub struct RankedCandidate {
    pub hash: ShortHash,
    pub last_access_time: UnixMillis,
    pub age: u64,
    /// Age computed against the credited last-access time; extra replicas
    /// push the access time into the past, aging the content.
    pub effective_age: i64,
    pub replica_count: usize,
    pub eligible: bool,
}

/// Orders local content by eviction preference: oldest effective age first.
/// Each replica beyond the first subtracts a credit from the content's
/// last-access time, so well-replicated content ages faster locally and is
/// the safest to drop.
pub struct EvictionRanker {
    db: Arc<LocationDb>,
    replica_credit: Duration,
    min_age: Duration,
    page_size: usize,
    clock: Arc<dyn Clock>,
    counters: Arc<Counters>,
}

impl EvictionRanker {
    pub fn new(
        db: Arc<LocationDb>,
        replica_credit: Duration,
        min_age: Duration,
        page_size: usize,
        clock: Arc<dyn Clock>,
        counters: Arc<Counters>,
    ) -> Self {
        EvictionRanker {
            db,
            replica_credit,
            min_age,
            page_size,
            clock,
            counters,
        }
    }

    pub fn effective_age(&self, age: u64, replica_count: usize) -> i64 {
        let credit = self.replica_credit.as_millis() as i64;
        age as i64 + credit * replica_count.saturating_sub(1) as i64
    }

    /// Ranks one page of candidates against the current index state.
    pub async fn rank_page(
        &self,
        page: &[EvictionCandidate],
        reverse: bool,
    ) -> Result<Vec<RankedCandidate>> {
        let now = self.clock.now();
        let min_age = self.min_age.as_millis() as u64;
        let mut ranked = Vec::with_capacity(page.len());
        for candidate in page {
            let replica_count = self
                .db
                .try_get(&candidate.hash)
                .await?
                .map(|entry| entry.replica_count().max(1))
                .unwrap_or(1);
            let age = millis_between(candidate.last_access_time, now);
            let eligible = age >= min_age;
            if !eligible {
                self.counters.eviction_min_age_ineligible.inc();
            }
            ranked.push(RankedCandidate {
                hash: candidate.hash,
                last_access_time: candidate.last_access_time,
                age,
                effective_age: self.effective_age(age, replica_count),
                replica_count,
                eligible,
            });
        }
        ranked.sort_by(|a, b| {
            b.effective_age
                .cmp(&a.effective_age)
                .then(b.age.cmp(&a.age))
        });
        if reverse {
            ranked.reverse();
        }
        Ok(ranked)
    }

    /// Ranks candidates page by page in input order. The result is sorted
    /// within each page, approximately sorted overall.
    pub async fn rank(
        &self,
        candidates: &[EvictionCandidate],
        reverse: bool,
    ) -> Result<Vec<RankedCandidate>> {
        let mut out = Vec::with_capacity(candidates.len());
        for page in candidates.chunks(self.page_size) {
            out.extend(self.rank_page(page, reverse).await?);
        }
        Ok(out)
    }
}

/// Fraction of adjacent pairs in eviction-preference order. The paged
/// algorithm guarantees this only approximately across page boundaries.
pub fn pairwise_monotonicity(ranked: &[RankedCandidate]) -> f64 {
    if ranked.len() < 2 {
        return 1.0;
    }
    let ordered = ranked
        .windows(2)
        .filter(|pair| pair[0].effective_age >= pair[1].effective_age)
        .count();
    ordered as f64 / (ranked.len() - 1) as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        cluster::MachineId,
        hash::{ContentHash, HashAlgorithm},
        store::MemEngine,
        time::ManualClock,
    };

    fn short(byte: u8) -> ShortHash {
        ContentHash::new(HashAlgorithm::Vso0, [byte; 32]).short()
    }

    struct Fixture {
        clock: ManualClock,
        db: Arc<LocationDb>,
        ranker: EvictionRanker,
        counters: Arc<Counters>,
    }

    fn fixture(page_size: usize) -> Fixture {
        let clock = ManualClock::new(10_000_000);
        let counters = Counters::new();
        let db = Arc::new(LocationDb::new(
            Arc::new(MemEngine::default()),
            Arc::new(clock.clone()),
            1_000,
            Duration::from_secs(3600),
        ));
        let ranker = EvictionRanker::new(
            db.clone(),
            Duration::from_secs(1800),
            Duration::from_secs(60),
            page_size,
            Arc::new(clock.clone()),
            counters.clone(),
        );
        Fixture {
            clock,
            db,
            ranker,
            counters,
        }
    }

    #[tokio::test]
    async fn replica_credit_reorders_candidates() {
        let f = fixture(100);
        let lonely = short(1);
        let replicated = short(2);
        f.db.location_added(&lonely, MachineId(1), 1).await.unwrap();
        for machine in 1..=5u32 {
            f.db.location_added(&replicated, MachineId(machine), 1)
                .await
                .unwrap();
        }

        let now = f.clock.now();
        // The replicated hash was accessed much later, yet four replica
        // credits of 30 minutes each age it past the lonely hash, making
        // it the safer eviction.
        let candidates = [
            EvictionCandidate {
                hash: lonely,
                last_access_time: now - 3_600_000,
            },
            EvictionCandidate {
                hash: replicated,
                last_access_time: now - 600_000,
            },
        ];
        let ranked = f.ranker.rank(&candidates, false).await.unwrap();
        assert_eq!(ranked[0].hash, replicated);
        assert!(ranked[0].effective_age > ranked[1].effective_age);
        assert_eq!(
            ranked[0].effective_age,
            600_000 + 4 * 1_800_000
        );

        let reversed = f.ranker.rank(&candidates, true).await.unwrap();
        assert_eq!(reversed[0].hash, lonely);
    }

    #[tokio::test]
    async fn young_content_is_ineligible() {
        let f = fixture(100);
        let now = f.clock.now();
        let candidates = [EvictionCandidate {
            hash: short(1),
            last_access_time: now - 1_000,
        }];
        let ranked = f.ranker.rank(&candidates, false).await.unwrap();
        assert!(!ranked[0].eligible);
        assert_eq!(f.counters.eviction_min_age_ineligible.get(), 1);
    }

    #[tokio::test]
    async fn paged_ranking_is_approximately_sorted() {
        let f = fixture(25);
        let now = f.clock.now();
        // Candidates arrive roughly oldest-first with some jitter, the way
        // an access-time enumeration hands them over.
        let candidates = (0..200u32)
            .map(|i| {
                let jitter = (i % 7) as u64 * 4_000;
                EvictionCandidate {
                    hash: ContentHash::new(HashAlgorithm::Vso0, {
                        let mut b = [0u8; 32];
                        b[0] = (i >> 8) as u8;
                        b[1] = i as u8;
                        b
                    })
                    .short(),
                    last_access_time: now - 8_000_000 + i as u64 * 30_000 + jitter,
                }
            })
            .collect::<Vec<_>>();

        let ranked = f.ranker.rank(&candidates, false).await.unwrap();
        assert_eq!(ranked.len(), candidates.len());
        assert!(pairwise_monotonicity(&ranked) >= 0.99);
    }
}
