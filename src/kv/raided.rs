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

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use bytes::Bytes;
use futures::future::{select, Either};
use tokio::{task::JoinHandle, time::timeout};
use tracing::warn;

use crate::{counters::Counters, kv::GlobalKv, Error, Result};

/// A pair of independent KV back-ends presented as one.
///
/// Writes go to both sides; reads race both sides and the slower request is
/// cancelled once a winner is in, with the cancellation awaited before the
/// call returns so outstanding work stays bounded.
pub struct RaidedKv {
    primary: Arc<dyn GlobalKv>,
    secondary: Option<Arc<dyn GlobalKv>>,
    retry_window: Duration,
    counters: Arc<Counters>,
}

impl RaidedKv {
    pub fn new(
        primary: Arc<dyn GlobalKv>,
        secondary: Option<Arc<dyn GlobalKv>>,
        retry_window: Duration,
        counters: Arc<Counters>,
    ) -> Self {
        RaidedKv {
            primary,
            secondary,
            retry_window,
            counters,
        }
    }

    fn window_elapsed() -> Error {
        Error::Transient("global kv retry window elapsed".to_owned())
    }

    async fn cancel_loser<T>(&self, loser: JoinHandle<T>) {
        loser.abort();
        match loser.await {
            Err(err) if err.is_cancelled() => {
                self.counters.raided_read_cancellations.inc();
            }
            _ => {
                // The loser raced to completion (or panicked) before the
                // abort landed.
                self.counters.raided_read_cancellations.inc();
                self.counters.raided_read_cancel_failures.inc();
            }
        }
    }

    /// Overwrites `key` on one side so a diverged mirror catches back up.
    async fn force_align(side: &Arc<dyn GlobalKv>, key: &[u8], value: &Bytes) {
        for _ in 0..3 {
            let current = match side.get(key).await {
                Ok(current) => current,
                Err(err) => {
                    warn!(err = ?err, "raided kv: mirror read failed during align");
                    return;
                }
            };
            if current.as_deref() == Some(value.as_ref()) {
                return;
            }
            match side
                .compare_and_set(key, current.as_deref(), value.clone())
                .await
            {
                Ok(true) => return,
                Ok(false) => continue,
                Err(err) => {
                    warn!(err = ?err, "raided kv: mirror align failed");
                    return;
                }
            }
        }
        warn!("raided kv: mirror align lost three races, leaving side stale");
    }
}

#[crate::async_trait]
impl GlobalKv for RaidedKv {
    async fn get(&self, key: &[u8]) -> Result<Option<Bytes>> {
        let secondary = match &self.secondary {
            Some(secondary) => secondary.clone(),
            None => {
                return timeout(self.retry_window, self.primary.get(key))
                    .await
                    .map_err(|_| Self::window_elapsed())?;
            }
        };

        let primary = self.primary.clone();
        let key_a = key.to_vec();
        let key_b = key.to_vec();
        let h1 = tokio::spawn(async move { primary.get(&key_a).await });
        let h2 = tokio::spawn(async move { secondary.get(&key_b).await });
        let abort_1 = h1.abort_handle();
        let abort_2 = h2.abort_handle();

        let race = async {
            let (first, other) = match select(h1, h2).await {
                Either::Left((first, other)) => (first, other),
                Either::Right((first, other)) => (first, other),
            };
            match first {
                // A hit wins the race outright.
                Ok(Ok(Some(value))) => {
                    self.cancel_loser(other).await;
                    Ok(Some(value))
                }
                // An empty answer may just be a side that lost the key;
                // give the slower side a chance to recover it.
                Ok(Ok(None)) => match other.await {
                    Ok(result) => Ok(result.unwrap_or(None)),
                    Err(_) => Ok(None),
                },
                Ok(Err(_)) | Err(_) => match other.await {
                    Ok(result) => result,
                    Err(err) => Err(err.into()),
                },
            }
        };

        match timeout(self.retry_window, race).await {
            Ok(result) => result,
            Err(_) => {
                abort_1.abort();
                abort_2.abort();
                Err(Self::window_elapsed())
            }
        }
    }

    async fn set_if_not_exists(&self, key: &[u8], value: Bytes) -> Result<bool> {
        let op = async {
            match &self.secondary {
                None => self.primary.set_if_not_exists(key, value.clone()).await,
                Some(secondary) => {
                    let (primary, mirror) = tokio::join!(
                        self.primary.set_if_not_exists(key, value.clone()),
                        secondary.set_if_not_exists(key, value.clone()),
                    );
                    let set = primary?;
                    if set && !matches!(mirror, Ok(true)) {
                        Self::force_align(secondary, key, &value).await;
                    }
                    Ok(set)
                }
            }
        };
        timeout(self.retry_window, op)
            .await
            .map_err(|_| Self::window_elapsed())?
    }

    async fn compare_and_set(
        &self,
        key: &[u8],
        expected: Option<&[u8]>,
        value: Bytes,
    ) -> Result<bool> {
        let op = async {
            match &self.secondary {
                None => {
                    self.primary
                        .compare_and_set(key, expected, value.clone())
                        .await
                }
                Some(secondary) => {
                    let (primary, mirror) = tokio::join!(
                        self.primary.compare_and_set(key, expected, value.clone()),
                        secondary.compare_and_set(key, expected, value.clone()),
                    );
                    let swapped = primary?;
                    if swapped && !matches!(mirror, Ok(true)) {
                        Self::force_align(secondary, key, &value).await;
                    }
                    Ok(swapped)
                }
            }
        };
        timeout(self.retry_window, op)
            .await
            .map_err(|_| Self::window_elapsed())?
    }

    async fn scan(&self, prefix: &[u8]) -> Result<Vec<(Bytes, Bytes)>> {
        let op = async {
            match &self.secondary {
                None => self.primary.scan(prefix).await,
                Some(secondary) => {
                    let (primary, mirror) =
                        tokio::join!(self.primary.scan(prefix), secondary.scan(prefix));
                    match (primary, mirror) {
                        (Ok(a), Ok(b)) => {
                            // Primary wins on key conflicts.
                            let mut merged = b
                                .into_iter()
                                .collect::<BTreeMap<Bytes, Bytes>>();
                            merged.extend(a);
                            Ok(merged.into_iter().collect())
                        }
                        (Ok(a), Err(_)) => Ok(a),
                        (Err(_), Ok(b)) => Ok(b),
                        (Err(err), Err(_)) => Err(err),
                    }
                }
            }
        };
        timeout(self.retry_window, op)
            .await
            .map_err(|_| Self::window_elapsed())?
    }

    async fn delete(&self, key: &[u8]) -> Result<bool> {
        let op = async {
            match &self.secondary {
                None => self.primary.delete(key).await,
                Some(secondary) => {
                    let (primary, mirror) =
                        tokio::join!(self.primary.delete(key), secondary.delete(key));
                    if let Err(err) = mirror {
                        warn!(err = ?err, "raided kv: mirror delete failed");
                    }
                    primary
                }
            }
        };
        timeout(self.retry_window, op)
            .await
            .map_err(|_| Self::window_elapsed())?
    }

    async fn delete_matching(
        &self,
        predicate: &(dyn for<'r> Fn(&'r [u8]) -> bool + Send + Sync),
    ) -> Result<usize> {
        let removed = self.primary.delete_matching(predicate).await?;
        if let Some(secondary) = &self.secondary {
            if let Err(err) = secondary.delete_matching(predicate).await {
                warn!(err = ?err, "raided kv: mirror delete_matching failed");
            }
        }
        Ok(removed)
    }
}
