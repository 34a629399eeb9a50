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

use std::collections::HashMap;

use bytes::Bytes;
use tokio::sync::Mutex;

use super::{Cursor, EventHub, SealedBatch};
use crate::{Error, Result};

const DEFAULT_MAX_MESSAGE_SIZE: usize = 192 * 1024;

/// In-memory [`EventHub`]; one instance stands in for the shared hub and is
/// handed to every machine of an in-process cluster.
pub struct MemHub {
    logs: Mutex<HashMap<String, Vec<SealedBatch>>>,
    max_message_size: usize,
}

impl Default for MemHub {
    fn default() -> Self {
        MemHub::with_max_message_size(DEFAULT_MAX_MESSAGE_SIZE)
    }
}

impl MemHub {
    pub fn with_max_message_size(max_message_size: usize) -> Self {
        MemHub {
            logs: Mutex::new(HashMap::new()),
            max_message_size,
        }
    }
}

#[crate::async_trait]
impl EventHub for MemHub {
    async fn publish(&self, epoch: &str, payload: Bytes) -> Result<Cursor> {
        if payload.len() > self.max_message_size {
            return Err(Error::InvalidArgument(format!(
                "event payload of {} bytes exceeds hub limit {}",
                payload.len(),
                self.max_message_size
            )));
        }
        let mut logs = self.logs.lock().await;
        let log = logs.entry(epoch.to_owned()).or_default();
        let cursor = log.len() as Cursor + 1;
        log.push(SealedBatch { cursor, payload });
        Ok(cursor)
    }

    async fn read(&self, epoch: &str, from: Cursor, max: usize) -> Result<Vec<SealedBatch>> {
        let logs = self.logs.lock().await;
        let Some(log) = logs.get(epoch) else {
            return Ok(Vec::new());
        };
        Ok(log
            .iter()
            .filter(|batch| batch.cursor > from)
            .take(max)
            .cloned()
            .collect())
    }

    async fn last_cursor(&self, epoch: &str) -> Result<Cursor> {
        let logs = self.logs.lock().await;
        Ok(logs.get(epoch).map(|log| log.len() as Cursor).unwrap_or(0))
    }

    fn max_message_size(&self) -> usize {
        self.max_message_size
    }
}
