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

use super::Entry;
use crate::hash::ShortHash;

/// Coalescing write cache in front of the persistent layer.
///
/// Updates for the same short hash merge into the latest entry; a drain
/// hands everything to one write batch. Reads that miss here fall through
/// to the engine and do not populate the cache.
#[derive(Default)]
pub(crate) struct WriteCache {
    entries: HashMap<ShortHash, Entry>,
}

impl WriteCache {
    pub fn get(&self, hash: &ShortHash) -> Option<Entry> {
        self.entries.get(hash).cloned()
    }

    pub fn insert(&mut self, hash: ShortHash, entry: Entry) {
        self.entries.insert(hash, entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn drain(&mut self) -> Vec<(ShortHash, Entry)> {
        self.entries.drain().collect()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        cluster::MachineId,
        hash::{ContentHash, HashAlgorithm},
        store::UNKNOWN_SIZE,
    };

    #[test]
    fn updates_coalesce_per_hash() {
        let hash = ContentHash::new(HashAlgorithm::Vso0, [9; 32]).short();
        let mut cache = WriteCache::default();

        let mut entry = Entry::new(UNKNOWN_SIZE, 1_000);
        entry.set_location(MachineId(1));
        cache.insert(hash, entry);

        let mut merged = cache.get(&hash).unwrap();
        merged.set_location(MachineId(2));
        merged.touch(2_000);
        cache.insert(hash, merged);

        assert_eq!(cache.len(), 1);
        let drained = cache.drain();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].1.replica_count(), 2);
        assert_eq!(drained[0].1.last_access_time, 2_000);
        assert_eq!(cache.len(), 0);
    }
}
