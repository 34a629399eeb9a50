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

use std::collections::BTreeSet;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::warn;

use crate::{cluster::MachineId, time::UnixMillis, Error, Result};

/// Size is recorded once; until then the entry carries this sentinel.
pub const UNKNOWN_SIZE: i64 = -1;

const ENTRY_VERSION: u8 = 1;
const ENTRY_HEADER_LEN: usize = 1 + 8 + 8 + 8 + 2;

/// A bitset over [`MachineId`]s.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MachineSet {
    words: Vec<u64>,
}

impl MachineSet {
    pub fn insert(&mut self, machine: MachineId) -> bool {
        let (word, bit) = Self::position(machine);
        if self.words.len() <= word {
            self.words.resize(word + 1, 0);
        }
        let mask = 1u64 << bit;
        let was_set = self.words[word] & mask != 0;
        self.words[word] |= mask;
        !was_set
    }

    pub fn remove(&mut self, machine: MachineId) -> bool {
        let (word, bit) = Self::position(machine);
        if self.words.len() <= word {
            return false;
        }
        let mask = 1u64 << bit;
        let was_set = self.words[word] & mask != 0;
        self.words[word] &= !mask;
        self.trim();
        was_set
    }

    pub fn contains(&self, machine: MachineId) -> bool {
        let (word, bit) = Self::position(machine);
        self.words
            .get(word)
            .map(|w| w & (1u64 << bit) != 0)
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|w| *w == 0)
    }

    pub fn iter(&self) -> impl Iterator<Item = MachineId> + '_ {
        self.words.iter().enumerate().flat_map(|(index, &word)| {
            (0..64u32)
                .filter(move |bit| word & (1u64 << bit) != 0)
                .map(move |bit| MachineId(index as u32 * 64 + bit))
        })
    }

    /// Clears every bit in `machines`, returning how many were set.
    pub fn mask_out(&mut self, machines: &BTreeSet<MachineId>) -> usize {
        let mut removed = 0;
        for machine in machines {
            if self.remove(*machine) {
                removed += 1;
            }
        }
        removed
    }

    /// True iff every set bit is in `machines`. An empty set is vacuously
    /// covered.
    pub fn is_subset_of(&self, machines: &BTreeSet<MachineId>) -> bool {
        self.iter().all(|machine| machines.contains(&machine))
    }

    fn position(machine: MachineId) -> (usize, u32) {
        ((machine.0 / 64) as usize, machine.0 % 64)
    }

    fn trim(&mut self) {
        while self.words.last() == Some(&0) {
            self.words.pop();
        }
    }

    fn words(&self) -> &[u64] {
        &self.words
    }
}

impl FromIterator<MachineId> for MachineSet {
    fn from_iter<I: IntoIterator<Item = MachineId>>(iter: I) -> Self {
        let mut set = MachineSet::default();
        for machine in iter {
            set.insert(machine);
        }
        set
    }
}

/// One content location record: which machines hold a hash, how big it is,
/// and when it was created and last touched.
#[derive(Clone, Debug, PartialEq)]
pub struct Entry {
    pub size: i64,
    pub machines: MachineSet,
    pub creation_time: UnixMillis,
    pub last_access_time: UnixMillis,
}

impl Entry {
    pub fn new(size: i64, now: UnixMillis) -> Self {
        Entry {
            size,
            machines: MachineSet::default(),
            creation_time: now,
            last_access_time: now,
        }
    }

    pub fn replica_count(&self) -> usize {
        self.machines.len()
    }

    pub fn set_location(&mut self, machine: MachineId) -> bool {
        self.machines.insert(machine)
    }

    pub fn clear_location(&mut self, machine: MachineId) -> bool {
        self.machines.remove(machine)
    }

    pub fn touch(&mut self, now: UnixMillis) {
        if now > self.last_access_time {
            self.last_access_time = now;
        }
    }

    /// Records the size if unknown. On conflicting known sizes the larger
    /// one wins.
    pub fn observe_size(&mut self, size: i64) {
        if size < 0 {
            return;
        }
        if self.size < 0 {
            self.size = size;
        } else if self.size != size {
            warn!(
                recorded = self.size,
                observed = size,
                "conflicting content sizes, keeping the larger"
            );
            self.size = self.size.max(size);
        }
    }

    pub fn encode(&self) -> Bytes {
        let words = self.machines.words();
        let mut buf = BytesMut::with_capacity(ENTRY_HEADER_LEN + words.len() * 8);
        buf.put_u8(ENTRY_VERSION);
        buf.put_i64(self.size);
        buf.put_u64(self.creation_time);
        buf.put_u64(self.last_access_time);
        buf.put_u16(words.len() as u16);
        for word in words {
            buf.put_u64(*word);
        }
        buf.freeze()
    }

    pub fn decode(mut buf: &[u8]) -> Result<Entry> {
        if buf.remaining() < ENTRY_HEADER_LEN {
            return Err(Error::Corrupt("location entry truncated".to_owned()));
        }
        let version = buf.get_u8();
        if version != ENTRY_VERSION {
            return Err(Error::Corrupt(format!(
                "location entry version {version}"
            )));
        }
        let size = buf.get_i64();
        let creation_time = buf.get_u64();
        let last_access_time = buf.get_u64();
        let word_count = buf.get_u16() as usize;
        if buf.remaining() < word_count * 8 {
            return Err(Error::Corrupt("location entry bitset truncated".to_owned()));
        }
        let mut words = Vec::with_capacity(word_count);
        for _ in 0..word_count {
            words.push(buf.get_u64());
        }
        Ok(Entry {
            size,
            machines: MachineSet { words },
            creation_time,
            last_access_time,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn machine_set_basics() {
        let mut set = MachineSet::default();
        assert!(set.insert(MachineId(1)));
        assert!(set.insert(MachineId(130)));
        assert!(!set.insert(MachineId(1)));
        assert_eq!(set.len(), 2);
        assert!(set.contains(MachineId(130)));
        assert_eq!(
            set.iter().collect::<Vec<_>>(),
            vec![MachineId(1), MachineId(130)]
        );
        assert!(set.remove(MachineId(130)));
        assert!(!set.remove(MachineId(130)));
        assert!(!set.is_empty());
        assert!(set.remove(MachineId(1)));
        assert!(set.is_empty());
    }

    #[test]
    fn mask_out_and_subset() {
        let mut set: MachineSet = [MachineId(1), MachineId(2), MachineId(3)]
            .into_iter()
            .collect();
        let inactive = [MachineId(2), MachineId(9)].into_iter().collect();
        assert!(!set.is_subset_of(&inactive));
        assert_eq!(set.mask_out(&inactive), 1);
        assert_eq!(set.len(), 2);

        let all = [MachineId(1), MachineId(3)].into_iter().collect();
        assert!(set.is_subset_of(&all));
    }

    #[test]
    fn entry_codec_round_trip() {
        let mut entry = Entry::new(UNKNOWN_SIZE, 42_000);
        entry.set_location(MachineId(7));
        entry.set_location(MachineId(64));
        entry.observe_size(1 << 20);
        entry.touch(50_000);

        let decoded = Entry::decode(&entry.encode()).unwrap();
        assert_eq!(decoded, entry);
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(matches!(Entry::decode(b"xy"), Err(Error::Corrupt(_))));
        let mut raw = Entry::new(3, 1).encode().to_vec();
        raw[0] = 9;
        assert!(matches!(Entry::decode(&raw), Err(Error::Corrupt(_))));
    }

    #[test]
    fn larger_size_wins_on_conflict() {
        let mut entry = Entry::new(100, 1);
        entry.observe_size(50);
        assert_eq!(entry.size, 100);
        entry.observe_size(200);
        assert_eq!(entry.size, 200);

        let mut unknown = Entry::new(UNKNOWN_SIZE, 1);
        unknown.observe_size(77);
        assert_eq!(unknown.size, 77);
    }
}
