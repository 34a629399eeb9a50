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

use std::{fmt, str::FromStr};

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

use crate::{Error, Result};

pub const CONTENT_HASH_LEN: usize = 32;
pub const SHORT_HASH_LEN: usize = 11;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum HashAlgorithm {
    Vso0 = 1,
    Sha256 = 2,
}

impl HashAlgorithm {
    pub fn name(&self) -> &'static str {
        match self {
            HashAlgorithm::Vso0 => "vso0",
            HashAlgorithm::Sha256 => "sha256",
        }
    }

    pub fn from_tag(tag: u8) -> Option<HashAlgorithm> {
        match tag {
            1 => Some(HashAlgorithm::Vso0),
            2 => Some(HashAlgorithm::Sha256),
            _ => None,
        }
    }

    pub fn from_name(name: &str) -> Option<HashAlgorithm> {
        match name {
            "vso0" => Some(HashAlgorithm::Vso0),
            "sha256" => Some(HashAlgorithm::Sha256),
            _ => None,
        }
    }
}

/// A full content fingerprint. Equality is bytewise; the algorithm tag is
/// part of the identity.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ContentHash {
    algo: HashAlgorithm,
    bytes: [u8; CONTENT_HASH_LEN],
}

impl ContentHash {
    pub fn new(algo: HashAlgorithm, bytes: [u8; CONTENT_HASH_LEN]) -> Self {
        ContentHash { algo, bytes }
    }

    /// Fingerprint arbitrary data. Used for checkpoint file identities.
    pub fn of_content(algo: HashAlgorithm, data: &[u8]) -> Self {
        use sha2::{Digest, Sha256};
        let digest = Sha256::digest(data);
        let mut bytes = [0u8; CONTENT_HASH_LEN];
        bytes.copy_from_slice(&digest);
        ContentHash { algo, bytes }
    }

    pub fn algorithm(&self) -> HashAlgorithm {
        self.algo
    }

    pub fn bytes(&self) -> &[u8; CONTENT_HASH_LEN] {
        &self.bytes
    }

    /// The lossy projection used as the location index key. Distinct full
    /// hashes may collide here, although it is unlikely.
    pub fn short(&self) -> ShortHash {
        let mut bytes = [0u8; SHORT_HASH_LEN];
        bytes.copy_from_slice(&self.bytes[..SHORT_HASH_LEN]);
        ShortHash {
            algo: self.algo,
            bytes,
        }
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}",
            self.algo.name(),
            hex::encode_upper(self.bytes)
        )
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self}")
    }
}

impl FromStr for ContentHash {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (algo, digits) = split_tagged(s)?;
        let raw = hex::decode(digits)
            .map_err(|_| Error::InvalidArgument(format!("content hash '{s}'")))?;
        if raw.len() != CONTENT_HASH_LEN {
            return Err(Error::InvalidArgument(format!("content hash '{s}'")));
        }
        let mut bytes = [0u8; CONTENT_HASH_LEN];
        bytes.copy_from_slice(&raw);
        Ok(ContentHash { algo, bytes })
    }
}

/// An 11-byte prefix of a [`ContentHash`], tagged with its algorithm.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ShortHash {
    algo: HashAlgorithm,
    bytes: [u8; SHORT_HASH_LEN],
}

impl ShortHash {
    pub fn new(algo: HashAlgorithm, bytes: [u8; SHORT_HASH_LEN]) -> Self {
        ShortHash { algo, bytes }
    }

    pub fn algorithm(&self) -> HashAlgorithm {
        self.algo
    }

    pub fn bytes(&self) -> &[u8; SHORT_HASH_LEN] {
        &self.bytes
    }

    /// Tag byte followed by the prefix, the form used in persisted keys.
    pub fn encode(&self) -> [u8; SHORT_HASH_LEN + 1] {
        let mut out = [0u8; SHORT_HASH_LEN + 1];
        out[0] = self.algo as u8;
        out[1..].copy_from_slice(&self.bytes);
        out
    }

    pub fn decode(raw: &[u8]) -> Result<ShortHash> {
        if raw.len() != SHORT_HASH_LEN + 1 {
            return Err(Error::Corrupt("short hash key".to_owned()));
        }
        let algo = HashAlgorithm::from_tag(raw[0])
            .ok_or_else(|| Error::Corrupt("short hash tag".to_owned()))?;
        let mut bytes = [0u8; SHORT_HASH_LEN];
        bytes.copy_from_slice(&raw[1..]);
        Ok(ShortHash { algo, bytes })
    }
}

impl From<&ContentHash> for ShortHash {
    fn from(hash: &ContentHash) -> Self {
        hash.short()
    }
}

impl fmt::Display for ShortHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}",
            self.algo.name(),
            hex::encode_upper(self.bytes)
        )
    }
}

impl fmt::Debug for ShortHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self}")
    }
}

impl FromStr for ShortHash {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (algo, digits) = split_tagged(s)?;
        let raw = hex::decode(digits)
            .map_err(|_| Error::InvalidArgument(format!("short hash '{s}'")))?;
        if raw.len() != SHORT_HASH_LEN {
            return Err(Error::InvalidArgument(format!("short hash '{s}'")));
        }
        let mut bytes = [0u8; SHORT_HASH_LEN];
        bytes.copy_from_slice(&raw);
        Ok(ShortHash { algo, bytes })
    }
}

fn split_tagged(s: &str) -> Result<(HashAlgorithm, &str)> {
    let (name, digits) = s
        .split_once(':')
        .ok_or_else(|| Error::InvalidArgument(format!("hash '{s}' has no algorithm tag")))?;
    let algo = HashAlgorithm::from_name(name)
        .ok_or_else(|| Error::InvalidArgument(format!("hash algorithm '{name}'")))?;
    Ok((algo, digits))
}

macro_rules! string_serde {
    ($ty:ident) => {
        impl Serialize for $ty {
            fn serialize<S: Serializer>(
                &self,
                serializer: S,
            ) -> std::result::Result<S::Ok, S::Error> {
                serializer.serialize_str(&self.to_string())
            }
        }

        impl<'de> Deserialize<'de> for $ty {
            fn deserialize<D: Deserializer<'de>>(
                deserializer: D,
            ) -> std::result::Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                s.parse().map_err(de::Error::custom)
            }
        }
    };
}

string_serde!(ContentHash);
string_serde!(ShortHash);
