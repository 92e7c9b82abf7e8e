// Copyright 2025 The Chert Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Artifact names.
//!
//! Every artifact is named by the hash of its bytes, rendered as lowercase
//! hex. Two algorithms coexist: SHA1 (40 digits) and SHA3-256 (64 digits).
//! The algorithm of a name is determined entirely by its length, so a name
//! string carries everything needed to re-verify the content it labels.

use std::fmt;

use sha1::Digest as _;
use sha1::Sha1;
use sha3::Sha3_256;

use crate::hex_util;

/// Length of a SHA1 name in hex digits.
pub const HNAME_LEN_SHA1: usize = 40;
/// Length of a SHA3-256 name in hex digits.
pub const HNAME_LEN_SHA3: usize = 64;

/// A hash algorithm usable for naming artifacts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HashAlgo {
    /// SHA1, the legacy algorithm.
    Sha1,
    /// SHA3-256, the preferred algorithm.
    Sha3_256,
}

impl HashAlgo {
    /// The algorithm implied by a hex name of `len` digits, if any.
    pub fn for_hex_len(len: usize) -> Option<Self> {
        match len {
            HNAME_LEN_SHA1 => Some(Self::Sha1),
            HNAME_LEN_SHA3 => Some(Self::Sha3_256),
            _ => None,
        }
    }

    /// Number of hex digits in a name produced by this algorithm.
    pub fn hex_len(self) -> usize {
        match self {
            Self::Sha1 => HNAME_LEN_SHA1,
            Self::Sha3_256 => HNAME_LEN_SHA3,
        }
    }

    /// Human-readable algorithm name.
    pub fn name(self) -> &'static str {
        match self {
            Self::Sha1 => "SHA1",
            Self::Sha3_256 => "SHA3-256",
        }
    }

    /// Hashes `data` and returns the lowercase hex digest.
    pub fn hash_hex(self, data: &[u8]) -> String {
        match self {
            Self::Sha1 => hex_util::encode_hex(&Sha1::digest(data)),
            Self::Sha3_256 => hex_util::encode_hex(&Sha3_256::digest(data)),
        }
    }
}

/// The hex hash name of an artifact.
///
/// An `ArtifactId` is always a syntactically valid name: lowercase hex of
/// length 40 or 64. It says nothing about whether the repository holds
/// content for that name.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ArtifactId(String);

impl ArtifactId {
    /// Parses `text` as an artifact name, validating length and charset.
    pub fn parse(text: &str) -> Option<Self> {
        HashAlgo::for_hex_len(text.len())?;
        hex_util::is_lower_hex(text).then(|| Self(text.to_owned()))
    }

    /// Computes the name of `data` under `algo`.
    pub fn hash_content(algo: HashAlgo, data: &[u8]) -> Self {
        Self(algo.hash_hex(data))
    }

    /// The algorithm this name was produced by.
    pub fn algo(&self) -> HashAlgo {
        HashAlgo::for_hex_len(self.0.len()).unwrap()
    }

    /// The name as a hex string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Re-hashes `data` with this name's algorithm and compares.
    pub fn matches_content(&self, data: &[u8]) -> bool {
        self.algo().hash_hex(data) == self.0
    }
}

impl fmt::Debug for ArtifactId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ArtifactId").field(&self.0).finish()
    }
}

impl fmt::Display for ArtifactId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(&self.0)
    }
}

impl AsRef<str> for ArtifactId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Validates a hash string the way `ArtifactId::parse` does, returning the
/// algorithm on success. This is the entry point used on untrusted wire
/// input, where the caller wants the algorithm without allocating.
pub fn hname_validate(text: &str) -> Option<HashAlgo> {
    let algo = HashAlgo::for_hex_len(text.len())?;
    hex_util::is_lower_hex(text).then_some(algo)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate() {
        let sha1 = "f572d396fae9206628714fb2ce00f72e94f2258f";
        assert_eq!(hname_validate(sha1), Some(HashAlgo::Sha1));
        assert_eq!(hname_validate(&sha1[..39]), None);
        assert_eq!(hname_validate(&sha1.to_uppercase()), None);
        let sha3 = "a7ffc6f8bf1ed76651c14756a061d662f580ff4de43b49fa82d80a4b80f8434a";
        assert_eq!(hname_validate(sha3), Some(HashAlgo::Sha3_256));
    }

    #[test]
    fn test_hash_content() {
        // Known digests of "hello\n".
        let id = ArtifactId::hash_content(HashAlgo::Sha1, b"hello\n");
        assert_eq!(id.as_str(), "f572d396fae9206628714fb2ce00f72e94f2258f");
        assert!(id.matches_content(b"hello\n"));
        assert!(!id.matches_content(b"hello"));
    }

    #[test]
    fn test_empty_content_hashes() {
        let id = ArtifactId::hash_content(HashAlgo::Sha1, b"");
        assert_eq!(id.as_str(), "da39a3ee5e6b4b0d3255bfef95601890afd80709");
        let id = ArtifactId::hash_content(HashAlgo::Sha3_256, b"");
        assert_eq!(
            id.as_str(),
            "a7ffc6f8bf1ed76651c14756a061d662f580ff4de43b49fa82d80a4b80f8434a"
        );
    }
}
