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

//! The hash-naming policy.
//!
//! SHA1 and SHA3-256 names coexist in one repository. The policy controls
//! which algorithm names new artifacts and whether legacy SHA1 artifacts
//! are still accepted from peers. The `auto` policy promotes itself to
//! `sha3` the first time a SHA3-named artifact is observed; the promotion
//! is one-way and is written back to the stored setting.

use rusqlite::params;

use crate::object_id::HashAlgo;
use crate::repo::RepoError;
use crate::repo::Repository;

/// Policy modes, ordered from most to least SHA1-friendly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashPolicy {
    /// New artifacts use SHA1.
    Sha1,
    /// SHA1 until any SHA3 artifact is observed, then permanently `sha3`.
    Auto,
    /// New artifacts use SHA3; legacy SHA1 names are allowed and reused.
    Sha3,
    /// SHA3 only; legacy SHA1 names stay readable but are never created.
    Sha3Only,
    /// SHA3 only, and SHA1 artifacts are refused on sync except in a clone.
    ShunSha1,
}

impl HashPolicy {
    /// The policy's config-file spelling.
    pub fn name(self) -> &'static str {
        match self {
            Self::Sha1 => "sha1",
            Self::Auto => "auto",
            Self::Sha3 => "sha3",
            Self::Sha3Only => "sha3-only",
            Self::ShunSha1 => "shun-sha1",
        }
    }

    /// Parses a config-file spelling.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "sha1" => Some(Self::Sha1),
            "auto" => Some(Self::Auto),
            "sha3" => Some(Self::Sha3),
            "sha3-only" => Some(Self::Sha3Only),
            "shun-sha1" => Some(Self::ShunSha1),
            _ => None,
        }
    }

    /// The algorithm used to name a new artifact under this policy.
    pub fn new_artifact_algo(self) -> HashAlgo {
        match self {
            Self::Sha1 | Self::Auto => HashAlgo::Sha1,
            Self::Sha3 | Self::Sha3Only | Self::ShunSha1 => HashAlgo::Sha3_256,
        }
    }

    /// Whether an artifact named with `algo` is accepted from a peer.
    /// During a clone even `shun-sha1` accepts legacy names, so that old
    /// repositories can still be copied wholesale.
    pub fn accepts_on_sync(self, algo: HashAlgo, is_clone: bool) -> bool {
        match algo {
            HashAlgo::Sha3_256 => true,
            HashAlgo::Sha1 => self != Self::ShunSha1 || is_clone,
        }
    }
}

impl Repository {
    /// The effective hash policy. When no policy was ever stored, the
    /// default depends on content: a repository holding only SHA1 names
    /// gets `auto`, anything else (including an empty one) gets `sha3`.
    pub fn hash_policy(&self) -> Result<HashPolicy, RepoError> {
        if let Some(policy) = self.cached_policy.get() {
            return Ok(policy);
        }
        let policy = match self.config_get("hash-policy")? {
            Some(name) => HashPolicy::from_name(&name)
                .ok_or_else(|| RepoError::NotARepository(format!("bad hash-policy {name:?}")))?,
            None => self.default_hash_policy()?,
        };
        self.cached_policy.set(Some(policy));
        Ok(policy)
    }

    fn default_hash_policy(&self) -> Result<HashPolicy, RepoError> {
        let mut has_sha3 = self
            .db()
            .prepare_cached("SELECT 1 FROM blob WHERE length(uuid)>40")?;
        let mut has_sha1 = self
            .db()
            .prepare_cached("SELECT 1 FROM blob WHERE length(uuid)==40")?;
        if has_sha3.exists(params![])? || !has_sha1.exists(params![])? {
            Ok(HashPolicy::Sha3)
        } else {
            Ok(HashPolicy::Auto)
        }
    }

    /// Stores a new hash policy. Selecting `auto` for a repository that
    /// already holds SHA3 artifacts lands on `sha3` directly.
    pub fn set_hash_policy(&self, policy: HashPolicy) -> Result<HashPolicy, RepoError> {
        let mut policy = policy;
        if policy == HashPolicy::Auto {
            let mut has_sha3 = self
                .db()
                .prepare_cached("SELECT 1 FROM blob WHERE length(uuid)>40")?;
            if has_sha3.exists(params![])? {
                policy = HashPolicy::Sha3;
            }
        }
        self.config_set("hash-policy", policy.name())?;
        self.cached_policy.set(Some(policy));
        Ok(policy)
    }

    /// Notes that an artifact named with `algo` entered the repository.
    /// Under `auto` this promotes the policy to `sha3`, permanently.
    pub fn observe_artifact_algo(&self, algo: HashAlgo) -> Result<(), RepoError> {
        if algo == HashAlgo::Sha3_256 && self.hash_policy()? == HashPolicy::Auto {
            self.set_hash_policy(HashPolicy::Sha3)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    #[test]
    fn test_names_round_trip() {
        for policy in [
            HashPolicy::Sha1,
            HashPolicy::Auto,
            HashPolicy::Sha3,
            HashPolicy::Sha3Only,
            HashPolicy::ShunSha1,
        ] {
            assert_eq!(HashPolicy::from_name(policy.name()), Some(policy));
        }
        assert_eq!(HashPolicy::from_name("md5"), None);
    }

    #[test_case(HashPolicy::Sha1, HashAlgo::Sha1, false, true ; "sha1 under sha1")]
    #[test_case(HashPolicy::Sha3, HashAlgo::Sha1, false, true ; "legacy sha1 under sha3")]
    #[test_case(HashPolicy::Sha3Only, HashAlgo::Sha1, false, true ; "legacy sha1 under sha3-only")]
    #[test_case(HashPolicy::ShunSha1, HashAlgo::Sha1, false, false ; "sha1 refused under shun-sha1")]
    #[test_case(HashPolicy::ShunSha1, HashAlgo::Sha1, true, true ; "clone bypasses shun-sha1")]
    #[test_case(HashPolicy::ShunSha1, HashAlgo::Sha3_256, false, true ; "sha3 always accepted")]
    fn test_sync_acceptance(policy: HashPolicy, algo: HashAlgo, is_clone: bool, accepted: bool) {
        assert_eq!(policy.accepts_on_sync(algo, is_clone), accepted);
    }

    #[test]
    fn test_auto_promotion() {
        let repo = Repository::create_in_memory().unwrap();
        repo.set_hash_policy(HashPolicy::Auto).unwrap();
        assert_eq!(repo.hash_policy().unwrap(), HashPolicy::Auto);
        repo.observe_artifact_algo(HashAlgo::Sha1).unwrap();
        assert_eq!(repo.hash_policy().unwrap(), HashPolicy::Auto);
        repo.observe_artifact_algo(HashAlgo::Sha3_256).unwrap();
        assert_eq!(repo.hash_policy().unwrap(), HashPolicy::Sha3);
        // One-way: the stored setting was rewritten.
        assert_eq!(
            repo.config_get("hash-policy").unwrap().as_deref(),
            Some("sha3")
        );
    }
}
