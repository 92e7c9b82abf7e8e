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

//! Sync authentication and the capability model.
//!
//! A sync request opens with `login USER NONCE SIGNATURE`. The nonce is
//! the SHA1 of everything in the payload after the login card, which binds
//! the signature to the exact bytes sent; the signature is
//! SHA1(nonce ∥ secret), where the stored secret is itself the SHA1 of
//! the user's password. SHA1 here is a legacy-compatibility choice baked
//! into the wire protocol, not an artifact-naming decision.

use rusqlite::OptionalExtension as _;
use rusqlite::params;
use sha1::Digest as _;
use sha1::Sha1;

use crate::repo::RepoError;
use crate::repo::Repository;
use crate::repo::now_julian;

/// Capability characters.
pub mod cap {
    /// Read repository content (pull).
    pub const READ: char = 'o';
    /// Write repository content (push).
    pub const WRITE: char = 'i';
    /// Clone the repository.
    pub const CLONE: char = 'g';
    /// Send and receive private artifacts.
    pub const PRIVATE: char = 'x';
    /// Write wiki and technotes without moderation.
    pub const WIKI_UNMODERATED: char = 'w';
    /// Write tickets and attachments without moderation.
    pub const TICKET_UNMODERATED: char = 'c';
    /// Read unversioned content.
    pub const UV_READ: char = 'u';
    /// Write unversioned content.
    pub const UV_WRITE: char = 'y';
    /// Setup: implies everything.
    pub const SETUP: char = 's';
}

/// The capabilities of an authenticated (or anonymous) actor.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserPerms {
    caps: String,
}

impl UserPerms {
    /// Builds from a capability string.
    pub fn new(caps: &str) -> Self {
        Self {
            caps: caps.to_owned(),
        }
    }

    /// True if the actor holds `c` (or setup, which implies everything).
    pub fn has(&self, c: char) -> bool {
        self.caps.contains(cap::SETUP) || self.caps.contains(c)
    }

    /// Errors with [`RepoError::PermissionDenied`] unless `c` is held.
    pub fn require(&self, c: char) -> Result<(), RepoError> {
        if self.has(c) {
            Ok(())
        } else {
            Err(RepoError::PermissionDenied(c))
        }
    }
}

fn sha1_hex(data: &[u8]) -> String {
    hex::encode(Sha1::digest(data))
}

/// The nonce for a request: SHA1 over the payload bytes that follow the
/// login card.
pub fn payload_nonce(payload_after_login: &[u8]) -> String {
    sha1_hex(payload_after_login)
}

/// The secret stored for a password.
pub fn secret_for_password(password: &str) -> String {
    sha1_hex(password.as_bytes())
}

/// The signature sent on the wire: SHA1(nonce ∥ secret).
pub fn login_signature(nonce: &str, secret: &str) -> String {
    let mut buf = Vec::with_capacity(nonce.len() + secret.len());
    buf.extend_from_slice(nonce.as_bytes());
    buf.extend_from_slice(secret.as_bytes());
    sha1_hex(&buf)
}

impl Repository {
    /// Creates a user with the given password and capability string.
    pub fn user_create(
        &self,
        login: &str,
        password: &str,
        caps: &str,
    ) -> Result<i64, RepoError> {
        let mut stmt = self.db().prepare_cached(
            "INSERT INTO user(login, cap, secret, mtime) VALUES(?1, ?2, ?3, ?4)",
        )?;
        stmt.execute(params![login, caps, secret_for_password(password), now_julian()])?;
        Ok(self.db().last_insert_rowid())
    }

    /// Looks up a user's id, secret, and capabilities.
    pub fn user_lookup(&self, login: &str) -> Result<Option<(i64, String, UserPerms)>, RepoError> {
        let mut stmt = self
            .db()
            .prepare_cached("SELECT uid, secret, cap FROM user WHERE login=?1")?;
        Ok(stmt
            .query_row(params![login], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })
            .optional()?
            .map(|(uid, secret, caps)| (uid, secret, UserPerms::new(&caps))))
    }

    /// Verifies a login card against the stored secret. Returns the uid
    /// and capabilities on success, `None` on any mismatch (unknown user
    /// and bad signature are indistinguishable to the peer).
    pub fn check_login(
        &self,
        login: &str,
        nonce: &str,
        signature: &str,
    ) -> Result<Option<(i64, UserPerms)>, RepoError> {
        let Some((uid, secret, perms)) = self.user_lookup(login)? else {
            return Ok(None);
        };
        if login_signature(nonce, &secret) == signature {
            Ok(Some((uid, perms)))
        } else {
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signature_round_trip() {
        let repo = Repository::create_in_memory().unwrap();
        repo.user_create("alice", "s3cret", "ioghx").unwrap();
        let payload = b"pull 1234 abcd\n";
        let nonce = payload_nonce(payload);
        let secret = secret_for_password("s3cret");
        let sig = login_signature(&nonce, &secret);
        let (uid, perms) = repo.check_login("alice", &nonce, &sig).unwrap().unwrap();
        assert!(uid > 0);
        assert!(perms.has(cap::READ));
        assert!(!perms.has(cap::SETUP));
        // A different payload invalidates the signature.
        let other_nonce = payload_nonce(b"push 1234 abcd\n");
        assert!(repo.check_login("alice", &other_nonce, &sig).unwrap().is_none());
        assert!(repo.check_login("mallory", &nonce, &sig).unwrap().is_none());
    }

    #[test]
    fn test_setup_implies_all() {
        let perms = UserPerms::new("s");
        assert!(perms.has(cap::WRITE));
        assert!(perms.require(cap::PRIVATE).is_ok());
        let limited = UserPerms::new("o");
        assert!(matches!(
            limited.require(cap::WRITE),
            Err(RepoError::PermissionDenied('i'))
        ));
    }
}
