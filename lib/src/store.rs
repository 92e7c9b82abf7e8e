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

//! The content-addressed blob store.
//!
//! Every artifact is a row in `blob`. Stored content is zlib-deflated with
//! a four-byte big-endian uncompressed-length prefix, and may additionally
//! be a delta against another row (a `delta` table entry names the base).
//! A row with `size = -1` is a *phantom*: the name is known, the content
//! has not arrived yet.
//!
//! Reads go through [`Repository::content_get`], which transparently
//! inverts delta chains and caches reconstructed bytes. Writes are
//! idempotent on the artifact name and queue every touched row for the
//! commit-time integrity verifier.

use std::io::Read as _;
use std::io::Write as _;
use std::sync::Arc;

use flate2::Compression;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use rusqlite::OptionalExtension as _;
use rusqlite::params;
use thiserror::Error;
use tracing::debug;

use crate::delta;
use crate::delta::DeltaError;
use crate::object_id::ArtifactId;
use crate::repo::RepoError;
use crate::repo::Repository;
use crate::repo::Rid;
use crate::verify;

/// Delta chains longer than this fail instead of recursing further. The
/// deltify paths never build chains anywhere near this deep.
const MAX_DELTA_DEPTH: usize = 64;

/// Blob store failures.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Content did not hash to its declared name.
    #[error("content of {uuid} does not match its hash")]
    CorruptBlob {
        /// The declared artifact name.
        uuid: String,
    },
    /// A stored or received delta failed to decode.
    #[error(transparent)]
    CorruptDelta(#[from] DeltaError),
    /// The operation needed content that is known only by hash.
    #[error("artifact rid {0} is a phantom; content has not been received")]
    Phantom(Rid),
    /// A delta chain exceeded [`MAX_DELTA_DEPTH`].
    #[error("delta chain for rid {0} is too deep")]
    DeltaChainTooDeep(Rid),
    /// The artifact is on the shun list and may not be stored.
    #[error("artifact {0} is shunned")]
    Shunned(String),
    /// A stored compressed blob was malformed.
    #[error("invalid compressed content for rid {0}")]
    BadEncoding(Rid),
}

/// Compresses `data` into the stored form: a 4-byte big-endian length
/// prefix followed by a zlib stream.
pub(crate) fn compress(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() / 2 + 64);
    out.extend_from_slice(&(data.len() as u32).to_be_bytes());
    let mut enc = ZlibEncoder::new(out, Compression::default());
    enc.write_all(data).expect("writing to a Vec cannot fail");
    enc.finish().expect("writing to a Vec cannot fail")
}

/// Inverts [`compress`], checking the length prefix.
pub(crate) fn decompress(stored: &[u8], rid: Rid) -> Result<Vec<u8>, StoreError> {
    if stored.len() < 4 {
        return Err(StoreError::BadEncoding(rid));
    }
    let declared = u32::from_be_bytes(stored[..4].try_into().unwrap()) as usize;
    let mut out = Vec::with_capacity(declared);
    let mut dec = ZlibDecoder::new(&stored[4..]);
    dec.read_to_end(&mut out)
        .map_err(|_| StoreError::BadEncoding(rid))?;
    if out.len() != declared {
        return Err(StoreError::BadEncoding(rid));
    }
    Ok(out)
}

impl Repository {
    /// Stores `content`, naming it by the current hash policy. Returns the
    /// rid and the computed name. Idempotent: existing full rows are
    /// returned as-is, phantoms are filled in place.
    pub fn content_put(&self, content: &[u8]) -> Result<(Rid, ArtifactId), RepoError> {
        let algo = self.hash_policy()?.new_artifact_algo();
        let id = ArtifactId::hash_content(algo, content);
        let rid = self.content_put_ex(content, &id, 0, false)?;
        Ok((rid, id))
    }

    /// Stores `content` under a declared name, with receive provenance and
    /// privacy. Fails with [`StoreError::CorruptBlob`] if the content does
    /// not hash to `id`, and with [`StoreError::Shunned`] if `id` is on the
    /// shun list.
    pub fn content_put_ex(
        &self,
        content: &[u8],
        id: &ArtifactId,
        rcvid: i64,
        private: bool,
    ) -> Result<Rid, RepoError> {
        assert!(self.in_transaction(), "content_put requires a transaction");
        if !id.matches_content(content) {
            return Err(StoreError::CorruptBlob {
                uuid: id.as_str().to_owned(),
            }
            .into());
        }
        if self.is_shunned(id)? {
            return Err(StoreError::Shunned(id.as_str().to_owned()).into());
        }
        let existing: Option<(Rid, i64)> = {
            let mut stmt = self
                .db()
                .prepare_cached("SELECT rid, size FROM blob WHERE uuid=?1")?;
            stmt.query_row(params![id.as_str()], |row| {
                Ok((row.get(0)?, row.get::<_, Option<i64>>(1)?.unwrap_or(-1)))
            })
            .optional()?
        };
        let rid = match existing {
            Some((rid, size)) if size >= 0 => return Ok(rid),
            Some((rid, _)) => {
                // Fill a phantom in place.
                let mut stmt = self.db().prepare_cached(
                    "UPDATE blob SET content=?1, size=?2, rcvid=?3 WHERE rid=?4",
                )?;
                stmt.execute(params![compress(content), content.len() as i64, rcvid, rid])?;
                self.content_cache.borrow_mut().pop(&rid);
                debug!(rid, uuid = id.as_str(), "phantom filled");
                rid
            }
            None => {
                let mut stmt = self.db().prepare_cached(
                    "INSERT INTO blob(rcvid, size, uuid, content) VALUES(?1, ?2, ?3, ?4)",
                )?;
                stmt.execute(params![
                    rcvid,
                    content.len() as i64,
                    id.as_str(),
                    compress(content)
                ])?;
                self.db().last_insert_rowid()
            }
        };
        if private {
            self.mark_private(rid)?;
        } else if !self.content_is_private(rid)? {
            self.mark_for_send(rid)?;
        }
        self.observe_artifact_algo(id.algo())?;
        verify::verify_before_commit(self, rid);
        Ok(rid)
    }

    /// Ensures a row exists for `id`, inserting a phantom if the name has
    /// never been seen. Used when a manifest or a peer names an artifact
    /// whose content has not been received.
    pub fn content_reference(&self, id: &ArtifactId) -> Result<Rid, RepoError> {
        if let Some(rid) = self.rid_for_uuid(id)? {
            return Ok(rid);
        }
        let mut stmt = self.db().prepare_cached(
            "INSERT INTO blob(rcvid, size, uuid, content) VALUES(0, -1, ?1, NULL)",
        )?;
        stmt.execute(params![id.as_str()])?;
        let rid = self.db().last_insert_rowid();
        debug!(rid, uuid = id.as_str(), "phantom created");
        Ok(rid)
    }

    /// The original (uncompressed, delta-resolved) size of a blob, or -1
    /// for phantoms.
    pub fn content_size(&self, rid: Rid) -> Result<i64, RepoError> {
        let mut stmt = self
            .db()
            .prepare_cached("SELECT size FROM blob WHERE rid=?1")?;
        let size: Option<Option<i64>> =
            stmt.query_row(params![rid], |row| row.get(0)).optional()?;
        match size {
            Some(Some(n)) => Ok(n),
            Some(None) => Ok(-1),
            None => Err(RepoError::NotFound(format!("rid {rid}"))),
        }
    }

    /// True if the blob is a phantom.
    pub fn content_is_phantom(&self, rid: Rid) -> Result<bool, RepoError> {
        Ok(self.content_size(rid)? < 0)
    }

    /// Reads and reconstructs the content of a blob, resolving delta
    /// chains. Recently reconstructed bytes are cached so deep chains
    /// amortize.
    pub fn content_get(&self, rid: Rid) -> Result<Arc<Vec<u8>>, RepoError> {
        if let Some(hit) = self.content_cache.borrow_mut().get(&rid) {
            return Ok(Arc::clone(hit));
        }
        // Walk to the full blob at the root of the chain, collecting the
        // compressed delta of each level on the way.
        let mut chain: Vec<(Rid, Vec<u8>)> = Vec::new();
        let mut cur = rid;
        let base: Arc<Vec<u8>> = loop {
            if chain.len() > MAX_DELTA_DEPTH {
                return Err(StoreError::DeltaChainTooDeep(rid).into());
            }
            if let Some(hit) = self.content_cache.borrow_mut().get(&cur) {
                break Arc::clone(hit);
            }
            let row: Option<(Option<Vec<u8>>, Option<Rid>)> = {
                let mut stmt = self.db().prepare_cached(
                    "SELECT blob.content, delta.srcid FROM blob
                      LEFT JOIN delta ON delta.rid=blob.rid
                     WHERE blob.rid=?1",
                )?;
                stmt.query_row(params![cur], |row| Ok((row.get(0)?, row.get(1)?)))
                    .optional()?
            };
            let Some((content, srcid)) = row else {
                return Err(RepoError::NotFound(format!("rid {cur}")));
            };
            let Some(stored) = content else {
                return Err(StoreError::Phantom(cur).into());
            };
            match srcid {
                None => {
                    let full = Arc::new(decompress(&stored, cur)?);
                    self.content_cache.borrow_mut().put(cur, Arc::clone(&full));
                    break full;
                }
                Some(srcid) => {
                    chain.push((cur, stored));
                    cur = srcid;
                }
            }
        };
        // Apply the deltas top-down, caching every level reconstructed.
        let mut full = base;
        for (level_rid, stored) in chain.into_iter().rev() {
            let delta_bytes = decompress(&stored, level_rid)?;
            let next = delta::apply(&full, &delta_bytes).map_err(StoreError::CorruptDelta)?;
            full = Arc::new(next);
            self.content_cache
                .borrow_mut()
                .put(level_rid, Arc::clone(&full));
        }
        Ok(full)
    }

    /// Replaces a delta-encoded blob with its full form in place, removing
    /// the delta row. Required before the delta's base becomes
    /// inaccessible (shun, disapprove, privatization boundaries).
    pub fn content_undelta(&self, rid: Rid) -> Result<(), RepoError> {
        let has_delta = {
            let mut stmt = self
                .db()
                .prepare_cached("SELECT 1 FROM delta WHERE rid=?1")?;
            stmt.exists(params![rid])?
        };
        if !has_delta {
            return Ok(());
        }
        let content = self.content_get(rid)?;
        let mut stmt = self
            .db()
            .prepare_cached("UPDATE blob SET content=?1, size=?2 WHERE rid=?3")?;
        stmt.execute(params![compress(&content), content.len() as i64, rid])?;
        let mut stmt = self.db().prepare_cached("DELETE FROM delta WHERE rid=?1")?;
        stmt.execute(params![rid])?;
        verify::verify_before_commit(self, rid);
        Ok(())
    }

    /// Re-encodes `rid` as a delta whose base is `srcid`, when that is
    /// smaller than the current full encoding (always, with `force`).
    /// Refuses quietly when it would violate an invariant: a phantom on
    /// either side, a cycle through the delta graph, or a public blob
    /// delta-based on a private one. Returns true if the row was
    /// re-encoded.
    pub fn content_deltify(&self, rid: Rid, srcid: Rid, force: bool) -> Result<bool, RepoError> {
        if rid == srcid {
            return Ok(false);
        }
        if self.content_is_phantom(rid)? || self.content_is_phantom(srcid)? {
            return Ok(false);
        }
        // A public blob must not lean on a private base; `force` overrides
        // for callers that will fix visibility themselves.
        if !force && self.content_is_private(srcid)? && !self.content_is_private(rid)? {
            return Ok(false);
        }
        // The base's chain must not pass through rid.
        let mut cur = srcid;
        let mut depth = 0;
        loop {
            let next: Option<Rid> = {
                let mut stmt = self
                    .db()
                    .prepare_cached("SELECT srcid FROM delta WHERE rid=?1")?;
                stmt.query_row(params![cur], |row| row.get(0)).optional()?
            };
            match next {
                Some(n) if n == rid => return Ok(false),
                Some(n) => {
                    cur = n;
                    depth += 1;
                    if depth > MAX_DELTA_DEPTH {
                        return Ok(false);
                    }
                }
                None => break,
            }
        }
        let target = self.content_get(rid)?;
        let base = self.content_get(srcid)?;
        let delta_bytes = delta::create(&base, &target);
        let delta_stored = compress(&delta_bytes);
        if !force {
            let current_len: i64 = {
                let mut stmt = self
                    .db()
                    .prepare_cached("SELECT length(content) FROM blob WHERE rid=?1")?;
                stmt.query_row(params![rid], |row| row.get(0))?
            };
            if delta_stored.len() as i64 >= current_len {
                return Ok(false);
            }
        }
        let mut stmt = self
            .db()
            .prepare_cached("UPDATE blob SET content=?1 WHERE rid=?2")?;
        stmt.execute(params![delta_stored, rid])?;
        let mut stmt = self
            .db()
            .prepare_cached("REPLACE INTO delta(rid, srcid) VALUES(?1, ?2)")?;
        stmt.execute(params![rid, srcid])?;
        verify::verify_before_commit(self, rid);
        Ok(true)
    }

    /// True if the blob is in the private set.
    pub fn content_is_private(&self, rid: Rid) -> Result<bool, RepoError> {
        let mut stmt = self
            .db()
            .prepare_cached("SELECT 1 FROM private WHERE rid=?1")?;
        Ok(stmt.exists(params![rid])?)
    }

    /// Adds the blob to the private set and withdraws it from the send
    /// queues.
    pub fn mark_private(&self, rid: Rid) -> Result<(), RepoError> {
        self.db()
            .prepare_cached("INSERT OR IGNORE INTO private VALUES(?1)")?
            .execute(params![rid])?;
        self.db()
            .prepare_cached("DELETE FROM unsent WHERE rid=?1")?
            .execute(params![rid])?;
        self.db()
            .prepare_cached("DELETE FROM unclustered WHERE rid=?1")?
            .execute(params![rid])?;
        Ok(())
    }

    /// Queues the blob for transmission and clustering.
    pub(crate) fn mark_for_send(&self, rid: Rid) -> Result<(), RepoError> {
        self.db()
            .prepare_cached("INSERT OR IGNORE INTO unsent VALUES(?1)")?
            .execute(params![rid])?;
        self.db()
            .prepare_cached("INSERT OR IGNORE INTO unclustered VALUES(?1)")?
            .execute(params![rid])?;
        Ok(())
    }

    /// Drops all cached reconstructed content.
    pub fn clear_content_cache(&self) {
        self.content_cache.borrow_mut().clear();
    }

    /// All phantom rids, optionally restricted to public ones.
    pub fn phantom_rids(&self, public_only: bool) -> Result<Vec<Rid>, RepoError> {
        let sql = if public_only {
            "SELECT rid FROM blob WHERE size<0 AND rid NOT IN private ORDER BY rid"
        } else {
            "SELECT rid FROM blob WHERE size<0 ORDER BY rid"
        };
        let mut stmt = self.db().prepare_cached(sql)?;
        let rids = stmt
            .query_map(params![], |row| row.get(0))?
            .collect::<Result<_, _>>()?;
        Ok(rids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn repo() -> Repository {
        Repository::create_in_memory().unwrap()
    }

    #[test]
    fn test_compress_round_trip() {
        let data = b"compressible compressible compressible".repeat(10);
        let stored = compress(&data);
        assert!(stored.len() < data.len());
        assert_eq!(decompress(&stored, 1).unwrap(), data);
        assert!(matches!(
            decompress(&stored[..3], 1),
            Err(StoreError::BadEncoding(1))
        ));
    }

    #[test]
    fn test_put_get_round_trip() {
        let repo = repo();
        repo.begin_transaction().unwrap();
        let (rid, id) = repo.content_put(b"hello\n").unwrap();
        assert_eq!(repo.content_size(rid).unwrap(), 6);
        assert!(id.matches_content(b"hello\n"));
        // Idempotent.
        let (rid2, _) = repo.content_put(b"hello\n").unwrap();
        assert_eq!(rid, rid2);
        repo.end_transaction(true).unwrap();
        assert_eq!(&**repo.content_get(rid).unwrap(), b"hello\n");
    }

    #[test]
    fn test_sha1_ingest_hashes() {
        let repo = repo();
        repo.set_hash_policy(crate::hash_policy::HashPolicy::Sha1)
            .unwrap();
        repo.begin_transaction().unwrap();
        let (rid, id) = repo.content_put(b"hello\n").unwrap();
        assert_eq!(id.as_str(), "f572d396fae9206628714fb2ce00f72e94f2258f");
        assert_eq!(repo.content_size(rid).unwrap(), 6);
        repo.end_transaction(true).unwrap();
    }

    #[test]
    fn test_phantom_fill() {
        let repo = repo();
        let id = ArtifactId::hash_content(crate::object_id::HashAlgo::Sha3_256, b"later");
        repo.begin_transaction().unwrap();
        let rid = repo.content_reference(&id).unwrap();
        assert_eq!(repo.content_size(rid).unwrap(), -1);
        assert!(matches!(
            repo.content_get(rid),
            Err(RepoError::Store(StoreError::Phantom(_)))
        ));
        let rid2 = repo.content_put_ex(b"later", &id, 0, false).unwrap();
        assert_eq!(rid, rid2);
        assert_eq!(repo.content_size(rid).unwrap(), 5);
        repo.end_transaction(true).unwrap();
        assert_eq!(&**repo.content_get(rid).unwrap(), b"later");
    }

    #[test]
    fn test_put_rejects_wrong_hash() {
        let repo = repo();
        let id = ArtifactId::hash_content(crate::object_id::HashAlgo::Sha3_256, b"right");
        repo.begin_transaction().unwrap();
        let err = repo.content_put_ex(b"wrong", &id, 0, false).unwrap_err();
        assert!(matches!(
            err,
            RepoError::Store(StoreError::CorruptBlob { .. })
        ));
        repo.end_transaction(false).unwrap();
    }

    #[test]
    fn test_deltify_and_undelta() {
        let repo = repo();
        let a = vec![b'a'; 4000];
        let mut b = a.clone();
        b.extend_from_slice(b"tail");
        repo.begin_transaction().unwrap();
        let (rid_a, _) = repo.content_put(&a).unwrap();
        let (rid_b, _) = repo.content_put(&b).unwrap();
        assert!(repo.content_deltify(rid_b, rid_a, false).unwrap());
        repo.end_transaction(true).unwrap();

        repo.clear_content_cache();
        assert_eq!(&**repo.content_get(rid_b).unwrap(), &b);

        repo.begin_transaction().unwrap();
        repo.content_undelta(rid_b).unwrap();
        repo.end_transaction(true).unwrap();
        let n: i64 = repo
            .db()
            .query_row("SELECT count(*) FROM delta", [], |r| r.get(0))
            .unwrap();
        assert_eq!(n, 0);
        repo.clear_content_cache();
        assert_eq!(&**repo.content_get(rid_b).unwrap(), &b);
    }

    #[test]
    fn test_deltify_refuses_cycles() {
        let repo = repo();
        repo.begin_transaction().unwrap();
        let (rid_a, _) = repo.content_put(&vec![b'a'; 2000]).unwrap();
        let (rid_b, _) = repo.content_put(&vec![b'b'; 2000]).unwrap();
        assert!(repo.content_deltify(rid_b, rid_a, true).unwrap());
        assert!(!repo.content_deltify(rid_a, rid_b, true).unwrap());
        repo.end_transaction(true).unwrap();
    }

    #[test]
    fn test_public_never_deltas_on_private() {
        let repo = repo();
        repo.begin_transaction().unwrap();
        let (rid_private, _) = repo.content_put(&vec![b'p'; 2000]).unwrap();
        repo.mark_private(rid_private).unwrap();
        let (rid_public, _) = repo.content_put(&vec![b'q'; 2001]).unwrap();
        assert!(!repo.content_deltify(rid_public, rid_private, false).unwrap());
        repo.end_transaction(true).unwrap();
    }
}
