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

//! The shun list.
//!
//! A shunned hash is administratively dead: its content is expunged, it
//! is refused on receipt, and `rebuild` keeps it gone. Shunning is the
//! only way a row ever leaves the blob table besides moderation
//! disapproval.

use rusqlite::params;
use tracing::info;

use crate::object_id::ArtifactId;
use crate::repo::RepoError;
use crate::repo::Repository;
use crate::repo::Rid;
use crate::repo::now_julian;

impl Repository {
    /// True if `id` is on the shun list.
    pub fn is_shunned(&self, id: &ArtifactId) -> Result<bool, RepoError> {
        let mut stmt = self
            .db()
            .prepare_cached("SELECT 1 FROM shun WHERE uuid=?1")?;
        Ok(stmt.exists(params![id.as_str()])?)
    }

    /// Adds `id` to the shun list and expunges any stored content,
    /// rewriting public deltas based on it first.
    pub fn shun(&self, id: &ArtifactId, comment: Option<&str>) -> Result<(), RepoError> {
        self.transaction(|repo| {
            let mut stmt = repo.db().prepare_cached(
                "INSERT OR IGNORE INTO shun(uuid, mtime, scom) VALUES(?1, ?2, ?3)",
            )?;
            stmt.execute(params![id.as_str(), now_julian(), comment])?;
            if let Some(rid) = repo.rid_for_uuid(id)? {
                repo.expunge_rid(rid)?;
            }
            info!(uuid = id.as_str(), "artifact shunned");
            Ok(())
        })
    }

    /// Removes `id` from the shun list. The content does not come back;
    /// a peer has to send it again.
    pub fn unshun(&self, id: &ArtifactId) -> Result<(), RepoError> {
        let mut stmt = self.db().prepare_cached("DELETE FROM shun WHERE uuid=?1")?;
        stmt.execute(params![id.as_str()])?;
        Ok(())
    }

    /// All shunned hashes, ascending.
    pub fn shunned_uuids(&self) -> Result<Vec<String>, RepoError> {
        let mut stmt = self
            .db()
            .prepare_cached("SELECT uuid FROM shun ORDER BY uuid")?;
        let uuids = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<_, _>>()?;
        Ok(uuids)
    }

    /// Deletes a blob row and every reference to it. Blobs stored as
    /// deltas against it are first rewritten in full form so the rest of
    /// the store stays readable.
    pub(crate) fn expunge_rid(&self, rid: Rid) -> Result<(), RepoError> {
        let dependents: Vec<Rid> = {
            let mut stmt = self
                .db()
                .prepare_cached("SELECT rid FROM delta WHERE srcid=?1")?;
            stmt.query_map(params![rid], |row| row.get(0))?
                .collect::<Result<_, _>>()?
        };
        for dep in dependents {
            self.content_undelta(dep)?;
        }
        for sql in [
            "DELETE FROM blob WHERE rid=?1",
            "DELETE FROM delta WHERE rid=?1",
            "DELETE FROM plink WHERE cid=?1 OR pid=?1",
            "DELETE FROM mlink WHERE mid=?1",
            "DELETE FROM tagxref WHERE rid=?1 OR srcid=?1",
            "DELETE FROM event WHERE objid=?1",
            "DELETE FROM leaf WHERE rid=?1",
            "DELETE FROM private WHERE rid=?1",
            "DELETE FROM unsent WHERE rid=?1",
            "DELETE FROM unclustered WHERE rid=?1",
            "DELETE FROM modreq WHERE objid=?1",
            "DELETE FROM attachment WHERE attachid=?1",
        ] {
            self.db().prepare_cached(sql)?.execute(params![rid])?;
        }
        self.content_cache.borrow_mut().pop(&rid);
        self.pending_verify.borrow_mut().remove(rid);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shun_expunges_and_blocks_reingest() {
        let repo = Repository::create_in_memory().unwrap();
        repo.begin_transaction().unwrap();
        let (rid, id) = repo.content_put(b"doomed content").unwrap();
        repo.end_transaction(true).unwrap();

        repo.shun(&id, Some("spam")).unwrap();
        assert!(repo.is_shunned(&id).unwrap());
        assert!(repo.rid_for_uuid(&id).unwrap().is_none());
        assert!(repo.content_size(rid).is_err());

        // Receipt of the same bytes is refused.
        repo.begin_transaction().unwrap();
        let err = repo.content_put_ex(b"doomed content", &id, 0, false);
        assert!(err.is_err());
        repo.end_transaction(false).unwrap();
    }

    #[test]
    fn test_shun_undeltas_dependents() {
        let repo = Repository::create_in_memory().unwrap();
        let base = vec![b'x'; 3000];
        let mut derived = base.clone();
        derived.extend_from_slice(b"more");
        repo.begin_transaction().unwrap();
        let (rid_base, id_base) = repo.content_put(&base).unwrap();
        let (rid_derived, _) = repo.content_put(&derived).unwrap();
        assert!(repo.content_deltify(rid_derived, rid_base, true).unwrap());
        repo.end_transaction(true).unwrap();

        repo.shun(&id_base, None).unwrap();
        repo.clear_content_cache();
        assert_eq!(&**repo.content_get(rid_derived).unwrap(), &derived);
    }
}
