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

//! The moderation queue.
//!
//! Artifacts from actors without the right capability arrive held: a
//! `modreq` row plus the private mark, and no derived rows. Approval
//! lifts both and re-runs the crosslink so the artifact appears;
//! disapproval deletes the artifact outright, following delta and
//! attachment dependencies.

use rusqlite::OptionalExtension as _;
use rusqlite::params;
use tracing::info;

use crate::repo::RepoError;
use crate::repo::Repository;
use crate::repo::Rid;
use crate::xref;
use crate::xref::ModerationPolicy;

impl Repository {
    /// True if `rid` is being held for moderation.
    pub fn moderation_pending(&self, rid: Rid) -> Result<bool, RepoError> {
        let mut stmt = self
            .db()
            .prepare_cached("SELECT 1 FROM modreq WHERE objid=?1")?;
        Ok(stmt.exists(params![rid])?)
    }

    /// True if any moderation request is outstanding.
    pub fn moderation_needed(&self) -> Result<bool, RepoError> {
        let mut stmt = self.db().prepare_cached("SELECT 1 FROM modreq")?;
        Ok(stmt.exists([])?)
    }

    /// Pending moderation requests, ascending by objid.
    pub fn moderation_queue(&self) -> Result<Vec<Rid>, RepoError> {
        let mut stmt = self
            .db()
            .prepare_cached("SELECT objid FROM modreq ORDER BY objid")?;
        let rids = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<_, _>>()?;
        Ok(rids)
    }

    /// Approves a held artifact: clears the private mark and the request,
    /// queues it for transmission, and re-runs the crosslink so its
    /// derived rows appear.
    pub fn moderation_approve(&self, rid: Rid) -> Result<(), RepoError> {
        if !self.moderation_pending(rid)? {
            return Ok(());
        }
        self.transaction(|repo| {
            let attach_rid: Option<Rid> = {
                let mut stmt = repo
                    .db()
                    .prepare_cached("SELECT attachRid FROM modreq WHERE objid=?1")?;
                stmt.query_row(params![rid], |row| row.get(0)).optional()?.flatten()
            };
            for r in std::iter::once(rid).chain(attach_rid) {
                repo.db()
                    .prepare_cached("DELETE FROM private WHERE rid=?1")?
                    .execute(params![r])?;
                repo.mark_for_send(r)?;
            }
            repo.db()
                .prepare_cached("DELETE FROM modreq WHERE objid=?1")?
                .execute(params![rid])?;
            xref::manifest_crosslink(repo, rid, &ModerationPolicy::TRUSTED)?;
            repo.incr_cfgcnt()?;
            info!(rid, "moderation approved");
            Ok(())
        })
    }

    /// Disapproves a held artifact: deletes the blob and every derived
    /// row. Public blobs stored as deltas against it are rewritten in
    /// full first, and an attachment's content blob goes with it when
    /// nothing else uses it.
    pub fn moderation_disapprove(&self, objid: Rid) -> Result<(), RepoError> {
        if !self.moderation_pending(objid)? {
            return Ok(());
        }
        self.transaction(|repo| {
            let mut rid = objid;
            while rid != 0 && repo.content_is_private(rid)? {
                let attach_rid: Option<Rid> = {
                    let mut stmt = repo
                        .db()
                        .prepare_cached("SELECT attachRid FROM modreq WHERE objid=?1")?;
                    stmt.query_row(params![rid], |row| row.get(0))
                        .optional()?
                        .flatten()
                };
                repo.expunge_rid(rid)?;
                info!(rid, "moderation disapproved");
                rid = match attach_rid {
                    Some(a) if !repo.object_used(a)? => a,
                    _ => 0,
                };
            }
            Ok(())
        })
    }

    /// True if anything in the derived tables still references `rid`.
    fn object_used(&self, rid: Rid) -> Result<bool, RepoError> {
        for (table, column) in [
            ("modreq", "attachRid"),
            ("mlink", "mid"),
            ("mlink", "fid"),
            ("tagxref", "srcid"),
            ("tagxref", "rid"),
        ] {
            let mut stmt = self
                .db()
                .prepare_cached(&format!("SELECT 1 FROM {table} WHERE {column}=?1"))?;
            if stmt.exists(params![rid])? {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use crate::manifest::Manifest;
    use crate::manifest::ManifestDate;

    use super::*;

    fn wiki_artifact(title: &str, body: &str) -> Vec<u8> {
        let m = Manifest {
            date: Some(ManifestDate::parse("2024-05-06T07:08:09.000").unwrap()),
            wiki_title: Some(title.to_owned()),
            user: Some("mallory".to_owned()),
            wiki_body: Some(body.as_bytes().to_vec()),
            has_z_card: true,
            ..Manifest::default()
        };
        m.emit()
    }

    #[test]
    fn test_hold_approve() {
        let repo = Repository::create_in_memory().unwrap();
        let policy = ModerationPolicy {
            moderate_wiki: true,
            moderate_ticket: true,
        };
        let text = wiki_artifact("SomePage", "content\n");
        repo.begin_transaction().unwrap();
        let (rid, _) = repo.content_put(&text).unwrap();
        xref::manifest_crosslink(&repo, rid, &policy).unwrap();
        repo.end_transaction(true).unwrap();

        assert!(repo.moderation_pending(rid).unwrap());
        assert!(repo.content_is_private(rid).unwrap());
        // No derived rows yet.
        let events: i64 = repo
            .db()
            .query_row("SELECT count(*) FROM event", [], |r| r.get(0))
            .unwrap();
        assert_eq!(events, 0);

        repo.moderation_approve(rid).unwrap();
        assert!(!repo.moderation_pending(rid).unwrap());
        assert!(!repo.content_is_private(rid).unwrap());
        let events: i64 = repo
            .db()
            .query_row("SELECT count(*) FROM event WHERE type='w'", [], |r| r.get(0))
            .unwrap();
        assert_eq!(events, 1);
    }

    #[test]
    fn test_hold_disapprove() {
        let repo = Repository::create_in_memory().unwrap();
        let policy = ModerationPolicy {
            moderate_wiki: true,
            moderate_ticket: true,
        };
        let text = wiki_artifact("SpamPage", "buy things\n");
        repo.begin_transaction().unwrap();
        let (rid, id) = repo.content_put(&text).unwrap();
        xref::manifest_crosslink(&repo, rid, &policy).unwrap();
        repo.end_transaction(true).unwrap();

        repo.moderation_disapprove(rid).unwrap();
        assert!(repo.rid_for_uuid(&id).unwrap().is_none());
        assert!(!repo.moderation_needed().unwrap());
    }
}
