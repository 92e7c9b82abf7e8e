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

//! Publishing private artifacts.
//!
//! Private artifacts never leave the repository. `publish` flips a set of
//! them public: the set is closed over check-in associates (file blobs,
//! tag sources, same-ticket changes) unless the caller asks for the named
//! artifacts only, and any blob still stored as a delta against a member
//! is rewritten in full before the private marks clear.

use std::collections::HashSet;

use rusqlite::params;
use tracing::info;

use crate::descendants;
use crate::repo::RepoError;
use crate::repo::Repository;
use crate::repo::Rid;
use crate::schema::tagid;

impl Repository {
    /// Lists private artifacts: all of them, or just check-ins.
    pub fn unpublished(&self, all: bool) -> Result<Vec<(Rid, String)>, RepoError> {
        let sql = if all {
            "SELECT blob.rid, blob.uuid FROM private JOIN blob USING(rid) ORDER BY blob.rid"
        } else {
            "SELECT blob.rid, blob.uuid FROM private
              JOIN blob USING(rid)
              JOIN event ON event.objid=private.rid AND event.type='ci'
             ORDER BY blob.rid"
        };
        let mut stmt = self.db().prepare_cached(sql)?;
        let rows = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<Result<_, _>>()?;
        Ok(rows)
    }

    /// Publishes the artifacts named by `names`. A name that resolves to a
    /// branch publishes every check-in on that branch from its start.
    /// Unless `only`, the set closes over check-in associates. Already
    /// public names are a harmless no-op. Returns the number of artifacts
    /// actually made public.
    pub fn publish(&self, names: &[&str], only: bool) -> Result<usize, RepoError> {
        self.transaction(|repo| {
            let mut ok: HashSet<Rid> = HashSet::new();
            for name in names {
                let rid = repo.name_to_rid(name)?;
                let is_branch_name = {
                    let mut stmt = repo.db().prepare_cached(
                        "SELECT 1 FROM tagxref
                          WHERE rid=?1 AND tagid=?2 AND tagtype>0 AND value=?3",
                    )?;
                    stmt.exists(params![rid, tagid::BRANCH, name])?
                };
                if is_branch_name {
                    let start = descendants::start_of_branch(repo, rid)?;
                    ok.extend(descendants::compute_descendants(repo, start)?);
                } else {
                    ok.insert(rid);
                }
            }
            if !only {
                repo.close_over_associates(&mut ok)?;
            }
            // Rewrite anything delta-based on a member before visibility
            // changes.
            for &rid in &ok {
                let dependents: Vec<Rid> = {
                    let mut stmt = repo
                        .db()
                        .prepare_cached("SELECT rid FROM delta WHERE srcid=?1")?;
                    stmt.query_map(params![rid], |row| row.get(0))?
                        .collect::<Result<_, _>>()?
                };
                for dep in dependents {
                    if !ok.contains(&dep) {
                        repo.content_undelta(dep)?;
                    }
                }
            }
            let mut published = 0usize;
            for &rid in &ok {
                let n = repo
                    .db()
                    .prepare_cached("DELETE FROM private WHERE rid=?1")?
                    .execute(params![rid])?;
                if n > 0 {
                    repo.mark_for_send(rid)?;
                    published += 1;
                }
            }
            info!(published, "artifacts published");
            Ok(published)
        })
    }

    /// Grows `ok` to a fixpoint over the artifacts a published check-in or
    /// ticket drags along: file blobs, tag-source artifacts, and changes
    /// to the same ticket.
    fn close_over_associates(&self, ok: &mut HashSet<Rid>) -> Result<(), RepoError> {
        loop {
            let mut added = Vec::new();
            for &rid in ok.iter() {
                let mut stmt = self
                    .db()
                    .prepare_cached("SELECT fid FROM mlink WHERE mid=?1 AND fid>0")?;
                for fid in stmt.query_map(params![rid], |row| row.get::<_, Rid>(0))? {
                    added.push(fid?);
                }
                let mut stmt = self
                    .db()
                    .prepare_cached("SELECT srcid FROM tagxref WHERE rid=?1 AND srcid>0")?;
                for srcid in stmt.query_map(params![rid], |row| row.get::<_, Rid>(0))? {
                    added.push(srcid?);
                }
                // Other changes to the same ticket.
                let mut stmt = self.db().prepare_cached(
                    "SELECT tx2.rid FROM event
                      JOIN tagxref tx1 ON tx1.rid=event.objid
                      JOIN tagxref tx2 ON tx2.tagid=tx1.tagid
                     WHERE event.objid=?1 AND event.type='t'",
                )?;
                for other in stmt.query_map(params![rid], |row| row.get::<_, Rid>(0))? {
                    added.push(other?);
                }
            }
            let before = ok.len();
            ok.extend(added);
            if ok.len() == before {
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_undeltas_public_dependent() {
        let repo = Repository::create_in_memory().unwrap();
        let p1 = vec![b'z'; 3000];
        let mut p2 = p1.clone();
        p2.extend_from_slice(b"public tail");
        repo.begin_transaction().unwrap();
        // Private base, then a public artifact stored as a delta on it.
        let (rid1, id1) = repo.content_put(&p1).unwrap();
        repo.mark_private(rid1).unwrap();
        let (rid2, _) = repo.content_put(&p2).unwrap();
        assert!(repo.content_deltify(rid2, rid1, true).unwrap());
        repo.end_transaction(true).unwrap();

        let n = repo.publish(&[id1.as_str()], true).unwrap();
        assert_eq!(n, 1);
        assert!(!repo.content_is_private(rid1).unwrap());
        // The dependent was rewritten in full.
        let deltas: i64 = repo
            .db()
            .query_row("SELECT count(*) FROM delta WHERE rid=?1", params![rid2], |r| {
                r.get(0)
            })
            .unwrap();
        assert_eq!(deltas, 0);
        // No public delta references a private source.
        let bad: i64 = repo
            .db()
            .query_row(
                "SELECT count(*) FROM delta
                  WHERE rid NOT IN private AND srcid IN private",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(bad, 0);
    }

    #[test]
    fn test_publish_is_idempotent() {
        let repo = Repository::create_in_memory().unwrap();
        repo.begin_transaction().unwrap();
        let (_, id) = repo.content_put(b"already public").unwrap();
        repo.end_transaction(true).unwrap();
        assert_eq!(repo.publish(&[id.as_str()], true).unwrap(), 0);
    }
}
