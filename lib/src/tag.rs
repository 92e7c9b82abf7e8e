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

//! Tags and the tagxref table.
//!
//! Tag names are interned in `tag`; applications of a tag to an artifact
//! are rows in `tagxref`. A row written directly by an artifact carries
//! `srcid > 0` (the artifact that set it); rows inherited through
//! propagation carry `srcid = 0`. Propagating tags walk primary-parent
//! links and stop at any row that was set directly, whatever its type.

use rusqlite::OptionalExtension as _;
use rusqlite::params;

use crate::repo::RepoError;
use crate::repo::Repository;
use crate::repo::Rid;
use crate::schema::tagid;

/// The three kinds of tagxref rows, in their stored encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagType {
    /// Cancels the tag at this artifact.
    Cancel,
    /// Applies to this artifact only.
    Add,
    /// Applies to this artifact and its primary descendants.
    Propagate,
}

impl TagType {
    /// The integer stored in `tagxref.tagtype`.
    pub fn as_int(self) -> i64 {
        match self {
            Self::Cancel => 0,
            Self::Add => 1,
            Self::Propagate => 2,
        }
    }
}

impl Repository {
    /// Looks up a tag name, returning its id if it was ever used.
    pub fn tag_find_id(&self, name: &str) -> Result<Option<i64>, RepoError> {
        let mut stmt = self
            .db()
            .prepare_cached("SELECT tagid FROM tag WHERE tagname=?1")?;
        Ok(stmt.query_row(params![name], |row| row.get(0)).optional()?)
    }

    /// Interns a tag name, allocating an id above the reserved range when
    /// it is new.
    pub fn tag_intern(&self, name: &str) -> Result<i64, RepoError> {
        if let Some(id) = self.tag_find_id(name)? {
            return Ok(id);
        }
        let mut stmt = self
            .db()
            .prepare_cached("INSERT INTO tag(tagname) VALUES(?1)")?;
        stmt.execute(params![name])?;
        Ok(self.db().last_insert_rowid())
    }

    /// Applies a tag operation to artifact `rid`, recorded as coming from
    /// artifact `srcid` at time `mtime`. A newer row for the same
    /// (rid, tag) wins over an older one regardless of arrival order, so
    /// replaying artifacts in any order converges. Propagating and
    /// canceling operations walk the primary-descendant subtree.
    pub fn tag_insert(
        &self,
        name: &str,
        ttype: TagType,
        value: Option<&str>,
        srcid: Rid,
        mtime: f64,
        rid: Rid,
    ) -> Result<i64, RepoError> {
        let tag_id = self.tag_intern(name)?;
        let newer_exists = {
            let mut stmt = self.db().prepare_cached(
                "SELECT 1 FROM tagxref WHERE tagid=?1 AND rid=?2 AND mtime>?3",
            )?;
            stmt.exists(params![tag_id, rid, mtime])?
        };
        if newer_exists {
            return Ok(tag_id);
        }
        let mut stmt = self.db().prepare_cached(
            "REPLACE INTO tagxref(tagid, tagtype, srcid, value, mtime, rid)
             VALUES(?1, ?2, ?3, ?4, ?5, ?6)",
        )?;
        stmt.execute(params![tag_id, ttype.as_int(), srcid, value, mtime, rid])?;
        match ttype {
            TagType::Propagate => self.tag_propagate(rid, tag_id, Some(value), mtime)?,
            TagType::Cancel => self.tag_propagate(rid, tag_id, None, mtime)?,
            TagType::Add => {}
        }
        if tag_id == tagid::BRANCH {
            crate::leaf::eventually_check(self, rid)?;
        } else if tag_id == tagid::COMMENT {
            let mut stmt = self
                .db()
                .prepare_cached("UPDATE event SET ecomment=?1 WHERE objid=?2")?;
            stmt.execute(params![value, rid])?;
        } else if tag_id == tagid::USER {
            let mut stmt = self
                .db()
                .prepare_cached("UPDATE event SET euser=?1 WHERE objid=?2")?;
            stmt.execute(params![value, rid])?;
        }
        Ok(tag_id)
    }

    /// Pushes a propagating tag (or the cancellation of one) down the
    /// primary-child subtree of `pid`. `value` is `Some` to propagate and
    /// `None` to cancel. Directly-set rows block the walk; inherited rows
    /// (`srcid = 0`) are replaced or deleted as the front passes.
    fn tag_propagate(
        &self,
        pid: Rid,
        tag_id: i64,
        value: Option<Option<&str>>,
        mtime: f64,
    ) -> Result<(), RepoError> {
        let mut pending = vec![pid];
        while let Some(rid) = pending.pop() {
            let children: Vec<(Rid, Option<Rid>)> = {
                let mut stmt = self.db().prepare_cached(
                    "SELECT plink.cid, tagxref.srcid FROM plink
                      LEFT JOIN tagxref
                        ON tagxref.rid=plink.cid AND tagxref.tagid=?2
                     WHERE plink.pid=?1 AND plink.isprim
                     ORDER BY plink.cid",
                )?;
                stmt.query_map(params![rid, tag_id], |row| {
                    Ok((row.get(0)?, row.get(1)?))
                })?
                .collect::<Result<_, _>>()?
            };
            for (cid, existing_srcid) in children {
                match existing_srcid {
                    // No row yet: propagation extends; cancellation has
                    // nothing to remove and nothing below it either.
                    None => {
                        if let Some(value) = value {
                            let mut stmt = self.db().prepare_cached(
                                "REPLACE INTO tagxref(tagid, tagtype, srcid, value, mtime, rid)
                                 VALUES(?1, 2, 0, ?2, ?3, ?4)",
                            )?;
                            stmt.execute(params![tag_id, value, mtime, cid])?;
                            pending.push(cid);
                        }
                    }
                    // An inherited row: overwrite or delete, keep walking.
                    Some(0) => {
                        if let Some(value) = value {
                            let mut stmt = self.db().prepare_cached(
                                "REPLACE INTO tagxref(tagid, tagtype, srcid, value, mtime, rid)
                                 VALUES(?1, 2, 0, ?2, ?3, ?4)",
                            )?;
                            stmt.execute(params![tag_id, value, mtime, cid])?;
                        } else {
                            let mut stmt = self.db().prepare_cached(
                                "DELETE FROM tagxref WHERE tagid=?1 AND rid=?2 AND srcid=0",
                            )?;
                            stmt.execute(params![tag_id, cid])?;
                        }
                        pending.push(cid);
                    }
                    // Directly set on the child: blocks propagation.
                    Some(_) => {}
                }
                if tag_id == tagid::BRANCH {
                    crate::leaf::eventually_check(self, cid)?;
                }
            }
        }
        Ok(())
    }

    /// The value of an active (non-canceled) tag on `rid`, if any.
    /// `Some(None)` means the tag applies but carries no value.
    pub fn tag_value(&self, rid: Rid, tag_id: i64) -> Result<Option<Option<String>>, RepoError> {
        let mut stmt = self.db().prepare_cached(
            "SELECT value FROM tagxref WHERE rid=?1 AND tagid=?2 AND tagtype>0",
        )?;
        Ok(stmt
            .query_row(params![rid, tag_id], |row| row.get(0))
            .optional()?)
    }

    /// The branch a check-in is on: the value of its `branch` tag, or
    /// `"trunk"` when it has none.
    pub fn branch_of(&self, rid: Rid) -> Result<String, RepoError> {
        Ok(self
            .tag_value(rid, tagid::BRANCH)?
            .flatten()
            .unwrap_or_else(|| "trunk".to_owned()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intern_is_stable() {
        let repo = Repository::create_in_memory().unwrap();
        let a = repo.tag_intern("sym-release").unwrap();
        let b = repo.tag_intern("sym-release").unwrap();
        assert_eq!(a, b);
        assert!(a > tagid::MAX_RESERVED);
        assert_eq!(repo.tag_find_id("branch").unwrap(), Some(tagid::BRANCH));
    }

    #[test]
    fn test_newer_row_wins() {
        let repo = Repository::create_in_memory().unwrap();
        repo.begin_transaction().unwrap();
        let (rid, _) = repo.content_put(b"some artifact").unwrap();
        repo.tag_insert("sym-v1", TagType::Add, None, rid, 100.0, rid)
            .unwrap();
        // An older cancel arriving late must not clobber the newer add.
        repo.tag_insert("sym-v1", TagType::Cancel, None, rid, 50.0, rid)
            .unwrap();
        let tid = repo.tag_find_id("sym-v1").unwrap().unwrap();
        let ttype: i64 = repo
            .db()
            .query_row(
                "SELECT tagtype FROM tagxref WHERE rid=?1 AND tagid=?2",
                params![rid, tid],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(ttype, 1);
        repo.end_transaction(true).unwrap();
    }

    #[test]
    fn test_branch_defaults_to_trunk() {
        let repo = Repository::create_in_memory().unwrap();
        repo.begin_transaction().unwrap();
        let (rid, _) = repo.content_put(b"a commit-ish blob").unwrap();
        assert_eq!(repo.branch_of(rid).unwrap(), "trunk");
        repo.tag_insert("branch", TagType::Propagate, Some("dev"), rid, 10.0, rid)
            .unwrap();
        assert_eq!(repo.branch_of(rid).unwrap(), "dev");
        repo.end_transaction(true).unwrap();
    }
}
