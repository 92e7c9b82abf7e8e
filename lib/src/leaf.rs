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

//! Maintenance of the LEAF table.
//!
//! A leaf is a check-in with no child on the same branch. The set is
//! maintained incrementally: operations that might change a node's leaf
//! status queue it (and its parents) with [`eventually_check`], and the
//! queue drains just before the transaction commits. `leaf_rebuild`
//! recomputes the whole set from scratch.

use rusqlite::params;

use crate::repo::RepoError;
use crate::repo::Repository;
use crate::repo::Rid;
use crate::schema::tagid;

/// True if `rid` has no child on its own branch.
pub fn is_leaf(repo: &Repository, rid: Rid) -> Result<bool, RepoError> {
    let mut stmt = repo.db().prepare_cached(
        "SELECT 1 FROM plink
          WHERE pid=?1
            AND coalesce((SELECT value FROM tagxref
                           WHERE tagid=?2 AND rid=?1 AND tagtype>0), 'trunk')
              = coalesce((SELECT value FROM tagxref
                           WHERE tagid=?2 AND rid=plink.cid AND tagtype>0), 'trunk')",
    )?;
    Ok(!stmt.exists(params![rid, tagid::BRANCH])?)
}

/// Counts the primary children of `pid` on the same branch.
pub fn count_nonbranch_children(repo: &Repository, pid: Rid) -> Result<i64, RepoError> {
    let mut stmt = repo.db().prepare_cached(
        "SELECT count(*) FROM plink
          WHERE pid=?1 AND isprim
            AND coalesce((SELECT value FROM tagxref
                           WHERE tagid=?2 AND rid=?1 AND tagtype>0), 'trunk')
              = coalesce((SELECT value FROM tagxref
                           WHERE tagid=?2 AND rid=plink.cid AND tagtype>0), 'trunk')",
    )?;
    Ok(stmt.query_row(params![pid, tagid::BRANCH], |row| row.get(0))?)
}

/// Re-evaluates the leaf status of `rid` and fixes the LEAF table.
pub fn leaf_check(repo: &Repository, rid: Rid) -> Result<(), RepoError> {
    let exists = {
        let mut stmt = repo
            .db()
            .prepare_cached("SELECT 1 FROM blob WHERE rid=?1")?;
        stmt.exists(params![rid])?
    };
    if !exists {
        return Ok(());
    }
    if is_leaf(repo, rid)? {
        repo.db()
            .prepare_cached("INSERT OR IGNORE INTO leaf VALUES(?1)")?
            .execute(params![rid])?;
    } else {
        repo.db()
            .prepare_cached("DELETE FROM leaf WHERE rid=?1")?
            .execute(params![rid])?;
    }
    Ok(())
}

/// Queues a leaf check for `rid` and each of its parents. The checks run
/// when the enclosing transaction commits.
pub fn eventually_check(repo: &Repository, rid: Rid) -> Result<(), RepoError> {
    let mut pending = repo.leaf_pending.borrow_mut();
    pending.insert(rid);
    let mut stmt = repo
        .db()
        .prepare_cached("SELECT pid FROM plink WHERE cid=?1 AND pid>0")?;
    for pid in stmt.query_map(params![rid], |row| row.get::<_, Rid>(0))? {
        pending.insert(pid?);
    }
    Ok(())
}

/// Drains the pending-check queue. Called from the transaction layer.
pub(crate) fn do_pending_checks(repo: &Repository) -> Result<(), RepoError> {
    let rids = repo.leaf_pending.borrow_mut().drain_sorted();
    for rid in rids {
        leaf_check(repo, rid)?;
    }
    Ok(())
}

/// Recomputes the entire LEAF table. Expensive for large repositories, so
/// only the rebuild path does it.
pub fn leaf_rebuild(repo: &Repository) -> Result<(), RepoError> {
    repo.db().execute_batch("DELETE FROM leaf")?;
    let mut stmt = repo.db().prepare_cached(
        "INSERT OR IGNORE INTO leaf
          SELECT cid FROM plink
          EXCEPT
          SELECT pid FROM plink
           WHERE coalesce((SELECT value FROM tagxref
                            WHERE tagid=?1 AND rid=plink.pid AND tagtype>0), 'trunk')
               = coalesce((SELECT value FROM tagxref
                            WHERE tagid=?1 AND rid=plink.cid AND tagtype>0), 'trunk')",
    )?;
    stmt.execute(params![tagid::BRANCH])?;
    Ok(())
}

/// An SQL expression testing whether the check-in named by `var` carries
/// the `closed` tag.
pub fn closed_leaf_sql(var: &str) -> String {
    format!(
        "EXISTS(SELECT 1 FROM tagxref AS tx
                 WHERE tx.rid={var} AND tx.tagid={} AND tx.tagtype>0)",
        tagid::CLOSED
    )
}

/// The current LEAF set, ascending.
pub fn all_leaves(repo: &Repository) -> Result<Vec<Rid>, RepoError> {
    let mut stmt = repo
        .db()
        .prepare_cached("SELECT rid FROM leaf ORDER BY rid")?;
    let rids = stmt
        .query_map([], |row| row.get(0))?
        .collect::<Result<_, _>>()?;
    Ok(rids)
}
