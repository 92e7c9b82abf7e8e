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

//! Descendant and ancestor enumeration over the check-in DAG.

use rusqlite::OptionalExtension as _;
use rusqlite::params;

use crate::bag::Bag;
use crate::repo::RepoError;
use crate::repo::Repository;
use crate::repo::Rid;

/// All transitive descendants of `base`, including `base` itself,
/// ascending.
pub fn compute_descendants(repo: &Repository, base: Rid) -> Result<Vec<Rid>, RepoError> {
    let mut seen = Bag::new();
    let mut pending = vec![base];
    seen.insert(base);
    while let Some(rid) = pending.pop() {
        let mut stmt = repo
            .db()
            .prepare_cached("SELECT cid FROM plink WHERE pid=?1")?;
        for cid in stmt.query_map(params![rid], |row| row.get::<_, Rid>(0))? {
            let cid = cid?;
            if seen.insert(cid) {
                pending.push(cid);
            }
        }
    }
    Ok(seen.drain_sorted())
}

/// Descendants of `base` restricted to a branch: the walk only crosses
/// check-ins whose branch tag value matches `branch`.
pub fn compute_descendants_on_branch(
    repo: &Repository,
    base: Rid,
    branch: &str,
) -> Result<Vec<Rid>, RepoError> {
    let mut seen = Bag::new();
    let mut pending = vec![base];
    seen.insert(base);
    while let Some(rid) = pending.pop() {
        let mut stmt = repo
            .db()
            .prepare_cached("SELECT cid FROM plink WHERE pid=?1")?;
        for cid in stmt.query_map(params![rid], |row| row.get::<_, Rid>(0))? {
            let cid = cid?;
            if repo.branch_of(cid)? == branch && seen.insert(cid) {
                pending.push(cid);
            }
        }
    }
    Ok(seen.drain_sorted())
}

/// All transitive ancestors of `rid`, including `rid` itself, ascending.
/// With `primary_only`, merge parents are not followed.
pub fn compute_ancestors(
    repo: &Repository,
    rid: Rid,
    primary_only: bool,
) -> Result<Vec<Rid>, RepoError> {
    let sql = if primary_only {
        "SELECT pid FROM plink WHERE cid=?1 AND isprim AND pid>0"
    } else {
        "SELECT pid FROM plink WHERE cid=?1 AND pid>0"
    };
    let mut seen = Bag::new();
    let mut pending = vec![rid];
    seen.insert(rid);
    while let Some(cur) = pending.pop() {
        let mut stmt = repo.db().prepare_cached(sql)?;
        for pid in stmt.query_map(params![cur], |row| row.get::<_, Rid>(0))? {
            let pid = pid?;
            if seen.insert(pid) {
                pending.push(pid);
            }
        }
    }
    Ok(seen.drain_sorted())
}

/// The leaves among the descendants of `base`: descendants with no
/// children at all.
pub fn compute_leaves(repo: &Repository, base: Rid) -> Result<Vec<Rid>, RepoError> {
    let mut seen = Bag::new();
    let mut leaves = Vec::new();
    let mut pending = vec![base];
    seen.insert(base);
    while let Some(rid) = pending.pop() {
        let mut stmt = repo
            .db()
            .prepare_cached("SELECT cid FROM plink WHERE pid=?1")?;
        let children: Vec<Rid> = stmt
            .query_map(params![rid], |row| row.get(0))?
            .collect::<Result<_, _>>()?;
        if children.is_empty() {
            leaves.push(rid);
        }
        for cid in children {
            if seen.insert(cid) {
                pending.push(cid);
            }
        }
    }
    leaves.sort_unstable();
    Ok(leaves)
}

/// Walks primary-parent links from `rid` back to the first check-in on the
/// same branch.
pub fn start_of_branch(repo: &Repository, rid: Rid) -> Result<Rid, RepoError> {
    let branch = repo.branch_of(rid)?;
    let mut cur = rid;
    loop {
        let parent: Option<Rid> = {
            let mut stmt = repo
                .db()
                .prepare_cached("SELECT pid FROM plink WHERE cid=?1 AND isprim AND pid>0")?;
            stmt.query_row(params![cur], |row| row.get(0)).optional()?
        };
        match parent {
            Some(pid) if repo.branch_of(pid)? == branch => cur = pid,
            _ => return Ok(cur),
        }
    }
}
