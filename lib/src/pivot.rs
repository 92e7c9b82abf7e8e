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

//! The pivot: the most recent common ancestor used by 3-way merge.
//!
//! The search seeds one *primary* check-in and one or more *secondaries*,
//! then walks ancestors in descending commit-time order. A node is the
//! pivot at the moment a primary-colored and a secondary-colored region of
//! the walk both reach it. Equal timestamps drain in descending rid order,
//! which keeps the result deterministic for a given repository.

use indexmap::IndexMap;
use rusqlite::OptionalExtension as _;
use rusqlite::params;

use crate::repo::RepoError;
use crate::repo::Repository;
use crate::repo::Rid;

#[derive(Debug, Clone, Copy)]
struct Entry {
    mtime: f64,
    pending: bool,
    is_primary: bool,
}

/// A pivot search in progress. Seed it with [`set_primary`] and
/// [`set_secondary`], then call [`find`].
///
/// [`set_primary`]: Pivot::set_primary
/// [`set_secondary`]: Pivot::set_secondary
/// [`find`]: Pivot::find
#[derive(Debug, Default)]
pub struct Pivot {
    queue: IndexMap<Rid, Entry>,
    has_primary: bool,
}

impl Pivot {
    /// Starts a new, empty search.
    pub fn new() -> Self {
        Self::default()
    }

    fn checkin_mtime(repo: &Repository, rid: Rid) -> Result<Option<f64>, RepoError> {
        let mut stmt = repo
            .db()
            .prepare_cached("SELECT mtime FROM event WHERE objid=?1 AND type='ci'")?;
        Ok(stmt.query_row(params![rid], |row| row.get(0)).optional()?)
    }

    /// Seeds the primary check-in. Resets any previous search state.
    pub fn set_primary(&mut self, repo: &Repository, rid: Rid) -> Result<(), RepoError> {
        let mtime = Self::checkin_mtime(repo, rid)?
            .ok_or_else(|| RepoError::NotFound(format!("check-in rid {rid}")))?;
        self.queue.clear();
        self.queue.insert(
            rid,
            Entry {
                mtime,
                pending: true,
                is_primary: true,
            },
        );
        self.has_primary = true;
        Ok(())
    }

    /// Seeds one secondary check-in. The primary must be set first; there
    /// can be any number of secondaries.
    pub fn set_secondary(&mut self, repo: &Repository, rid: Rid) -> Result<(), RepoError> {
        assert!(self.has_primary, "set_primary must be called first");
        let mtime = Self::checkin_mtime(repo, rid)?
            .ok_or_else(|| RepoError::NotFound(format!("check-in rid {rid}")))?;
        self.queue.entry(rid).or_insert(Entry {
            mtime,
            pending: true,
            is_primary: false,
        });
        Ok(())
    }

    /// Runs the search. With `ignore_merges`, only primary parent links
    /// are followed. Returns the pivot rid, or `None` when the seeds share
    /// no common ancestor.
    pub fn find(&mut self, repo: &Repository, ignore_merges: bool) -> Result<Option<Rid>, RepoError> {
        let colors: std::collections::HashSet<bool> =
            self.queue.values().map(|e| e.is_primary).collect();
        assert!(
            colors.len() == 2,
            "pivot search needs both a primary and a secondary"
        );
        let child_sql = if ignore_merges {
            "SELECT cid FROM plink WHERE pid=?1 AND isprim"
        } else {
            "SELECT cid FROM plink WHERE pid=?1"
        };
        let parent_sql = if ignore_merges {
            "SELECT pid FROM plink WHERE cid=?1 AND isprim"
        } else {
            "SELECT pid FROM plink WHERE cid=?1"
        };
        loop {
            // The newest pending node; ties break toward the larger rid.
            let Some((rid, entry)) = self
                .queue
                .iter()
                .filter(|(_, e)| e.pending)
                .map(|(&rid, &e)| (rid, e))
                .max_by(|a, b| {
                    (a.1.mtime, a.0)
                        .partial_cmp(&(b.1.mtime, b.0))
                        .expect("commit times are finite")
                })
            else {
                return Ok(None);
            };
            // The node is the pivot if regions of both colors reach it:
            // some queued child has the opposite color.
            let children: Vec<Rid> = {
                let mut stmt = repo.db().prepare_cached(child_sql)?;
                stmt.query_map(params![rid], |row| row.get(0))?
                    .collect::<Result<_, _>>()?
            };
            let meets = children.iter().any(|cid| {
                self.queue
                    .get(cid)
                    .is_some_and(|c| c.is_primary != entry.is_primary)
            });
            if meets {
                return Ok(Some(rid));
            }
            // Expand ancestors with this node's color; nodes already
            // queued keep the color they arrived with.
            let parents: Vec<Rid> = {
                let mut stmt = repo.db().prepare_cached(parent_sql)?;
                stmt.query_map(params![rid], |row| row.get(0))?
                    .collect::<Result<_, _>>()?
            };
            for pid in parents {
                if pid <= 0 || self.queue.contains_key(&pid) {
                    continue;
                }
                let mtime = Self::checkin_mtime(repo, pid)?.unwrap_or(0.0);
                self.queue.insert(
                    pid,
                    Entry {
                        mtime,
                        pending: true,
                        is_primary: entry.is_primary,
                    },
                );
            }
            self.queue.get_mut(&rid).expect("rid is queued").pending = false;
        }
    }
}

/// Convenience wrapper: the pivot of one primary and a set of secondaries.
pub fn pivot(
    repo: &Repository,
    primary: Rid,
    secondaries: &[Rid],
    ignore_merges: bool,
) -> Result<Option<Rid>, RepoError> {
    let mut search = Pivot::new();
    search.set_primary(repo, primary)?;
    for &rid in secondaries {
        search.set_secondary(repo, rid)?;
    }
    search.find(repo, ignore_merges)
}
