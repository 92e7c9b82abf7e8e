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

//! Shortest paths through the check-in DAG.
//!
//! The search expands both parent and child edges breadth-first, so the
//! result may climb over a common ancestor. Nodes live in an arena indexed
//! by position; the `seen` set is an integer bag. The first node to reach
//! the target wins, and edges are expanded in ascending rid order, so the
//! chosen path is deterministic.

use rusqlite::params;

use crate::bag::Bag;
use crate::repo::RepoError;
use crate::repo::Repository;
use crate::repo::Rid;

/// One step on a computed path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PathStep {
    /// The check-in at this step.
    pub rid: Rid,
    /// True if the previous step is this check-in's parent (the path
    /// descended into it); false if the path climbed to it.
    pub from_is_parent: bool,
}

/// A path between two check-ins, in forward order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Path {
    steps: Vec<PathStep>,
}

impl Path {
    /// The steps, starting at the `from` node and ending at `to`.
    pub fn steps(&self) -> &[PathStep] {
        &self.steps
    }

    /// Number of edges on the path.
    pub fn len(&self) -> usize {
        self.steps.len() - 1
    }

    /// True if the path is a single node.
    pub fn is_empty(&self) -> bool {
        self.steps.len() <= 1
    }

    /// The node halfway along the path, or `None` for paths shorter than
    /// two edges. Used by bisect.
    pub fn midpoint(&self) -> Option<PathStep> {
        if self.len() < 2 {
            return None;
        }
        Some(self.steps[self.steps.len() - 1 - self.len() / 2])
    }
}

struct Node {
    rid: Rid,
    from: Option<usize>,
    from_is_parent: bool,
}

/// Computes the shortest path from `from` to `to` over plink edges. With
/// `direct_only`, merge edges are ignored and only primary parent-child
/// links are followed.
pub fn shortest_path(
    repo: &Repository,
    from: Rid,
    to: Rid,
    direct_only: bool,
) -> Result<Option<Path>, RepoError> {
    let mut nodes: Vec<Node> = vec![Node {
        rid: from,
        from: None,
        from_is_parent: false,
    }];
    if from == to {
        return Ok(Some(build_path(&nodes, 0)));
    }
    let mut seen = Bag::new();
    seen.insert(from);
    let mut frontier = vec![0usize];

    let child_sql = if direct_only {
        "SELECT cid FROM plink WHERE pid=?1 AND isprim ORDER BY cid"
    } else {
        "SELECT cid FROM plink WHERE pid=?1 ORDER BY cid"
    };
    let parent_sql = if direct_only {
        "SELECT pid FROM plink WHERE cid=?1 AND isprim ORDER BY pid"
    } else {
        "SELECT pid FROM plink WHERE cid=?1 ORDER BY pid"
    };

    while !frontier.is_empty() {
        let mut next_frontier = Vec::new();
        for &idx in &frontier {
            let rid = nodes[idx].rid;
            // Child edges first, matching the expansion order the
            // tie-break depends on.
            for (sql, is_parent_edge) in [(child_sql, true), (parent_sql, false)] {
                let mut stmt = repo.db().prepare_cached(sql)?;
                let neighbors: Vec<Rid> = stmt
                    .query_map(params![rid], |row| row.get(0))?
                    .collect::<Result<_, _>>()?;
                for n in neighbors {
                    if !seen.insert(n) {
                        continue;
                    }
                    nodes.push(Node {
                        rid: n,
                        from: Some(idx),
                        from_is_parent: is_parent_edge,
                    });
                    if n == to {
                        return Ok(Some(build_path(&nodes, nodes.len() - 1)));
                    }
                    next_frontier.push(nodes.len() - 1);
                }
            }
        }
        frontier = next_frontier;
    }
    Ok(None)
}

fn build_path(nodes: &[Node], end: usize) -> Path {
    let mut steps = Vec::new();
    let mut cur = Some(end);
    while let Some(idx) = cur {
        let node = &nodes[idx];
        steps.push(PathStep {
            rid: node.rid,
            from_is_parent: node.from_is_parent,
        });
        cur = node.from;
    }
    steps.reverse();
    Path { steps }
}

/// Computes all file renames that occur walking from `from` to `to`.
/// Returns `(orig_fnid, new_fnid)` pairs: for every file whose name
/// changed anywhere along the path, the name it started with and the name
/// it ends with. Used by annotate and diff-across-rename.
pub fn find_filename_changes(
    repo: &Repository,
    from: Rid,
    to: Rid,
) -> Result<Vec<(i64, i64)>, RepoError> {
    let Some(path) = shortest_path(repo, from, to, false)? else {
        return Ok(Vec::new());
    };
    struct NameChange {
        orig: i64,
        cur: i64,
        new: i64,
    }
    let mut changes: Vec<NameChange> = Vec::new();
    let steps = path.steps();
    for (i, step) in steps.iter().enumerate() {
        let next = steps.get(i + 1);
        // Skip nodes whose parent is not on the path.
        if !step.from_is_parent && next.is_none_or(|n| n.from_is_parent) {
            continue;
        }
        let mut stmt = repo
            .db()
            .prepare_cached("SELECT pfnid, fnid FROM mlink WHERE mid=?1 AND pfnid>0")?;
        let rows: Vec<(i64, i64)> = stmt
            .query_map(params![step.rid], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<Result<_, _>>()?;
        for (pfnid_col, fnid_col) in rows {
            // Walking upward inverts the direction of the rename.
            let (pfnid, fnid) = if step.from_is_parent {
                (pfnid_col, fnid_col)
            } else {
                (fnid_col, pfnid_col)
            };
            match changes.iter_mut().find(|c| c.cur == pfnid) {
                Some(c) => c.new = fnid,
                None => changes.push(NameChange {
                    orig: pfnid,
                    cur: pfnid,
                    new: fnid,
                }),
            }
        }
        for c in &mut changes {
            c.cur = c.new;
        }
    }
    Ok(changes
        .into_iter()
        .filter(|c| c.orig != c.new)
        .map(|c| (c.orig, c.new))
        .collect())
}
