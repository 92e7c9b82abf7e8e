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

//! Rebuilding the derived tables.
//!
//! Everything outside `blob`/`delta`/`private`/`shun`/`config` is a
//! deterministic function of artifact content. `rebuild` drops it all and
//! reconstructs by crosslinking every blob in rid order, verifying each
//! row on the way; the result is byte-identical to what incremental
//! operation would have produced. `scrub` removes the secrets that must
//! not leak when a repository file is handed to someone else.

use rusqlite::params;
use tracing::info;
use tracing::instrument;

use crate::leaf;
use crate::object_id::ArtifactId;
use crate::repo::RepoError;
use crate::repo::Repository;
use crate::repo::Rid;
use crate::schema::tagid;
use crate::verify;
use crate::xref;
use crate::xref::ModerationPolicy;

/// Reconstructs all derived tables from blob content. Returns the number
/// of artifacts crosslinked.
#[instrument(skip_all)]
pub fn rebuild(repo: &Repository) -> Result<usize, RepoError> {
    repo.transaction(|repo| {
        // Shunned content stays dead across a rebuild.
        for uuid in repo.shunned_uuids()? {
            if let Some(id) = ArtifactId::parse(&uuid) {
                if let Some(rid) = repo.rid_for_uuid(&id)? {
                    repo.expunge_rid(rid)?;
                }
            }
        }
        repo.db().execute_batch(
            "DELETE FROM plink;
             DELETE FROM mlink;
             DELETE FROM tagxref;
             DELETE FROM event;
             DELETE FROM leaf;
             DELETE FROM attachment;
             DELETE FROM filename;
             DELETE FROM pending_xlink;",
        )?;
        let mut stmt = repo
            .db()
            .prepare_cached("DELETE FROM tag WHERE tagid>?1")?;
        stmt.execute(params![tagid::MAX_RESERVED])?;

        let rids: Vec<Rid> = {
            let mut stmt = repo
                .db()
                .prepare_cached("SELECT rid FROM blob ORDER BY rid")?;
            stmt.query_map([], |row| row.get(0))?
                .collect::<Result<_, _>>()?
        };
        let mut linked = 0usize;
        for rid in rids {
            verify::verify_before_commit(repo, rid);
            if xref::manifest_crosslink(repo, rid, &ModerationPolicy::TRUSTED)? {
                linked += 1;
            }
        }
        leaf::leaf_rebuild(repo)?;
        info!(linked, "rebuild complete");
        Ok(linked)
    })
}

/// Removes sensitive state from a repository that is about to be handed
/// off: private artifacts are expunged and user secrets cleared. Returns
/// the number of private artifacts removed.
#[instrument(skip_all)]
pub fn scrub(repo: &Repository) -> Result<usize, RepoError> {
    repo.transaction(|repo| {
        let rids: Vec<Rid> = {
            let mut stmt = repo
                .db()
                .prepare_cached("SELECT rid FROM private ORDER BY rid")?;
            stmt.query_map([], |row| row.get(0))?
                .collect::<Result<_, _>>()?
        };
        for &rid in &rids {
            repo.expunge_rid(rid)?;
        }
        repo.db().execute_batch(
            "UPDATE user SET secret='';
             DELETE FROM modreq;
             DELETE FROM rcvfrom;",
        )?;
        info!(removed = rids.len(), "scrub complete");
        Ok(rids.len())
    })
}
