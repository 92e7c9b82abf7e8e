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

//! The integrity verifier.
//!
//! Every row that enters the blob table is queued here. Immediately before
//! the enclosing transaction commits, each queued row is re-extracted
//! through the delta resolver and its hash recomputed against the stored
//! name. Any mismatch aborts the transaction, so nothing externally
//! observable is ever derived from an unverified corpus.

use tracing::instrument;

use crate::repo::RepoError;
use crate::repo::Repository;
use crate::repo::Rid;
use crate::store::StoreError;

/// Queues `rid` for verification before the next commit. Queuing the same
/// rid repeatedly verifies it once.
pub fn verify_before_commit(repo: &Repository, rid: Rid) {
    if rid > 0 {
        repo.pending_verify.borrow_mut().insert(rid);
    }
}

/// Cancels all pending verification. Only the rollback paths use this.
pub fn verify_cancel(repo: &Repository) {
    repo.pending_verify.borrow_mut().clear();
}

/// Re-checks every queued row. Called by the transaction layer just before
/// `COMMIT`; a failure aborts the whole transaction.
#[instrument(skip_all)]
pub(crate) fn verify_at_commit(repo: &Repository) -> Result<(), RepoError> {
    let rids = repo.pending_verify.borrow_mut().drain_sorted();
    if rids.is_empty() {
        return Ok(());
    }
    // Cached reconstructions must not mask a corrupt stored row.
    repo.clear_content_cache();
    for rid in rids {
        verify_rid(repo, rid)?;
    }
    Ok(())
}

fn verify_rid(repo: &Repository, rid: Rid) -> Result<(), RepoError> {
    let size = match repo.content_size(rid) {
        Ok(size) => size,
        // The row may have been rolled back in a savepoint after being
        // queued, or expunged; nothing left to check.
        Err(RepoError::NotFound(_)) => return Ok(()),
        Err(err) => return Err(err),
    };
    if size < 0 {
        // No way to verify phantoms.
        return Ok(());
    }
    let uuid = repo.uuid_for_rid(rid)?;
    let content = match repo.content_get(rid) {
        Ok(content) => content,
        Err(RepoError::Store(StoreError::Phantom(_))) => return Ok(()),
        Err(err) => return Err(err),
    };
    if !uuid.matches_content(&content) {
        return Err(RepoError::VerifyFailed {
            rid,
            uuid: uuid.as_str().to_owned(),
        });
    }
    Ok(())
}

/// Verifies every row in the repository. Used by `rebuild` and the
/// integrity-check command.
pub fn verify_all(repo: &Repository) -> Result<(), RepoError> {
    let rids: Vec<Rid> = {
        let mut stmt = repo.db().prepare_cached("SELECT rid FROM blob ORDER BY rid")?;
        let rids = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<_, _>>()?;
        rids
    };
    repo.clear_content_cache();
    for rid in rids {
        verify_rid(repo, rid)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use rusqlite::params;

    use super::*;

    #[test]
    fn test_clean_store_verifies() {
        let repo = Repository::create_in_memory().unwrap();
        repo.begin_transaction().unwrap();
        repo.content_put(b"alpha").unwrap();
        repo.content_put(b"beta").unwrap();
        repo.end_transaction(true).unwrap();
        verify_all(&repo).unwrap();
    }

    #[test]
    fn test_corruption_aborts_commit() {
        let repo = Repository::create_in_memory().unwrap();
        repo.begin_transaction().unwrap();
        repo.content_put(b"genuine content").unwrap();
        repo.end_transaction(true).unwrap();

        repo.begin_transaction().unwrap();
        let (rid, _) = repo.content_put(b"to be corrupted").unwrap();
        // Swap in the compressed form of different bytes behind the
        // store's back.
        repo.db()
            .execute(
                "UPDATE blob SET content=?1 WHERE rid=?2",
                params![crate::store::compress(b"tampered"), rid],
            )
            .unwrap();
        let err = repo.end_transaction(true).unwrap_err();
        assert!(matches!(err, RepoError::VerifyFailed { rid: r, .. } if r == rid));
        // The transaction rolled back: the tampered row is gone.
        let n: i64 = repo
            .db()
            .query_row("SELECT count(*) FROM blob", [], |r| r.get(0))
            .unwrap();
        assert_eq!(n, 1);
    }
}
