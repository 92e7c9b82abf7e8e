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

//! The cross-reference builder.
//!
//! When an artifact's content is available and parses as a manifest, this
//! module populates the derived tables: `plink` and `mlink` for check-ins,
//! `tagxref` for tag operations, `event` for the timeline, and the leaf
//! queue. The whole pass is a deterministic function of blob content and
//! is re-runnable, which is what makes `rebuild` possible.
//!
//! A check-in whose baseline or primary parent has not arrived yet cannot
//! compute its file transitions; it is parked in `pending_xlink` and
//! revisited when the missing artifact shows up.

use rusqlite::OptionalExtension as _;
use rusqlite::params;
use tracing::debug;
use tracing::warn;

use crate::leaf;
use crate::manifest::ArtifactType;
use crate::manifest::Manifest;
use crate::object_id::ArtifactId;
use crate::repo::RepoError;
use crate::repo::Repository;
use crate::repo::Rid;
use crate::store::StoreError;
use crate::tag::TagType;

/// Which artifact classes the acting user may publish without review.
/// Artifacts intercepted by moderation get a `modreq` row and the private
/// mark instead of derived rows; approval re-runs the crosslink.
#[derive(Debug, Clone, Copy, Default)]
pub struct ModerationPolicy {
    /// Hold wiki and technote artifacts for review.
    pub moderate_wiki: bool,
    /// Hold ticket changes and attachments for review.
    pub moderate_ticket: bool,
}

impl ModerationPolicy {
    /// A policy that intercepts nothing; used by local commands, rebuild
    /// and moderation approval.
    pub const TRUSTED: Self = Self {
        moderate_wiki: false,
        moderate_ticket: false,
    };

    fn intercepts(&self, ty: ArtifactType) -> bool {
        match ty {
            ArtifactType::Wiki | ArtifactType::Technote => self.moderate_wiki,
            ArtifactType::Ticket | ArtifactType::Attachment => self.moderate_ticket,
            _ => false,
        }
    }
}

/// Interns a filename, returning its fnid.
pub fn filename_intern(repo: &Repository, name: &str) -> Result<i64, RepoError> {
    {
        let mut stmt = repo
            .db()
            .prepare_cached("SELECT fnid FROM filename WHERE name=?1")?;
        if let Some(fnid) = stmt.query_row(params![name], |row| row.get(0)).optional()? {
            return Ok(fnid);
        }
    }
    repo.db()
        .prepare_cached("INSERT INTO filename(name) VALUES(?1)")?
        .execute(params![name])?;
    Ok(repo.db().last_insert_rowid())
}

/// Crosslinks the artifact stored at `rid`. Returns true if the content
/// was a recognized manifest and its derived rows are in place (or it was
/// parked for moderation or a missing baseline). Content that is not a
/// manifest — most file blobs — returns false.
pub fn manifest_crosslink(
    repo: &Repository,
    rid: Rid,
    policy: &ModerationPolicy,
) -> Result<bool, RepoError> {
    let content = match repo.content_get(rid) {
        Ok(content) => content,
        Err(RepoError::Store(StoreError::Phantom(_))) => return Ok(false),
        Err(err) => return Err(err),
    };
    let Ok(m) = Manifest::parse(&content) else {
        return Ok(false);
    };
    let Some(ty) = m.artifact_type() else {
        return Ok(false);
    };
    if policy.intercepts(ty) {
        intercept_for_moderation(repo, rid, &m, ty)?;
        return Ok(true);
    }
    match ty {
        ArtifactType::Checkin => crosslink_checkin(repo, rid, &m)?,
        ArtifactType::Control => crosslink_control(repo, rid, &m)?,
        ArtifactType::Wiki => crosslink_wiki(repo, rid, &m)?,
        ArtifactType::Technote => crosslink_technote(repo, rid, &m)?,
        ArtifactType::Ticket => crosslink_ticket(repo, rid, &m)?,
        ArtifactType::Attachment => crosslink_attachment(repo, rid, &m)?,
        ArtifactType::Cluster => crosslink_cluster(repo, rid, &m)?,
    }
    Ok(true)
}

/// Re-crosslinks every manifest that was waiting for `id` to arrive, then
/// crosslinks `rid` itself. Call this after filling a phantom.
pub fn after_content_available(
    repo: &Repository,
    rid: Rid,
    id: &ArtifactId,
    policy: &ModerationPolicy,
) -> Result<(), RepoError> {
    manifest_crosslink(repo, rid, policy)?;
    let waiters: Vec<String> = {
        let mut stmt = repo
            .db()
            .prepare_cached("SELECT waiter FROM pending_xlink WHERE missing=?1")?;
        stmt.query_map(params![id.as_str()], |row| row.get(0))?
            .collect::<Result<_, _>>()?
    };
    if waiters.is_empty() {
        return Ok(());
    }
    repo.db()
        .prepare_cached("DELETE FROM pending_xlink WHERE missing=?1")?
        .execute(params![id.as_str()])?;
    for waiter in waiters {
        let Some(wid) = ArtifactId::parse(&waiter) else {
            continue;
        };
        if let Some(wrid) = repo.rid_for_uuid(&wid)? {
            debug!(rid = wrid, "revisiting deferred crosslink");
            manifest_crosslink(repo, wrid, policy)?;
        }
    }
    Ok(())
}

fn park_for_missing(
    repo: &Repository,
    waiter_rid: Rid,
    missing: &ArtifactId,
) -> Result<(), RepoError> {
    let waiter = repo.uuid_for_rid(waiter_rid)?;
    warn!(
        waiter = waiter.as_str(),
        missing = missing.as_str(),
        "file transitions deferred until baseline arrives"
    );
    repo.db()
        .prepare_cached("INSERT OR IGNORE INTO pending_xlink(missing, waiter) VALUES(?1, ?2)")?
        .execute(params![missing.as_str(), waiter.as_str()])?;
    Ok(())
}

fn intercept_for_moderation(
    repo: &Repository,
    rid: Rid,
    m: &Manifest,
    ty: ArtifactType,
) -> Result<(), RepoError> {
    let tktid = m.ticket.as_ref().map(|k| k.as_str().to_owned());
    let attach_rid = match (ty, &m.attachment) {
        (ArtifactType::Attachment, Some(a)) => match &a.src {
            Some(src) => Some(repo.content_reference(src)?),
            None => None,
        },
        _ => None,
    };
    repo.db()
        .prepare_cached("INSERT OR IGNORE INTO modreq(objid, attachRid, tktid) VALUES(?1, ?2, ?3)")?
        .execute(params![rid, attach_rid, tktid])?;
    repo.mark_private(rid)?;
    if let Some(attach_rid) = attach_rid {
        repo.mark_private(attach_rid)?;
    }
    debug!(rid, "artifact held for moderation");
    Ok(())
}

fn insert_event(
    repo: &Repository,
    ty: &str,
    mtime: f64,
    rid: Rid,
    tagid: Option<i64>,
    user: Option<&str>,
    comment: Option<&str>,
) -> Result<(), RepoError> {
    let mut stmt = repo.db().prepare_cached(
        "REPLACE INTO event(type, mtime, objid, tagid, user, comment)
         VALUES(?1, ?2, ?3, ?4, ?5, ?6)",
    )?;
    stmt.execute(params![ty, mtime, rid, tagid, user, comment])?;
    Ok(())
}

fn apply_tag_cards(repo: &Repository, rid: Rid, m: &Manifest) -> Result<(), RepoError> {
    let mtime = m.mtime();
    for t in &m.tags {
        let target_rid = match &t.target {
            None => rid,
            Some(id) => repo.content_reference(id)?,
        };
        repo.tag_insert(&t.name, t.ttype, t.value.as_deref(), rid, mtime, target_rid)?;
    }
    Ok(())
}

fn crosslink_checkin(repo: &Repository, rid: Rid, m: &Manifest) -> Result<(), RepoError> {
    let mtime = m.mtime();
    // The pass is re-runnable: clear this check-in's own derived rows.
    repo.db()
        .prepare_cached("DELETE FROM plink WHERE cid=?1")?
        .execute(params![rid])?;
    repo.db()
        .prepare_cached("DELETE FROM mlink WHERE mid=?1")?
        .execute(params![rid])?;

    let baseid = match &m.baseline {
        Some(id) => Some(repo.content_reference(id)?),
        None => None,
    };
    for (i, parent) in m.parents.iter().enumerate() {
        let pid = repo.content_reference(parent)?;
        let mut stmt = repo.db().prepare_cached(
            "INSERT OR IGNORE INTO plink(pid, cid, isprim, mtime, baseid)
             VALUES(?1, ?2, ?3, ?4, ?5)",
        )?;
        stmt.execute(params![pid, rid, i == 0, mtime, baseid])?;
    }
    insert_event(
        repo,
        "ci",
        mtime,
        rid,
        None,
        m.user.as_deref(),
        m.comment.as_deref(),
    )?;
    build_mlinks(repo, rid, m)?;
    apply_tag_cards(repo, rid, m)?;
    leaf::eventually_check(repo, rid)?;
    Ok(())
}

/// Computes the file-transition rows for a check-in by diffing its
/// effective file set against the primary parent's. Adds have `pid=0`,
/// deletions `fid=0`, renames carry the prior fnid.
fn build_mlinks(repo: &Repository, rid: Rid, m: &Manifest) -> Result<(), RepoError> {
    let child_set = match m.file_set(repo) {
        Ok(set) => set,
        Err(RepoError::Store(StoreError::Phantom(_))) => {
            if let Some(base) = &m.baseline {
                park_for_missing(repo, rid, base)?;
            }
            return Ok(());
        }
        Err(err) => return Err(err),
    };
    let parent_set = match m.parents.first() {
        None => Default::default(),
        Some(parent_id) => {
            let Some(parent_rid) = repo.rid_for_uuid(parent_id)? else {
                park_for_missing(repo, rid, parent_id)?;
                return Ok(());
            };
            match Manifest::parse_rid(repo, parent_rid) {
                Ok(pm) => match pm.file_set(repo) {
                    Ok(set) => set,
                    Err(RepoError::Store(StoreError::Phantom(_))) => {
                        park_for_missing(repo, rid, parent_id)?;
                        return Ok(());
                    }
                    Err(err) => return Err(err),
                },
                Err(RepoError::Store(StoreError::Phantom(_))) => {
                    park_for_missing(repo, rid, parent_id)?;
                    return Ok(());
                }
                Err(err) => return Err(err),
            }
        }
    };

    let mut insert = |fid: Rid, pid: Rid, fnid: i64, pfnid: i64, mperm: i64| -> Result<(), RepoError> {
        let mut stmt = repo.db().prepare_cached(
            "INSERT INTO mlink(mid, fid, pid, fnid, pfnid, mperm)
             VALUES(?1, ?2, ?3, ?4, ?5, ?6)",
        )?;
        stmt.execute(params![rid, fid, pid, fnid, pfnid, mperm])?;
        Ok(())
    };

    // Names consumed by an explicit rename in this manifest.
    let renamed_from: std::collections::HashSet<&str> = m
        .files
        .iter()
        .filter(|f| f.uuid.is_some())
        .filter_map(|f| f.prior_name.as_deref())
        .collect();
    let rename_of = |name: &str| -> Option<&str> {
        m.files
            .iter()
            .find(|f| f.name == name)
            .and_then(|f| f.prior_name.as_deref())
    };

    for (name, entry) in &child_set {
        let fid = repo.content_reference(&entry.uuid)?;
        let fnid = filename_intern(repo, name)?;
        match parent_set.get(name) {
            Some(prev) if prev == entry => {}
            Some(prev) => {
                let pid = repo.content_reference(&prev.uuid)?;
                insert(fid, pid, fnid, 0, entry.perm.as_int())?;
            }
            None => match rename_of(name).and_then(|old| parent_set.get(old).map(|e| (old, e))) {
                Some((old_name, prev)) => {
                    let pid = repo.content_reference(&prev.uuid)?;
                    let pfnid = filename_intern(repo, old_name)?;
                    insert(fid, pid, fnid, pfnid, entry.perm.as_int())?;
                }
                None => {
                    insert(fid, 0, fnid, 0, entry.perm.as_int())?;
                }
            },
        }
    }
    for (name, prev) in &parent_set {
        if child_set.contains_key(name) || renamed_from.contains(name.as_str()) {
            continue;
        }
        let pid = repo.content_reference(&prev.uuid)?;
        let fnid = filename_intern(repo, name)?;
        insert(0, pid, fnid, 0, 0)?;
    }
    Ok(())
}

fn crosslink_control(repo: &Repository, rid: Rid, m: &Manifest) -> Result<(), RepoError> {
    apply_tag_cards(repo, rid, m)?;
    insert_event(
        repo,
        "g",
        m.mtime(),
        rid,
        None,
        m.user.as_deref(),
        m.comment.as_deref(),
    )?;
    Ok(())
}

fn crosslink_wiki(repo: &Repository, rid: Rid, m: &Manifest) -> Result<(), RepoError> {
    let title = m.wiki_title.as_deref().expect("wiki artifact has an L card");
    let mtime = m.mtime();
    let tag = format!("wiki-{title}");
    let tagid = repo.tag_insert(&tag, TagType::Add, None, rid, mtime, rid)?;
    let comment = format!("Changes to wiki page [{title}]");
    insert_event(
        repo,
        "w",
        mtime,
        rid,
        Some(tagid),
        m.user.as_deref(),
        Some(&comment),
    )?;
    Ok(())
}

fn crosslink_technote(repo: &Repository, rid: Rid, m: &Manifest) -> Result<(), RepoError> {
    let (when, id) = m.technote.as_ref().expect("technote artifact has an E card");
    let tag = format!("event-{id}");
    let tagid = repo.tag_insert(&tag, TagType::Add, None, rid, m.mtime(), rid)?;
    insert_event(
        repo,
        "e",
        when.julian(),
        rid,
        Some(tagid),
        m.user.as_deref(),
        m.comment.as_deref(),
    )?;
    Ok(())
}

fn crosslink_ticket(repo: &Repository, rid: Rid, m: &Manifest) -> Result<(), RepoError> {
    let k = m.ticket.as_ref().expect("ticket artifact has a K card");
    let tag = format!("tkt-{k}");
    let tagid = repo.tag_insert(&tag, TagType::Add, None, rid, m.mtime(), rid)?;
    let comment = format!("Changes to ticket [{}]", &k.as_str()[..10.min(k.as_str().len())]);
    insert_event(
        repo,
        "t",
        m.mtime(),
        rid,
        Some(tagid),
        m.user.as_deref(),
        Some(&comment),
    )?;
    Ok(())
}

fn crosslink_attachment(repo: &Repository, rid: Rid, m: &Manifest) -> Result<(), RepoError> {
    let a = m.attachment.as_ref().expect("attachment artifact has an A card");
    let mtime = m.mtime();
    let src = match &a.src {
        Some(id) => {
            repo.content_reference(id)?;
            Some(id.as_str())
        }
        None => None,
    };
    let mut stmt = repo.db().prepare_cached(
        "REPLACE INTO attachment(attachid, mtime, src, target, filename, comment, user)
         VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7)",
    )?;
    stmt.execute(params![
        rid,
        mtime,
        src,
        a.target,
        a.name,
        m.comment,
        m.user
    ])?;
    let mut stmt = repo.db().prepare_cached(
        "UPDATE attachment SET isLatest = (mtime ==
            (SELECT max(mtime) FROM attachment AS a2
              WHERE a2.target=attachment.target AND a2.filename=attachment.filename))
         WHERE target=?1 AND filename=?2",
    )?;
    stmt.execute(params![a.target, a.name])?;
    let comment = format!("Attachment {} added to [{}]", a.name, a.target);
    insert_event(
        repo,
        "g",
        mtime,
        rid,
        None,
        m.user.as_deref(),
        Some(&comment),
    )?;
    Ok(())
}

fn crosslink_cluster(repo: &Repository, rid: Rid, m: &Manifest) -> Result<(), RepoError> {
    repo.tag_insert("cluster", TagType::Add, None, rid, 0.0, rid)?;
    for member in &m.members {
        let mrid = repo.content_reference(member)?;
        repo.db()
            .prepare_cached("DELETE FROM unclustered WHERE rid=?1")?
            .execute(params![mrid])?;
    }
    Ok(())
}
