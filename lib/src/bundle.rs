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

//! Bundles: subsets of a repository in a standalone file.
//!
//! A bundle is a small SQLite database (`bconfig` + `bblob`) attached to
//! the repository connection while in use. Export selects a subtree of
//! check-ins and writes their artifacts, delta-compressed against other
//! bundle rows; import ingests them, privately by default so a bundle can
//! be inspected before publishing.

use std::collections::HashMap;
use std::path::Path;

use rusqlite::OptionalExtension as _;
use rusqlite::params;
use tracing::info;

use crate::delta;
use crate::descendants;
use crate::manifest::Manifest;
use crate::object_id::ArtifactId;
use crate::repo::RepoError;
use crate::repo::Repository;
use crate::repo::Rid;
use crate::store;
use crate::store::StoreError;
use crate::xref;
use crate::xref::ModerationPolicy;

const BUNDLE_SCHEMA: &str = "\
CREATE TABLE IF NOT EXISTS bx.bconfig(
  bcname TEXT,
  bcvalue ANY
);
CREATE TABLE IF NOT EXISTS bx.bblob(
  blobid INTEGER PRIMARY KEY,
  uuid TEXT NOT NULL,
  sz INT NOT NULL,
  delta INT REFERENCES bblob,
  data BLOB
);
";

/// Which check-ins an export covers.
#[derive(Debug, Clone, Default)]
pub struct BundleSpec<'a> {
    /// All check-ins on the most recent instance of this branch.
    pub branch: Option<&'a str>,
    /// This check-in and its primary descendants.
    pub from: Option<&'a str>,
    /// Stop the `from` walk at this check-in (inclusive).
    pub to: Option<&'a str>,
    /// Exactly one check-in.
    pub checkin: Option<&'a str>,
}

/// Metadata of one bundle row.
#[derive(Debug, Clone, PartialEq)]
pub struct BundleEntry {
    /// Position in the bundle.
    pub blobid: i64,
    /// Artifact name.
    pub uuid: String,
    /// Uncompressed size.
    pub size: i64,
    /// Bundle row this one is a delta against, if any.
    pub delta_base: Option<i64>,
}

struct AttachedBundle<'r> {
    repo: &'r Repository,
}

impl<'r> AttachedBundle<'r> {
    fn open(repo: &'r Repository, path: &Path, init: bool) -> Result<Self, RepoError> {
        let path_text = path.to_string_lossy();
        repo.db()
            .execute("ATTACH ?1 AS bx", params![path_text.as_ref()])?;
        if init {
            repo.db().execute_batch(BUNDLE_SCHEMA)?;
        }
        Ok(Self { repo })
    }
}

impl Drop for AttachedBundle<'_> {
    fn drop(&mut self) {
        let _ = self.repo.db().execute_batch("DETACH bx");
    }
}

impl Repository {
    /// Resolves a [`BundleSpec`] to the set of check-in rids it names.
    fn bundle_subtree(&self, spec: &BundleSpec<'_>) -> Result<Vec<Rid>, RepoError> {
        if let Some(ci) = spec.checkin {
            return Ok(vec![self.name_to_rid(ci)?]);
        }
        if let Some(branch) = spec.branch {
            let tip = self.name_to_rid(branch)?;
            let start = descendants::start_of_branch(self, tip)?;
            return descendants::compute_descendants_on_branch(self, start, branch);
        }
        let Some(from) = spec.from else {
            return Err(RepoError::NotFound(
                "bundle export needs one of --branch, --from, --checkin".into(),
            ));
        };
        let from_rid = self.name_to_rid(from)?;
        let end: Option<(Rid, f64)> = match spec.to {
            Some(to) => {
                let rid = self.name_to_rid(to)?;
                let mtime: f64 = self
                    .db()
                    .prepare_cached("SELECT mtime FROM event WHERE objid=?1")?
                    .query_row(params![rid], |row| row.get(0))
                    .optional()?
                    .unwrap_or(0.0);
                Some((rid, mtime))
            }
            None => None,
        };
        // Primary descendants of `from`, cut off at the end point.
        let mut rids = vec![from_rid];
        let mut pending = vec![from_rid];
        while let Some(rid) = pending.pop() {
            if end.is_some_and(|(end_rid, _)| rid == end_rid) {
                continue;
            }
            let children: Vec<(Rid, f64)> = {
                let mut stmt = self.db().prepare_cached(
                    "SELECT plink.cid, coalesce(event.mtime, 0)
                       FROM plink LEFT JOIN event ON event.objid=plink.cid
                      WHERE plink.pid=?1 AND plink.isprim",
                )?;
                stmt.query_map(params![rid], |row| Ok((row.get(0)?, row.get(1)?)))?
                    .collect::<Result<_, _>>()?
            };
            for (cid, mtime) in children {
                if end.is_some_and(|(_, end_time)| mtime > end_time) {
                    continue;
                }
                if !rids.contains(&cid) {
                    rids.push(cid);
                    pending.push(cid);
                }
            }
        }
        rids.sort_unstable();
        Ok(rids)
    }

    /// Exports the artifacts of the selected subtree into a new bundle
    /// file. Returns the number of artifacts written.
    pub fn bundle_export(&self, path: &Path, spec: &BundleSpec<'_>) -> Result<usize, RepoError> {
        let checkins = self.bundle_subtree(spec)?;
        // The check-ins plus every file blob they reference.
        let mut rids = checkins.clone();
        for &mid in &checkins {
            let mut stmt = self
                .db()
                .prepare_cached("SELECT fid FROM mlink WHERE mid=?1 AND fid>0")?;
            for fid in stmt.query_map(params![mid], |row| row.get::<_, Rid>(0))? {
                let fid = fid?;
                if !rids.contains(&fid) {
                    rids.push(fid);
                }
            }
        }
        rids.sort_unstable();

        let bundle = AttachedBundle::open(self, path, true)?;
        let repo = bundle.repo;
        repo.db().execute(
            "INSERT INTO bx.bconfig(bcname, bcvalue) VALUES('project-code', ?1)",
            params![repo.project_code()?],
        )?;
        // Maps artifact name to the bundle row carrying it, for delta
        // bases.
        let mut in_bundle: HashMap<String, (i64, Rid)> = HashMap::new();
        let mut written = 0usize;
        for rid in rids {
            if repo.content_is_phantom(rid)? {
                continue;
            }
            let uuid = repo.uuid_for_rid(rid)?;
            let content = repo.content_get(rid)?;
            let base = self.bundle_delta_base(rid, &in_bundle)?;
            let (data, delta_col, sz) = match base {
                Some((base_blobid, base_rid)) => {
                    let base_content = repo.content_get(base_rid)?;
                    let d = delta::create(&base_content, &content);
                    let stored = store::compress(&d);
                    if stored.len() < content.len() {
                        (stored, Some(base_blobid), content.len() as i64)
                    } else {
                        (store::compress(&content), None, content.len() as i64)
                    }
                }
                None => (store::compress(&content), None, content.len() as i64),
            };
            repo.db().execute(
                "INSERT INTO bx.bblob(uuid, sz, delta, data) VALUES(?1, ?2, ?3, ?4)",
                params![uuid.as_str(), sz, delta_col, data],
            )?;
            let blobid = repo.db().last_insert_rowid();
            in_bundle.insert(uuid.as_str().to_owned(), (blobid, rid));
            written += 1;
        }
        info!(written, path = %path.display(), "bundle exported");
        Ok(written)
    }

    /// Picks a delta base already in the bundle: the primary parent for a
    /// check-in manifest, or the prior version of a file blob.
    fn bundle_delta_base(
        &self,
        rid: Rid,
        in_bundle: &HashMap<String, (i64, Rid)>,
    ) -> Result<Option<(i64, Rid)>, RepoError> {
        if let Ok(m) = Manifest::parse_rid(self, rid) {
            if let Some(parent) = m.parents.first() {
                return Ok(in_bundle.get(parent.as_str()).copied());
            }
        }
        let prior: Option<Rid> = {
            let mut stmt = self
                .db()
                .prepare_cached("SELECT pid FROM mlink WHERE fid=?1 AND pid>0 LIMIT 1")?;
            stmt.query_row(params![rid], |row| row.get(0)).optional()?
        };
        match prior {
            Some(pid) => {
                let uuid = self.uuid_for_rid(pid)?;
                Ok(in_bundle.get(uuid.as_str()).copied())
            }
            None => Ok(None),
        }
    }

    /// Imports a bundle. Artifacts arrive private unless `publish`.
    /// Returns the number of artifacts ingested.
    pub fn bundle_import(&self, path: &Path, publish: bool) -> Result<usize, RepoError> {
        let bundle = AttachedBundle::open(self, path, false)?;
        let repo = bundle.repo;
        let rows: Vec<(i64, String, Option<i64>, Vec<u8>)> = {
            let mut stmt = repo.db().prepare(
                "SELECT blobid, uuid, delta, data FROM bx.bblob ORDER BY blobid",
            )?;
            stmt.query_map([], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
            })?
            .collect::<Result<_, _>>()?
        };
        repo.begin_transaction()?;
        let result = (|| -> Result<usize, RepoError> {
            let mut contents: HashMap<i64, Vec<u8>> = HashMap::new();
            let mut ingested = 0usize;
            for (blobid, uuid, delta_base, data) in rows {
                let raw = store::decompress(&data, 0)?;
                let content = match delta_base {
                    None => raw,
                    Some(base) => {
                        let base_content = contents.get(&base).ok_or_else(|| {
                            RepoError::Store(StoreError::CorruptDelta(
                                delta::DeltaError::CopyOutOfRange,
                            ))
                        })?;
                        delta::apply(base_content, &raw).map_err(StoreError::CorruptDelta)?
                    }
                };
                let id = ArtifactId::parse(&uuid)
                    .ok_or_else(|| RepoError::NotFound(format!("bad bundle uuid {uuid}")))?;
                let rid = repo.content_put_ex(&content, &id, 0, !publish)?;
                xref::manifest_crosslink(repo, rid, &ModerationPolicy::TRUSTED)?;
                contents.insert(blobid, content);
                ingested += 1;
            }
            Ok(ingested)
        })();
        repo.end_transaction(result.is_ok())?;
        let ingested = result?;
        info!(ingested, path = %path.display(), "bundle imported");
        Ok(ingested)
    }

    /// Lists the artifacts in a bundle.
    pub fn bundle_ls(&self, path: &Path) -> Result<Vec<BundleEntry>, RepoError> {
        let bundle = AttachedBundle::open(self, path, false)?;
        let mut stmt = bundle
            .repo
            .db()
            .prepare("SELECT blobid, uuid, sz, delta FROM bx.bblob ORDER BY blobid")?;
        let rows = stmt
            .query_map([], |row| {
                Ok(BundleEntry {
                    blobid: row.get(0)?,
                    uuid: row.get(1)?,
                    size: row.get(2)?,
                    delta_base: row.get(3)?,
                })
            })?
            .collect::<Result<_, _>>()?;
        Ok(rows)
    }

    /// Reconstructs one artifact's content out of a bundle.
    pub fn bundle_extract(&self, path: &Path, uuid: &str) -> Result<Vec<u8>, RepoError> {
        let bundle = AttachedBundle::open(self, path, false)?;
        let repo = bundle.repo;
        let mut chain: Vec<Vec<u8>> = Vec::new();
        let mut cur = uuid.to_owned();
        loop {
            let row: Option<(Option<i64>, Vec<u8>)> = {
                let mut stmt = repo
                    .db()
                    .prepare("SELECT delta, data FROM bx.bblob WHERE uuid=?1")?;
                stmt.query_row(params![cur], |row| Ok((row.get(0)?, row.get(1)?)))
                    .optional()?
            };
            let Some((delta_base, data)) = row else {
                return Err(RepoError::NotFound(cur));
            };
            let raw = store::decompress(&data, 0)?;
            match delta_base {
                None => {
                    let mut content = raw;
                    for d in chain.into_iter().rev() {
                        content = delta::apply(&content, &d).map_err(StoreError::CorruptDelta)?;
                    }
                    return Ok(content);
                }
                Some(base) => {
                    chain.push(raw);
                    let base_uuid: String = repo
                        .db()
                        .prepare("SELECT uuid FROM bx.bblob WHERE blobid=?1")?
                        .query_row(params![base], |row| row.get(0))?;
                    cur = base_uuid;
                }
            }
        }
    }

    /// Appends raw files to a bundle as standalone full blobs.
    pub fn bundle_append(&self, path: &Path, files: &[(&str, &[u8])]) -> Result<(), RepoError> {
        let bundle = AttachedBundle::open(self, path, true)?;
        let repo = bundle.repo;
        for (_, content) in files {
            let algo = repo.hash_policy()?.new_artifact_algo();
            let id = ArtifactId::hash_content(algo, content);
            repo.db().execute(
                "INSERT INTO bx.bblob(uuid, sz, delta, data) VALUES(?1, ?2, NULL, ?3)",
                params![id.as_str(), content.len() as i64, store::compress(content)],
            )?;
        }
        Ok(())
    }
}
