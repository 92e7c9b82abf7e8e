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

//! The repository handle.
//!
//! A [`Repository`] owns a single SQLite connection. All writes happen
//! inside scoped transactions; nested `begin_transaction` calls become
//! savepoints, so an inner rollback does not invalidate the enclosing
//! frame. The outermost commit runs the pending leaf checks and the
//! integrity verifier before issuing `COMMIT`, so everything externally
//! observable is on a verified corpus.

use std::cell::Cell;
use std::cell::RefCell;
use std::num::NonZeroUsize;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use clru::CLruCache;
use rusqlite::Connection;
use rusqlite::OptionalExtension as _;
use rusqlite::params;
use thiserror::Error;
use tracing::instrument;

use crate::bag::Bag;
use crate::hash_policy::HashPolicy;
use crate::hex_util;
use crate::manifest::ManifestParseError;
use crate::object_id::ArtifactId;
use crate::schema;
use crate::schema::tagid;
use crate::store::StoreError;
use crate::xfer::SyncError;

/// Process-local integer id of a blob row. Rids never appear on the wire.
pub type Rid = i64;

/// Top-level error type for repository operations.
#[derive(Debug, Error)]
pub enum RepoError {
    /// The database lock could not be obtained within the busy timeout.
    /// The operation may be retried.
    #[error("database is locked")]
    Busy,
    /// The file exists but does not carry the repository schema.
    #[error("not a repository: {0}")]
    NotARepository(String),
    /// A blob store failure.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// A manifest failed to parse.
    #[error(transparent)]
    Manifest(#[from] ManifestParseError),
    /// A sync session failure.
    #[error(transparent)]
    Sync(#[from] SyncError),
    /// A blob failed its integrity re-check at commit time.
    #[error("integrity check failed for rid {rid} ({uuid})")]
    VerifyFailed {
        /// The failing row.
        rid: Rid,
        /// Its declared hash name.
        uuid: String,
    },
    /// A symbolic or hex reference did not resolve.
    #[error("no artifact matches \"{0}\"")]
    NotFound(String),
    /// A hex prefix matched more than one artifact.
    #[error("ambiguous name \"{0}\"")]
    Ambiguous(String),
    /// The acting user lacks a required capability.
    #[error("permission denied: capability '{0}' required")]
    PermissionDenied(char),
    /// Any other database-level failure.
    #[error("database error: {0}")]
    Db(rusqlite::Error),
    /// Filesystem-level failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<rusqlite::Error> for RepoError {
    fn from(err: rusqlite::Error) -> Self {
        match err.sqlite_error_code() {
            Some(rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked) => {
                Self::Busy
            }
            _ => Self::Db(err),
        }
    }
}

/// How long to wait on the SQLite write lock before reporting
/// [`RepoError::Busy`].
const BUSY_TIMEOUT: Duration = Duration::from_secs(10);

/// Entries kept in the reconstructed-content cache. Deep delta chains
/// resolve against this, so it only needs to cover a working set.
const CONTENT_CACHE_SIZE: usize = 64;

/// An open repository.
pub struct Repository {
    conn: Connection,
    tx_depth: Cell<usize>,
    pub(crate) pending_verify: RefCell<Bag>,
    pub(crate) leaf_pending: RefCell<Bag>,
    pub(crate) content_cache: RefCell<CLruCache<Rid, Arc<Vec<u8>>>>,
    pub(crate) cached_policy: Cell<Option<HashPolicy>>,
}

impl std::fmt::Debug for Repository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Repository").finish_non_exhaustive()
    }
}

impl Repository {
    fn from_connection(conn: Connection) -> Self {
        Self {
            conn,
            tx_depth: Cell::new(0),
            pending_verify: RefCell::new(Bag::new()),
            leaf_pending: RefCell::new(Bag::new()),
            content_cache: RefCell::new(CLruCache::new(
                NonZeroUsize::new(CONTENT_CACHE_SIZE).unwrap(),
            )),
            cached_policy: Cell::new(None),
        }
    }

    /// Opens an existing repository file.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, RepoError> {
        let path = path.as_ref();
        let conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        let repo = Self::from_connection(conn);
        if !repo.table_exists("config")? || !repo.table_exists("blob")? {
            return Err(RepoError::NotARepository(path.display().to_string()));
        }
        Ok(repo)
    }

    /// Creates a new repository file and seeds its schema and identity.
    #[instrument(skip_all)]
    pub fn create(path: impl AsRef<Path>) -> Result<Self, RepoError> {
        let conn = Connection::open(path.as_ref())?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        let repo = Self::from_connection(conn);
        repo.init_schema()?;
        Ok(repo)
    }

    /// Creates a throwaway in-memory repository. Bundles cannot be attached
    /// to it; everything else behaves identically.
    pub fn create_in_memory() -> Result<Self, RepoError> {
        let conn = Connection::open_in_memory()?;
        let repo = Self::from_connection(conn);
        repo.init_schema()?;
        Ok(repo)
    }

    fn init_schema(&self) -> Result<(), RepoError> {
        self.begin_transaction()?;
        let r = (|| -> Result<(), RepoError> {
            self.conn.execute_batch(schema::REPOSITORY_SCHEMA)?;
            self.conn.execute_batch(schema::XREF_SCHEMA)?;
            self.conn.execute_batch(schema::TAG_SEED)?;
            let mut rng = rand::rng();
            let project_code = random_hex_code(&mut rng);
            let server_code = random_hex_code(&mut rng);
            self.config_set("project-code", &project_code)?;
            self.config_set("server-code", &server_code)?;
            self.config_set("content-schema", schema::CONTENT_SCHEMA)?;
            self.config_set("aux-schema", schema::AUX_SCHEMA)?;
            self.config_set("hash-policy", HashPolicy::ShunSha1.name())?;
            Ok(())
        })();
        self.end_transaction(r.is_ok())?;
        r
    }

    /// The underlying connection. The repository's data model *is* this
    /// schema, so read-only queries against it are a supported interface;
    /// writes outside this crate void the integrity guarantees.
    pub fn db(&self) -> &Connection {
        &self.conn
    }

    pub(crate) fn table_exists(&self, name: &str) -> Result<bool, RepoError> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT 1 FROM sqlite_master WHERE type='table' AND name=?1")?;
        Ok(stmt.exists(params![name])?)
    }

    // -- transactions ------------------------------------------------------

    /// Opens a transaction, or a savepoint when one is already open.
    pub fn begin_transaction(&self) -> Result<(), RepoError> {
        let depth = self.tx_depth.get();
        if depth == 0 {
            self.conn.execute_batch("BEGIN IMMEDIATE")?;
        } else {
            self.conn
                .execute_batch(&format!("SAVEPOINT chert_{depth}"))?;
        }
        self.tx_depth.set(depth + 1);
        Ok(())
    }

    /// Closes the innermost transaction frame. With `commit` false the
    /// frame is rolled back; an inner rollback leaves the enclosing frame
    /// intact. The outermost commit runs pending leaf checks and the
    /// integrity verifier first, and rolls everything back if either fails.
    pub fn end_transaction(&self, commit: bool) -> Result<(), RepoError> {
        let depth = self.tx_depth.get();
        assert!(depth > 0, "end_transaction without begin_transaction");
        self.tx_depth.set(depth - 1);
        if depth > 1 {
            let name = format!("chert_{}", depth - 1);
            if commit {
                self.conn.execute_batch(&format!("RELEASE {name}"))?;
            } else {
                self.conn
                    .execute_batch(&format!("ROLLBACK TO {name}; RELEASE {name}"))?;
            }
            return Ok(());
        }
        if commit {
            match self.run_commit_hooks() {
                Ok(()) => {
                    self.conn.execute_batch("COMMIT")?;
                    Ok(())
                }
                Err(err) => {
                    self.abort_transaction();
                    Err(err)
                }
            }
        } else {
            self.abort_transaction();
            Ok(())
        }
    }

    fn run_commit_hooks(&self) -> Result<(), RepoError> {
        crate::leaf::do_pending_checks(self)?;
        crate::verify::verify_at_commit(self)
    }

    fn abort_transaction(&self) {
        // A failing ROLLBACK leaves nothing further to do; the transaction
        // dies with the connection.
        let _ = self.conn.execute_batch("ROLLBACK");
        self.pending_verify.borrow_mut().clear();
        self.leaf_pending.borrow_mut().clear();
        self.content_cache.borrow_mut().clear();
    }

    /// Runs `f` inside a transaction frame, committing on `Ok` and rolling
    /// back on `Err`.
    pub fn transaction<T>(
        &self,
        f: impl FnOnce(&Self) -> Result<T, RepoError>,
    ) -> Result<T, RepoError> {
        self.begin_transaction()?;
        match f(self) {
            Ok(v) => {
                self.end_transaction(true)?;
                Ok(v)
            }
            Err(err) => {
                let _ = self.end_transaction(false);
                Err(err)
            }
        }
    }

    /// True if a transaction frame is currently open.
    pub fn in_transaction(&self) -> bool {
        self.tx_depth.get() > 0
    }

    // -- config ------------------------------------------------------------

    /// Reads a config entry.
    pub fn config_get(&self, name: &str) -> Result<Option<String>, RepoError> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT value FROM config WHERE name=?1")?;
        Ok(stmt
            .query_row(params![name], |row| row.get::<_, Option<String>>(0))
            .optional()?
            .flatten())
    }

    /// Reads an integer config entry, with a default.
    pub fn config_get_int(&self, name: &str, dflt: i64) -> Result<i64, RepoError> {
        Ok(self
            .config_get(name)?
            .and_then(|v| v.parse().ok())
            .unwrap_or(dflt))
    }

    /// Writes a config entry and bumps `cfgcnt` so that caches depending on
    /// the configuration invalidate.
    pub fn config_set(&self, name: &str, value: &str) -> Result<(), RepoError> {
        let mut stmt = self.conn.prepare_cached(
            "REPLACE INTO config(name, value, mtime) VALUES(?1, ?2, ?3)",
        )?;
        stmt.execute(params![name, value, now_julian()])?;
        if name != "cfgcnt" {
            self.incr_cfgcnt()?;
        }
        Ok(())
    }

    /// Removes a config entry.
    pub fn config_unset(&self, name: &str) -> Result<(), RepoError> {
        let mut stmt = self.conn.prepare_cached("DELETE FROM config WHERE name=?1")?;
        stmt.execute(params![name])?;
        self.incr_cfgcnt()?;
        Ok(())
    }

    /// Bumps the monotonic configuration counter.
    pub fn incr_cfgcnt(&self) -> Result<(), RepoError> {
        let n = self.config_get_int("cfgcnt", 0)?;
        let mut stmt = self.conn.prepare_cached(
            "REPLACE INTO config(name, value, mtime) VALUES('cfgcnt', ?1, ?2)",
        )?;
        stmt.execute(params![n + 1, now_julian()])?;
        Ok(())
    }

    /// The repository's project code.
    pub fn project_code(&self) -> Result<String, RepoError> {
        self.config_get("project-code")?
            .ok_or_else(|| RepoError::NotARepository("missing project-code".into()))
    }

    // -- name resolution ---------------------------------------------------

    /// The rid of an artifact name, if the blob table has a row for it.
    pub fn rid_for_uuid(&self, id: &ArtifactId) -> Result<Option<Rid>, RepoError> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT rid FROM blob WHERE uuid=?1")?;
        Ok(stmt.query_row(params![id.as_str()], |row| row.get(0)).optional()?)
    }

    /// The name of a blob row. It is an error for `rid` not to exist.
    pub fn uuid_for_rid(&self, rid: Rid) -> Result<ArtifactId, RepoError> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT uuid FROM blob WHERE rid=?1")?;
        let text: Option<String> = stmt.query_row(params![rid], |row| row.get(0)).optional()?;
        let text = text.ok_or_else(|| RepoError::NotFound(format!("rid {rid}")))?;
        ArtifactId::parse(&text).ok_or_else(|| RepoError::NotARepository(format!(
            "blob row {rid} has malformed name {text:?}"
        )))
    }

    /// Resolves a hex prefix of at least 4 digits to a unique artifact.
    pub fn resolve_hex_prefix(&self, prefix: &str) -> Result<Rid, RepoError> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT rid FROM blob WHERE uuid>=?1 AND uuid<?2 LIMIT 2",
        )?;
        let upper = {
            // Smallest string greater than every uuid with this prefix.
            let mut s = prefix.to_owned();
            s.push('g');
            s
        };
        let rids: Vec<Rid> = stmt
            .query_map(params![prefix, upper], |row| row.get(0))?
            .collect::<Result<_, _>>()?;
        match rids.as_slice() {
            [rid] => Ok(*rid),
            [] => Err(RepoError::NotFound(prefix.to_owned())),
            _ => Err(RepoError::Ambiguous(prefix.to_owned())),
        }
    }

    /// Resolves a user-facing name: a full hash, a hex abbreviation of at
    /// least 4 digits, a symbolic tag, or a branch name (most recent
    /// check-in on that branch).
    pub fn name_to_rid(&self, name: &str) -> Result<Rid, RepoError> {
        if let Some(id) = ArtifactId::parse(name) {
            if let Some(rid) = self.rid_for_uuid(&id)? {
                return Ok(rid);
            }
        } else if hex_util::is_hex_prefix(name) {
            if let Ok(rid) = self.resolve_hex_prefix(name) {
                return Ok(rid);
            }
        }
        // Symbolic tag: most recent check-in carrying sym-<name>.
        let mut stmt = self.conn.prepare_cached(
            "SELECT tagxref.rid FROM tagxref JOIN tag USING(tagid)
              JOIN event ON event.objid=tagxref.rid
             WHERE tag.tagname='sym-'||?1 AND tagxref.tagtype>0
             ORDER BY event.mtime DESC LIMIT 1",
        )?;
        if let Some(rid) = stmt.query_row(params![name], |row| row.get(0)).optional()? {
            return Ok(rid);
        }
        // Branch name: most recent check-in whose branch tag has this value.
        let mut stmt = self.conn.prepare_cached(
            "SELECT tagxref.rid FROM tagxref
              JOIN event ON event.objid=tagxref.rid
             WHERE tagxref.tagid=?1 AND tagxref.tagtype>0 AND tagxref.value=?2
             ORDER BY event.mtime DESC LIMIT 1",
        )?;
        if let Some(rid) = stmt
            .query_row(params![tagid::BRANCH, name], |row| row.get(0))
            .optional()?
        {
            return Ok(rid);
        }
        Err(RepoError::NotFound(name.to_owned()))
    }
}

fn random_hex_code(rng: &mut impl rand::Rng) -> String {
    let mut bytes = [0u8; 20];
    rng.fill(&mut bytes[..]);
    hex_util::encode_hex(&bytes)
}

/// The Unix epoch expressed as a Julian day.
pub const JULIAN_EPOCH: f64 = 2440587.5;

/// Converts seconds-since-epoch to a Julian day number.
pub fn julian_from_unix(secs: f64) -> f64 {
    JULIAN_EPOCH + secs / 86400.0
}

/// Converts a Julian day number to seconds-since-epoch.
pub fn unix_from_julian(julian: f64) -> f64 {
    (julian - JULIAN_EPOCH) * 86400.0
}

/// The current time as a Julian day number.
pub fn now_julian() -> f64 {
    let now = Utc::now();
    julian_from_unix(now.timestamp() as f64 + f64::from(now.timestamp_subsec_millis()) / 1000.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_seeds_identity() {
        let repo = Repository::create_in_memory().unwrap();
        let pc = repo.project_code().unwrap();
        assert_eq!(pc.len(), 40);
        assert!(hex_util::is_lower_hex(&pc));
        assert_eq!(
            repo.config_get("hash-policy").unwrap().as_deref(),
            Some("shun-sha1")
        );
        assert!(repo.config_get_int("cfgcnt", 0).unwrap() > 0);
    }

    #[test]
    fn test_nested_transactions() {
        let repo = Repository::create_in_memory().unwrap();
        repo.begin_transaction().unwrap();
        repo.config_set("outer", "1").unwrap();
        repo.begin_transaction().unwrap();
        repo.config_set("inner", "1").unwrap();
        // Rolling back the inner frame keeps the outer write.
        repo.end_transaction(false).unwrap();
        repo.end_transaction(true).unwrap();
        assert_eq!(repo.config_get("outer").unwrap().as_deref(), Some("1"));
        assert_eq!(repo.config_get("inner").unwrap(), None);
    }

    #[test]
    fn test_julian_round_trip() {
        let t = 1_577_934_245.0; // 2020-01-02 03:04:05 UTC
        let j = julian_from_unix(t);
        assert!((unix_from_julian(j) - t).abs() < 1e-3);
    }
}
