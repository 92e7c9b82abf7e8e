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

//! Unversioned content.
//!
//! Unversioned files live outside the artifact DAG: one row per name,
//! newest mtime wins, no history. They ride along on sync via `uvfile`
//! cards when the client asks for them.

use rusqlite::OptionalExtension as _;
use rusqlite::params;

use crate::object_id::ArtifactId;
use crate::repo::RepoError;
use crate::repo::Repository;
use crate::store;

/// One unversioned file.
#[derive(Debug, Clone, PartialEq)]
pub struct UvFile {
    /// The name, a repository-relative path.
    pub name: String,
    /// Last modification, seconds since the epoch.
    pub mtime: i64,
    /// Hash of the content under the current naming policy.
    pub hash: String,
    /// Uncompressed size.
    pub size: i64,
}

impl Repository {
    /// Stores (or replaces) an unversioned file. An existing row with a
    /// newer mtime wins; returns whether the write took effect.
    pub fn uv_put(
        &self,
        name: &str,
        content: &[u8],
        mtime: i64,
        rcvid: i64,
    ) -> Result<bool, RepoError> {
        let existing_mtime: Option<i64> = {
            let mut stmt = self
                .db()
                .prepare_cached("SELECT mtime FROM unversioned WHERE name=?1")?;
            stmt.query_row(params![name], |row| row.get(0)).optional()?
        };
        if existing_mtime.is_some_and(|t| t > mtime) {
            return Ok(false);
        }
        let algo = self.hash_policy()?.new_artifact_algo();
        let hash = ArtifactId::hash_content(algo, content);
        let mut stmt = self.db().prepare_cached(
            "REPLACE INTO unversioned(name, rcvid, mtime, hash, sz, content)
             VALUES(?1, ?2, ?3, ?4, ?5, ?6)",
        )?;
        stmt.execute(params![
            name,
            rcvid,
            mtime,
            hash.as_str(),
            content.len() as i64,
            store::compress(content)
        ])?;
        Ok(true)
    }

    /// Fetches an unversioned file's metadata and content.
    pub fn uv_get(&self, name: &str) -> Result<Option<(UvFile, Vec<u8>)>, RepoError> {
        let mut stmt = self.db().prepare_cached(
            "SELECT mtime, hash, sz, content FROM unversioned WHERE name=?1",
        )?;
        let row: Option<(i64, String, i64, Vec<u8>)> = stmt
            .query_row(params![name], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
            })
            .optional()?;
        let Some((mtime, hash, size, stored)) = row else {
            return Ok(None);
        };
        let content = store::decompress(&stored, 0)?;
        Ok(Some((
            UvFile {
                name: name.to_owned(),
                mtime,
                hash,
                size,
            },
            content,
        )))
    }

    /// Removes an unversioned file.
    pub fn uv_remove(&self, name: &str) -> Result<(), RepoError> {
        let mut stmt = self
            .db()
            .prepare_cached("DELETE FROM unversioned WHERE name=?1")?;
        stmt.execute(params![name])?;
        Ok(())
    }

    /// Lists unversioned files by name.
    pub fn uv_list(&self) -> Result<Vec<UvFile>, RepoError> {
        let mut stmt = self.db().prepare_cached(
            "SELECT name, mtime, hash, sz FROM unversioned ORDER BY name",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok(UvFile {
                    name: row.get(0)?,
                    mtime: row.get(1)?,
                    hash: row.get(2)?,
                    size: row.get(3)?,
                })
            })?
            .collect::<Result<_, _>>()?;
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_newer_mtime_wins() {
        let repo = Repository::create_in_memory().unwrap();
        assert!(repo.uv_put("logo.png", b"v2", 200, 0).unwrap());
        // An older update loses.
        assert!(!repo.uv_put("logo.png", b"v1", 100, 0).unwrap());
        let (meta, content) = repo.uv_get("logo.png").unwrap().unwrap();
        assert_eq!(content, b"v2");
        assert_eq!(meta.mtime, 200);
        assert_eq!(meta.size, 2);
        assert_eq!(repo.uv_list().unwrap().len(), 1);
        repo.uv_remove("logo.png").unwrap();
        assert!(repo.uv_get("logo.png").unwrap().is_none());
    }
}
