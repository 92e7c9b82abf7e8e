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

//! Bisect a range of check-ins.
//!
//! Bisect state persists in the config table (`bisect-good`, `bisect-bad`
//! and an append-only `bisect-log`), so a session survives across process
//! invocations. Each step is the midpoint of the shortest path between
//! the current good and bad endpoints; by default only primary
//! parent-child links are followed.

use crate::path;
use crate::repo::RepoError;
use crate::repo::Repository;
use crate::repo::Rid;

/// One entry of the bisect log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BisectEntry {
    /// The check-in that was tested.
    pub rid: Rid,
    /// Its hash name.
    pub uuid: String,
    /// True if it was marked good.
    pub good: bool,
}

/// The current endpoints and suggested next step of a bisect session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BisectStatus {
    /// The newest known-good check-in, if marked.
    pub good: Option<Rid>,
    /// The oldest known-bad check-in, if marked.
    pub bad: Option<Rid>,
    /// The next check-in to test; `None` when the range is closed or an
    /// endpoint is missing.
    pub next: Option<Rid>,
}

impl Repository {
    fn bisect_endpoint(&self, key: &str) -> Result<Option<Rid>, RepoError> {
        match self.config_get(key)? {
            Some(uuid) => Ok(Some(self.name_to_rid(&uuid)?)),
            None => Ok(None),
        }
    }

    /// Whether bisect follows only primary parent links (the default).
    pub fn bisect_direct_only(&self) -> Result<bool, RepoError> {
        Ok(self.config_get_int("bisect-direct-only", 1)? != 0)
    }

    /// Marks a check-in good or bad and appends to the log.
    pub fn bisect_mark(&self, rid: Rid, good: bool) -> Result<(), RepoError> {
        let uuid = self.uuid_for_rid(rid)?;
        self.transaction(|repo| {
            let key = if good { "bisect-good" } else { "bisect-bad" };
            repo.config_set(key, uuid.as_str())?;
            let mut log = repo.config_get("bisect-log")?.unwrap_or_default();
            log.push_str(if good { "good " } else { "bad " });
            log.push_str(uuid.as_str());
            log.push('\n');
            repo.config_set("bisect-log", &log)?;
            Ok(())
        })
    }

    /// The recorded history of marks, oldest first.
    pub fn bisect_log(&self) -> Result<Vec<BisectEntry>, RepoError> {
        let Some(log) = self.config_get("bisect-log")? else {
            return Ok(Vec::new());
        };
        let mut entries = Vec::new();
        for line in log.lines() {
            let Some((verdict, uuid)) = line.split_once(' ') else {
                continue;
            };
            entries.push(BisectEntry {
                rid: self.name_to_rid(uuid)?,
                uuid: uuid.to_owned(),
                good: verdict == "good",
            });
        }
        Ok(entries)
    }

    /// The next check-in to test: the midpoint of the shortest path
    /// between the good and bad endpoints. `None` when either endpoint is
    /// missing or the range has no interior left.
    pub fn bisect_next(&self) -> Result<Option<Rid>, RepoError> {
        let (Some(good), Some(bad)) = (
            self.bisect_endpoint("bisect-good")?,
            self.bisect_endpoint("bisect-bad")?,
        ) else {
            return Ok(None);
        };
        let direct_only = self.bisect_direct_only()?;
        let Some(p) = path::shortest_path(self, good, bad, direct_only)? else {
            return Ok(None);
        };
        Ok(p.midpoint().map(|step| step.rid))
    }

    /// The endpoints and next step.
    pub fn bisect_status(&self) -> Result<BisectStatus, RepoError> {
        Ok(BisectStatus {
            good: self.bisect_endpoint("bisect-good")?,
            bad: self.bisect_endpoint("bisect-bad")?,
            next: self.bisect_next()?,
        })
    }

    /// The check-ins between the endpoints, in path order, for display.
    pub fn bisect_vlist(&self) -> Result<Vec<(Rid, String)>, RepoError> {
        let (Some(good), Some(bad)) = (
            self.bisect_endpoint("bisect-good")?,
            self.bisect_endpoint("bisect-bad")?,
        ) else {
            return Ok(Vec::new());
        };
        let direct_only = self.bisect_direct_only()?;
        let Some(p) = path::shortest_path(self, good, bad, direct_only)? else {
            return Ok(Vec::new());
        };
        let mut out = Vec::with_capacity(p.steps().len());
        for step in p.steps() {
            out.push((step.rid, self.uuid_for_rid(step.rid)?.as_str().to_owned()));
        }
        Ok(out)
    }

    /// Forgets all bisect state.
    pub fn bisect_reset(&self) -> Result<(), RepoError> {
        self.transaction(|repo| {
            for key in ["bisect-good", "bisect-bad", "bisect-log"] {
                repo.config_unset(key)?;
            }
            Ok(())
        })
    }
}
