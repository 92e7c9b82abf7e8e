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

//! ETag derivation.
//!
//! Readers that serve repository state over HTTP can answer conditional
//! requests cheaply: an ETag captures exactly the inputs a response
//! depends on. Output that depends on nothing beyond the executable gets
//! a long max-age; anything data- or config-dependent revalidates.

use rusqlite::OptionalExtension as _;

use crate::repo::RepoError;
use crate::repo::Repository;

/// What a response depends on. Combine with bitwise-or.
pub mod depend {
    /// Independent of repository state.
    pub const CONST: u32 = 0x00;
    /// Depends on the configuration (`cfgcnt`).
    pub const CONFIG: u32 = 0x01;
    /// Depends on repository data (the event table high-water mark).
    pub const DATA: u32 = 0x02;
    /// Depends on a display cookie supplied by the caller.
    pub const COOKIE: u32 = 0x04;
    /// Always different; never cacheable.
    pub const DYNAMIC: u32 = 0x08;
}

/// A computed entity tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Etag {
    /// The quoted tag value, or `None` for dynamic output.
    pub tag: Option<String>,
    /// Suggested `max-age` in seconds.
    pub max_age: u32,
}

/// Computes the ETag for a response with the given dependency mask.
pub fn etag_for(repo: &Repository, mask: u32, cookie: Option<&str>) -> Result<Etag, RepoError> {
    if mask & depend::DYNAMIC != 0 {
        return Ok(Etag {
            tag: None,
            max_age: 0,
        });
    }
    let mut basis = repo.project_code()?;
    if mask & depend::CONFIG != 0 {
        basis.push_str(&format!("/{}", repo.config_get_int("cfgcnt", 0)?));
    }
    if mask & depend::DATA != 0 {
        let high_water: Option<f64> = repo
            .db()
            .prepare_cached("SELECT max(mtime) FROM event")?
            .query_row([], |row| row.get(0))
            .optional()?
            .flatten();
        basis.push_str(&format!("/{:.17}", high_water.unwrap_or(0.0)));
    }
    if mask & depend::COOKIE != 0 {
        basis.push('/');
        basis.push_str(cookie.unwrap_or(""));
    }
    Ok(Etag {
        tag: Some(format!("\"{:x}\"", md5::compute(basis.as_bytes()))),
        max_age: if mask == depend::CONST { 86400 } else { 1 },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_changes_move_the_tag() {
        let repo = Repository::create_in_memory().unwrap();
        let a = etag_for(&repo, depend::CONFIG, None).unwrap();
        repo.config_set("some-setting", "1").unwrap();
        let b = etag_for(&repo, depend::CONFIG, None).unwrap();
        assert_ne!(a, b);
        // A constant page's tag does not move.
        let c1 = etag_for(&repo, depend::CONST, None).unwrap();
        let c2 = etag_for(&repo, depend::CONST, None).unwrap();
        assert_eq!(c1, c2);
        assert_eq!(c1.max_age, 86400);
    }

    #[test]
    fn test_dynamic_has_no_tag() {
        let repo = Repository::create_in_memory().unwrap();
        let e = etag_for(&repo, depend::DYNAMIC | depend::DATA, None).unwrap();
        assert_eq!(e.tag, None);
    }
}
