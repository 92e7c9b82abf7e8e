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

//! Test helpers for chert-lib: temporary repositories and quick ways to
//! build commit graphs out of real artifacts.

#![allow(missing_docs)]

use std::path::Path;
use std::path::PathBuf;

use chert_lib::manifest::FileCard;
use chert_lib::manifest::FilePerm;
use chert_lib::manifest::Manifest;
use chert_lib::manifest::ManifestDate;
use chert_lib::object_id::ArtifactId;
use chert_lib::repo::Repository;
use chert_lib::repo::Rid;
use chert_lib::tag::TagType;
use chert_lib::xref;
use chert_lib::xref::ModerationPolicy;
use tempfile::TempDir;

/// A repository in a temporary directory, removed on drop.
pub struct TestRepo {
    pub repo: Repository,
    dir: TempDir,
}

impl TestRepo {
    /// Creates a fresh file-backed repository.
    pub fn init() -> Self {
        let dir = TempDir::new().unwrap();
        let repo = Repository::create(dir.path().join("test.chert")).unwrap();
        Self { repo, dir }
    }

    /// The repository file path.
    pub fn repo_path(&self) -> PathBuf {
        self.dir.path().join("test.chert")
    }

    /// A scratch path inside the temporary directory.
    pub fn scratch_path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    /// The temporary directory itself.
    pub fn dir(&self) -> &Path {
        self.dir.path()
    }
}

/// Base timestamp for generated commits; offsets keep history ordered.
const BASE_JULIAN: f64 = 2459000.5;

/// The date given to the `seq`-th generated commit.
pub fn commit_date(seq: u32) -> ManifestDate {
    ManifestDate::from_julian(BASE_JULIAN + f64::from(seq) * 0.01)
}

/// Describes one commit to synthesize.
#[derive(Default)]
pub struct CommitSpec<'a> {
    /// Parent check-in names; first is primary.
    pub parents: Vec<&'a str>,
    /// (filename, content) pairs; the full tree of the commit.
    pub files: Vec<(&'a str, &'a str)>,
    /// Commit comment.
    pub comment: &'a str,
    /// Position in history; drives the timestamp.
    pub seq: u32,
    /// Branch to attach with a propagating tag, if any.
    pub branch: Option<&'a str>,
}

/// Stores the file blobs and the check-in manifest for `spec`, crosslinks
/// them, and returns the check-in's rid and name. Runs in its own
/// transaction.
pub fn write_commit(repo: &Repository, spec: &CommitSpec<'_>) -> (Rid, ArtifactId) {
    repo.begin_transaction().unwrap();
    let mut files = Vec::new();
    for (name, content) in &spec.files {
        let (_, id) = repo.content_put(content.as_bytes()).unwrap();
        files.push(FileCard {
            name: (*name).to_owned(),
            uuid: Some(id),
            perm: FilePerm::Regular,
            prior_name: None,
        });
    }
    files.sort_by(|a, b| a.name.cmp(&b.name));
    let mut tags = Vec::new();
    if let Some(branch) = spec.branch {
        tags.push(chert_lib::manifest::TagCard {
            ttype: TagType::Propagate,
            name: "branch".to_owned(),
            target: None,
            value: Some(branch.to_owned()),
        });
        tags.push(chert_lib::manifest::TagCard {
            ttype: TagType::Propagate,
            name: format!("sym-{branch}"),
            target: None,
            value: None,
        });
        tags.sort_by(|a, b| a.name.cmp(&b.name));
    }
    let manifest = Manifest {
        comment: Some(spec.comment.to_owned()),
        date: Some(commit_date(spec.seq)),
        files,
        parents: spec
            .parents
            .iter()
            .map(|p| ArtifactId::parse(p).unwrap())
            .collect(),
        tags,
        user: Some("tester".to_owned()),
        has_z_card: true,
        ..Manifest::default()
    };
    let text = manifest.emit();
    let (rid, id) = repo.content_put(&text).unwrap();
    assert!(xref::manifest_crosslink(repo, rid, &ModerationPolicy::TRUSTED).unwrap());
    repo.end_transaction(true).unwrap();
    (rid, id)
}

/// Builds a linear chain of `n` commits on trunk, each touching one file.
/// Returns (rid, uuid) per commit, oldest first.
pub fn linear_history(repo: &Repository, n: u32) -> Vec<(Rid, ArtifactId)> {
    let mut commits: Vec<(Rid, ArtifactId)> = Vec::new();
    let contents: Vec<String> = (0..n).map(|i| format!("version {i}\n")).collect();
    for i in 0..n {
        let parent = commits.last().map(|(_, id)| id.as_str().to_owned());
        let parents: Vec<&str> = parent.as_deref().into_iter().collect();
        let spec = CommitSpec {
            parents,
            files: vec![("file.txt", contents[i as usize].as_str())],
            comment: "step",
            seq: i,
            ..CommitSpec::default()
        };
        commits.push(write_commit(repo, &spec));
    }
    commits
}
