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

use chert_lib::rebuild;
use chert_lib::repo::Repository;
use pretty_assertions::assert_eq;
use testutils::CommitSpec;
use testutils::TestRepo;
use testutils::linear_history;
use testutils::write_commit;

/// Snapshot of every derived table, ordered, for equality comparison.
fn derived_snapshot(repo: &Repository) -> Vec<String> {
    let mut rows = Vec::new();
    for sql in [
        "SELECT 'plink:'||pid||':'||cid||':'||isprim||':'||mtime
           FROM plink ORDER BY pid, cid",
        "SELECT 'mlink:'||mid||':'||fid||':'||pid||':'||fnid||':'||pfnid||':'||mperm
           FROM mlink ORDER BY mid, fnid, fid",
        "SELECT 'tagxref:'||tagid||':'||rid||':'||tagtype||':'||srcid
                ||':'||coalesce(value, '')||':'||mtime
           FROM tagxref ORDER BY tagid, rid",
        "SELECT 'event:'||objid||':'||type||':'||coalesce(user, '')
                ||':'||coalesce(comment, '')
           FROM event ORDER BY objid",
        "SELECT 'leaf:'||rid FROM leaf ORDER BY rid",
        "SELECT 'filename:'||fnid||':'||name FROM filename ORDER BY fnid",
    ] {
        let mut stmt = repo.db().prepare(sql).unwrap();
        let chunk: Vec<String> = stmt
            .query_map([], |r| r.get(0))
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        rows.extend(chunk);
    }
    rows
}

#[test]
fn test_rebuild_reproduces_derived_tables() {
    let test_repo = TestRepo::init();
    let repo = &test_repo.repo;
    let commits = linear_history(repo, 4);
    // Some branching and a merge for good measure.
    let (_, branch_id) = write_commit(
        repo,
        &CommitSpec {
            parents: vec![commits[1].1.as_str()],
            files: vec![("side.txt", "side\n")],
            comment: "branch work",
            seq: 8,
            branch: Some("side"),
            ..CommitSpec::default()
        },
    );
    write_commit(
        repo,
        &CommitSpec {
            parents: vec![commits[3].1.as_str(), branch_id.as_str()],
            files: vec![("file.txt", "merged\n"), ("side.txt", "side\n")],
            comment: "merge",
            seq: 9,
            ..CommitSpec::default()
        },
    );

    let before = derived_snapshot(repo);
    assert!(!before.is_empty());
    let linked = rebuild::rebuild(repo).unwrap();
    assert!(linked >= 6);
    let after = derived_snapshot(repo);
    assert_eq!(before, after);
}

#[test]
fn test_rebuild_is_itself_idempotent() {
    let test_repo = TestRepo::init();
    let repo = &test_repo.repo;
    linear_history(repo, 3);
    rebuild::rebuild(repo).unwrap();
    let first = derived_snapshot(repo);
    rebuild::rebuild(repo).unwrap();
    assert_eq!(first, derived_snapshot(repo));
}

#[test]
fn test_scrub_removes_private_and_secrets() {
    let test_repo = TestRepo::init();
    let repo = &test_repo.repo;
    linear_history(repo, 2);
    repo.user_create("dev", "hunter2", "goi").unwrap();
    repo.begin_transaction().unwrap();
    let (rid, _) = repo.content_put(b"internal only").unwrap();
    repo.mark_private(rid).unwrap();
    repo.end_transaction(true).unwrap();

    let removed = rebuild::scrub(repo).unwrap();
    assert_eq!(removed, 1);
    let private: i64 = repo
        .db()
        .query_row("SELECT count(*) FROM private", [], |r| r.get(0))
        .unwrap();
    assert_eq!(private, 0);
    let secret: String = repo
        .db()
        .query_row("SELECT secret FROM user WHERE login='dev'", [], |r| r.get(0))
        .unwrap();
    assert_eq!(secret, "");
}
