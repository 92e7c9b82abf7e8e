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

use chert_lib::leaf;
use chert_lib::manifest::FileCard;
use chert_lib::manifest::FilePerm;
use chert_lib::manifest::Manifest;
use chert_lib::manifest::TagCard;
use chert_lib::object_id::ArtifactId;
use chert_lib::repo::Rid;
use chert_lib::tag::TagType;
use chert_lib::xref;
use chert_lib::xref::ModerationPolicy;
use rusqlite::params;
use testutils::CommitSpec;
use testutils::TestRepo;
use testutils::commit_date;
use testutils::linear_history;
use testutils::write_commit;

#[test]
fn test_commit_produces_plink_and_mlink() {
    let test_repo = TestRepo::init();
    let repo = &test_repo.repo;
    let (rid1, id1) = write_commit(
        repo,
        &CommitSpec {
            files: vec![("foo.txt", "one\n")],
            comment: "first",
            seq: 0,
            ..CommitSpec::default()
        },
    );
    let (rid2, _) = write_commit(
        repo,
        &CommitSpec {
            parents: vec![id1.as_str()],
            files: vec![("foo.txt", "two\n")],
            comment: "second",
            seq: 1,
            ..CommitSpec::default()
        },
    );

    // One parent link, primary.
    let (pid, isprim): (Rid, bool) = repo
        .db()
        .query_row(
            "SELECT pid, isprim FROM plink WHERE cid=?1",
            params![rid2],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .unwrap();
    assert_eq!(pid, rid1);
    assert!(isprim);

    // One file transition: foo.txt old-version -> new-version.
    let (fid, prev, fnid, pfnid): (Rid, Rid, i64, i64) = repo
        .db()
        .query_row(
            "SELECT fid, pid, fnid, pfnid FROM mlink WHERE mid=?1",
            params![rid2],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
        )
        .unwrap();
    assert!(fid > 0);
    assert!(prev > 0);
    assert_ne!(fid, prev);
    assert_eq!(pfnid, 0);
    let name: String = repo
        .db()
        .query_row("SELECT name FROM filename WHERE fnid=?1", params![fnid], |r| {
            r.get(0)
        })
        .unwrap();
    assert_eq!(name, "foo.txt");

    // Both commits made it onto the timeline.
    let events: i64 = repo
        .db()
        .query_row("SELECT count(*) FROM event WHERE type='ci'", [], |r| r.get(0))
        .unwrap();
    assert_eq!(events, 2);
}

#[test]
fn test_mlink_encodes_delete_and_add() {
    let test_repo = TestRepo::init();
    let repo = &test_repo.repo;
    let (_, id1) = write_commit(
        repo,
        &CommitSpec {
            files: vec![("gone.txt", "bye\n"), ("kept.txt", "hi\n")],
            comment: "base",
            seq: 0,
            ..CommitSpec::default()
        },
    );
    let (rid2, _) = write_commit(
        repo,
        &CommitSpec {
            parents: vec![id1.as_str()],
            files: vec![("kept.txt", "hi\n"), ("new.txt", "fresh\n")],
            comment: "change",
            seq: 1,
            ..CommitSpec::default()
        },
    );

    // gone.txt: deletion row (fid=0); new.txt: addition row (pid=0);
    // kept.txt unchanged: no row.
    let rows: Vec<(Rid, Rid, String)> = {
        let mut stmt = repo
            .db()
            .prepare(
                "SELECT mlink.fid, mlink.pid, filename.name
                   FROM mlink JOIN filename USING(fnid)
                  WHERE mid=?1 ORDER BY filename.name",
            )
            .unwrap();
        let rows = stmt
            .query_map(params![rid2], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)))
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        rows
    };
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].2, "gone.txt");
    assert_eq!(rows[0].0, 0);
    assert!(rows[0].1 > 0);
    assert_eq!(rows[1].2, "new.txt");
    assert!(rows[1].0 > 0);
    assert_eq!(rows[1].1, 0);
}

#[test]
fn test_mlink_encodes_rename() {
    let test_repo = TestRepo::init();
    let repo = &test_repo.repo;
    let (_, id1) = write_commit(
        repo,
        &CommitSpec {
            files: vec![("old.txt", "payload\n")],
            comment: "base",
            seq: 0,
            ..CommitSpec::default()
        },
    );
    // Build the rename manifest by hand: F new.txt <hash> w old.txt.
    repo.begin_transaction().unwrap();
    let (_, blob_id) = repo.content_put(b"payload\n").unwrap();
    let m = Manifest {
        comment: Some("rename".to_owned()),
        date: Some(commit_date(1)),
        files: vec![FileCard {
            name: "new.txt".to_owned(),
            uuid: Some(blob_id),
            perm: FilePerm::Regular,
            prior_name: Some("old.txt".to_owned()),
        }],
        parents: vec![ArtifactId::parse(id1.as_str()).unwrap()],
        user: Some("tester".to_owned()),
        has_z_card: true,
        ..Manifest::default()
    };
    let (rid2, _) = repo.content_put(&m.emit()).unwrap();
    assert!(xref::manifest_crosslink(repo, rid2, &ModerationPolicy::TRUSTED).unwrap());
    repo.end_transaction(true).unwrap();

    let (fnid, pfnid): (i64, i64) = repo
        .db()
        .query_row(
            "SELECT fnid, pfnid FROM mlink WHERE mid=?1 AND pfnid>0",
            params![rid2],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .unwrap();
    let new_name: String = repo
        .db()
        .query_row("SELECT name FROM filename WHERE fnid=?1", params![fnid], |r| {
            r.get(0)
        })
        .unwrap();
    let old_name: String = repo
        .db()
        .query_row("SELECT name FROM filename WHERE fnid=?1", params![pfnid], |r| {
            r.get(0)
        })
        .unwrap();
    assert_eq!(new_name, "new.txt");
    assert_eq!(old_name, "old.txt");
}

#[test]
fn test_delta_manifest_file_set() {
    let test_repo = TestRepo::init();
    let repo = &test_repo.repo;
    let (rid1, id1) = write_commit(
        repo,
        &CommitSpec {
            files: vec![("a.txt", "alpha\n"), ("b.txt", "beta\n")],
            comment: "baseline",
            seq: 0,
            ..CommitSpec::default()
        },
    );
    // A delta manifest on top: replaces a.txt, removes b.txt.
    repo.begin_transaction().unwrap();
    let (_, new_a) = repo.content_put(b"alpha2\n").unwrap();
    let m = Manifest {
        baseline: Some(repo.uuid_for_rid(rid1).unwrap()),
        comment: Some("delta manifest".to_owned()),
        date: Some(commit_date(1)),
        files: vec![
            FileCard {
                name: "a.txt".to_owned(),
                uuid: Some(new_a.clone()),
                perm: FilePerm::Regular,
                prior_name: None,
            },
            FileCard {
                name: "b.txt".to_owned(),
                uuid: None,
                perm: FilePerm::Regular,
                prior_name: None,
            },
        ],
        parents: vec![ArtifactId::parse(id1.as_str()).unwrap()],
        user: Some("tester".to_owned()),
        has_z_card: true,
        ..Manifest::default()
    };
    let text = m.emit();
    let parsed = Manifest::parse(&text).unwrap();
    let set = parsed.file_set(repo).unwrap();
    repo.end_transaction(true).unwrap();

    assert_eq!(set.len(), 1);
    assert_eq!(set["a.txt"].uuid, new_a);
    assert!(!set.contains_key("b.txt"));
}

#[test]
fn test_tag_propagation_stops_at_cancel() {
    let test_repo = TestRepo::init();
    let repo = &test_repo.repo;
    let commits = linear_history(repo, 4);
    let rids: Vec<Rid> = commits.iter().map(|(rid, _)| *rid).collect();

    // A control artifact puts a propagating tag on the first commit.
    repo.begin_transaction().unwrap();
    let control = Manifest {
        date: Some(commit_date(10)),
        tags: vec![TagCard {
            ttype: TagType::Propagate,
            name: "sym-release".to_owned(),
            target: Some(commits[0].1.clone()),
            value: None,
        }],
        user: Some("tester".to_owned()),
        has_z_card: true,
        ..Manifest::default()
    };
    let (crid, _) = repo.content_put(&control.emit()).unwrap();
    assert!(xref::manifest_crosslink(repo, crid, &ModerationPolicy::TRUSTED).unwrap());
    repo.end_transaction(true).unwrap();

    let tid = repo.tag_find_id("sym-release").unwrap().unwrap();
    for &rid in &rids {
        assert!(
            repo.tag_value(rid, tid).unwrap().is_some(),
            "tag missing on {rid}"
        );
    }
    // Inherited rows carry srcid=0; the origin row carries the control
    // artifact as source.
    let srcid: Rid = repo
        .db()
        .query_row(
            "SELECT srcid FROM tagxref WHERE rid=?1 AND tagid=?2",
            params![rids[2], tid],
            |r| r.get(0),
        )
        .unwrap();
    assert_eq!(srcid, 0);

    // Cancel at the middle commit; the tail clears, the head remains.
    repo.begin_transaction().unwrap();
    let cancel = Manifest {
        date: Some(commit_date(11)),
        tags: vec![TagCard {
            ttype: TagType::Cancel,
            name: "sym-release".to_owned(),
            target: Some(commits[2].1.clone()),
            value: None,
        }],
        user: Some("tester".to_owned()),
        has_z_card: true,
        ..Manifest::default()
    };
    let (crid2, _) = repo.content_put(&cancel.emit()).unwrap();
    assert!(xref::manifest_crosslink(repo, crid2, &ModerationPolicy::TRUSTED).unwrap());
    repo.end_transaction(true).unwrap();

    assert!(repo.tag_value(rids[0], tid).unwrap().is_some());
    assert!(repo.tag_value(rids[1], tid).unwrap().is_some());
    assert!(repo.tag_value(rids[2], tid).unwrap().is_none());
    assert!(repo.tag_value(rids[3], tid).unwrap().is_none());
}

#[test]
fn test_branch_tag_splits_leaves() {
    let test_repo = TestRepo::init();
    let repo = &test_repo.repo;
    let (_, id1) = write_commit(
        repo,
        &CommitSpec {
            files: vec![("f", "0\n")],
            comment: "root",
            seq: 0,
            ..CommitSpec::default()
        },
    );
    let (rid_trunk, _) = write_commit(
        repo,
        &CommitSpec {
            parents: vec![id1.as_str()],
            files: vec![("f", "trunk\n")],
            comment: "trunk tip",
            seq: 1,
            ..CommitSpec::default()
        },
    );
    let (rid_branch, _) = write_commit(
        repo,
        &CommitSpec {
            parents: vec![id1.as_str()],
            files: vec![("f", "branch\n")],
            comment: "branch tip",
            seq: 2,
            branch: Some("dev"),
            ..CommitSpec::default()
        },
    );

    assert_eq!(repo.branch_of(rid_branch).unwrap(), "dev");
    // The root has a trunk child, so only the two tips are leaves.
    let leaves = leaf::all_leaves(repo).unwrap();
    assert_eq!(leaves, vec![rid_trunk, rid_branch]);

    // Recomputing from scratch agrees with the incremental result.
    repo.db().execute_batch("DELETE FROM leaf").unwrap();
    leaf::leaf_rebuild(repo).unwrap();
    assert_eq!(leaf::all_leaves(repo).unwrap(), leaves);
}
