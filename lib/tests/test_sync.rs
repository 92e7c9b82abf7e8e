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

use std::collections::BTreeSet;

use chert_lib::repo::Repository;
use pretty_assertions::assert_eq;
use chert_lib::sync;
use chert_lib::sync::SyncOptions;
use chert_lib::transport::LocalTransport;
use testutils::CommitSpec;
use testutils::TestRepo;
use testutils::linear_history;
use testutils::write_commit;

fn public_uuids(repo: &Repository) -> BTreeSet<String> {
    let mut stmt = repo
        .db()
        .prepare("SELECT uuid FROM blob WHERE size>=0 AND rid NOT IN private")
        .unwrap();
    let uuids = stmt
        .query_map([], |r| r.get(0))
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();
    uuids
}

fn clone_of(server: &TestRepo) -> TestRepo {
    let client = TestRepo::init();
    let mut transport = LocalTransport::new(&server.repo);
    let stats = sync::sync(
        &client.repo,
        &mut transport,
        &SyncOptions {
            clone: true,
            ..SyncOptions::default()
        },
    )
    .unwrap();
    assert!(stats.received > 0);
    client
}

#[test]
fn test_clone_copies_everything_public() {
    let server = TestRepo::init();
    linear_history(&server.repo, 5);
    // One private artifact that must not travel.
    server.repo.begin_transaction().unwrap();
    let (private_rid, private_id) = server.repo.content_put(b"private notes").unwrap();
    server.repo.mark_private(private_rid).unwrap();
    server.repo.end_transaction(true).unwrap();

    let client = clone_of(&server);

    assert_eq!(
        client.repo.project_code().unwrap(),
        server.repo.project_code().unwrap()
    );
    let server_set = public_uuids(&server.repo);
    let client_set = public_uuids(&client.repo);
    assert_eq!(server_set, client_set);
    assert!(client.repo.rid_for_uuid(&private_id).unwrap().is_none());

    // The clone's derived tables match what a rebuild derives from the
    // same content.
    let before: i64 = client
        .repo
        .db()
        .query_row("SELECT count(*) FROM plink", [], |r| r.get(0))
        .unwrap();
    chert_lib::rebuild::rebuild(&client.repo).unwrap();
    let after: i64 = client
        .repo
        .db()
        .query_row("SELECT count(*) FROM plink", [], |r| r.get(0))
        .unwrap();
    assert_eq!(before, after);
    assert!(before >= 4);
}

#[test]
fn test_pull_catches_up_incrementally() {
    let server = TestRepo::init();
    let commits = linear_history(&server.repo, 3);
    let client = clone_of(&server);

    // New work appears on the server.
    let tip = commits.last().unwrap().1.as_str();
    write_commit(
        &server.repo,
        &CommitSpec {
            parents: vec![tip],
            files: vec![("file.txt", "newer\n")],
            comment: "after clone",
            seq: 9,
            ..CommitSpec::default()
        },
    );

    let mut transport = LocalTransport::new(&server.repo);
    let stats = sync::sync(
        &client.repo,
        &mut transport,
        &SyncOptions {
            pull: true,
            ..SyncOptions::default()
        },
    )
    .unwrap();
    assert!(stats.received >= 2, "received {}", stats.received);
    assert_eq!(public_uuids(&server.repo), public_uuids(&client.repo));
    // Nothing is left known-only-by-hash.
    assert!(client.repo.phantom_rids(true).unwrap().is_empty());
}

#[test]
fn test_push_requires_login() {
    let server = TestRepo::init();
    linear_history(&server.repo, 2);
    let client = clone_of(&server);
    write_commit(
        &client.repo,
        &CommitSpec {
            files: vec![("local.txt", "local work\n")],
            comment: "local",
            seq: 9,
            ..CommitSpec::default()
        },
    );

    // Anonymous push is rejected.
    let mut transport = LocalTransport::new(&server.repo);
    let err = sync::sync(
        &client.repo,
        &mut transport,
        &SyncOptions {
            push: true,
            ..SyncOptions::default()
        },
    );
    assert!(err.is_err());

    // With credentials the push goes through.
    server.repo.user_create("dev", "hunter2", "goi").unwrap();
    let mut transport = LocalTransport::new(&server.repo);
    let stats = sync::sync(
        &client.repo,
        &mut transport,
        &SyncOptions {
            push: true,
            credentials: Some(("dev".to_owned(), "hunter2".to_owned())),
            ..SyncOptions::default()
        },
    )
    .unwrap();
    assert!(stats.sent >= 2, "sent {}", stats.sent);
    assert_eq!(public_uuids(&server.repo), public_uuids(&client.repo));

    // The client's unsent queue drained.
    let unsent: i64 = client
        .repo
        .db()
        .query_row("SELECT count(*) FROM unsent", [], |r| r.get(0))
        .unwrap();
    assert_eq!(unsent, 0);
}

#[test]
fn test_push_with_bad_password_fails() {
    let server = TestRepo::init();
    linear_history(&server.repo, 1);
    server.repo.user_create("dev", "hunter2", "goi").unwrap();
    let client = clone_of(&server);
    write_commit(
        &client.repo,
        &CommitSpec {
            files: vec![("w", "x\n")],
            comment: "w",
            seq: 9,
            ..CommitSpec::default()
        },
    );
    let mut transport = LocalTransport::new(&server.repo);
    let err = sync::sync(
        &client.repo,
        &mut transport,
        &SyncOptions {
            push: true,
            credentials: Some(("dev".to_owned(), "wrong".to_owned())),
            ..SyncOptions::default()
        },
    );
    assert!(err.is_err());
}

#[test]
fn test_sync_is_idempotent() {
    let server = TestRepo::init();
    linear_history(&server.repo, 3);
    let client = clone_of(&server);

    let mut transport = LocalTransport::new(&server.repo);
    let stats = sync::sync(
        &client.repo,
        &mut transport,
        &SyncOptions {
            pull: true,
            ..SyncOptions::default()
        },
    )
    .unwrap();
    assert_eq!(stats.received, 0);
}

#[test]
fn test_cluster_round_trip() {
    let server = TestRepo::init();
    linear_history(&server.repo, 4);
    // Pack the server's history into a cluster before the first pull.
    server.repo.begin_transaction().unwrap();
    let clusters = server.repo.cluster_make().unwrap();
    server.repo.end_transaction(true).unwrap();
    assert_eq!(clusters.len(), 1);

    // A fresh pull (not clone) discovers content through the cluster.
    let client = TestRepo::init();
    client
        .repo
        .config_set("project-code", &server.repo.project_code().unwrap())
        .unwrap();
    let mut transport = LocalTransport::new(&server.repo);
    sync::sync(
        &client.repo,
        &mut transport,
        &SyncOptions {
            pull: true,
            ..SyncOptions::default()
        },
    )
    .unwrap();
    assert_eq!(public_uuids(&server.repo), public_uuids(&client.repo));
    assert!(client.repo.phantom_rids(true).unwrap().is_empty());
}

#[test]
fn test_private_artifacts_move_only_with_permission() {
    let server = TestRepo::init();
    linear_history(&server.repo, 2);
    server.repo.begin_transaction().unwrap();
    let (private_rid, private_id) = server.repo.content_put(b"secret work").unwrap();
    server.repo.mark_private(private_rid).unwrap();
    server.repo.end_transaction(true).unwrap();
    server.repo.user_create("admin", "pw", "s").unwrap();

    // Default pull: private stays home.
    let client = clone_of(&server);
    assert!(client.repo.rid_for_uuid(&private_id).unwrap().is_none());

    // Private pull with the x capability brings it over, still private.
    let mut transport = LocalTransport::new(&server.repo);
    sync::sync(
        &client.repo,
        &mut transport,
        &SyncOptions {
            pull: true,
            send_private: true,
            credentials: Some(("admin".to_owned(), "pw".to_owned())),
            ..SyncOptions::default()
        },
    )
    .unwrap();
    let rid = client.repo.rid_for_uuid(&private_id).unwrap().unwrap();
    assert!(client.repo.content_is_private(rid).unwrap());
    assert_eq!(&**client.repo.content_get(rid).unwrap(), b"secret work");
}

/// A transport that cuts the connection partway through the response.
struct FlakyTransport<'a> {
    inner: LocalTransport<'a>,
}

impl chert_lib::transport::XferTransport for FlakyTransport<'_> {
    fn round_trip(
        &mut self,
        payload: &[u8],
    ) -> Result<Vec<u8>, chert_lib::xfer::SyncError> {
        let mut response = self.inner.round_trip(payload)?;
        // Cut the stream mid-card, as a dropped connection would.
        response.truncate(40);
        Ok(response)
    }
}

#[test]
fn test_interrupted_sync_changes_nothing() {
    let server = TestRepo::init();
    linear_history(&server.repo, 3);
    let client = TestRepo::init();
    client
        .repo
        .config_set("project-code", &server.repo.project_code().unwrap())
        .unwrap();

    let count_blobs = |repo: &Repository| -> i64 {
        repo.db()
            .query_row("SELECT count(*) FROM blob", [], |r| r.get(0))
            .unwrap()
    };
    let before = count_blobs(&client.repo);
    let mut transport = FlakyTransport {
        inner: LocalTransport::new(&server.repo),
    };
    let err = sync::sync(
        &client.repo,
        &mut transport,
        &SyncOptions {
            pull: true,
            ..SyncOptions::default()
        },
    );
    assert!(err.is_err());
    // The failed session left the repository exactly as it was.
    assert_eq!(count_blobs(&client.repo), before);
    assert!(!client.repo.in_transaction());
}

#[test]
fn test_uvfile_exchange() {
    let server = TestRepo::init();
    linear_history(&server.repo, 1);
    server.repo.uv_put("download.css", b"body{}", 1000, 0).unwrap();
    server.repo.user_create("dev", "pw", "gou").unwrap();

    let client = clone_of(&server);
    let mut transport = LocalTransport::new(&server.repo);
    sync::sync(
        &client.repo,
        &mut transport,
        &SyncOptions {
            pull: true,
            uv: true,
            credentials: Some(("dev".to_owned(), "pw".to_owned())),
            ..SyncOptions::default()
        },
    )
    .unwrap();
    let (meta, content) = client.repo.uv_get("download.css").unwrap().unwrap();
    assert_eq!(content, b"body{}");
    assert_eq!(meta.mtime, 1000);
}
