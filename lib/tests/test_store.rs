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

use assert_matches::assert_matches;
use chert_lib::delta;
use chert_lib::hash_policy::HashPolicy;
use chert_lib::object_id::ArtifactId;
use chert_lib::object_id::HashAlgo;
use chert_lib::repo::RepoError;
use chert_lib::store::StoreError;
use chert_lib::verify;
use testutils::TestRepo;

#[test]
fn test_ingest_and_recompute() {
    let test_repo = TestRepo::init();
    let repo = &test_repo.repo;
    repo.set_hash_policy(HashPolicy::Sha1).unwrap();
    repo.begin_transaction().unwrap();
    let (rid, id) = repo.content_put(b"hello\n").unwrap();
    repo.end_transaction(true).unwrap();
    assert_eq!(id.as_str(), "f572d396fae9206628714fb2ce00f72e94f2258f");
    assert_eq!(&**repo.content_get(rid).unwrap(), b"hello\n");
    assert_eq!(repo.content_size(rid).unwrap(), 6);
}

#[test]
fn test_delta_round_trip_through_store() {
    let test_repo = TestRepo::init();
    let repo = &test_repo.repo;
    let a = vec![0u8; 10_000];
    let mut b = a.clone();
    b[5000..5010].copy_from_slice(b"ABCDEFGHIJ");

    let d = delta::create(&a, &b);
    assert_eq!(delta::apply(&a, &d).unwrap(), b);
    assert!(d.len() < 100, "delta is {} bytes", d.len());

    repo.begin_transaction().unwrap();
    let (rid_a, _) = repo.content_put(&a).unwrap();
    let (rid_b, _) = repo.content_put(&b).unwrap();
    assert!(repo.content_deltify(rid_b, rid_a, false).unwrap());
    repo.end_transaction(true).unwrap();

    // Every delta row reconstructs to content matching its hash.
    verify::verify_all(repo).unwrap();
    repo.clear_content_cache();
    assert_eq!(&**repo.content_get(rid_b).unwrap(), &b);
}

#[test]
fn test_every_blob_hashes_to_its_name() {
    let test_repo = TestRepo::init();
    let repo = &test_repo.repo;
    repo.begin_transaction().unwrap();
    for i in 0..20u32 {
        repo.content_put(format!("blob number {i}").repeat(i as usize + 1).as_bytes())
            .unwrap();
    }
    repo.end_transaction(true).unwrap();

    let rows: Vec<(i64, String)> = {
        let mut stmt = repo.db().prepare("SELECT rid, uuid FROM blob").unwrap();
        let rows = stmt
            .query_map([], |r| Ok((r.get(0)?, r.get(1)?)))
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        rows
    };
    for (rid, uuid) in rows {
        let content = repo.content_get(rid).unwrap();
        let id = ArtifactId::parse(&uuid).unwrap();
        assert!(id.matches_content(&content), "rid {rid} does not verify");
    }
}

#[test]
fn test_shun_preserves_remaining_integrity() {
    let test_repo = TestRepo::init();
    let repo = &test_repo.repo;
    repo.begin_transaction().unwrap();
    let (_, spam_id) = repo.content_put(b"spam artifact").unwrap();
    let keep: Vec<_> = (0..5u32)
        .map(|i| repo.content_put(format!("kept {i}").as_bytes()).unwrap())
        .collect();
    repo.end_transaction(true).unwrap();

    repo.shun(&spam_id, None).unwrap();

    // No row of any kind refers to the shunned hash.
    let n: i64 = repo
        .db()
        .query_row(
            "SELECT count(*) FROM blob WHERE uuid=?1",
            [spam_id.as_str()],
            |r| r.get(0),
        )
        .unwrap();
    assert_eq!(n, 0);
    verify::verify_all(repo).unwrap();
    for (rid, _) in keep {
        assert!(repo.content_get(rid).is_ok());
    }
}

#[test]
fn test_phantom_has_no_content_and_no_delta() {
    let test_repo = TestRepo::init();
    let repo = &test_repo.repo;
    let id = ArtifactId::hash_content(HashAlgo::Sha3_256, b"not here yet");
    repo.begin_transaction().unwrap();
    let rid = repo.content_reference(&id).unwrap();
    repo.end_transaction(true).unwrap();

    assert_eq!(repo.content_size(rid).unwrap(), -1);
    assert_matches!(
        repo.content_get(rid),
        Err(RepoError::Store(StoreError::Phantom(_)))
    );
    let deltas: i64 = repo
        .db()
        .query_row("SELECT count(*) FROM delta WHERE rid=?1", [rid], |r| r.get(0))
        .unwrap();
    assert_eq!(deltas, 0);
}
