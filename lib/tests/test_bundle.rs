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

use chert_lib::bundle::BundleSpec;
use chert_lib::repo::Repository;
use pretty_assertions::assert_eq;
use test_case::test_case;
use testutils::TestRepo;
use testutils::linear_history;

fn uuids(repo: &Repository) -> BTreeSet<String> {
    let mut stmt = repo
        .db()
        .prepare("SELECT uuid FROM blob WHERE size>=0")
        .unwrap();
    let uuids = stmt
        .query_map([], |r| r.get(0))
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();
    uuids
}

#[test]
fn test_export_import_round_trip() {
    let source = TestRepo::init();
    let commits = linear_history(&source.repo, 4);
    let bundle_path = source.scratch_path("history.bundle");

    let spec = BundleSpec {
        from: Some(commits[0].1.as_str()),
        ..BundleSpec::default()
    };
    let written = source.repo.bundle_export(&bundle_path, &spec).unwrap();
    // Four manifests and four file versions.
    assert_eq!(written, 8);

    let entries = source.repo.bundle_ls(&bundle_path).unwrap();
    assert_eq!(entries.len(), 8);
    // Later manifests delta against their parents inside the bundle.
    assert!(entries.iter().any(|e| e.delta_base.is_some()));

    // Import into a fresh repository, privately by default.
    let dest = TestRepo::init();
    let ingested = dest.repo.bundle_import(&bundle_path, false).unwrap();
    assert_eq!(ingested, 8);
    assert_eq!(uuids(&source.repo), uuids(&dest.repo));
    let private: i64 = dest
        .repo
        .db()
        .query_row("SELECT count(*) FROM private", [], |r| r.get(0))
        .unwrap();
    assert_eq!(private, 8);

    // Publishing the imported check-ins (closure picks up their file
    // blobs) makes everything shareable.
    let names: Vec<&str> = commits.iter().map(|(_, id)| id.as_str()).collect();
    dest.repo.publish(&names, false).unwrap();
    let private: i64 = dest
        .repo
        .db()
        .query_row("SELECT count(*) FROM private", [], |r| r.get(0))
        .unwrap();
    assert_eq!(private, 0);
}

#[test]
fn test_extract_single_artifact() {
    let source = TestRepo::init();
    let commits = linear_history(&source.repo, 3);
    let bundle_path = source.scratch_path("extract.bundle");
    source
        .repo
        .bundle_export(
            &bundle_path,
            &BundleSpec {
                from: Some(commits[0].1.as_str()),
                ..BundleSpec::default()
            },
        )
        .unwrap();

    let manifest_uuid = commits[2].1.as_str();
    let extracted = source.repo.bundle_extract(&bundle_path, manifest_uuid).unwrap();
    let direct = source.repo.content_get(commits[2].0).unwrap();
    assert_eq!(extracted, *direct);
}

// Each selection mode pulls in the chosen manifests plus the file
// versions they reference.
#[test_case("from-start", 8 ; "start and all primary descendants")]
#[test_case("from-mid", 6 ; "descendants of the second checkin")]
#[test_case("single-checkin", 2 ; "one checkin and its file")]
fn test_export_selection(mode: &str, expected: usize) {
    let source = TestRepo::init();
    let commits = linear_history(&source.repo, 4);
    let bundle_path = source.scratch_path("selection.bundle");
    let spec = match mode {
        "from-start" => BundleSpec {
            from: Some(commits[0].1.as_str()),
            ..BundleSpec::default()
        },
        "from-mid" => BundleSpec {
            from: Some(commits[1].1.as_str()),
            ..BundleSpec::default()
        },
        _ => BundleSpec {
            checkin: Some(commits[1].1.as_str()),
            ..BundleSpec::default()
        },
    };
    let written = source.repo.bundle_export(&bundle_path, &spec).unwrap();
    assert_eq!(written, expected);
    assert_eq!(source.repo.bundle_ls(&bundle_path).unwrap().len(), expected);
}

#[test]
fn test_append_raw_files() {
    let source = TestRepo::init();
    let bundle_path = source.scratch_path("append.bundle");
    source
        .repo
        .bundle_append(&bundle_path, &[("notes.txt", b"some notes")])
        .unwrap();
    let entries = source.repo.bundle_ls(&bundle_path).unwrap();
    assert_eq!(entries.len(), 1);
    let content = source
        .repo
        .bundle_extract(&bundle_path, &entries[0].uuid)
        .unwrap();
    assert_eq!(content, b"some notes");
}
