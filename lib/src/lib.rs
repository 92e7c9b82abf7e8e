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

//! Chert is a distributed version-control core whose repository is a single
//! SQLite database holding an append-only set of immutable, hash-named
//! artifacts.
//!
//! The library covers the artifact engine only: the content-addressed blob
//! store with delta compression, the manifest grammar and the derived graph
//! tables built from it, the DAG algorithms used by merge and bisect, and
//! the card-stream sync protocol. There is no working-copy or UI layer here.

#![warn(missing_docs)]

pub mod bag;
pub mod bisect;
pub mod bundle;
pub mod cluster;
pub mod delta;
pub mod descendants;
pub mod etag;
pub mod hash_policy;
pub mod hex_util;
pub mod leaf;
pub mod login;
pub mod manifest;
pub mod moderate;
pub mod object_id;
pub mod path;
pub mod pivot;
pub mod publish;
pub mod rebuild;
pub mod repo;
pub mod schema;
pub mod shun;
pub mod store;
pub mod sync;
pub mod tag;
pub mod transport;
pub mod unversioned;
pub mod verify;
pub mod xfer;
pub mod xref;
