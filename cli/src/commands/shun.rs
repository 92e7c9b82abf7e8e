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

use std::path::PathBuf;

use chert_lib::object_id::ArtifactId;

use crate::cli_util::CommandError;
use crate::cli_util::open_repository;
use crate::cli_util::usage;

/// Permanently expunge artifacts and refuse to receive them again
#[derive(Debug, clap::Args)]
pub(crate) struct ShunArgs {
    /// Full hashes of the artifacts to shun
    #[arg(required = true)]
    uuids: Vec<String>,
    /// Reason recorded alongside the shun entries
    #[arg(long)]
    comment: Option<String>,
}

pub(crate) fn run(repo_flag: Option<&PathBuf>, args: &ShunArgs) -> Result<(), CommandError> {
    let repo = open_repository(repo_flag)?;
    for uuid in &args.uuids {
        let id = ArtifactId::parse(uuid)
            .ok_or_else(|| usage(format!("not a full artifact hash: {uuid}")))?;
        repo.shun(&id, args.comment.as_deref())?;
        println!("shunned {uuid}");
    }
    Ok(())
}
