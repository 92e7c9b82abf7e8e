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

use chert_lib::rebuild;

use crate::cli_util::CommandError;
use crate::cli_util::open_repository;

/// Reconstruct all derived tables from artifact content
#[derive(Debug, clap::Args)]
pub(crate) struct RebuildArgs {}

/// Remove private artifacts and secrets before handing the file off
#[derive(Debug, clap::Args)]
pub(crate) struct ScrubArgs {
    /// Skip the are-you-sure check
    #[arg(long)]
    force: bool,
}

pub(crate) fn run_rebuild(
    repo_flag: Option<&PathBuf>,
    _args: &RebuildArgs,
) -> Result<(), CommandError> {
    let repo = open_repository(repo_flag)?;
    let linked = rebuild::rebuild(&repo)?;
    println!("rebuild complete: {linked} artifacts crosslinked");
    Ok(())
}

pub(crate) fn run_scrub(repo_flag: Option<&PathBuf>, args: &ScrubArgs) -> Result<(), CommandError> {
    let repo = open_repository(repo_flag)?;
    if !args.force {
        return Err(crate::cli_util::usage(
            "scrub permanently deletes private data; re-run with --force",
        ));
    }
    let removed = rebuild::scrub(&repo)?;
    println!("scrub complete: {removed} private artifacts removed");
    Ok(())
}
