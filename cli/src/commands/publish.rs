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

use crate::cli_util::CommandError;
use crate::cli_util::open_repository;
use crate::cli_util::usage;

/// Make private artifacts public
#[derive(Debug, clap::Args)]
pub(crate) struct PublishArgs {
    /// Publish only the named artifacts, without their associates
    #[arg(long)]
    only: bool,
    /// Check-ins, branches, or hashes to publish
    #[arg(required = true)]
    tags: Vec<String>,
}

/// List private artifacts
#[derive(Debug, clap::Args)]
pub(crate) struct UnpublishedArgs {
    /// Show all artifacts, not just check-ins
    #[arg(long)]
    all: bool,
}

pub(crate) fn run_publish(
    repo_flag: Option<&PathBuf>,
    args: &PublishArgs,
) -> Result<(), CommandError> {
    if args.tags.is_empty() {
        return Err(usage("publish needs at least one tag"));
    }
    let repo = open_repository(repo_flag)?;
    let names: Vec<&str> = args.tags.iter().map(String::as_str).collect();
    let published = repo.publish(&names, args.only)?;
    println!("{published} artifacts published");
    Ok(())
}

pub(crate) fn run_unpublished(
    repo_flag: Option<&PathBuf>,
    args: &UnpublishedArgs,
) -> Result<(), CommandError> {
    let repo = open_repository(repo_flag)?;
    for (_, uuid) in repo.unpublished(args.all)? {
        println!("{uuid}");
    }
    Ok(())
}
