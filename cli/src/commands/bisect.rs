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

use chert_lib::repo::Repository;

use crate::cli_util::CommandError;
use crate::cli_util::open_repository;

/// Search history for the check-in that introduced a defect
#[derive(Debug, clap::Args)]
pub(crate) struct BisectArgs {
    #[command(subcommand)]
    command: BisectCommand,
}

#[derive(Debug, clap::Subcommand)]
enum BisectCommand {
    /// Mark a check-in as bad
    Bad { version: String },
    /// Mark a check-in as good
    Good { version: String },
    /// Show the next check-in to test
    Next,
    /// Forget all bisect state
    Reset,
    /// List the check-ins between the current endpoints
    Vlist,
}

fn print_next(repo: &Repository) -> Result<(), CommandError> {
    match repo.bisect_next()? {
        Some(rid) => println!("next: {}", repo.uuid_for_rid(rid)?),
        None => {
            let status = repo.bisect_status()?;
            match (status.good, status.bad) {
                (Some(_), Some(bad)) => {
                    println!("bisect complete: first bad is {}", repo.uuid_for_rid(bad)?);
                }
                _ => println!("mark one good and one bad check-in first"),
            }
        }
    }
    Ok(())
}

pub(crate) fn run(repo_flag: Option<&PathBuf>, args: &BisectArgs) -> Result<(), CommandError> {
    let repo = open_repository(repo_flag)?;
    match &args.command {
        BisectCommand::Bad { version } => {
            let rid = repo.name_to_rid(version)?;
            repo.bisect_mark(rid, false)?;
            print_next(&repo)?;
        }
        BisectCommand::Good { version } => {
            let rid = repo.name_to_rid(version)?;
            repo.bisect_mark(rid, true)?;
            print_next(&repo)?;
        }
        BisectCommand::Next => print_next(&repo)?,
        BisectCommand::Reset => repo.bisect_reset()?,
        BisectCommand::Vlist => {
            let log = repo.bisect_log()?;
            for (rid, uuid) in repo.bisect_vlist()? {
                let mark = log
                    .iter()
                    .rev()
                    .find(|e| e.rid == rid)
                    .map(|e| if e.good { " good" } else { " bad" })
                    .unwrap_or("");
                println!("{uuid}{mark}");
            }
        }
    }
    Ok(())
}
