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

mod bisect;
mod bundle;
mod clone;
mod hash_policy;
mod init;
mod publish;
mod rebuild;
mod shun;
mod sync;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use crate::cli_util::CommandError;

/// Chert: a distributed version-control core in a single database file.
#[derive(Debug, Parser)]
#[command(name = "chert", version, disable_help_subcommand = true)]
pub(crate) struct Cli {
    /// Repository file to operate on.
    #[arg(short = 'R', long = "repository", global = true, value_name = "REPOSITORY")]
    repository: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, clap::Subcommand)]
enum Command {
    Init(init::InitArgs),
    Clone(clone::CloneArgs),
    Pull(sync::PullArgs),
    Push(sync::PushArgs),
    Sync(sync::SyncArgs),
    Rebuild(rebuild::RebuildArgs),
    Scrub(rebuild::ScrubArgs),
    Bundle(bundle::BundleArgs),
    Bisect(bisect::BisectArgs),
    HashPolicy(hash_policy::HashPolicyArgs),
    Publish(publish::PublishArgs),
    Unpublished(publish::UnpublishedArgs),
    Shun(shun::ShunArgs),
}

pub fn dispatch() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            // Help and version output are not errors.
            let _ = err.print();
            return match err.kind() {
                clap::error::ErrorKind::DisplayHelp | clap::error::ErrorKind::DisplayVersion => {
                    ExitCode::SUCCESS
                }
                _ => ExitCode::from(1),
            };
        }
    };
    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("chert: {err}");
            ExitCode::from(err.exit_code())
        }
    }
}

fn run(cli: &Cli) -> Result<(), CommandError> {
    let repo_flag = cli.repository.as_ref();
    match &cli.command {
        Command::Init(args) => init::run(args),
        Command::Clone(args) => clone::run(args),
        Command::Pull(args) => sync::run_pull(repo_flag, args),
        Command::Push(args) => sync::run_push(repo_flag, args),
        Command::Sync(args) => sync::run_sync(repo_flag, args),
        Command::Rebuild(args) => rebuild::run_rebuild(repo_flag, args),
        Command::Scrub(args) => rebuild::run_scrub(repo_flag, args),
        Command::Bundle(args) => bundle::run(repo_flag, args),
        Command::Bisect(args) => bisect::run(repo_flag, args),
        Command::HashPolicy(args) => hash_policy::run(repo_flag, args),
        Command::Publish(args) => publish::run_publish(repo_flag, args),
        Command::Unpublished(args) => publish::run_unpublished(repo_flag, args),
        Command::Shun(args) => shun::run(repo_flag, args),
    }
}
