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

use chert_lib::sync::SyncOptions;
use chert_lib::sync::SyncStats;

use crate::cli_util::CommandError;
use crate::cli_util::PeerTransport;
use crate::cli_util::credentials;
use crate::cli_util::open_repository;
use crate::cli_util::resolve_sync_url;

#[derive(Debug, clap::Args, Default)]
pub(crate) struct SyncFlags {
    /// Peer URL; defaults to the last one used
    url: Option<String>,
    /// Login to authenticate as (password from $CHERT_PASSWORD)
    #[arg(short = 'U', long)]
    user: Option<String>,
    /// Exchange private artifacts too (needs the x capability)
    #[arg(long)]
    private: bool,
    /// Exchange unversioned files too
    #[arg(long)]
    uv: bool,
}

/// Receive artifacts the peer has and this repository lacks
#[derive(Debug, clap::Args)]
pub(crate) struct PullArgs {
    #[command(flatten)]
    flags: SyncFlags,
}

/// Send artifacts this repository has and the peer lacks
#[derive(Debug, clap::Args)]
pub(crate) struct PushArgs {
    #[command(flatten)]
    flags: SyncFlags,
}

/// Pull and push in one session
#[derive(Debug, clap::Args)]
pub(crate) struct SyncArgs {
    #[command(flatten)]
    flags: SyncFlags,
}

fn run_session(
    repo_flag: Option<&PathBuf>,
    flags: &SyncFlags,
    pull: bool,
    push: bool,
) -> Result<SyncStats, CommandError> {
    let repo = open_repository(repo_flag)?;
    let url = resolve_sync_url(&repo, flags.url.as_deref())?;
    let opts = SyncOptions {
        pull,
        push,
        send_private: flags.private,
        uv: flags.uv,
        credentials: credentials(flags.user.as_deref()),
        ..SyncOptions::default()
    };
    let mut transport = PeerTransport::for_url(&url)?;
    let stats = transport.run_sync(&repo, &opts)?;
    println!(
        "sync complete: sent {}, received {}, {} round-trips",
        stats.sent, stats.received, stats.rounds
    );
    Ok(stats)
}

pub(crate) fn run_pull(repo_flag: Option<&PathBuf>, args: &PullArgs) -> Result<(), CommandError> {
    run_session(repo_flag, &args.flags, true, false).map(|_| ())
}

pub(crate) fn run_push(repo_flag: Option<&PathBuf>, args: &PushArgs) -> Result<(), CommandError> {
    run_session(repo_flag, &args.flags, false, true).map(|_| ())
}

pub(crate) fn run_sync(repo_flag: Option<&PathBuf>, args: &SyncArgs) -> Result<(), CommandError> {
    run_session(repo_flag, &args.flags, true, true).map(|_| ())
}
