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
use chert_lib::sync::SyncOptions;

use crate::cli_util::CommandError;
use crate::cli_util::PeerTransport;
use crate::cli_util::credentials;
use crate::cli_util::usage;

/// Make a complete copy of a remote repository
#[derive(Debug, clap::Args)]
pub(crate) struct CloneArgs {
    /// Source: an http(s) URL or a local repository file
    url: String,
    /// Where to create the copy
    path: PathBuf,
    /// Login to authenticate as (password from $CHERT_PASSWORD)
    #[arg(short = 'U', long)]
    user: Option<String>,
    /// Also copy private artifacts (needs the x capability)
    #[arg(long)]
    private: bool,
}

pub(crate) fn run(args: &CloneArgs) -> Result<(), CommandError> {
    if args.path.exists() {
        return Err(usage(format!("{} already exists", args.path.display())));
    }
    let repo = Repository::create(&args.path)?;
    repo.config_set("last-sync-url", &args.url)?;
    let opts = SyncOptions {
        clone: true,
        send_private: args.private,
        credentials: credentials(args.user.as_deref()),
        ..SyncOptions::default()
    };
    let mut transport = PeerTransport::for_url(&args.url)?;
    let stats = transport.run_sync(&repo, &opts)?;
    println!(
        "clone complete: {} artifacts in {} round-trips",
        stats.received, stats.rounds
    );
    Ok(())
}
