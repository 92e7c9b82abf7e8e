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

use chert_lib::bundle::BundleSpec;

use crate::cli_util::CommandError;
use crate::cli_util::open_repository;
use crate::cli_util::usage;

/// Move subsets of history through standalone bundle files
#[derive(Debug, clap::Args)]
pub(crate) struct BundleArgs {
    #[command(subcommand)]
    command: BundleCommand,
}

#[derive(Debug, clap::Subcommand)]
enum BundleCommand {
    /// Write a subtree of check-ins into a bundle
    Export {
        /// The bundle file to create
        bundle: PathBuf,
        /// All check-ins on this branch
        #[arg(long)]
        branch: Option<String>,
        /// This check-in and its primary descendants
        #[arg(long)]
        from: Option<String>,
        /// Stop the --from walk here (inclusive)
        #[arg(long, requires = "from")]
        to: Option<String>,
        /// Exactly one check-in
        #[arg(long, conflicts_with_all = ["branch", "from"])]
        checkin: Option<String>,
    },
    /// Ingest a bundle's artifacts (privately unless --publish)
    Import {
        bundle: PathBuf,
        /// Make the imported artifacts public immediately
        #[arg(long)]
        publish: bool,
    },
    /// List a bundle's contents
    Ls { bundle: PathBuf },
    /// Write one artifact's content to a file
    Extract {
        bundle: PathBuf,
        uuid: String,
        output: PathBuf,
    },
    /// Add raw files to a bundle
    Append {
        bundle: PathBuf,
        files: Vec<PathBuf>,
    },
}

pub(crate) fn run(repo_flag: Option<&PathBuf>, args: &BundleArgs) -> Result<(), CommandError> {
    let repo = open_repository(repo_flag)?;
    match &args.command {
        BundleCommand::Export {
            bundle,
            branch,
            from,
            to,
            checkin,
        } => {
            let spec = BundleSpec {
                branch: branch.as_deref(),
                from: from.as_deref(),
                to: to.as_deref(),
                checkin: checkin.as_deref(),
            };
            let written = repo.bundle_export(bundle, &spec)?;
            println!("{written} artifacts written to {}", bundle.display());
        }
        BundleCommand::Import { bundle, publish } => {
            let ingested = repo.bundle_import(bundle, *publish)?;
            println!("{ingested} artifacts imported");
        }
        BundleCommand::Ls { bundle } => {
            for entry in repo.bundle_ls(bundle)? {
                let kind = if entry.delta_base.is_some() {
                    "delta"
                } else {
                    "full"
                };
                println!("{} {:>9} {kind}", entry.uuid, entry.size);
            }
        }
        BundleCommand::Extract {
            bundle,
            uuid,
            output,
        } => {
            let content = repo.bundle_extract(bundle, uuid)?;
            std::fs::write(output, content).map_err(chert_lib::repo::RepoError::from)?;
        }
        BundleCommand::Append { bundle, files } => {
            if files.is_empty() {
                return Err(usage("bundle append needs at least one file"));
            }
            let mut contents = Vec::new();
            for path in files {
                let data = std::fs::read(path).map_err(chert_lib::repo::RepoError::from)?;
                contents.push((path.to_string_lossy().into_owned(), data));
            }
            let borrowed: Vec<(&str, &[u8])> = contents
                .iter()
                .map(|(name, data)| (name.as_str(), data.as_slice()))
                .collect();
            repo.bundle_append(bundle, &borrowed)?;
            println!("{} files appended", borrowed.len());
        }
    }
    Ok(())
}
