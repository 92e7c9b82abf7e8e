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
use crate::cli_util::usage;

/// Create a new, empty repository file
#[derive(Debug, clap::Args)]
pub(crate) struct InitArgs {
    /// Where to create the repository
    path: PathBuf,
    /// Login for the initial admin user
    #[arg(long, default_value = "admin")]
    admin_user: String,
}

pub(crate) fn run(args: &InitArgs) -> Result<(), CommandError> {
    if args.path.exists() {
        return Err(usage(format!("{} already exists", args.path.display())));
    }
    let repo = Repository::create(&args.path)?;
    let password = std::env::var("CHERT_PASSWORD").unwrap_or_default();
    repo.user_create(&args.admin_user, &password, "s")?;
    println!("repository: {}", args.path.display());
    println!("project-code: {}", repo.project_code()?);
    println!("admin-user: {}", args.admin_user);
    Ok(())
}
