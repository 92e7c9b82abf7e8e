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

use chert_lib::hash_policy::HashPolicy;

use crate::cli_util::CommandError;
use crate::cli_util::open_repository;
use crate::cli_util::usage;

/// Query or set which hash algorithm names new artifacts
#[derive(Debug, clap::Args)]
pub(crate) struct HashPolicyArgs {
    /// One of: sha1, auto, sha3, sha3-only, shun-sha1
    policy: Option<String>,
}

pub(crate) fn run(repo_flag: Option<&PathBuf>, args: &HashPolicyArgs) -> Result<(), CommandError> {
    let repo = open_repository(repo_flag)?;
    match &args.policy {
        None => println!("{}", repo.hash_policy()?.name()),
        Some(name) => {
            let policy = HashPolicy::from_name(name).ok_or_else(|| {
                usage(format!(
                    "unknown hash policy {name:?} - should be one of: \
                     sha1 auto sha3 sha3-only shun-sha1"
                ))
            })?;
            let effective = repo.set_hash_policy(policy)?;
            println!("{}", effective.name());
        }
    }
    Ok(())
}
