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

//! Shared plumbing for the command implementations.

use std::path::PathBuf;

use chert_lib::repo::RepoError;
use chert_lib::repo::Repository;
use chert_lib::sync::SyncOptions;
use chert_lib::transport::HttpTransport;
use chert_lib::transport::LocalTransport;
use thiserror::Error;

/// A command failed. The variant decides the exit code: usage errors exit
/// with 1, everything else with 2.
#[derive(Debug, Error)]
pub enum CommandError {
    /// The command line did not make sense.
    #[error("{0}")]
    Usage(String),
    /// The repository layer reported a failure.
    #[error(transparent)]
    Repo(#[from] RepoError),
}

impl CommandError {
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::Usage(_) => 1,
            Self::Repo(_) => 2,
        }
    }
}

pub fn usage(message: impl Into<String>) -> CommandError {
    CommandError::Usage(message.into())
}

/// Resolves the repository file: `-R` wins, then `CHERT_REPOSITORY`.
pub fn open_repository(flag: Option<&PathBuf>) -> Result<Repository, CommandError> {
    let path = match flag {
        Some(path) => path.clone(),
        None => std::env::var_os("CHERT_REPOSITORY")
            .map(PathBuf::from)
            .ok_or_else(|| usage("no repository: use -R or set CHERT_REPOSITORY"))?,
    };
    Ok(Repository::open(&path)?)
}

/// Builds a transport for `url`: `http(s)://` goes over the wire, a bare
/// filesystem path syncs against a local repository file. The returned
/// repository handle, when present, must outlive the transport.
pub enum PeerTransport {
    Http(HttpTransport),
    Local(Box<Repository>),
}

impl PeerTransport {
    pub fn for_url(url: &str) -> Result<Self, CommandError> {
        if url.starts_with("http://") || url.starts_with("https://") {
            Ok(Self::Http(HttpTransport::new(url)))
        } else {
            let peer = Repository::open(url)?;
            Ok(Self::Local(Box::new(peer)))
        }
    }

    pub fn run_sync(
        &mut self,
        repo: &Repository,
        opts: &SyncOptions,
    ) -> Result<chert_lib::sync::SyncStats, CommandError> {
        let stats = match self {
            Self::Http(t) => chert_lib::sync::sync(repo, t, opts)?,
            Self::Local(peer) => {
                let mut t = LocalTransport::new(peer);
                chert_lib::sync::sync(repo, &mut t, opts)?
            }
        };
        Ok(stats)
    }
}

/// The URL to sync with: the given one (remembered for next time) or the
/// last one used.
pub fn resolve_sync_url(
    repo: &Repository,
    given: Option<&str>,
) -> Result<String, CommandError> {
    match given {
        Some(url) => {
            repo.config_set("last-sync-url", url)?;
            Ok(url.to_owned())
        }
        None => repo
            .config_get("last-sync-url")?
            .ok_or_else(|| usage("no saved sync URL; pass one explicitly")),
    }
}

/// Credentials from `--user` and the `CHERT_PASSWORD` environment
/// variable.
pub fn credentials(user: Option<&str>) -> Option<(String, String)> {
    let user = user?.to_owned();
    let password = std::env::var("CHERT_PASSWORD").unwrap_or_default();
    Some((user, password))
}
