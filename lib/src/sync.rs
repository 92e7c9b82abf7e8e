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

//! The client-side sync state machine.
//!
//! Each round assembles a request (login, pragmas, `gimme` for every
//! phantom, `igot`/`file` when pushing), sends it through the transport,
//! and folds the response into the repository inside a transaction. The
//! session ends when no phantom remains reachable, both send queues are
//! drained, and a round makes no progress; a failed round rolls back and
//! leaves the repository exactly as it was before that round.

use rusqlite::params;
use tracing::debug;
use tracing::info;
use tracing::instrument;

use crate::login;
use crate::object_id::ArtifactId;
use crate::repo::RepoError;
use crate::repo::Repository;
use crate::transport::XferTransport;
use crate::xfer;
use crate::xfer::CardWriter;
use crate::xfer::SyncError;

/// What a sync session should do.
#[derive(Debug, Clone, Default)]
pub struct SyncOptions {
    /// Receive artifacts the peer has and we lack.
    pub pull: bool,
    /// Send artifacts we have and the peer lacks.
    pub push: bool,
    /// Initial full copy: adopt the peer's project identity and receive
    /// everything.
    pub clone: bool,
    /// Ask to exchange private artifacts (needs the `x` capability).
    pub send_private: bool,
    /// Ask to exchange unversioned files.
    pub uv: bool,
    /// Login and password for the peer.
    pub credentials: Option<(String, String)>,
}

/// What a finished session did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncStats {
    /// Round-trips performed.
    pub rounds: usize,
    /// Artifacts sent to the peer.
    pub sent: usize,
    /// Artifacts received from the peer.
    pub received: usize,
}

/// Round-trip limit; a safety net against a peer that never converges.
const MAX_ROUNDS: usize = 64;

/// How many gimme cards one request carries at most.
const MAX_GIMME: usize = 500;

/// Runs a sync session over `transport`.
#[instrument(skip_all)]
pub fn sync(
    repo: &Repository,
    transport: &mut dyn XferTransport,
    opts: &SyncOptions,
) -> Result<SyncStats, RepoError> {
    let mut stats = SyncStats::default();
    let mut server_wants: Vec<String> = Vec::new();
    let mut clone_seqno: i64 = 0;
    let mut prev_payload: Option<Vec<u8>> = None;
    let mut prev_progress = 1usize;

    for round in 0..MAX_ROUNDS {
        let mut body = CardWriter::new();
        if opts.send_private {
            body.card("pragma send-private");
        }
        if opts.uv {
            body.card("pragma uv");
        }
        if opts.clone {
            body.card(&format!("clone 3 {clone_seqno}"));
        } else {
            let pcode = repo.project_code()?;
            if opts.pull {
                body.card(&format!("pull {pcode}"));
            }
            if opts.push {
                body.card(&format!("push {pcode}"));
            }
        }
        for rid in repo
            .phantom_rids(!opts.send_private)?
            .into_iter()
            .take(MAX_GIMME)
        {
            let uuid = repo.uuid_for_rid(rid)?;
            body.card(&format!("gimme {uuid}"));
        }
        let mut sent_this_round = 0usize;
        if opts.push {
            announce_unsent(repo, opts, &mut body)?;
            for uuid in std::mem::take(&mut server_wants) {
                if send_to_peer(repo, &uuid, &mut body)? {
                    sent_this_round += 1;
                }
            }
        }
        let payload = wrap_login(opts, body.into_bytes())?;
        if prev_payload.as_deref() == Some(payload.as_slice()) && prev_progress == 0 {
            // Identical request after an idle round: the peer has nothing
            // new for us and we have nothing new for it.
            break;
        }
        prev_payload = Some(payload.clone());

        let response = transport.round_trip(&payload)?;
        stats.rounds = round + 1;
        stats.sent += sent_this_round;

        repo.begin_transaction()?;
        let outcome = process_response(repo, opts, &response, &mut server_wants, &mut clone_seqno);
        match outcome {
            Ok(progress) => {
                repo.end_transaction(true)?;
                stats.received += progress.files_received;
                debug!(
                    round,
                    received = progress.files_received,
                    sent = sent_this_round,
                    "sync round complete"
                );
                if opts.clone && progress.files_received == 0 {
                    break;
                }
                let total = progress.total() + sent_this_round;
                if total == 0 && prev_progress == 0 {
                    break;
                }
                prev_progress = total;
            }
            Err(err) => {
                let _ = repo.end_transaction(false);
                return Err(err);
            }
        }
    }
    info!(
        rounds = stats.rounds,
        sent = stats.sent,
        received = stats.received,
        "sync finished"
    );
    Ok(stats)
}

fn wrap_login(opts: &SyncOptions, body: Vec<u8>) -> Result<Vec<u8>, RepoError> {
    let Some((user, password)) = &opts.credentials else {
        return Ok(body);
    };
    let nonce = login::payload_nonce(&body);
    let secret = login::secret_for_password(password);
    let signature = login::login_signature(&nonce, &secret);
    let mut payload = format!("login {user} {nonce} {signature}\n").into_bytes();
    payload.extend_from_slice(&body);
    Ok(payload)
}

fn announce_unsent(
    repo: &Repository,
    opts: &SyncOptions,
    body: &mut CardWriter,
) -> Result<(), RepoError> {
    let unsent: Vec<String> = {
        let mut stmt = repo.db().prepare_cached(
            "SELECT blob.uuid FROM unsent JOIN blob USING(rid)
              WHERE blob.size>=0 ORDER BY blob.uuid",
        )?;
        stmt.query_map([], |row| row.get(0))?
            .collect::<Result<_, _>>()?
    };
    for uuid in unsent {
        body.card(&format!("igot {uuid}"));
    }
    if opts.send_private {
        let private: Vec<String> = {
            let mut stmt = repo.db().prepare_cached(
                "SELECT blob.uuid FROM private JOIN blob USING(rid)
                  WHERE blob.size>=0 ORDER BY blob.uuid",
            )?;
            stmt.query_map([], |row| row.get(0))?
                .collect::<Result<_, _>>()?
        };
        for uuid in private {
            body.card(&format!("igot {uuid} 1"));
        }
    }
    Ok(())
}

fn send_to_peer(repo: &Repository, uuid: &str, body: &mut CardWriter) -> Result<bool, RepoError> {
    let Some(id) = ArtifactId::parse(uuid) else {
        return Ok(false);
    };
    let Some(rid) = repo.rid_for_uuid(&id)? else {
        return Ok(false);
    };
    if repo.content_is_phantom(rid)? {
        return Ok(false);
    }
    let content = repo.content_get(rid)?;
    body.file(uuid, &content);
    repo.db()
        .prepare_cached("DELETE FROM unsent WHERE rid=?1")?
        .execute(params![rid])?;
    Ok(true)
}

#[derive(Debug, Default)]
struct RoundProgress {
    files_received: usize,
    new_phantoms: usize,
    new_wants: usize,
}

impl RoundProgress {
    fn total(&self) -> usize {
        self.files_received + self.new_phantoms + self.new_wants
    }
}

fn process_response(
    repo: &Repository,
    opts: &SyncOptions,
    response: &[u8],
    server_wants: &mut Vec<String>,
    clone_seqno: &mut i64,
) -> Result<RoundProgress, RepoError> {
    let mut reader = xfer::CardReader::new(response);
    let mut progress = RoundProgress::default();
    let mut rcvid = 0i64;
    while let Some(tokens) = reader.next_card().map_err(RepoError::Sync)? {
        match tokens[0] {
            "file" => {
                let (uuid, src, size) = parse_file(&tokens)?;
                let raw = reader.take_content(size).map_err(RepoError::Sync)?;
                if rcvid == 0 {
                    rcvid = new_rcvid(repo)?;
                }
                if xfer::receive_file(repo, uuid, src, raw, rcvid, opts.clone, false)?.is_some() {
                    progress.files_received += 1;
                }
            }
            "igot" => {
                let Some(uuid) = tokens.get(1) else {
                    return Err(SyncError::Protocol("igot without uuid".into()).into());
                };
                let is_private = tokens.get(2).copied() == Some("1");
                if is_private && !opts.send_private {
                    continue;
                }
                let Some(id) = ArtifactId::parse(uuid) else {
                    continue;
                };
                match repo.rid_for_uuid(&id)? {
                    Some(rid) if !repo.content_is_phantom(rid)? => {
                        // The peer acknowledged holding it; nothing left
                        // to send.
                        repo.db()
                            .prepare_cached("DELETE FROM unsent WHERE rid=?1")?
                            .execute(params![rid])?;
                    }
                    Some(_) => {}
                    None => {
                        if opts.pull || opts.clone {
                            let rid = repo.content_reference(&id)?;
                            if is_private {
                                repo.mark_private(rid)?;
                            }
                            progress.new_phantoms += 1;
                        }
                    }
                }
            }
            "gimme" => {
                let Some(uuid) = tokens.get(1) else {
                    return Err(SyncError::Protocol("gimme without uuid".into()).into());
                };
                server_wants.push((*uuid).to_owned());
                progress.new_wants += 1;
            }
            "cluster" => {
                let Some(uuid) = tokens.get(1) else {
                    return Err(SyncError::Protocol("cluster without uuid".into()).into());
                };
                if let Some(id) = ArtifactId::parse(uuid) {
                    if repo.rid_for_uuid(&id)?.is_none() {
                        repo.content_reference(&id)?;
                        progress.new_phantoms += 1;
                    }
                }
            }
            "pragma" => {
                if opts.clone {
                    match (tokens.get(1).copied(), tokens.get(2)) {
                        (Some("project-code"), Some(code)) => {
                            repo.config_set("project-code", code)?;
                        }
                        (Some("server-code"), Some(code)) => {
                            repo.config_set("peer-server-code", code)?;
                        }
                        _ => {}
                    }
                }
            }
            "uvfile" => {
                let (name, mtime, size, _hash, flags) =
                    xfer::parse_uvfile(&tokens).map_err(RepoError::Sync)?;
                let raw = reader.take_content(size).map_err(RepoError::Sync)?;
                if flags & 1 != 0 && opts.uv {
                    if rcvid == 0 {
                        rcvid = new_rcvid(repo)?;
                    }
                    repo.uv_put(name, raw, mtime, rcvid)?;
                }
            }
            "cookie" => {
                if let Some(v) = tokens.get(1).and_then(|t| t.parse::<i64>().ok()) {
                    *clone_seqno = v;
                }
            }
            "message" => {
                info!(message = %tokens[1..].join(" "), "server");
            }
            "error" => {
                return Err(SyncError::Remote(tokens[1..].join(" ")).into());
            }
            other => {
                return Err(SyncError::Protocol(format!("unknown card {other:?}")).into());
            }
        }
    }
    Ok(progress)
}

fn parse_file<'a>(tokens: &[&'a str]) -> Result<(&'a str, Option<&'a str>, usize), RepoError> {
    match tokens.len() {
        3 => {
            let size = tokens[2]
                .parse()
                .map_err(|_| SyncError::Protocol("bad file size".into()))?;
            Ok((tokens[1], None, size))
        }
        4 => {
            let size = tokens[3]
                .parse()
                .map_err(|_| SyncError::Protocol("bad file size".into()))?;
            Ok((tokens[1], Some(tokens[2]), size))
        }
        _ => Err(SyncError::Protocol("malformed file card".into()).into()),
    }
}

fn new_rcvid(repo: &Repository) -> Result<i64, RepoError> {
    let mut stmt = repo.db().prepare_cached(
        "INSERT INTO rcvfrom(uid, mtime, nonce, ipaddr) VALUES(NULL, ?1, NULL, 'sync')",
    )?;
    stmt.execute(params![crate::repo::now_julian()])?;
    Ok(repo.db().last_insert_rowid())
}
