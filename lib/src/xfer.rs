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

//! The sync card stream.
//!
//! One round-trip of the protocol is a request card stream and a response
//! card stream. Cards are newline-terminated lines of space-separated
//! tokens; `file` and `uvfile` cards are followed immediately by that many
//! raw content bytes. This module implements the codec and the
//! server-side processor; the client loop lives in [`crate::sync`].

use std::collections::HashSet;

use bstr::ByteSlice as _;
use itertools::Itertools as _;
use rusqlite::OptionalExtension as _;
use thiserror::Error;
use tracing::debug;
use tracing::info_span;
use tracing::warn;

use crate::delta;
use crate::login;
use crate::login::UserPerms;
use crate::login::cap;
use crate::object_id::ArtifactId;
use crate::repo::RepoError;
use crate::repo::Repository;
use crate::repo::Rid;
use crate::repo::now_julian;
use crate::store::StoreError;
use crate::xref;
use crate::xref::ModerationPolicy;

/// Failures of a sync session.
#[derive(Debug, Error)]
pub enum SyncError {
    /// The peer rejected our login card.
    #[error("login rejected by peer")]
    AuthFailed,
    /// The card stream was malformed.
    #[error("protocol error: {0}")]
    Protocol(String),
    /// The transport failed (connection, HTTP, compression).
    #[error("transport failure: {0}")]
    Transport(String),
    /// The peer sent an `error` card; the session is over.
    #[error("remote error: {0}")]
    Remote(String),
}

/// Approximate per-round budget for file-card payload bytes. Keeping
/// rounds bounded lets a clone resume after an interruption.
const SEND_BUDGET: usize = 2 * 1024 * 1024;

/// Reads a card stream, giving lines as token vectors and inline content
/// on demand.
pub struct CardReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> CardReader<'a> {
    /// Wraps a raw (decompressed) payload.
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// The bytes not yet consumed. The login nonce covers exactly this
    /// region at the moment the login card has been read.
    pub fn remaining(&self) -> &'a [u8] {
        &self.data[self.pos..]
    }

    /// The next card as tokens, or `None` at end of stream.
    pub fn next_card(&mut self) -> Result<Option<Vec<&'a str>>, SyncError> {
        loop {
            if self.pos >= self.data.len() {
                return Ok(None);
            }
            let eol = self.data[self.pos..]
                .find_byte(b'\n')
                .map(|i| self.pos + i)
                .ok_or_else(|| SyncError::Protocol("unterminated card".into()))?;
            let line = &self.data[self.pos..eol];
            self.pos = eol + 1;
            if line.is_empty() {
                continue;
            }
            let text = std::str::from_utf8(line)
                .map_err(|_| SyncError::Protocol("card is not valid UTF-8".into()))?;
            let tokens: Vec<&str> = text.split(' ').filter(|t| !t.is_empty()).collect();
            if tokens.is_empty() {
                continue;
            }
            return Ok(Some(tokens));
        }
    }

    /// Takes `n` raw content bytes following a `file`/`uvfile` card.
    pub fn take_content(&mut self, n: usize) -> Result<&'a [u8], SyncError> {
        if self.pos + n > self.data.len() {
            return Err(SyncError::Protocol("truncated file content".into()));
        }
        let content = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(content)
    }
}

/// Accumulates a card stream.
#[derive(Debug, Default)]
pub struct CardWriter {
    buf: Vec<u8>,
}

impl CardWriter {
    /// An empty stream.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends one card line.
    pub fn card(&mut self, line: &str) {
        debug_assert!(!line.contains('\n'));
        self.buf.extend_from_slice(line.as_bytes());
        self.buf.push(b'\n');
    }

    /// Appends a full-content file card.
    pub fn file(&mut self, uuid: &str, content: &[u8]) {
        self.card(&format!("file {uuid} {}", content.len()));
        self.buf.extend_from_slice(content);
    }

    /// Appends a delta file card: content is a delta against `src_uuid`,
    /// which the receiver is known to hold.
    pub fn file_delta(&mut self, uuid: &str, src_uuid: &str, delta_bytes: &[u8]) {
        self.card(&format!("file {uuid} {src_uuid} {}", delta_bytes.len()));
        self.buf.extend_from_slice(delta_bytes);
    }

    /// Appends an unversioned-file card.
    pub fn uvfile(&mut self, name: &str, mtime: i64, hash: &str, content: &[u8]) {
        self.card(&format!("uvfile {name} {mtime} {} {hash} 1", content.len()));
        self.buf.extend_from_slice(content);
    }

    /// Bytes written so far.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// True if nothing was written.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// The finished stream.
    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

/// Ingests one received `file` card worth of content into `repo`:
/// reconstructs delta form, stores, and crosslinks. Returns the rid, or
/// `None` when the artifact was skipped (shunned, or refused by hash
/// policy).
pub fn receive_file(
    repo: &Repository,
    uuid: &str,
    src_uuid: Option<&str>,
    raw: &[u8],
    rcvid: i64,
    is_clone: bool,
    private: bool,
) -> Result<Option<Rid>, RepoError> {
    let id = ArtifactId::parse(uuid)
        .ok_or_else(|| SyncError::Protocol(format!("malformed uuid {uuid:?}")))?;
    if !repo.hash_policy()?.accepts_on_sync(id.algo(), is_clone) {
        warn!(uuid, "artifact refused by hash policy");
        return Ok(None);
    }
    if repo.is_shunned(&id)? {
        debug!(uuid, "shunned artifact ignored");
        return Ok(None);
    }
    let content = match src_uuid {
        None => raw.to_vec(),
        Some(src) => {
            let src_id = ArtifactId::parse(src)
                .ok_or_else(|| SyncError::Protocol(format!("malformed uuid {src:?}")))?;
            let src_rid = repo.rid_for_uuid(&src_id)?.ok_or_else(|| {
                SyncError::Protocol(format!("delta against unknown artifact {src}"))
            })?;
            let base = repo.content_get(src_rid)?;
            delta::apply(&base, raw).map_err(StoreError::CorruptDelta)?
        }
    };
    let rid = repo.content_put_ex(&content, &id, rcvid, private)?;
    xref::after_content_available(repo, rid, &id, &ModerationPolicy::TRUSTED)?;
    Ok(Some(rid))
}

/// What the server learned from one request and still owes the client.
struct ServerSession {
    uid: Option<i64>,
    perms: UserPerms,
    rcvid: i64,
    is_clone: bool,
    is_pull: bool,
    is_push: bool,
    send_private: bool,
    send_uv: bool,
    clone_seqno: i64,
    /// Artifacts the client says it holds; usable as delta bases.
    client_has: HashSet<String>,
    /// Artifacts the client asked for.
    wanted: Vec<String>,
    /// Names the client acknowledged holding that we lack.
    missing_here: Vec<String>,
    received: usize,
}

/// Processes one sync request against `repo`, acting as the server.
/// Returns the response card stream. Protocol and permission failures
/// produce an `error` card response with everything rolled back; only
/// repository-level failures surface as `Err`.
pub fn process_request(repo: &Repository, body: &[u8], ipaddr: &str) -> Result<Vec<u8>, RepoError> {
    let span = info_span!("xfer", ip = ipaddr);
    let _enter = span.enter();
    repo.begin_transaction()?;
    match process_inner(repo, body, ipaddr) {
        Ok(response) => {
            repo.end_transaction(true)?;
            Ok(response)
        }
        Err(err @ (RepoError::Sync(_) | RepoError::PermissionDenied(_))) => {
            repo.end_transaction(false)?;
            let mut out = CardWriter::new();
            out.card(&format!("error {}", quote_error(&err.to_string())));
            Ok(out.into_bytes())
        }
        Err(err) => {
            repo.end_transaction(false)?;
            Err(err)
        }
    }
}

fn quote_error(text: &str) -> String {
    text.replace('\n', " ")
}

fn anonymous_perms(repo: &Repository) -> Result<UserPerms, RepoError> {
    let caps = repo
        .config_get("anonymous-caps")?
        .unwrap_or_else(|| "go".to_owned());
    Ok(UserPerms::new(&caps))
}

fn process_inner(repo: &Repository, body: &[u8], ipaddr: &str) -> Result<Vec<u8>, RepoError> {
    let mut reader = CardReader::new(body);
    let mut s = ServerSession {
        uid: None,
        perms: anonymous_perms(repo)?,
        rcvid: 0,
        is_clone: false,
        is_pull: false,
        is_push: false,
        send_private: false,
        send_uv: false,
        clone_seqno: 0,
        client_has: HashSet::new(),
        wanted: Vec::new(),
        missing_here: Vec::new(),
        received: 0,
    };
    while let Some(tokens) = reader.next_card()? {
        match tokens[0] {
            "login" => {
                if tokens.len() != 4 {
                    return Err(SyncError::Protocol("malformed login card".into()).into());
                }
                let nonce = login::payload_nonce(reader.remaining());
                if nonce != tokens[2] {
                    return Err(SyncError::AuthFailed.into());
                }
                match repo.check_login(tokens[1], tokens[2], tokens[3])? {
                    Some((uid, perms)) => {
                        s.uid = Some(uid);
                        s.perms = perms;
                    }
                    None => return Err(SyncError::AuthFailed.into()),
                }
            }
            "pragma" => {
                match tokens.get(1).copied() {
                    Some("send-private") => {
                        s.send_private = s.perms.has(cap::PRIVATE);
                    }
                    Some("uv") => {
                        s.send_uv = s.perms.has(cap::UV_READ);
                    }
                    // Unknown pragmas are ignored for forward compatibility.
                    _ => {}
                }
            }
            "clone" => {
                if !s.perms.has(cap::CLONE) && !s.perms.has(cap::READ) {
                    return Err(SyncError::Protocol("clone not authorized".into()).into());
                }
                s.is_clone = true;
                s.is_pull = true;
                s.clone_seqno = tokens
                    .get(2)
                    .and_then(|t| t.parse().ok())
                    .unwrap_or(0);
            }
            "pull" => {
                s.perms.require(cap::READ)?;
                check_project_code(repo, &tokens)?;
                s.is_pull = true;
            }
            "push" => {
                s.perms.require(cap::WRITE)?;
                check_project_code(repo, &tokens)?;
                s.is_push = true;
            }
            "igot" => {
                let uuid = *tokens
                    .get(1)
                    .ok_or_else(|| SyncError::Protocol("igot without uuid".into()))?;
                let is_private = tokens.get(2).copied() == Some("1");
                if is_private && !s.send_private {
                    continue;
                }
                s.client_has.insert(uuid.to_owned());
                let Some(id) = ArtifactId::parse(uuid) else {
                    return Err(SyncError::Protocol(format!("malformed uuid {uuid:?}")).into());
                };
                if repo.is_shunned(&id)? {
                    continue;
                }
                // Note what the client holds that we lack; the response
                // asks for it when the client is pushing.
                match repo.rid_for_uuid(&id)? {
                    Some(rid) if !repo.content_is_phantom(rid)? => {}
                    _ => {
                        if s.is_push {
                            repo.content_reference(&id)?;
                            if is_private {
                                if let Some(rid) = repo.rid_for_uuid(&id)? {
                                    repo.mark_private(rid)?;
                                }
                            }
                        }
                        s.missing_here.push(uuid.to_owned());
                    }
                }
            }
            "gimme" => {
                s.perms.require(cap::READ)?;
                let uuid = *tokens
                    .get(1)
                    .ok_or_else(|| SyncError::Protocol("gimme without uuid".into()))?;
                s.wanted.push(uuid.to_owned());
            }
            "file" => {
                s.perms.require(cap::WRITE)?;
                let (uuid, src, size) = parse_file_card(&tokens)?;
                let raw = reader.take_content(size)?;
                if s.rcvid == 0 {
                    s.rcvid = new_rcvid(repo, s.uid, ipaddr)?;
                }
                if receive_file(repo, uuid, src, raw, s.rcvid, false, false)?.is_some() {
                    s.received += 1;
                }
            }
            "uvfile" => {
                let (name, mtime, size, hash, flags) = parse_uvfile(&tokens)?;
                let raw = reader.take_content(size)?;
                if flags & 1 != 0 {
                    s.perms.require(cap::UV_WRITE)?;
                    let declared = ArtifactId::parse(hash)
                        .ok_or_else(|| SyncError::Protocol("malformed uvfile hash".into()))?;
                    if !declared.matches_content(raw) {
                        return Err(SyncError::Protocol("uvfile content mismatch".into()).into());
                    }
                    if s.rcvid == 0 {
                        s.rcvid = new_rcvid(repo, s.uid, ipaddr)?;
                    }
                    repo.uv_put(name, raw, mtime, s.rcvid)?;
                }
            }
            "cookie" => {}
            "message" => {
                debug!(message = %tokens[1..].join(" "), "peer message");
            }
            "error" => {
                return Err(SyncError::Remote(tokens[1..].join(" ")).into());
            }
            other => {
                return Err(SyncError::Protocol(format!("unknown card {other:?}")).into());
            }
        }
    }
    build_response(repo, &mut s)
}

fn check_project_code(repo: &Repository, tokens: &[&str]) -> Result<(), RepoError> {
    if let Some(code) = tokens.get(1) {
        if **code != *repo.project_code()? {
            return Err(SyncError::Protocol("project code mismatch".into()).into());
        }
    }
    Ok(())
}

fn parse_file_card<'a>(tokens: &[&'a str]) -> Result<(&'a str, Option<&'a str>, usize), SyncError> {
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
        _ => Err(SyncError::Protocol("malformed file card".into())),
    }
}

/// Parses a `uvfile NAME MTIME SIZE HASH FLAGS` card into its fields.
pub fn parse_uvfile<'a>(
    tokens: &[&'a str],
) -> Result<(&'a str, i64, usize, &'a str, u32), SyncError> {
    if tokens.len() != 6 {
        return Err(SyncError::Protocol("malformed uvfile card".into()));
    }
    let mtime = tokens[2]
        .parse()
        .map_err(|_| SyncError::Protocol("bad uvfile mtime".into()))?;
    let size = tokens[3]
        .parse()
        .map_err(|_| SyncError::Protocol("bad uvfile size".into()))?;
    let flags = tokens[5]
        .parse()
        .map_err(|_| SyncError::Protocol("bad uvfile flags".into()))?;
    Ok((tokens[1], mtime, size, tokens[4], flags))
}

fn new_rcvid(repo: &Repository, uid: Option<i64>, ipaddr: &str) -> Result<i64, RepoError> {
    let mut stmt = repo.db().prepare_cached(
        "INSERT INTO rcvfrom(uid, mtime, nonce, ipaddr) VALUES(?1, ?2, NULL, ?3)",
    )?;
    stmt.execute(rusqlite::params![uid, now_julian(), ipaddr])?;
    Ok(repo.db().last_insert_rowid())
}

fn build_response(repo: &Repository, s: &mut ServerSession) -> Result<Vec<u8>, RepoError> {
    let mut out = CardWriter::new();
    if s.is_clone {
        if s.clone_seqno == 0 {
            out.card(&format!("pragma project-code {}", repo.project_code()?));
            if let Some(server_code) = repo.config_get("server-code")? {
                out.card(&format!("pragma server-code {server_code}"));
            }
        }
        send_clone_batch(repo, s, &mut out)?;
    } else if s.is_pull {
        // Coalesce a long unclustered backlog before advertising it.
        let backlog: i64 = {
            let mut stmt = repo
                .db()
                .prepare_cached("SELECT count(*) FROM unclustered")?;
            stmt.query_row([], |row| row.get(0))?
        };
        if backlog >= 100 {
            repo.cluster_make()?;
        }
        // Advertise what the client might be missing: clusters first,
        // then the unclustered remainder.
        for uuid in repo.cluster_uuids()? {
            if !s.client_has.contains(&uuid) {
                out.card(&format!("cluster {uuid}"));
            }
        }
        let unclustered: Vec<String> = {
            let mut stmt = repo.db().prepare_cached(
                "SELECT blob.uuid FROM unclustered JOIN blob USING(rid)
                  WHERE blob.size>=0 AND blob.rid NOT IN private
                  ORDER BY blob.uuid",
            )?;
            stmt.query_map([], |row| row.get(0))?
                .collect::<Result<_, _>>()?
        };
        for uuid in unclustered {
            if !s.client_has.contains(&uuid) {
                out.card(&format!("igot {uuid}"));
            }
        }
        if s.send_private {
            let private: Vec<String> = {
                let mut stmt = repo.db().prepare_cached(
                    "SELECT blob.uuid FROM private JOIN blob USING(rid)
                      WHERE blob.size>=0 ORDER BY blob.uuid",
                )?;
                stmt.query_map([], |row| row.get(0))?
                    .collect::<Result<_, _>>()?
            };
            for uuid in private {
                if !s.client_has.contains(&uuid) {
                    out.card(&format!("igot {uuid} 1"));
                }
            }
        }
    }
    // Answer gimme cards.
    let mut budget = SEND_BUDGET;
    for uuid in std::mem::take(&mut s.wanted) {
        if budget == 0 {
            break;
        }
        send_artifact(repo, s, &uuid, &mut out, &mut budget)?;
    }
    if s.is_push {
        // Ask for what the client holds and we lack, and acknowledge the
        // rest so the client can clear its unsent queue.
        for uuid in &s.missing_here {
            out.card(&format!("gimme {uuid}"));
        }
        for uuid in s
            .client_has
            .iter()
            .filter(|u| !s.missing_here.contains(*u))
            .sorted()
        {
            out.card(&format!("igot {uuid}"));
        }
    }
    if s.send_uv && s.is_pull {
        for meta in repo.uv_list()? {
            if let Some((info, content)) = repo.uv_get(&meta.name)? {
                out.uvfile(&info.name, info.mtime, &info.hash, &content);
            }
        }
    }
    if s.received > 0 {
        out.card(&format!("message processed {} artifacts", s.received));
    }
    Ok(out.into_bytes())
}

fn send_clone_batch(
    repo: &Repository,
    s: &mut ServerSession,
    out: &mut CardWriter,
) -> Result<(), RepoError> {
    let rows: Vec<(Rid, String)> = {
        let mut stmt = repo.db().prepare_cached(
            "SELECT rid, uuid FROM blob
              WHERE rid>?1 AND size>=0
                AND (rid NOT IN private OR ?2)
                AND uuid NOT IN shun
              ORDER BY rid",
        )?;
        stmt.query_map(rusqlite::params![s.clone_seqno, s.send_private], |row| {
            Ok((row.get(0)?, row.get(1)?))
        })?
        .collect::<Result<_, _>>()?
    };
    let mut budget = SEND_BUDGET;
    let mut max_sent = s.clone_seqno;
    for (rid, uuid) in rows {
        if budget == 0 {
            break;
        }
        send_artifact(repo, s, &uuid, out, &mut budget)?;
        max_sent = rid;
    }
    out.card(&format!("cookie {max_sent}"));
    Ok(())
}

fn send_artifact(
    repo: &Repository,
    s: &mut ServerSession,
    uuid: &str,
    out: &mut CardWriter,
    budget: &mut usize,
) -> Result<(), RepoError> {
    let Some(id) = ArtifactId::parse(uuid) else {
        return Ok(());
    };
    if repo.is_shunned(&id)? {
        return Ok(());
    }
    let Some(rid) = repo.rid_for_uuid(&id)? else {
        return Ok(());
    };
    if repo.content_is_phantom(rid)? {
        return Ok(());
    }
    if repo.content_is_private(rid)? && !s.send_private {
        return Ok(());
    }
    // Prefer the stored delta form when the receiver holds (or has just
    // been sent) the base.
    let delta_src: Option<Rid> = {
        let mut stmt = repo
            .db()
            .prepare_cached("SELECT srcid FROM delta WHERE rid=?1")?;
        stmt.query_row(rusqlite::params![rid], |row| row.get(0))
            .optional()?
    };
    if let Some(srcid) = delta_src {
        let src_uuid = repo.uuid_for_rid(srcid)?;
        if s.client_has.contains(src_uuid.as_str()) {
            let raw: Vec<u8> = {
                let mut stmt = repo
                    .db()
                    .prepare_cached("SELECT content FROM blob WHERE rid=?1")?;
                stmt.query_row(rusqlite::params![rid], |row| row.get(0))?
            };
            let delta_bytes = crate::store::decompress(&raw, rid)?;
            *budget = budget.saturating_sub(delta_bytes.len());
            out.file_delta(uuid, src_uuid.as_str(), &delta_bytes);
            s.client_has.insert(uuid.to_owned());
            return Ok(());
        }
    }
    let content = repo.content_get(rid)?;
    *budget = budget.saturating_sub(content.len());
    out.file(uuid, &content);
    s.client_has.insert(uuid.to_owned());
    Ok(())
}
