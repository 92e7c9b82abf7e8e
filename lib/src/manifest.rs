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

//! The manifest grammar.
//!
//! A manifest is a sequence of lines, each a single uppercase *card*
//! letter followed by space-separated fields. Cards appear in strictly
//! ascending alphabetical order, optionally closed by a `Z <md5>` card
//! covering all preceding bytes. Bytes that cannot appear in a field
//! (space, tab, newline, return, backslash) use the backslash-escaped
//! *quoted* encoding.
//!
//! Parsing is strict and positional: any malformed card reports the line
//! number it sits on. A successfully parsed manifest re-emits to the exact
//! input bytes, which is what keeps regenerated artifacts hash-identical.

use std::collections::BTreeMap;

use bstr::ByteSlice as _;
use chrono::NaiveDateTime;
use smallvec::SmallVec;
use thiserror::Error;

use crate::object_id::ArtifactId;
use crate::repo::RepoError;
use crate::repo::Repository;
use crate::repo::julian_from_unix;
use crate::repo::unix_from_julian;
use crate::store::StoreError;
use crate::tag::TagType;

/// A manifest failed to parse. Carries the 1-based line number of the
/// offending card.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("manifest syntax error on line {line}: {reason}")]
pub struct ManifestParseError {
    /// 1-based line number of the bad card.
    pub line: usize,
    /// What was wrong with it.
    pub reason: String,
}

fn err(line: usize, reason: impl Into<String>) -> ManifestParseError {
    ManifestParseError {
        line,
        reason: reason.into(),
    }
}

/// What kind of artifact a parsed manifest encodes, inferred from its card
/// set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactType {
    /// A check-in (commit).
    Checkin,
    /// A wiki page revision.
    Wiki,
    /// A technote (event).
    Technote,
    /// A ticket change.
    Ticket,
    /// An attachment to a wiki page or ticket.
    Attachment,
    /// A cluster: a bundle of artifact names for sync.
    Cluster,
    /// A tag-only control artifact.
    Control,
}

impl ArtifactType {
    /// The single-letter event type used in the timeline index.
    pub fn event_type(self) -> &'static str {
        match self {
            Self::Checkin => "ci",
            Self::Wiki => "w",
            Self::Technote => "e",
            Self::Ticket => "t",
            Self::Attachment | Self::Control | Self::Cluster => "g",
        }
    }
}

/// A D- or E-card timestamp. The original spelling is kept alongside the
/// Julian-day value so emission is byte-faithful.
#[derive(Debug, Clone, PartialEq)]
pub struct ManifestDate {
    text: String,
    julian: f64,
}

impl ManifestDate {
    /// Parses an ISO-8601 (`2020-01-02T03:04:05.000`) or bare Julian-day
    /// timestamp.
    pub fn parse(text: &str) -> Option<Self> {
        if let Ok(dt) = NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f") {
            let secs = dt.and_utc().timestamp() as f64
                + f64::from(dt.and_utc().timestamp_subsec_millis()) / 1000.0;
            return Some(Self {
                text: text.to_owned(),
                julian: julian_from_unix(secs),
            });
        }
        if text.bytes().all(|b| b.is_ascii_digit() || b == b'.') {
            if let Ok(julian) = text.parse::<f64>() {
                return Some(Self {
                    text: text.to_owned(),
                    julian,
                });
            }
        }
        None
    }

    /// Builds a canonical (millisecond ISO-8601) date from a Julian day.
    pub fn from_julian(julian: f64) -> Self {
        let unix = unix_from_julian(julian);
        let secs = unix.floor() as i64;
        let millis = ((unix - unix.floor()) * 1000.0).round() as u32;
        let dt = chrono::DateTime::from_timestamp(secs, millis * 1_000_000)
            .unwrap_or_else(|| chrono::DateTime::from_timestamp(0, 0).unwrap());
        Self {
            text: dt.naive_utc().format("%Y-%m-%dT%H:%M:%S%.3f").to_string(),
            julian,
        }
    }

    /// The timestamp as a Julian day number.
    pub fn julian(&self) -> f64 {
        self.julian
    }

    /// The original spelling.
    pub fn text(&self) -> &str {
        &self.text
    }
}

/// File permissions carried on an F card.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FilePerm {
    /// An ordinary file.
    #[default]
    Regular,
    /// Executable.
    Executable,
    /// Symbolic link; the blob holds the target path.
    Link,
}

impl FilePerm {
    fn parse(tok: &str) -> Option<Self> {
        match tok {
            "w" => Some(Self::Regular),
            "x" => Some(Self::Executable),
            "l" => Some(Self::Link),
            _ => None,
        }
    }

    /// The integer stored in `mlink.mperm`.
    pub fn as_int(self) -> i64 {
        match self {
            Self::Regular => 0,
            Self::Executable => 1,
            Self::Link => 2,
        }
    }
}

/// One F card: a file present in (or, for delta manifests, removed from)
/// the check-in.
#[derive(Debug, Clone, PartialEq)]
pub struct FileCard {
    /// Repository-relative filename.
    pub name: String,
    /// Content blob, or `None` in a delta manifest to remove the baseline
    /// file.
    pub uuid: Option<ArtifactId>,
    /// Permissions.
    pub perm: FilePerm,
    /// The name this file had in the parent check-in, when renamed.
    pub prior_name: Option<String>,
}

/// One T card: a tag operation against a target artifact.
#[derive(Debug, Clone, PartialEq)]
pub struct TagCard {
    /// Add, cancel, or propagate.
    pub ttype: TagType,
    /// Tag name, without the leading `+`/`-`/`*`.
    pub name: String,
    /// Target artifact; `None` means the enclosing manifest itself.
    pub target: Option<ArtifactId>,
    /// Optional tag value.
    pub value: Option<String>,
}

/// The A card of an attachment artifact.
#[derive(Debug, Clone, PartialEq)]
pub struct AttachmentCard {
    /// Filename of the attachment.
    pub name: String,
    /// The wiki page name or ticket/technote id attached to.
    pub target: String,
    /// Content blob; `None` deletes the attachment.
    pub src: Option<ArtifactId>,
}

/// One Q card: a cherry-pick merge annotation.
#[derive(Debug, Clone, PartialEq)]
pub struct CherrypickCard {
    /// True for `-` (backed out), false for `+` (picked).
    pub exclude: bool,
    /// The check-in picked or backed out.
    pub target: ArtifactId,
    /// Optional baseline used for the pick.
    pub base: Option<ArtifactId>,
}

/// A parsed manifest: optional singleton cards plus vectors for the
/// repeatable ones.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Manifest {
    /// A card.
    pub attachment: Option<AttachmentCard>,
    /// B card: baseline of a delta manifest.
    pub baseline: Option<ArtifactId>,
    /// C card.
    pub comment: Option<String>,
    /// D card.
    pub date: Option<ManifestDate>,
    /// E card: technote timestamp and id.
    pub technote: Option<(ManifestDate, ArtifactId)>,
    /// F cards, in filename order.
    pub files: Vec<FileCard>,
    /// J cards: ticket field changes. A leading `+` on the field name
    /// means append.
    pub fields: Vec<(String, Option<String>)>,
    /// K card: ticket id.
    pub ticket: Option<ArtifactId>,
    /// L card: wiki page title.
    pub wiki_title: Option<String>,
    /// M cards: cluster members, ascending.
    pub members: Vec<ArtifactId>,
    /// N card: mimetype of the C card or W body.
    pub mimetype: Option<String>,
    /// P card: parents, primary first.
    pub parents: Vec<ArtifactId>,
    /// Q cards.
    pub cherrypicks: Vec<CherrypickCard>,
    /// R card: md5 over the concatenated file contents.
    pub repo_checksum: Option<String>,
    /// T cards, ascending by tag name.
    pub tags: Vec<TagCard>,
    /// U card.
    pub user: Option<String>,
    /// W card body bytes.
    pub wiki_body: Option<Vec<u8>>,
    /// Whether the manifest carries a Z card. Parsing records what the
    /// input had; code that builds a manifest sets this to emit one.
    pub has_z_card: bool,
    /// A single blank line separated the body from the Z card.
    pub blank_before_z: bool,
}

/// Encodes one field of a card: space, tab, newline, return and backslash
/// become backslash escapes.
pub fn quote_field(field: &str) -> String {
    let mut out = String::with_capacity(field.len());
    for c in field.chars() {
        match c {
            ' ' => out.push_str("\\s"),
            '\t' => out.push_str("\\t"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\\' => out.push_str("\\\\"),
            c => out.push(c),
        }
    }
    out
}

/// Decodes the quoted encoding. Returns `None` on a dangling or unknown
/// escape.
pub fn unquote_field(token: &str) -> Option<String> {
    if !token.contains('\\') {
        return Some(token.to_owned());
    }
    let mut out = String::with_capacity(token.len());
    let mut chars = token.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next()? {
            's' => out.push(' '),
            't' => out.push('\t'),
            'n' => out.push('\n'),
            'r' => out.push('\r'),
            '\\' => out.push('\\'),
            _ => return None,
        }
    }
    Some(out)
}

fn parse_hash(tok: &str, line: usize) -> Result<ArtifactId, ManifestParseError> {
    ArtifactId::parse(tok).ok_or_else(|| err(line, format!("malformed hash {tok:?}")))
}

fn parse_md5(tok: &str, line: usize) -> Result<String, ManifestParseError> {
    if tok.len() == 32 && crate::hex_util::is_lower_hex(tok) {
        Ok(tok.to_owned())
    } else {
        Err(err(line, format!("malformed md5 checksum {tok:?}")))
    }
}

/// Which card letters may repeat.
fn is_repeatable(letter: u8) -> bool {
    matches!(letter, b'F' | b'J' | b'M' | b'Q' | b'T')
}

impl Manifest {
    /// Parses manifest text. The input must be newline-terminated; cards
    /// must be in ascending order; a trailing Z card, when present, must
    /// checksum all preceding bytes.
    pub fn parse(data: &[u8]) -> Result<Self, ManifestParseError> {
        if data.is_empty() {
            return Err(err(1, "empty artifact is not a manifest"));
        }
        if *data.last().unwrap() != b'\n' {
            return Err(err(1, "manifest does not end with a newline"));
        }
        let mut m = Self::default();
        let mut pos = 0usize;
        let mut line_no = 0usize;
        let mut prev_letter = 0u8;
        let mut pending_blank = false;
        while pos < data.len() {
            let eol = data[pos..]
                .find_byte(b'\n')
                .map(|i| pos + i)
                .expect("data ends with a newline");
            let line = &data[pos..eol];
            line_no += 1;
            let line_start = pos;
            pos = eol + 1;

            if line.is_empty() {
                if pending_blank {
                    return Err(err(line_no, "more than one blank line"));
                }
                pending_blank = true;
                continue;
            }
            let text = std::str::from_utf8(line)
                .map_err(|_| err(line_no, "card is not valid UTF-8"))?;
            let mut tokens = text.split(' ');
            let head = tokens.next().unwrap();
            if head.len() != 1 || !head.as_bytes()[0].is_ascii_uppercase() {
                return Err(err(line_no, format!("malformed card {head:?}")));
            }
            let letter = head.as_bytes()[0];
            if pending_blank && letter != b'Z' {
                return Err(err(line_no, "blank line is only allowed before the Z card"));
            }
            if letter < prev_letter || (letter == prev_letter && !is_repeatable(letter)) {
                return Err(err(line_no, format!("card {} out of order", letter as char)));
            }
            prev_letter = letter;
            let toks: SmallVec<[&str; 4]> = tokens.collect();
            if toks.iter().any(|t| t.is_empty()) {
                return Err(err(line_no, "empty field"));
            }
            match letter {
                b'A' => {
                    if toks.len() < 2 || toks.len() > 3 {
                        return Err(err(line_no, "A card takes 2 or 3 fields"));
                    }
                    let name = unquote_field(toks[0])
                        .ok_or_else(|| err(line_no, "bad escape in attachment name"))?;
                    let target = unquote_field(toks[1])
                        .ok_or_else(|| err(line_no, "bad escape in attachment target"))?;
                    let src = toks
                        .get(2)
                        .map(|t| parse_hash(t, line_no))
                        .transpose()?;
                    m.attachment = Some(AttachmentCard { name, target, src });
                }
                b'B' => {
                    if toks.len() != 1 {
                        return Err(err(line_no, "B card takes 1 field"));
                    }
                    m.baseline = Some(parse_hash(toks[0], line_no)?);
                }
                b'C' => {
                    if toks.len() != 1 {
                        return Err(err(line_no, "C card takes 1 field"));
                    }
                    m.comment = Some(
                        unquote_field(toks[0])
                            .ok_or_else(|| err(line_no, "bad escape in comment"))?,
                    );
                }
                b'D' => {
                    if toks.len() != 1 {
                        return Err(err(line_no, "D card takes 1 field"));
                    }
                    m.date = Some(
                        ManifestDate::parse(toks[0])
                            .ok_or_else(|| err(line_no, format!("bad date {:?}", toks[0])))?,
                    );
                }
                b'E' => {
                    if toks.len() != 2 {
                        return Err(err(line_no, "E card takes 2 fields"));
                    }
                    let when = ManifestDate::parse(toks[0])
                        .ok_or_else(|| err(line_no, format!("bad date {:?}", toks[0])))?;
                    m.technote = Some((when, parse_hash(toks[1], line_no)?));
                }
                b'F' => {
                    if toks.is_empty() || toks.len() > 4 {
                        return Err(err(line_no, "F card takes 1 to 4 fields"));
                    }
                    let name = unquote_field(toks[0])
                        .ok_or_else(|| err(line_no, "bad escape in filename"))?;
                    if let Some(prev) = m.files.last() {
                        if prev.name >= name {
                            return Err(err(line_no, "F cards are not sorted by filename"));
                        }
                    }
                    let uuid = toks.get(1).map(|t| parse_hash(t, line_no)).transpose()?;
                    let perm = match toks.get(2) {
                        None => FilePerm::Regular,
                        Some(t) => FilePerm::parse(t)
                            .ok_or_else(|| err(line_no, format!("bad permissions {t:?}")))?,
                    };
                    let prior_name = toks
                        .get(3)
                        .map(|t| {
                            unquote_field(t)
                                .ok_or_else(|| err(line_no, "bad escape in prior filename"))
                        })
                        .transpose()?;
                    m.files.push(FileCard {
                        name,
                        uuid,
                        perm,
                        prior_name,
                    });
                }
                b'J' => {
                    if toks.is_empty() || toks.len() > 2 {
                        return Err(err(line_no, "J card takes 1 or 2 fields"));
                    }
                    let name = unquote_field(toks[0])
                        .ok_or_else(|| err(line_no, "bad escape in field name"))?;
                    if let Some((prev, _)) = m.fields.last() {
                        if *prev > name {
                            return Err(err(line_no, "J cards are not sorted"));
                        }
                    }
                    let value = toks
                        .get(1)
                        .map(|t| {
                            unquote_field(t).ok_or_else(|| err(line_no, "bad escape in field value"))
                        })
                        .transpose()?;
                    m.fields.push((name, value));
                }
                b'K' => {
                    if toks.len() != 1 {
                        return Err(err(line_no, "K card takes 1 field"));
                    }
                    m.ticket = Some(parse_hash(toks[0], line_no)?);
                }
                b'L' => {
                    if toks.len() != 1 {
                        return Err(err(line_no, "L card takes 1 field"));
                    }
                    m.wiki_title = Some(
                        unquote_field(toks[0])
                            .ok_or_else(|| err(line_no, "bad escape in wiki title"))?,
                    );
                }
                b'M' => {
                    if toks.len() != 1 {
                        return Err(err(line_no, "M card takes 1 field"));
                    }
                    let id = parse_hash(toks[0], line_no)?;
                    if let Some(prev) = m.members.last() {
                        if *prev >= id {
                            return Err(err(line_no, "M cards are not sorted"));
                        }
                    }
                    m.members.push(id);
                }
                b'N' => {
                    if toks.len() != 1 {
                        return Err(err(line_no, "N card takes 1 field"));
                    }
                    m.mimetype = Some(
                        unquote_field(toks[0])
                            .ok_or_else(|| err(line_no, "bad escape in mimetype"))?,
                    );
                }
                b'P' => {
                    let mut parents = Vec::with_capacity(toks.len());
                    for t in &toks {
                        parents.push(parse_hash(t, line_no)?);
                    }
                    m.parents = parents;
                }
                b'Q' => {
                    if toks.is_empty() || toks.len() > 2 {
                        return Err(err(line_no, "Q card takes 1 or 2 fields"));
                    }
                    let (sign, rest) = toks[0]
                        .split_at_checked(1)
                        .ok_or_else(|| err(line_no, "empty Q field"))?;
                    let exclude = match sign {
                        "+" => false,
                        "-" => true,
                        _ => return Err(err(line_no, "Q card must begin with + or -")),
                    };
                    let target = parse_hash(rest, line_no)?;
                    let base = toks.get(1).map(|t| parse_hash(t, line_no)).transpose()?;
                    m.cherrypicks.push(CherrypickCard {
                        exclude,
                        target,
                        base,
                    });
                }
                b'R' => {
                    if toks.len() != 1 {
                        return Err(err(line_no, "R card takes 1 field"));
                    }
                    m.repo_checksum = Some(parse_md5(toks[0], line_no)?);
                }
                b'T' => {
                    if toks.len() < 2 || toks.len() > 3 {
                        return Err(err(line_no, "T card takes 2 or 3 fields"));
                    }
                    let (sign, rest) = toks[0]
                        .split_at_checked(1)
                        .ok_or_else(|| err(line_no, "empty tag name"))?;
                    let ttype = match sign {
                        "+" => TagType::Add,
                        "-" => TagType::Cancel,
                        "*" => TagType::Propagate,
                        _ => return Err(err(line_no, "tag must begin with +, - or *")),
                    };
                    let name = unquote_field(rest)
                        .ok_or_else(|| err(line_no, "bad escape in tag name"))?;
                    if name.is_empty() {
                        return Err(err(line_no, "empty tag name"));
                    }
                    let target = if toks[1] == "*" {
                        None
                    } else {
                        Some(parse_hash(toks[1], line_no)?)
                    };
                    if let Some(prev) = m.tags.last() {
                        let prev_key = (&prev.name, prev.target.as_ref());
                        if prev_key > (&name, target.as_ref()) {
                            return Err(err(line_no, "T cards are not sorted"));
                        }
                    }
                    let value = toks
                        .get(2)
                        .map(|t| {
                            unquote_field(t).ok_or_else(|| err(line_no, "bad escape in tag value"))
                        })
                        .transpose()?;
                    m.tags.push(TagCard {
                        ttype,
                        name,
                        target,
                        value,
                    });
                }
                b'U' => {
                    if toks.len() != 1 {
                        return Err(err(line_no, "U card takes 1 field"));
                    }
                    m.user = Some(
                        unquote_field(toks[0])
                            .ok_or_else(|| err(line_no, "bad escape in user name"))?,
                    );
                }
                b'W' => {
                    if toks.len() != 1 {
                        return Err(err(line_no, "W card takes 1 field"));
                    }
                    let len: usize = toks[0]
                        .parse()
                        .map_err(|_| err(line_no, format!("bad W length {:?}", toks[0])))?;
                    if pos + len + 1 > data.len() {
                        return Err(err(line_no, "W body is truncated"));
                    }
                    let body = data[pos..pos + len].to_vec();
                    if data[pos + len] != b'\n' {
                        return Err(err(line_no, "W body is not newline-terminated"));
                    }
                    line_no += body.iter().filter(|&&b| b == b'\n').count();
                    pos += len + 1;
                    m.wiki_body = Some(body);
                }
                b'Z' => {
                    if toks.len() != 1 {
                        return Err(err(line_no, "Z card takes 1 field"));
                    }
                    let declared = parse_md5(toks[0], line_no)?;
                    let computed = format!("{:x}", md5::compute(&data[..line_start]));
                    if declared != computed {
                        return Err(err(line_no, "Z card checksum mismatch"));
                    }
                    if pos != data.len() {
                        return Err(err(line_no + 1, "content after Z card"));
                    }
                    m.has_z_card = true;
                    m.blank_before_z = pending_blank;
                    pending_blank = false;
                }
                _ => {
                    return Err(err(line_no, format!("unknown card {}", letter as char)));
                }
            }
        }
        if pending_blank {
            return Err(err(line_no, "trailing blank line"));
        }
        if prev_letter == 0 {
            return Err(err(1, "no cards"));
        }
        Ok(m)
    }

    /// Classifies the manifest by its card set, or `None` if the card
    /// combination does not form a recognized artifact.
    pub fn artifact_type(&self) -> Option<ArtifactType> {
        if self.attachment.is_some() {
            return Some(ArtifactType::Attachment);
        }
        if self.ticket.is_some() {
            return (!self.fields.is_empty()
                && self.wiki_title.is_none()
                && self.technote.is_none())
            .then_some(ArtifactType::Ticket);
        }
        if self.wiki_title.is_some() {
            return self.wiki_body.as_ref().map(|_| ArtifactType::Wiki);
        }
        if self.technote.is_some() {
            return self.wiki_body.as_ref().map(|_| ArtifactType::Technote);
        }
        if !self.members.is_empty() {
            let only_members = self.date.is_none()
                && self.comment.is_none()
                && self.user.is_none()
                && self.files.is_empty()
                && self.parents.is_empty()
                && self.tags.is_empty();
            return only_members.then_some(ArtifactType::Cluster);
        }
        if self.date.is_some() {
            let attaches_branch = self
                .tags
                .iter()
                .any(|t| t.name == "branch" && t.target.is_none());
            if !self.files.is_empty()
                || !self.parents.is_empty()
                || self.baseline.is_some()
                || self.repo_checksum.is_some()
                || attaches_branch
            {
                return Some(ArtifactType::Checkin);
            }
            if !self.tags.is_empty() && self.files.is_empty() && self.wiki_body.is_none() {
                return Some(ArtifactType::Control);
            }
        }
        None
    }

    /// The commit timestamp as a Julian day, defaulting to zero for
    /// manifests without a D card.
    pub fn mtime(&self) -> f64 {
        self.date.as_ref().map_or(0.0, ManifestDate::julian)
    }

    /// Emits the canonical text. Cards come out in alphabetical order with
    /// the same within-card sorting the parser enforces, so
    /// `emit(parse(text)) == text` for any text that parses.
    pub fn emit(&self) -> Vec<u8> {
        let mut out: Vec<u8> = Vec::new();
        let mut card = |text: String| {
            out.extend_from_slice(text.as_bytes());
            out.push(b'\n');
        };
        if let Some(a) = &self.attachment {
            let mut line = format!("A {} {}", quote_field(&a.name), quote_field(&a.target));
            if let Some(src) = &a.src {
                line.push(' ');
                line.push_str(src.as_str());
            }
            card(line);
        }
        if let Some(b) = &self.baseline {
            card(format!("B {b}"));
        }
        if let Some(c) = &self.comment {
            card(format!("C {}", quote_field(c)));
        }
        if let Some(d) = &self.date {
            card(format!("D {}", d.text()));
        }
        if let Some((when, id)) = &self.technote {
            card(format!("E {} {id}", when.text()));
        }
        for f in &self.files {
            let mut line = format!("F {}", quote_field(&f.name));
            if let Some(uuid) = &f.uuid {
                line.push(' ');
                line.push_str(uuid.as_str());
                let perm_tok = match f.perm {
                    FilePerm::Regular => {
                        if f.prior_name.is_some() {
                            Some("w")
                        } else {
                            None
                        }
                    }
                    FilePerm::Executable => Some("x"),
                    FilePerm::Link => Some("l"),
                };
                if let Some(tok) = perm_tok {
                    line.push(' ');
                    line.push_str(tok);
                }
                if let Some(prior) = &f.prior_name {
                    line.push(' ');
                    line.push_str(&quote_field(prior));
                }
            }
            card(line);
        }
        for (name, value) in &self.fields {
            let mut line = format!("J {}", quote_field(name));
            if let Some(v) = value {
                line.push(' ');
                line.push_str(&quote_field(v));
            }
            card(line);
        }
        if let Some(k) = &self.ticket {
            card(format!("K {k}"));
        }
        if let Some(l) = &self.wiki_title {
            card(format!("L {}", quote_field(l)));
        }
        for member in &self.members {
            card(format!("M {member}"));
        }
        if let Some(n) = &self.mimetype {
            card(format!("N {}", quote_field(n)));
        }
        if !self.parents.is_empty() {
            let list: Vec<&str> = self.parents.iter().map(ArtifactId::as_str).collect();
            card(format!("P {}", list.join(" ")));
        }
        for q in &self.cherrypicks {
            let sign = if q.exclude { '-' } else { '+' };
            let mut line = format!("Q {sign}{}", q.target);
            if let Some(base) = &q.base {
                line.push(' ');
                line.push_str(base.as_str());
            }
            card(line);
        }
        if let Some(r) = &self.repo_checksum {
            card(format!("R {r}"));
        }
        for t in &self.tags {
            let sign = match t.ttype {
                TagType::Add => '+',
                TagType::Cancel => '-',
                TagType::Propagate => '*',
            };
            let target = t.target.as_ref().map_or("*", ArtifactId::as_str);
            let mut line = format!("T {sign}{} {target}", quote_field(&t.name));
            if let Some(v) = &t.value {
                line.push(' ');
                line.push_str(&quote_field(v));
            }
            card(line);
        }
        if let Some(u) = &self.user {
            card(format!("U {}", quote_field(u)));
        }
        if let Some(w) = &self.wiki_body {
            out.extend_from_slice(format!("W {}\n", w.len()).as_bytes());
            out.extend_from_slice(w);
            out.push(b'\n');
        }
        if self.has_z_card {
            if self.blank_before_z {
                out.push(b'\n');
            }
            let sum = format!("{:x}", md5::compute(&out));
            out.extend_from_slice(format!("Z {sum}\n").as_bytes());
        }
        out
    }
}

/// A resolved file-set entry: the blob and permissions a name maps to in a
/// check-in's effective tree.
#[derive(Debug, Clone, PartialEq)]
pub struct FileEntry {
    /// Content blob.
    pub uuid: ArtifactId,
    /// Permissions.
    pub perm: FilePerm,
}

impl Manifest {
    /// Resolves the effective file set of a check-in: its own F cards
    /// merged over the baseline manifest's cards when this is a delta
    /// manifest. Delta manifests may not nest.
    pub fn file_set(&self, repo: &Repository) -> Result<BTreeMap<String, FileEntry>, RepoError> {
        let mut set = match &self.baseline {
            None => BTreeMap::new(),
            Some(base_id) => {
                let base_rid = repo
                    .rid_for_uuid(base_id)?
                    .ok_or_else(|| RepoError::Store(StoreError::Phantom(0)))?;
                let content = repo.content_get(base_rid)?;
                let base = Self::parse(&content)?;
                if base.baseline.is_some() {
                    return Err(ManifestParseError {
                        line: 1,
                        reason: "delta manifest baseline is itself a delta manifest".into(),
                    }
                    .into());
                }
                base.file_set(repo)?
            }
        };
        for f in &self.files {
            match &f.uuid {
                None => {
                    set.remove(&f.name);
                }
                Some(uuid) => {
                    set.insert(
                        f.name.clone(),
                        FileEntry {
                            uuid: uuid.clone(),
                            perm: f.perm,
                        },
                    );
                }
            }
        }
        Ok(set)
    }

    /// Parses the manifest stored at `rid`.
    pub fn parse_rid(repo: &Repository, rid: crate::repo::Rid) -> Result<Self, RepoError> {
        let content = repo.content_get(rid)?;
        Ok(Self::parse(&content)?)
    }
}

#[cfg(test)]
mod tests {
    use indoc::formatdoc;

    use super::*;

    fn manifest_with_z(body: &str) -> Vec<u8> {
        let mut text = body.as_bytes().to_vec();
        let sum = format!("{:x}", md5::compute(&text));
        text.extend_from_slice(format!("Z {sum}\n").as_bytes());
        text
    }

    const FILE_HASH: &str = "6adfb183a4a2c94a2f92dab5ade762a47889a5a1";
    const PARENT_HASH: &str = "e9e2a1aa3e1b6e9d4e94a0e5a9d0e8c7b6a59483";

    fn checkin_text() -> Vec<u8> {
        manifest_with_z(&formatdoc! {"
            C test\\scommit
            D 2020-01-02T03:04:05.000
            F foo.txt {file}
            P {parent}
            U alice
        ",
            file = FILE_HASH,
            parent = PARENT_HASH,
        })
    }

    #[test]
    fn test_parse_checkin() {
        let m = Manifest::parse(&checkin_text()).unwrap();
        assert_eq!(m.artifact_type(), Some(ArtifactType::Checkin));
        assert_eq!(m.comment.as_deref(), Some("test commit"));
        assert_eq!(m.user.as_deref(), Some("alice"));
        assert_eq!(m.files.len(), 1);
        assert_eq!(m.files[0].name, "foo.txt");
        assert_eq!(m.files[0].uuid.as_ref().unwrap().as_str(), FILE_HASH);
        assert_eq!(m.parents.len(), 1);
        assert!(m.has_z_card);
        // 2020-01-02 03:04:05 UTC as a Julian day.
        assert!((m.mtime() - 2458850.627835648).abs() < 1e-6);
    }

    #[test]
    fn test_round_trip() {
        let text = checkin_text();
        let m = Manifest::parse(&text).unwrap();
        assert_eq!(m.emit(), text);
    }

    #[test]
    fn test_round_trip_wiki() {
        let body = "W 15\nhello\nwiki body\n";
        let text = manifest_with_z(&format!(
            "D 2021-06-01T10:00:00.000\nL HomePage\nU bob\n{body}"
        ));
        let m = Manifest::parse(&text).unwrap();
        assert_eq!(m.artifact_type(), Some(ArtifactType::Wiki));
        assert_eq!(m.wiki_body.as_deref(), Some(&b"hello\nwiki body"[..]));
        assert_eq!(m.emit(), text);
    }

    #[test]
    fn test_out_of_order_cards_rejected() {
        let text = "D 2020-01-02T03:04:05.000\nC late comment\nU alice\n";
        let e = Manifest::parse(text.as_bytes()).unwrap_err();
        assert_eq!(e.line, 2);
    }

    #[test]
    fn test_unsorted_f_cards_rejected() {
        let text = format!(
            "D 2020-01-02T03:04:05.000\nF b.txt {FILE_HASH}\nF a.txt {FILE_HASH}\nU alice\n"
        );
        let e = Manifest::parse(text.as_bytes()).unwrap_err();
        assert_eq!(e.line, 3);
        assert!(e.reason.contains("sorted"));
    }

    #[test]
    fn test_bad_z_rejected() {
        let mut text = checkin_text();
        // Flip one digit of the checksum.
        let n = text.len() - 2;
        text[n] = if text[n] == b'0' { b'1' } else { b'0' };
        let e = Manifest::parse(&text).unwrap_err();
        assert!(e.reason.contains("checksum"));
    }

    #[test]
    fn test_empty_artifact_is_not_a_manifest() {
        assert!(Manifest::parse(b"").is_err());
    }

    #[test]
    fn test_cluster() {
        let a = "a".repeat(64);
        let b = "b".repeat(64);
        let text = manifest_with_z(&format!("M {a}\nM {b}\n"));
        let m = Manifest::parse(&text).unwrap();
        assert_eq!(m.artifact_type(), Some(ArtifactType::Cluster));
        assert_eq!(m.members.len(), 2);
        assert_eq!(m.emit(), text);
    }

    #[test]
    fn test_control_artifact() {
        let target = "c".repeat(40);
        let text = manifest_with_z(&format!(
            "D 2022-03-04T05:06:07.000\nT +sym-release {target}\nU carol\n"
        ));
        let m = Manifest::parse(&text).unwrap();
        assert_eq!(m.artifact_type(), Some(ArtifactType::Control));
        assert_eq!(m.tags[0].ttype, TagType::Add);
        assert_eq!(m.tags[0].name, "sym-release");
        assert_eq!(m.emit(), text);
    }

    #[test]
    fn test_quoting() {
        assert_eq!(quote_field("a b\tc\\d"), "a\\sb\\tc\\\\d");
        assert_eq!(unquote_field("a\\sb\\tc\\\\d").as_deref(), Some("a b\tc\\d"));
        assert_eq!(unquote_field("dangling\\"), None);
        assert_eq!(unquote_field("bad\\q"), None);
    }

    #[test]
    fn test_date_round_trip() {
        let d = ManifestDate::parse("2020-01-02T03:04:05.250").unwrap();
        let again = ManifestDate::from_julian(d.julian());
        assert_eq!(again.text(), "2020-01-02T03:04:05.250");
    }

    #[test]
    fn test_rename_file_card() {
        let text = manifest_with_z(&format!(
            "D 2020-01-02T03:04:05.000\nF new.txt {FILE_HASH} w old.txt\nP {PARENT_HASH}\nU alice\n"
        ));
        let m = Manifest::parse(&text).unwrap();
        assert_eq!(m.files[0].prior_name.as_deref(), Some("old.txt"));
        assert_eq!(m.files[0].perm, FilePerm::Regular);
        assert_eq!(m.emit(), text);
    }
}
