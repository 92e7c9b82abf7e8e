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

//! The repository SQL schema.
//!
//! The `blob`, `delta`, `rcvfrom`, `private`, `shun` and `config` tables are
//! the durable truth of a repository. Everything else (`plink`, `mlink`,
//! `tagxref`, `event`, `leaf`, `filename`) is derived from artifact content
//! and can be reconstructed by `rebuild`.

/// Version stamp of the durable content tables.
pub const CONTENT_SCHEMA: &str = "2";
/// Version stamp of the derived/auxiliary tables.
pub const AUX_SCHEMA: &str = "2";

/// Tables holding artifact content and receive provenance.
pub const REPOSITORY_SCHEMA: &str = "\
CREATE TABLE blob(
  rid INTEGER PRIMARY KEY AUTOINCREMENT,
  rcvid INTEGER,
  size INTEGER,
  uuid TEXT UNIQUE NOT NULL,
  content BLOB
);
CREATE TABLE delta(
  rid INTEGER PRIMARY KEY,
  srcid INTEGER NOT NULL REFERENCES blob
);
CREATE INDEX delta_i1 ON delta(srcid);
CREATE TABLE rcvfrom(
  rcvid INTEGER PRIMARY KEY AUTOINCREMENT,
  uid INTEGER,
  mtime DATETIME,
  nonce TEXT,
  ipaddr TEXT
);
CREATE TABLE private(rid INTEGER PRIMARY KEY);
CREATE TABLE shun(
  uuid TEXT PRIMARY KEY,
  mtime DATETIME,
  scom TEXT
) WITHOUT ROWID;
CREATE TABLE unclustered(rid INTEGER PRIMARY KEY);
CREATE TABLE unsent(rid INTEGER PRIMARY KEY);
CREATE TABLE config(
  name TEXT PRIMARY KEY NOT NULL,
  value CLOB,
  mtime DATETIME
) WITHOUT ROWID;
CREATE TABLE user(
  uid INTEGER PRIMARY KEY,
  login TEXT UNIQUE,
  cap TEXT,
  secret TEXT,
  mtime DATETIME
);
CREATE TABLE modreq(
  objid INTEGER PRIMARY KEY,
  attachRid INTEGER,
  tktid TEXT
);
CREATE TABLE unversioned(
  uvid INTEGER PRIMARY KEY,
  name TEXT UNIQUE NOT NULL,
  rcvid INTEGER,
  mtime DATETIME,
  hash TEXT,
  sz INTEGER,
  content BLOB
);
CREATE TABLE pending_xlink(
  missing TEXT,
  waiter TEXT,
  PRIMARY KEY(missing, waiter)
) WITHOUT ROWID;
";

/// Derived tables built by the cross-reference builder.
pub const XREF_SCHEMA: &str = "\
CREATE TABLE filename(
  fnid INTEGER PRIMARY KEY,
  name TEXT UNIQUE
);
CREATE TABLE plink(
  pid INTEGER REFERENCES blob,
  cid INTEGER REFERENCES blob,
  isprim BOOLEAN,
  mtime DATETIME,
  baseid INTEGER REFERENCES blob,
  UNIQUE(pid, cid)
);
CREATE INDEX plink_i2 ON plink(cid, pid);
CREATE TABLE mlink(
  mid INTEGER REFERENCES blob,
  fid INTEGER REFERENCES blob,
  pid INTEGER REFERENCES blob,
  fnid INTEGER REFERENCES filename,
  pfnid INTEGER REFERENCES filename,
  mperm INTEGER
);
CREATE INDEX mlink_i1 ON mlink(mid);
CREATE INDEX mlink_i2 ON mlink(fnid);
CREATE INDEX mlink_i3 ON mlink(fid);
CREATE INDEX mlink_i4 ON mlink(pid);
CREATE TABLE tag(
  tagid INTEGER PRIMARY KEY AUTOINCREMENT,
  tagname TEXT UNIQUE
);
CREATE TABLE tagxref(
  tagid INTEGER REFERENCES tag,
  tagtype INTEGER,
  srcid INTEGER REFERENCES blob,
  value TEXT,
  mtime DATETIME,
  rid INTEGER REFERENCES blob,
  UNIQUE(rid, tagid)
);
CREATE INDEX tagxref_i1 ON tagxref(tagid, mtime);
CREATE TABLE event(
  type TEXT,
  mtime DATETIME,
  objid INTEGER PRIMARY KEY,
  tagid INTEGER,
  uid INTEGER,
  user TEXT,
  comment TEXT,
  euser TEXT,
  ecomment TEXT
);
CREATE INDEX event_i1 ON event(mtime);
CREATE TABLE leaf(rid INTEGER PRIMARY KEY);
CREATE TABLE attachment(
  attachid INTEGER PRIMARY KEY,
  isLatest BOOLEAN DEFAULT 0,
  mtime DATETIME,
  src TEXT,
  target TEXT,
  filename TEXT,
  comment TEXT,
  user TEXT
);
CREATE INDEX attachment_i1 ON attachment(target, filename, mtime);
";

/// Reserved tag ids. User-defined tags are assigned ids above
/// [`MAX_RESERVED_TAGID`].
pub mod tagid {
    /// Background color display hint.
    pub const BGCOLOR: i64 = 1;
    /// Check-in comment edit.
    pub const COMMENT: i64 = 2;
    /// Check-in user edit.
    pub const USER: i64 = 3;
    /// Check-in date edit.
    pub const DATE: i64 = 4;
    /// Hide from timeline.
    pub const HIDDEN: i64 = 5;
    /// Private artifact marker.
    pub const PRIVATE: i64 = 6;
    /// Cluster artifact marker.
    pub const CLUSTER: i64 = 7;
    /// The branch tag; its value names the branch.
    pub const BRANCH: i64 = 8;
    /// Closed-leaf marker.
    pub const CLOSED: i64 = 9;
    /// Parent override.
    pub const PARENT: i64 = 10;
    /// Technote marker.
    pub const NOTE: i64 = 11;
    /// Largest reserved tag id.
    pub const MAX_RESERVED: i64 = 99;
}

/// Seeds the reserved rows of the `tag` table.
pub const TAG_SEED: &str = "\
INSERT INTO tag(tagid, tagname) VALUES
  (1, 'bgcolor'),
  (2, 'comment'),
  (3, 'user'),
  (4, 'date'),
  (5, 'hidden'),
  (6, 'private'),
  (7, 'cluster'),
  (8, 'branch'),
  (9, 'closed'),
  (10, 'parent'),
  (11, 'note');
UPDATE sqlite_sequence SET seq=99 WHERE name='tag' AND seq<99;
";
