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

//! Sync transports.
//!
//! A transport carries one request payload to the peer and brings back
//! one response payload; the protocol state lives entirely in the card
//! streams, so the connection may drop between round-trips. The HTTP
//! transport POSTs `application/x-fossil` (a zlib-compressed card stream)
//! to the peer's `/xfer` endpoint. The in-process transport runs a server
//! repository directly, which is how the sync machinery is tested.

use std::io::Read as _;
use std::io::Write as _;

use flate2::Compression;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;

use crate::repo::RepoError;
use crate::repo::Repository;
use crate::xfer;
use crate::xfer::SyncError;

/// Content type of a compressed card stream.
pub const CONTENT_TYPE: &str = "application/x-fossil";
/// Content type of an uncompressed card stream, for debugging.
pub const CONTENT_TYPE_DEBUG: &str = "application/x-fossil-debug";

/// One request/response exchange with a sync peer.
pub trait XferTransport {
    /// Sends `payload` and returns the peer's response payload, both as
    /// uncompressed card streams.
    fn round_trip(&mut self, payload: &[u8]) -> Result<Vec<u8>, SyncError>;
}

fn deflate(data: &[u8]) -> Vec<u8> {
    let mut enc = ZlibEncoder::new(Vec::new(), Compression::default());
    enc.write_all(data).expect("writing to a Vec cannot fail");
    enc.finish().expect("writing to a Vec cannot fail")
}

fn inflate(data: &[u8]) -> Result<Vec<u8>, SyncError> {
    let mut out = Vec::new();
    ZlibDecoder::new(data)
        .read_to_end(&mut out)
        .map_err(|e| SyncError::Transport(format!("bad compressed payload: {e}")))?;
    Ok(out)
}

/// HTTP client transport.
pub struct HttpTransport {
    agent: ureq::Agent,
    url: String,
}

impl HttpTransport {
    /// Creates a transport for the repository at `url`. The `/xfer`
    /// endpoint suffix is appended here.
    pub fn new(url: &str) -> Self {
        let base = url.trim_end_matches('/');
        Self {
            agent: ureq::AgentBuilder::new()
                .redirects(5)
                .build(),
            url: format!("{base}/xfer"),
        }
    }
}

impl XferTransport for HttpTransport {
    fn round_trip(&mut self, payload: &[u8]) -> Result<Vec<u8>, SyncError> {
        let response = self
            .agent
            .post(&self.url)
            .set("Content-Type", CONTENT_TYPE)
            .send_bytes(&deflate(payload))
            .map_err(|e| SyncError::Transport(e.to_string()))?;
        let compressed = response.header("Content-Type").map(str::to_owned);
        let mut body = Vec::new();
        response
            .into_reader()
            .read_to_end(&mut body)
            .map_err(|e| SyncError::Transport(e.to_string()))?;
        if compressed.as_deref() == Some(CONTENT_TYPE_DEBUG) {
            Ok(body)
        } else {
            inflate(&body)
        }
    }
}

/// In-process transport: the "peer" is another open repository in the
/// same process.
pub struct LocalTransport<'a> {
    server: &'a Repository,
}

impl<'a> LocalTransport<'a> {
    /// Wraps a server-side repository.
    pub fn new(server: &'a Repository) -> Self {
        Self { server }
    }
}

impl XferTransport for LocalTransport<'_> {
    fn round_trip(&mut self, payload: &[u8]) -> Result<Vec<u8>, SyncError> {
        match xfer::process_request(self.server, payload, "local") {
            Ok(response) => Ok(response),
            Err(RepoError::Sync(err)) => Err(err),
            Err(err) => Err(SyncError::Transport(err.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deflate_round_trip() {
        let data = b"pragma send-private\ngimme 0123\n".repeat(40);
        assert_eq!(inflate(&deflate(&data)).unwrap(), data);
        assert!(inflate(b"not zlib at all").is_err());
    }
}
