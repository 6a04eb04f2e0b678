/*
 * Copyright (c) 2024 Yunshan Networks
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use std::collections::BTreeMap;
use std::fmt;

use public::Timestamp;

use crate::common::{PacketDirection, TcpTuple};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Version {
    pub major: u8,
    pub minor: u8,
}

impl Version {
    pub const HTTP_10: Self = Self { major: 1, minor: 0 };
    pub const HTTP_11: Self = Self { major: 1, minor: 1 };
}

// unparseable versions fall back to 1.0
impl Default for Version {
    fn default() -> Self {
        Self::HTTP_10
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// One HTTP request or response.
///
/// Offsets (`start`, `header_offset`, `body_offset`, `end`) index the owning
/// stream's buffer while the message is being parsed. Once complete, `raw`
/// holds the bytes in `start..end` and the `raw_*` accessors translate the
/// offsets into it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Message {
    pub timestamp: Timestamp,
    pub tuple: TcpTuple,
    pub direction: PacketDirection,
    pub is_request: bool,
    pub version: Version,

    // request
    pub method: String,
    pub request_uri: String,

    // response
    pub status_code: u16,
    pub status_phrase: String,

    // captured headers, names lower-cased, repeats joined with ", "
    pub headers: BTreeMap<String, String>,
    pub content_length: usize,
    pub has_content_length: bool,
    pub content_type: String,
    pub transfer_encoding: String,
    pub is_chunked: bool,
    pub connection: String,
    pub real_ip: String,
    pub host: String,
    pub user_agent: String,
    pub referer: String,
    pub authorization: String,

    pub start: usize,
    pub header_offset: usize,
    pub body_offset: usize,
    pub end: usize,
    pub size: usize,

    pub chunked_length: usize,
    pub chunked_body: Vec<u8>,

    pub notes: Vec<String>,
    pub raw: Vec<u8>,
}

impl Message {
    pub fn new(timestamp: Timestamp) -> Self {
        Self {
            timestamp,
            ..Default::default()
        }
    }

    // 1xx, 204 and 304 responses never carry a body
    pub fn is_bodyless_status(&self) -> bool {
        !self.is_request
            && ((100..200).contains(&self.status_code)
                || self.status_code == 204
                || self.status_code == 304)
    }

    pub fn connection_close(&self) -> bool {
        has_token(&self.connection, "close")
    }

    pub fn connection_keep_alive(&self) -> bool {
        has_token(&self.connection, "keep-alive")
    }

    // Without a content-length the body runs until the connection closes
    // when the peer said so or speaks HTTP/1.0 without keep-alive.
    pub fn is_read_until_close(&self) -> bool {
        !self.has_content_length
            && (self.connection_close()
                || (self.version == Version::HTTP_10 && !self.connection_keep_alive()))
    }

    pub fn add_note<S: Into<String>>(&mut self, note: S) {
        let note = note.into();
        if !self.notes.contains(&note) {
            self.notes.push(note);
        }
    }

    pub fn raw_headers(&self) -> &[u8] {
        let end = self.body_offset.saturating_sub(self.start).min(self.raw.len());
        &self.raw[..end]
    }

    pub fn raw_body(&self) -> &[u8] {
        let start = self.body_offset.saturating_sub(self.start).min(self.raw.len());
        &self.raw[start..]
    }

    // header block without the first line
    pub fn raw_header_fields(&self) -> (usize, usize) {
        let from = self.header_offset.saturating_sub(self.start).min(self.raw.len());
        let to = self.body_offset.saturating_sub(self.start).min(self.raw.len());
        (from, to.max(from))
    }

    // the decoded body: concatenated chunks for chunked messages
    pub fn body(&self) -> &[u8] {
        if self.is_chunked {
            &self.chunked_body
        } else {
            self.raw_body()
        }
    }
}

fn has_token(value: &str, token: &str) -> bool {
    value
        .split(',')
        .any(|t| t.trim().eq_ignore_ascii_case(token))
}
