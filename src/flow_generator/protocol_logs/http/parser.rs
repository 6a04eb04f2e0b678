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

use log::debug;

use super::message::Version;
use super::stream::{ParseState, Stream};
use crate::config::HttpConfig;
use crate::flow_generator::error::{Error, Result};

use public::bytes::{find, parse_dec, parse_hex, trim_sp_ht};

const CRLF: &[u8] = b"\r\n";
const RESPONSE_PREFIX: &[u8] = b"HTTP/";
// "HTTP/1.1 " is the shortest line that can hold anything useful
const FIRST_LINE_MIN_LEN: usize = 9;

enum Step {
    Continue,
    Suspend,
    Complete,
}

/// Incremental HTTP/1.x message tokenizer.
///
/// Works on the bytes buffered in a [`Stream`] starting at its parse offset.
/// `Ok(false)` means more data is needed, `Ok(true)` that the stream's current
/// message is fully delimited, and `Err` that the bytes are not HTTP and the
/// stream should be dropped. Calling it again with more data appended resumes
/// where it stopped.
pub struct MessageParser<'a> {
    config: &'a HttpConfig,
}

impl<'a> MessageParser<'a> {
    pub fn new(config: &'a HttpConfig) -> Self {
        Self { config }
    }

    pub fn parse(&self, s: &mut Stream) -> Result<bool> {
        loop {
            let step = match s.parse_state {
                ParseState::Start => Self::start(s),
                ParseState::FirstLine => Self::first_line(s)?,
                ParseState::Headers => self.headers(s)?,
                ParseState::Body => Self::body(s),
                ParseState::BodyChunkedStart => Self::chunk_start(s)?,
                ParseState::BodyChunked => Self::chunk_body(s)?,
                ParseState::BodyChunkedWaitFinalCrlf => Self::chunk_final_crlf(s)?,
            };
            match step {
                Step::Continue => (),
                Step::Suspend => return Ok(false),
                Step::Complete => {
                    let m = &mut s.message;
                    m.end = s.parse_offset;
                    m.size = m.end - m.start;
                    return Ok(true);
                }
            }
        }
    }

    fn start(s: &mut Stream) -> Step {
        if s.unparsed() == 0 {
            return Step::Suspend;
        }
        s.message.start = s.parse_offset;
        s.message.timestamp = s.last_timestamp;
        s.parse_state = ParseState::FirstLine;
        Step::Continue
    }

    fn first_line(s: &mut Stream) -> Result<Step> {
        let data = &s.data[s.parse_offset..];
        let Some(i) = find(data, CRLF) else {
            return Ok(Step::Suspend);
        };
        let line = &data[..i];
        if line.len() < FIRST_LINE_MIN_LEN {
            debug!("first line too small");
            return Err(Error::FirstLineTooShort);
        }

        let m = &mut s.message;
        if line.starts_with(RESPONSE_PREFIX) {
            m.is_request = false;
            let rest = &line[RESPONSE_PREFIX.len()..];
            let Some(sp) = rest.iter().position(|b| *b == b' ') else {
                return Err(Error::InvalidStatusCode);
            };
            m.version = parse_version(&rest[..sp]).unwrap_or_else(|_| {
                debug!(
                    "failed to understand http version: {}",
                    String::from_utf8_lossy(&rest[..sp])
                );
                Version::default()
            });
            let (code, phrase) = parse_response_status(&rest[sp + 1..])?;
            m.status_code = code;
            m.status_phrase = phrase;
            debug!("http status_code={}, status_phrase={}", code, m.status_phrase);
        } else {
            m.is_request = true;
            let fields = line
                .split(|b| *b == b' ' || *b == b'\t')
                .filter(|f| !f.is_empty())
                .collect::<Vec<_>>();
            if fields.len() != 3 || !fields[2].starts_with(RESPONSE_PREFIX) {
                debug!(
                    "couldn't understand http request: {}",
                    String::from_utf8_lossy(line)
                );
                return Err(Error::InvalidRequestLine);
            }
            m.method = String::from_utf8_lossy(fields[0]).into_owned();
            m.request_uri = String::from_utf8_lossy(fields[1]).into_owned();
            let version = &fields[2][RESPONSE_PREFIX.len()..];
            m.version = parse_version(version).unwrap_or_else(|_| {
                debug!(
                    "failed to understand http version: {}",
                    String::from_utf8_lossy(version)
                );
                Version::default()
            });
            debug!("http method={}, request_uri={}", m.method, m.request_uri);
        }

        s.parse_offset += i + CRLF.len();
        s.message.header_offset = s.parse_offset;
        s.parse_state = ParseState::Headers;
        Ok(Step::Continue)
    }

    fn headers(&self, s: &mut Stream) -> Result<Step> {
        let data = &s.data[s.parse_offset..];
        if data.starts_with(CRLF) {
            return Ok(Self::headers_end(s));
        }
        if data.len() < CRLF.len() {
            return Ok(Step::Suspend);
        }
        let Some((consumed, name, value)) = parse_header_line(data)? else {
            return Ok(Step::Suspend);
        };
        self.store_header(s, name, value);
        s.parse_offset += consumed;
        Ok(Step::Continue)
    }

    fn headers_end(s: &mut Stream) -> Step {
        s.parse_offset += CRLF.len();
        let m = &mut s.message;
        m.body_offset = s.parse_offset;
        if m.is_bodyless_status() {
            debug!("terminate response, status code {}", m.status_code);
            return Step::Complete;
        }
        if m.is_chunked {
            // chunk sizes are summed up as they are read
            m.content_length = 0;
            s.parse_state = ParseState::BodyChunkedStart;
            return Step::Continue;
        }
        if m.content_length == 0 && (m.is_request || m.has_content_length) {
            return Step::Complete;
        }
        s.body_received = 0;
        s.parse_state = ParseState::Body;
        Step::Continue
    }

    fn store_header(&self, s: &mut Stream, name: String, value: String) {
        let m = &mut s.message;
        match name.as_str() {
            "content-length" => match parse_dec(value.as_bytes()) {
                Some(n) => {
                    m.content_length = n;
                    m.has_content_length = true;
                }
                // treated as if the header were absent
                None => debug!("ignore unparseable content-length: {}", value),
            },
            "content-type" => m.content_type = value.clone(),
            "transfer-encoding" => {
                m.is_chunked = value
                    .rsplit(',')
                    .next()
                    .map(|t| t.trim().eq_ignore_ascii_case("chunked"))
                    .unwrap_or(false);
                m.transfer_encoding = value.clone();
            }
            "connection" => m.connection = value.clone(),
            "host" => m.host = value.clone(),
            "user-agent" => m.user_agent = value.clone(),
            "referer" => m.referer = value.clone(),
            "authorization" => m.authorization = value.clone(),
            _ => (),
        }
        if !self.config.real_ip_header.is_empty() && name == self.config.real_ip_header {
            if let Some(ip) = value.split(',').next() {
                m.real_ip = ip.trim().to_owned();
            }
        }
        if self.config.send_all_headers || self.config.send_headers.contains(&name) {
            m.headers
                .entry(name)
                .and_modify(|v| {
                    v.push_str(", ");
                    v.push_str(&value);
                })
                .or_insert(value);
        }
    }

    fn body(s: &mut Stream) -> Step {
        let remaining = s.unparsed();
        let m = &mut s.message;
        if m.is_read_until_close() {
            // the connection close terminates the message
            s.body_received += remaining;
            m.content_length += remaining;
            s.parse_offset = s.data.len();
            return Step::Suspend;
        }
        let wanted = m.content_length.saturating_sub(s.body_received);
        if remaining >= wanted {
            s.parse_offset += wanted;
            s.body_received += wanted;
            return Step::Complete;
        }
        s.body_received += remaining;
        s.parse_offset = s.data.len();
        Step::Suspend
    }

    fn chunk_start(s: &mut Stream) -> Result<Step> {
        let data = &s.data[s.parse_offset..];
        let Some(i) = find(data, CRLF) else {
            return Ok(Step::Suspend);
        };
        let size = parse_chunk_size(&data[..i])?;
        s.parse_offset += i + CRLF.len();
        if size == 0 {
            s.parse_state = ParseState::BodyChunkedWaitFinalCrlf;
            return Ok(Step::Continue);
        }
        s.message.chunked_length = size;
        s.body_received = 0;
        s.parse_state = ParseState::BodyChunked;
        Ok(Step::Continue)
    }

    fn chunk_body(s: &mut Stream) -> Result<Step> {
        let m = &mut s.message;
        let wanted = m.chunked_length - s.body_received;
        let take = wanted.min(s.data.len() - s.parse_offset);
        m.chunked_body
            .extend_from_slice(&s.data[s.parse_offset..s.parse_offset + take]);
        s.parse_offset += take;
        s.body_received += take;
        if s.body_received < m.chunked_length {
            return Ok(Step::Suspend);
        }

        let rest = &s.data[s.parse_offset..];
        if rest.len() < CRLF.len() {
            return Ok(Step::Suspend);
        }
        if !rest.starts_with(CRLF) {
            return Err(Error::MissingChunkCrlf);
        }
        s.parse_offset += CRLF.len();
        m.content_length += m.chunked_length;
        m.chunked_length = 0;
        s.body_received = 0;
        s.parse_state = ParseState::BodyChunkedStart;
        Ok(Step::Continue)
    }

    fn chunk_final_crlf(s: &mut Stream) -> Result<Step> {
        let rest = &s.data[s.parse_offset..];
        if rest.len() < CRLF.len() {
            return Ok(Step::Suspend);
        }
        if !rest.starts_with(CRLF) {
            debug!("expected CRLF sequence at end of message");
            return Err(Error::MissingChunkCrlf);
        }
        s.parse_offset += CRLF.len();
        Ok(Step::Complete)
    }
}

// Only major 0-1 and minor 0-2 are known.
fn parse_version(s: &[u8]) -> Result<Version> {
    if s.len() < 3 || s[1] != b'.' {
        return Err(Error::InvalidVersion);
    }
    let (major, minor) = (s[0].wrapping_sub(b'0'), s[2].wrapping_sub(b'0'));
    if major > 1 || minor > 2 {
        return Err(Error::InvalidVersion);
    }
    Ok(Version { major, minor })
}

fn parse_response_status(s: &[u8]) -> Result<(u16, String)> {
    let s = trim_sp_ht(s);
    let (code, phrase) = match s.iter().position(|b| *b == b' ') {
        Some(p) => (&s[..p], &s[p + 1..]),
        None => (s, &b""[..]),
    };
    if code.len() != 3 {
        return Err(Error::InvalidStatusCode);
    }
    let code = parse_dec(code).ok_or(Error::InvalidStatusCode)?;
    Ok((code as u16, String::from_utf8_lossy(phrase).into_owned()))
}

// chunk extensions after ';' are ignored
fn parse_chunk_size(line: &[u8]) -> Result<usize> {
    let size = match line.iter().position(|b| *b == b';') {
        Some(p) => &line[..p],
        None => line,
    };
    parse_hex(trim_sp_ht(size)).ok_or(Error::InvalidChunkSize)
}

// Parses one header, including continuation lines. Returns the bytes
// consumed with the lower-cased name and unfolded value, or None if the
// header is not complete yet. A header is only complete once the first byte
// of the following line is known, as it may be a continuation.
fn parse_header_line(data: &[u8]) -> Result<Option<(usize, String, String)>> {
    let Some(i) = find(data, CRLF) else {
        return Ok(None);
    };
    let line = &data[..i];
    let Some(colon) = line.iter().position(|b| *b == b':') else {
        debug!("header without colon: {}", String::from_utf8_lossy(line));
        return Err(Error::HeaderWithoutColon);
    };
    let name = String::from_utf8_lossy(trim_sp_ht(&line[..colon])).to_ascii_lowercase();

    let mut value = trim_sp_ht(&line[colon + 1..]).to_vec();
    let mut p = i + CRLF.len();
    loop {
        match data.get(p) {
            None => return Ok(None),
            Some(b' ' | b'\t') => {
                let Some(q) = find(&data[p..], CRLF) else {
                    return Ok(None);
                };
                let folded = trim_sp_ht(&data[p..p + q]);
                if !folded.is_empty() {
                    if !value.is_empty() {
                        value.push(b' ');
                    }
                    value.extend_from_slice(folded);
                }
                p += q + CRLF.len();
            }
            Some(_) => break,
        }
    }
    Ok(Some((p, name, String::from_utf8_lossy(&value).into_owned())))
}
