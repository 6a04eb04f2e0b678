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

// Message post-processing: parameter extraction and redaction, header
// collection and raw capture.

use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv6Addr};

use base64::{
    engine::general_purpose::{STANDARD, STANDARD_NO_PAD},
    Engine,
};
use percent_encoding::percent_decode_str;
use url::{form_urlencoded, Url};

use super::event::HeaderValue;
use super::message::Message;
use crate::config::HttpConfig;

use public::bytes::find;

pub const REDACTED_PARAM: &str = "xxxxx";
pub const REDACTED_HEADER: &str = "REDACTED";

const CRLF: &[u8] = b"\r\n";
const AUTH_HEADERS: [&[u8]; 2] = [b"authorization:", b"proxy-authorization:"];
const BASIC_AUTH_PREFIX: &str = "Basic ";
const URL_BASE: &str = "http://localhost/";

/// Splits a request target into its decoded path and the redacted,
/// re-encoded parameter string. Parameters of an urlencoded `form` body
/// replace query parameters of the same name.
pub fn extract_parameters(
    request_uri: &str,
    form: Option<&[u8]>,
    hide_keywords: &[String],
) -> Result<(String, String), url::ParseError> {
    let base = Url::parse(URL_BASE)?;
    let url = Url::options().base_url(Some(&base)).parse(request_uri)?;
    let path = percent_decode_str(url.path())
        .decode_utf8_lossy()
        .into_owned();

    let mut params = hide_secrets(url.query_pairs(), hide_keywords);
    if let Some(body) = form {
        params.extend(hide_secrets(form_urlencoded::parse(body), hide_keywords));
    }

    let mut serializer = form_urlencoded::Serializer::new(String::new());
    for (key, values) in params.iter() {
        for value in values {
            serializer.append_pair(key, value);
        }
    }
    Ok((path, serializer.finish()))
}

fn hide_secrets<'a, I>(pairs: I, hide_keywords: &[String]) -> BTreeMap<String, Vec<String>>
where
    I: Iterator<Item = (std::borrow::Cow<'a, str>, std::borrow::Cow<'a, str>)>,
{
    let mut params: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (key, value) in pairs {
        let value = if is_secret_parameter(&key, hide_keywords) {
            REDACTED_PARAM.to_owned()
        } else {
            value.into_owned()
        };
        params.entry(key.into_owned()).or_default().push(value);
    }
    params
}

fn is_secret_parameter(key: &str, hide_keywords: &[String]) -> bool {
    let key = key.to_lowercase();
    hide_keywords.iter().any(|k| *k == key)
}

/// Applies header redaction to a completed message.
///
/// Configured `redact-headers` get the value `REDACTED`. With
/// `redact-authorization` the credentials of request authorization headers
/// are overwritten with `*` inside the raw bytes, keeping their length.
pub fn hide_headers(m: &mut Message, config: &HttpConfig) {
    for name in config.redact_headers.iter() {
        if let Some(v) = m.headers.get_mut(name) {
            *v = REDACTED_HEADER.to_owned();
        }
    }

    if !m.is_request || !config.redact_authorization {
        return;
    }

    let (from, to) = m.raw_header_fields();
    let block = &mut m.raw[from..to];
    let mut pos = 0;
    // set while inside an authorization header, so folded lines get masked too
    let mut masking = false;
    while pos < block.len() {
        let line_end = find(&block[pos..], CRLF)
            .map(|i| pos + i)
            .unwrap_or(block.len());
        let folded = matches!(block[pos], b' ' | b'\t');
        let value_start = if folded && masking {
            Some(pos)
        } else {
            AUTH_HEADERS
                .iter()
                .find(|h| {
                    let line = &block[pos..line_end];
                    line.len() >= h.len() && line[..h.len()].eq_ignore_ascii_case(h)
                })
                .map(|h| pos + h.len())
        };
        masking = value_start.is_some();
        if let Some(mut i) = value_start {
            while i < line_end && (block[i] == b' ' || block[i] == b'\t') {
                i += 1;
            }
            block[i..line_end].fill(b'*');
        }
        pos = line_end + CRLF.len();
    }

    for name in ["authorization", "proxy-authorization"] {
        if let Some(v) = m.headers.get_mut(name) {
            *v = "*".to_owned();
        }
    }
    if !m.authorization.is_empty() {
        m.authorization = "*".to_owned();
    }
}

// user of "Authorization: Basic <base64(user:password)>"
pub fn extract_basic_auth_user(authorization: &str) -> Option<String> {
    let prefix = authorization.get(..BASIC_AUTH_PREFIX.len())?;
    if !prefix.eq_ignore_ascii_case(BASIC_AUTH_PREFIX) {
        return None;
    }
    let encoded = authorization[BASIC_AUTH_PREFIX.len()..].trim();
    let decoded = STANDARD
        .decode(encoded)
        .or_else(|_| STANDARD_NO_PAD.decode(encoded))
        .ok()?;
    let decoded = String::from_utf8_lossy(&decoded);
    let (user, _) = decoded.split_once(':')?;
    Some(user.to_owned())
}

/// Splits a host header into host and port. IPv6 brackets are removed.
pub fn extract_host(header: &str) -> (String, Option<u16>) {
    if header.is_empty() || header.parse::<IpAddr>().is_ok() {
        return (header.to_owned(), None);
    }
    let (mut host, mut port) = (header, None);
    if let Some(pos) = header.rfind(':') {
        if let Ok(n) = header[pos + 1..].parse::<u16>() {
            if n > 0 {
                host = &header[..pos];
                port = Some(n);
            }
        }
    }
    if host.len() > 2 && host.starts_with('[') && host.ends_with(']') {
        let inner = &host[1..host.len() - 1];
        if inner.parse::<Ipv6Addr>().is_ok() {
            host = inner;
        }
    }
    (host.to_owned(), port)
}

pub fn split_cookies(value: &str) -> BTreeMap<String, String> {
    value
        .split(';')
        .filter_map(|c| c.split_once('='))
        .map(|(name, value)| {
            (
                name.trim().to_lowercase(),
                strip_quotes(value.trim()).to_owned(),
            )
        })
        .collect()
}

fn strip_quotes(s: &str) -> &str {
    if s.len() > 1 && s.starts_with('"') && s.ends_with('"') {
        &s[1..s.len() - 1]
    } else {
        s
    }
}

// Captured headers for the event; cookie headers are split into
// sub-fields when split_cookie is set.
pub fn collect_headers(m: &Message, split_cookie: bool) -> BTreeMap<String, HeaderValue> {
    let cookie = if m.is_request { "cookie" } else { "set-cookie" };
    m.headers
        .iter()
        .map(|(name, value)| {
            let value = if split_cookie && name == cookie {
                HeaderValue::Cookies(split_cookies(value))
            } else {
                HeaderValue::Text(value.clone())
            };
            (name.clone(), value)
        })
        .collect()
}

// Raw capture: headers always, the body only for content types asked for.
// Chunked bodies are captured de-chunked.
pub fn cut_message_body(m: &Message, include_body_for: &[String]) -> Vec<u8> {
    let mut raw = m.raw_headers().to_vec();
    if m.content_type.is_empty()
        || include_body_for
            .iter()
            .any(|t| m.content_type.contains(t.as_str()))
    {
        raw.extend_from_slice(m.body());
    }
    raw
}
