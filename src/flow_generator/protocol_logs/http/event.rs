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

use chrono::{SecondsFormat, TimeZone, Utc};
use serde::{Serialize, Serializer};

use public::Timestamp;

use super::transaction::Transaction;
use crate::common::Endpoint;

pub const EVENT_TYPE: &str = "http";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EventStatus {
    #[serde(rename = "OK")]
    Ok,
    Error,
}

impl EventStatus {
    pub fn from_status_code(code: u16) -> Self {
        if code < 400 {
            Self::Ok
        } else {
            Self::Error
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum HeaderValue {
    Text(String),
    Cookies(BTreeMap<String, String>),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct HttpFields {
    pub code: u16,
    pub phrase: String,
    pub content_length: usize,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub host: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub user_agent: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub referer: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_headers: Option<BTreeMap<String, HeaderValue>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_headers: Option<BTreeMap<String, HeaderValue>>,
}

/// One published request/response pair.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HttpEvent {
    #[serde(rename = "type")]
    pub event_type: &'static str,
    pub status: EventStatus,
    // milliseconds
    pub responsetime: u64,
    pub method: String,
    pub path: String,
    pub query: String,
    pub params: String,
    pub bytes_in: usize,
    pub bytes_out: usize,
    #[serde(rename = "@timestamp", serialize_with = "serialize_timestamp")]
    pub timestamp: Timestamp,
    pub src: Endpoint,
    pub dst: Endpoint,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub real_ip: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub user_name: String,
    pub http: HttpFields,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_raw: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_raw: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub notes: Vec<String>,
}

fn serialize_timestamp<S: Serializer>(ts: &Timestamp, serializer: S) -> Result<S::Ok, S::Error> {
    let time = Utc.timestamp_nanos(ts.as_nanos() as i64);
    serializer.serialize_str(&time.to_rfc3339_opts(SecondsFormat::Millis, true))
}

impl From<Transaction> for HttpEvent {
    fn from(t: Transaction) -> Self {
        let (req, resp) = (t.request, t.response);
        let mut notes = req.notes;
        for note in resp.notes {
            if !notes.contains(&note) {
                notes.push(note);
            }
        }
        HttpEvent {
            event_type: EVENT_TYPE,
            status: EventStatus::from_status_code(resp.code),
            responsetime: resp.timestamp.saturating_sub(req.timestamp).as_millis() as u64,
            query: format!("{} {}", req.method, req.request_uri),
            method: req.method,
            path: req.path,
            params: req.params,
            bytes_in: req.size,
            bytes_out: resp.size,
            timestamp: req.timestamp,
            src: req.src,
            dst: req.dst,
            real_ip: req.real_ip,
            user_name: req.user_name,
            http: HttpFields {
                code: resp.code,
                phrase: resp.phrase,
                content_length: resp.content_length,
                host: req.host,
                user_agent: req.user_agent,
                referer: req.referer,
                request_headers: req.headers,
                response_headers: resp.headers,
            },
            request_raw: req.raw,
            response_raw: resp.raw,
            notes,
        }
    }
}
