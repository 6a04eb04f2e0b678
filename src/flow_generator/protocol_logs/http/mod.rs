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

mod event;
mod message;
mod parser;
mod postprocess;
mod stream;
mod transaction;

pub use event::{EventStatus, HeaderValue, HttpEvent, HttpFields};
pub use message::{Message, Version};
pub use parser::MessageParser;
pub use postprocess::{extract_parameters, REDACTED_HEADER, REDACTED_PARAM};
pub use stream::{ParseState, Stream};
pub use transaction::{
    RequestLeg, ResponseLeg, Transaction, TransactionCounter, TransactionTable,
};

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use std::time::Duration;

use log::{debug, warn};

use public::counter::{Counter, CounterType, CounterValue, RefCountable};

use self::postprocess::{
    collect_headers, cut_message_body, extract_basic_auth_user, extract_host, hide_headers,
};
use super::{L7ConnectionData, L7ProtocolAnalyzer, ParseParam};
use crate::common::{PacketDirection, TcpTuple};
use crate::config::HttpConfig;
use crate::sender::EventSender;

pub const NOTE_REQUEST_PACKET_LOSS: &str = "Packet loss while capturing the request";
pub const NOTE_RESPONSE_PACKET_LOSS: &str = "Packet loss while capturing the response";
pub const NOTE_HOST_PORT_MISMATCH: &str = "Host header port number mismatch";

/// Per-connection state: one stream for each direction, created on the
/// first payload seen in that direction.
#[derive(Debug, Default)]
pub struct HttpConnectionData {
    streams: [Option<Stream>; 2],
}

impl HttpConnectionData {
    pub fn stream(&self, direction: PacketDirection) -> Option<&Stream> {
        self.streams[direction.index()].as_ref()
    }
}

#[derive(Debug, Default)]
pub struct HttpCounter {
    pub messages: AtomicU64,
    pub parse_errors: AtomicU64,
    pub oversized_streams: AtomicU64,
    pub gaps_tolerated: AtomicU64,
    pub gaps_dropped: AtomicU64,
}

impl RefCountable for HttpCounter {
    fn get_counters(&self) -> Vec<Counter> {
        vec![
            (
                "messages",
                CounterType::Counted,
                CounterValue::Unsigned(self.messages.load(Ordering::Relaxed)),
            ),
            (
                "parse-errors",
                CounterType::Counted,
                CounterValue::Unsigned(self.parse_errors.load(Ordering::Relaxed)),
            ),
            (
                "oversized-streams",
                CounterType::Counted,
                CounterValue::Unsigned(self.oversized_streams.load(Ordering::Relaxed)),
            ),
            (
                "gaps-tolerated",
                CounterType::Counted,
                CounterValue::Unsigned(self.gaps_tolerated.load(Ordering::Relaxed)),
            ),
            (
                "gaps-dropped",
                CounterType::Counted,
                CounterValue::Unsigned(self.gaps_dropped.load(Ordering::Relaxed)),
            ),
        ]
    }
}

enum GapVerdict {
    Ignore,
    Tolerate,
    Complete,
    Drop,
}

// Missing bytes are survivable only inside a body, where they cost payload
// but not framing.
fn message_gap(s: &mut Stream, nbytes: usize) -> GapVerdict {
    match s.parse_state {
        ParseState::Start if !s.has_partial_message() => GapVerdict::Ignore,
        ParseState::Body => {
            let m = &mut s.message;
            m.add_note(if m.is_request {
                NOTE_REQUEST_PACKET_LOSS
            } else {
                NOTE_RESPONSE_PACKET_LOSS
            });
            if m.is_read_until_close() {
                s.body_received += nbytes;
                m.content_length += nbytes;
                GapVerdict::Tolerate
            } else if s.data.len() - s.parse_offset + nbytes
                >= m.content_length.saturating_sub(s.body_received)
            {
                GapVerdict::Complete
            } else {
                s.body_received += nbytes;
                GapVerdict::Tolerate
            }
        }
        _ => GapVerdict::Drop,
    }
}

pub struct HttpAnalyzer {
    config: HttpConfig,
    table: Arc<TransactionTable>,
    sender: Arc<dyn EventSender>,
    counter: Arc<HttpCounter>,
}

impl HttpAnalyzer {
    pub fn new(config: HttpConfig, sender: Arc<dyn EventSender>) -> Self {
        let table = Arc::new(TransactionTable::new(config.transaction_timeout));
        Self {
            config,
            table,
            sender,
            counter: Arc::new(HttpCounter::default()),
        }
    }

    pub fn config(&self) -> &HttpConfig {
        &self.config
    }

    pub fn table(&self) -> &Arc<TransactionTable> {
        &self.table
    }

    pub fn counter(&self) -> &Arc<HttpCounter> {
        &self.counter
    }

    fn connection_data(data: &mut Option<L7ConnectionData>) -> &mut HttpConnectionData {
        match data.get_or_insert_with(|| L7ConnectionData::Http(HttpConnectionData::default())) {
            L7ConnectionData::Http(d) => d,
        }
    }

    fn message_complete(&self, mut m: Message) {
        self.counter.messages.fetch_add(1, Ordering::Relaxed);
        let user_name = if self.config.redact_authorization {
            String::new()
        } else {
            extract_basic_auth_user(&m.authorization).unwrap_or_default()
        };
        hide_headers(&mut m, &self.config);
        if m.is_request {
            self.received_request(m, user_name);
        } else {
            self.received_response(m);
        }
    }

    fn received_request(&self, mut m: Message, user_name: String) {
        let (src, dst) = match m.direction {
            PacketDirection::ClientToServer => (m.tuple.src(), m.tuple.dst()),
            PacketDirection::ServerToClient => (m.tuple.dst(), m.tuple.src()),
        };

        let form = (m.content_length > 0 && m.content_type.contains("urlencoded"))
            .then(|| m.body());
        let (path, params) =
            match extract_parameters(&m.request_uri, form, &self.config.hide_keywords) {
                Ok(r) => r,
                Err(e) => {
                    warn!("Fail to parse HTTP parameters: {}", e);
                    let path = m.request_uri.split('?').next().unwrap_or_default();
                    (path.to_owned(), String::new())
                }
            };

        let (host, port) = extract_host(&m.host);
        if matches!(port, Some(p) if p != dst.port) {
            m.add_note(NOTE_HOST_PORT_MISMATCH);
        }

        let headers = self
            .config
            .send_headers()
            .then(|| collect_headers(&m, self.config.split_cookie));
        let raw = self.config.send_request.then(|| {
            String::from_utf8_lossy(&cut_message_body(&m, &self.config.include_body_for))
                .into_owned()
        });

        debug!("http request {} {} on {}", m.method, m.request_uri, m.tuple);
        self.table.on_request(RequestLeg {
            timestamp: m.timestamp,
            tuple: m.tuple,
            src,
            dst,
            method: m.method,
            request_uri: m.request_uri,
            path,
            params,
            real_ip: m.real_ip,
            user_name,
            host,
            user_agent: m.user_agent,
            referer: m.referer,
            headers,
            raw,
            size: m.size,
            notes: m.notes,
        });
    }

    fn received_response(&self, m: Message) {
        let headers = self
            .config
            .send_headers()
            .then(|| collect_headers(&m, self.config.split_cookie));
        let raw = self.config.send_response.then(|| {
            String::from_utf8_lossy(&cut_message_body(&m, &self.config.include_body_for))
                .into_owned()
        });

        debug!("http response {} on {}", m.status_code, m.tuple);
        let response = ResponseLeg {
            timestamp: m.timestamp,
            code: m.status_code,
            phrase: m.status_phrase,
            content_length: m.content_length,
            headers,
            raw,
            size: m.size,
            notes: m.notes,
        };
        if let Some(t) = self.table.on_response(&m.tuple, response) {
            self.sender.send(HttpEvent::from(t));
        }
    }
}

impl L7ProtocolAnalyzer for HttpAnalyzer {
    fn ports(&self) -> Vec<u16> {
        self.config.ports.clone()
    }

    fn connection_timeout(&self) -> Duration {
        self.config.transaction_timeout
    }

    fn parse(
        &self,
        param: &ParseParam,
        tuple: &TcpTuple,
        direction: PacketDirection,
        data: &mut Option<L7ConnectionData>,
    ) {
        let conn = Self::connection_data(data);
        let slot = &mut conn.streams[direction.index()];
        let stream = slot.get_or_insert_with(|| Stream::new(param.timestamp, *tuple, direction));

        let parser = MessageParser::new(&self.config);
        let dropped = match stream.append(param.timestamp, param.payload, self.config.max_message_size)
        {
            Err(e) => {
                debug!("drop {} stream of {}: {}", direction, tuple, e);
                self.counter.oversized_streams.fetch_add(1, Ordering::Relaxed);
                true
            }
            Ok(_) => loop {
                match parser.parse(stream) {
                    Ok(true) => self.message_complete(stream.take_message()),
                    Ok(false) => break false,
                    Err(e) => {
                        debug!("drop {} stream of {}: {}", direction, tuple, e);
                        self.counter.parse_errors.fetch_add(1, Ordering::Relaxed);
                        break true;
                    }
                }
            },
        };
        if dropped {
            *slot = None;
        }
    }

    fn received_fin(
        &self,
        tuple: &TcpTuple,
        direction: PacketDirection,
        data: &mut Option<L7ConnectionData>,
    ) {
        let Some(L7ConnectionData::Http(conn)) = data else {
            return;
        };
        let Some(mut stream) = conn.streams[direction.index()].take() else {
            return;
        };
        if stream.first_line_received() {
            debug!("{} of {} closed inside a message", direction, tuple);
            self.message_complete(stream.take_partial_message());
        }
    }

    fn gap_in_stream(
        &self,
        tuple: &TcpTuple,
        direction: PacketDirection,
        nbytes: usize,
        data: &mut Option<L7ConnectionData>,
    ) -> bool {
        let Some(L7ConnectionData::Http(conn)) = data else {
            return false;
        };
        let slot = &mut conn.streams[direction.index()];
        let Some(stream) = slot.as_mut() else {
            return false;
        };
        match message_gap(stream, nbytes) {
            GapVerdict::Ignore => false,
            GapVerdict::Tolerate => {
                self.counter.gaps_tolerated.fetch_add(1, Ordering::Relaxed);
                false
            }
            GapVerdict::Complete => {
                self.counter.gaps_tolerated.fetch_add(1, Ordering::Relaxed);
                self.message_complete(stream.take_partial_message());
                false
            }
            GapVerdict::Drop => {
                debug!(
                    "gap of {} bytes in {} headers of {}, dropping stream",
                    nbytes, direction, tuple
                );
                self.counter.gaps_dropped.fetch_add(1, Ordering::Relaxed);
                *slot = None;
                true
            }
        }
    }

    fn expired(&self, tuple: &TcpTuple, data: &mut Option<L7ConnectionData>) {
        let Some(L7ConnectionData::Http(conn)) = data.take() else {
            return;
        };
        // requests first so that the table can pair what follows
        for mut stream in conn.streams.into_iter().flatten() {
            if stream.first_line_received() {
                debug!("connection {} expired inside a message", tuple);
                self.message_complete(stream.take_partial_message());
            }
        }
    }
}

impl RefCountable for HttpAnalyzer {
    fn get_counters(&self) -> Vec<Counter> {
        let mut counters = self.counter.get_counters();
        counters.extend(self.table.counter().get_counters());
        counters
    }
}
