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

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use ahash::AHashMap;
use log::{debug, info, warn};

use public::{
    counter::{Counter, CounterType, CounterValue, RefCountable},
    ChronoMap, Timestamp,
};

use crate::common::{MetaPacket, PacketDirection, TcpFlags, TcpTuple};
use crate::flow_generator::protocol_logs::{
    L7Analyzer, L7ConnectionData, L7ProtocolAnalyzer, ParseParam,
};

struct Connection {
    analyzer: usize,
    data: Option<L7ConnectionData>,
    // next expected sequence number per direction
    next_seq: [Option<u32>; 2],
    fin: [bool; 2],
}

impl Connection {
    fn new(analyzer: usize) -> Self {
        Self {
            analyzer,
            data: None,
            next_seq: [None; 2],
            fin: [false; 2],
        }
    }

    fn closed(&self) -> bool {
        self.fin[0] && self.fin[1]
    }
}

#[derive(Debug, Default)]
pub struct DispatcherCounter {
    pub packets: AtomicU64,
    pub ignored: AtomicU64,
    pub connections: AtomicU64,
    pub retransmissions: AtomicU64,
    pub gaps: AtomicU64,
    pub resets: AtomicU64,
    pub closed: AtomicU64,
    pub expired: AtomicU64,
}

impl RefCountable for DispatcherCounter {
    fn get_counters(&self) -> Vec<Counter> {
        vec![
            (
                "packets",
                CounterType::Counted,
                CounterValue::Unsigned(self.packets.load(Ordering::Relaxed)),
            ),
            (
                "ignored-packets",
                CounterType::Counted,
                CounterValue::Unsigned(self.ignored.load(Ordering::Relaxed)),
            ),
            (
                "connections",
                CounterType::Counted,
                CounterValue::Unsigned(self.connections.load(Ordering::Relaxed)),
            ),
            (
                "retransmissions",
                CounterType::Counted,
                CounterValue::Unsigned(self.retransmissions.load(Ordering::Relaxed)),
            ),
            (
                "gaps",
                CounterType::Counted,
                CounterValue::Unsigned(self.gaps.load(Ordering::Relaxed)),
            ),
            (
                "state-resets",
                CounterType::Counted,
                CounterValue::Unsigned(self.resets.load(Ordering::Relaxed)),
            ),
            (
                "closed-connections",
                CounterType::Counted,
                CounterValue::Unsigned(self.closed.load(Ordering::Relaxed)),
            ),
            (
                "expired-connections",
                CounterType::Counted,
                CounterValue::Unsigned(self.expired.load(Ordering::Relaxed)),
            ),
        ]
    }
}

/// Feeds TCP segments to the analyzer bound to the connection's server port.
///
/// Connections are keyed by their client to server tuple. Payload is handed
/// over in sequence order: retransmitted bytes are trimmed and holes are
/// reported as gaps. Connections idle for longer than their analyzer's
/// connection timeout are expired on the next packet, measured in packet
/// time.
pub struct Dispatcher {
    analyzers: Vec<L7Analyzer>,
    ports: AHashMap<u16, usize>,
    connections: ChronoMap<Timestamp, TcpTuple, Connection>,
    counter: Arc<DispatcherCounter>,
}

impl Dispatcher {
    pub fn new(analyzers: Vec<L7Analyzer>) -> Self {
        let mut ports = AHashMap::new();
        for (i, analyzer) in analyzers.iter().enumerate() {
            for port in analyzer.ports() {
                if let Some(prev) = ports.insert(port, i) {
                    warn!(
                        "port {} claimed by analyzers {} and {}, using the latter",
                        port, prev, i
                    );
                }
            }
        }
        info!("dispatching {} ports to {} analyzers", ports.len(), analyzers.len());
        Self {
            analyzers,
            ports,
            connections: ChronoMap::new(),
            counter: Arc::new(DispatcherCounter::default()),
        }
    }

    pub fn analyzers(&self) -> &[L7Analyzer] {
        &self.analyzers
    }

    pub fn counter(&self) -> &Arc<DispatcherCounter> {
        &self.counter
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    // Returns the connection key and the packet's direction on it.
    fn lookup(&mut self, packet: &MetaPacket) -> Option<(TcpTuple, PacketDirection)> {
        let tuple = packet.tuple;
        if self.connections.contains_key(&tuple) {
            return Some((tuple, PacketDirection::ClientToServer));
        }
        let reversed = tuple.reversed();
        if self.connections.contains_key(&reversed) {
            return Some((reversed, PacketDirection::ServerToClient));
        }
        if packet.flags.contains(TcpFlags::RST) {
            return None;
        }

        let (key, direction, analyzer) = if let Some(i) = self.ports.get(&tuple.dst_port) {
            (tuple, PacketDirection::ClientToServer, *i)
        } else if let Some(i) = self.ports.get(&tuple.src_port) {
            (reversed, PacketDirection::ServerToClient, *i)
        } else {
            return None;
        };
        debug!("new connection {}", key);
        self.counter.connections.fetch_add(1, Ordering::Relaxed);
        let timeout = self.analyzers[analyzer].connection_timeout();
        self.connections
            .insert(packet.timestamp + timeout, key, Connection::new(analyzer));
        Some((key, direction))
    }

    pub fn inject_meta_packet(&mut self, packet: &MetaPacket) {
        self.counter.packets.fetch_add(1, Ordering::Relaxed);
        self.flush_idle(packet.timestamp);

        let Some((key, direction)) = self.lookup(packet) else {
            self.counter.ignored.fetch_add(1, Ordering::Relaxed);
            return;
        };
        let Some(conn) = self.connections.get_mut(&key) else {
            return;
        };
        let analyzer = &self.analyzers[conn.analyzer];
        let idx = direction.index();

        if packet.flags.contains(TcpFlags::SYN) {
            conn.next_seq[idx] = Some(packet.seq.wrapping_add(1));
        } else if !packet.payload.is_empty() {
            let mut payload = &packet.payload[..];
            if let Some(expected) = conn.next_seq[idx] {
                let diff = packet.seq.wrapping_sub(expected) as i32;
                if diff > 0 {
                    self.counter.gaps.fetch_add(1, Ordering::Relaxed);
                    if analyzer.gap_in_stream(&key, direction, diff as usize, &mut conn.data) {
                        debug!("reset state of {} after gap of {} bytes", key, diff);
                        self.counter.resets.fetch_add(1, Ordering::Relaxed);
                        conn.data = None;
                    }
                } else if diff < 0 {
                    let overlap = diff.unsigned_abs() as usize;
                    if overlap >= payload.len() {
                        self.counter
                            .retransmissions
                            .fetch_add(1, Ordering::Relaxed);
                        payload = &[];
                    } else {
                        payload = &payload[overlap..];
                    }
                }
            }
            if !payload.is_empty() {
                let param = ParseParam {
                    timestamp: packet.timestamp,
                    payload,
                };
                analyzer.parse(&param, &key, direction, &mut conn.data);
                conn.next_seq[idx] =
                    Some(packet.seq.wrapping_add(packet.payload.len() as u32));
            }
        }

        if packet.flags.contains(TcpFlags::RST) {
            for dir in [direction, direction.reversed()] {
                if !conn.fin[dir.index()] {
                    conn.fin[dir.index()] = true;
                    analyzer.received_fin(&key, dir, &mut conn.data);
                }
            }
        } else if packet.flags.contains(TcpFlags::FIN) && !conn.fin[idx] {
            conn.fin[idx] = true;
            analyzer.received_fin(&key, direction, &mut conn.data);
        }

        if conn.closed() {
            debug!("connection {} closed", key);
            self.counter.closed.fetch_add(1, Ordering::Relaxed);
            self.connections.remove(&key);
        } else {
            let timeout = analyzer.connection_timeout();
            self.connections
                .move_to_time(&key, packet.timestamp + timeout);
        }
    }

    /// Expires connections idle past their timeout at `now`.
    pub fn flush_idle(&mut self, now: Timestamp) {
        let analyzers = &self.analyzers;
        let counter = &self.counter;
        self.connections.forward_time(now, |key, conn| {
            debug!("connection {} expired", key);
            counter.expired.fetch_add(1, Ordering::Relaxed);
            analyzers[conn.analyzer].expired(key, &mut conn.data);
            None
        });
    }

    /// Expires every connection, used when the input ends.
    pub fn flush_all(&mut self) {
        let analyzers = &self.analyzers;
        for (_, key, mut conn) in self.connections.drain() {
            self.counter.expired.fetch_add(1, Ordering::Relaxed);
            analyzers[conn.analyzer].expired(&key, &mut conn.data);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr};
    use std::time::Duration;

    use parking_lot::Mutex;

    use super::*;
    use crate::common::meta_packet::tests::build_frame;
    use crate::config::HttpConfig;
    use crate::flow_generator::protocol_logs::http::{HttpAnalyzer, HttpEvent};

    const REQUEST: &[u8] = b"GET /index.html HTTP/1.1\r\nHost: a\r\n\r\n";
    const RESPONSE: &[u8] = b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello";

    fn client() -> TcpTuple {
        TcpTuple::new(
            IpAddr::V4(Ipv4Addr::new(10, 1, 1, 1)),
            40000,
            IpAddr::V4(Ipv4Addr::new(10, 1, 1, 2)),
            80,
        )
    }

    fn server() -> TcpTuple {
        client().reversed()
    }

    fn setup() -> (Dispatcher, Arc<Mutex<Vec<HttpEvent>>>) {
        let events = Arc::new(Mutex::new(vec![]));
        let sink = events.clone();
        let analyzer = HttpAnalyzer::new(
            HttpConfig::default(),
            Arc::new(move |e: HttpEvent| sink.lock().push(e)),
        );
        (Dispatcher::new(vec![analyzer.into()]), events)
    }

    fn packet(millis: u64, tuple: TcpTuple, seq: u32, flags: TcpFlags, payload: &[u8]) -> MetaPacket {
        MetaPacket {
            timestamp: Timestamp::from_millis(millis),
            tuple,
            seq,
            flags,
            payload: payload.to_vec(),
        }
    }

    fn handshake(d: &mut Dispatcher) {
        d.inject_meta_packet(&packet(0, client(), 99, TcpFlags::SYN, b""));
        d.inject_meta_packet(&packet(1, server(), 499, TcpFlags::SYN_ACK, b""));
    }

    #[test]
    fn request_response_over_frames() {
        let (mut d, events) = setup();
        handshake(&mut d);
        let frame = build_frame(&client(), 100, TcpFlags::PSH | TcpFlags::ACK, REQUEST);
        let p = MetaPacket::from_link_layer(Timestamp::from_millis(2), 1, &frame).unwrap();
        d.inject_meta_packet(&p);
        d.inject_meta_packet(&packet(52, server(), 500, TcpFlags::PSH | TcpFlags::ACK, RESPONSE));

        let events = events.lock();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].responsetime, 50);
        assert_eq!(events[0].path, "/index.html");
        assert_eq!(events[0].src.port, 40000);
    }

    #[test]
    fn retransmission_is_skipped() {
        let (mut d, events) = setup();
        handshake(&mut d);
        d.inject_meta_packet(&packet(2, client(), 100, TcpFlags::ACK, REQUEST));
        d.inject_meta_packet(&packet(3, client(), 100, TcpFlags::ACK, REQUEST));
        d.inject_meta_packet(&packet(4, server(), 500, TcpFlags::ACK, RESPONSE));
        assert_eq!(events.lock().len(), 1);
        assert_eq!(d.counter().retransmissions.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn overlap_is_trimmed() {
        let (mut d, events) = setup();
        handshake(&mut d);
        d.inject_meta_packet(&packet(2, client(), 100, TcpFlags::ACK, &REQUEST[..10]));
        d.inject_meta_packet(&packet(3, client(), 105, TcpFlags::ACK, &REQUEST[5..]));
        d.inject_meta_packet(&packet(4, server(), 500, TcpFlags::ACK, RESPONSE));
        let events = events.lock();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].bytes_in, REQUEST.len());
    }

    #[test]
    fn gap_in_body() {
        let (mut d, events) = setup();
        handshake(&mut d);
        d.inject_meta_packet(&packet(2, client(), 100, TcpFlags::ACK, REQUEST));
        let head = RESPONSE.len() - 5;
        d.inject_meta_packet(&packet(3, server(), 500, TcpFlags::ACK, &RESPONSE[..head + 1]));
        // "ell" lost
        let seq = 500 + head as u32 + 4;
        d.inject_meta_packet(&packet(4, server(), seq, TcpFlags::ACK, &RESPONSE[head + 4..]));
        let events = events.lock();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].notes.len(), 1);
    }

    #[test]
    fn gap_in_headers_resets_state() {
        let (mut d, events) = setup();
        handshake(&mut d);
        d.inject_meta_packet(&packet(2, client(), 100, TcpFlags::ACK, &REQUEST[..8]));
        d.inject_meta_packet(&packet(3, client(), 120, TcpFlags::ACK, &REQUEST[20..]));
        assert_eq!(d.counter().resets.load(Ordering::Relaxed), 1);
        d.inject_meta_packet(&packet(4, server(), 500, TcpFlags::ACK, RESPONSE));
        assert!(events.lock().is_empty());
    }

    #[test]
    fn unknown_port_is_ignored() {
        let (mut d, _) = setup();
        let mut tuple = client();
        tuple.dst_port = 5432;
        d.inject_meta_packet(&packet(0, tuple, 1, TcpFlags::ACK, b"Q"));
        assert_eq!(d.connection_count(), 0);
        assert_eq!(d.counter().ignored.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn midstream_pickup_from_server_side() {
        let (mut d, events) = setup();
        d.inject_meta_packet(&packet(0, client(), 7, TcpFlags::ACK, REQUEST));
        d.inject_meta_packet(&packet(9, server(), 3, TcpFlags::ACK, RESPONSE));
        assert_eq!(events.lock().len(), 1);

        // first packet seen is from the server
        let (mut d, _) = setup();
        d.inject_meta_packet(&packet(0, server(), 3, TcpFlags::ACK, RESPONSE));
        assert_eq!(d.connection_count(), 1);
    }

    #[test]
    fn close_delimited_body() {
        let (mut d, events) = setup();
        handshake(&mut d);
        d.inject_meta_packet(&packet(2, client(), 100, TcpFlags::ACK, REQUEST));
        let response = b"HTTP/1.0 200 OK\r\n\r\nbody until close";
        d.inject_meta_packet(&packet(3, server(), 500, TcpFlags::ACK, response));
        assert!(events.lock().is_empty());
        d.inject_meta_packet(&packet(4, server(), 500 + response.len() as u32, TcpFlags::FIN_ACK, b""));
        assert_eq!(events.lock().len(), 1);
        assert_eq!(events.lock()[0].http.content_length, 16);

        d.inject_meta_packet(&packet(5, client(), 100 + REQUEST.len() as u32, TcpFlags::FIN_ACK, b""));
        assert_eq!(d.connection_count(), 0);
        assert_eq!(d.counter().closed.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn reset_closes_connection() {
        let (mut d, _) = setup();
        handshake(&mut d);
        d.inject_meta_packet(&packet(2, client(), 100, TcpFlags::RST, b""));
        assert_eq!(d.connection_count(), 0);
    }

    #[test]
    fn idle_connection_expires() {
        let (mut d, events) = setup();
        handshake(&mut d);
        d.inject_meta_packet(&packet(2, client(), 100, TcpFlags::ACK, REQUEST));
        d.inject_meta_packet(&packet(3, server(), 500, TcpFlags::ACK, b"HTTP/1.0 200 OK\r\n\r\nxyz"));

        d.flush_idle(Timestamp::from_millis(3) + Duration::from_secs(5));
        assert_eq!(d.connection_count(), 1);
        d.flush_idle(Timestamp::from_millis(3) + Duration::from_secs(11));
        assert_eq!(d.connection_count(), 0);
        assert_eq!(events.lock().len(), 1);
        assert_eq!(d.counter().expired.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn flush_all_drains_connections() {
        let (mut d, events) = setup();
        d.inject_meta_packet(&packet(0, client(), 100, TcpFlags::ACK, REQUEST));
        d.inject_meta_packet(&packet(1, server(), 500, TcpFlags::ACK, b"HTTP/1.1 200 OK\r\nConnection: close\r\n\r\nab"));
        d.flush_all();
        assert_eq!(d.connection_count(), 0);
        assert_eq!(events.lock().len(), 1);
    }
}
