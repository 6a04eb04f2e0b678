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

mod reader;

pub use reader::{PcapReader, RawFrame};

use std::io::Read;

use log::{debug, info};

use crate::common::MetaPacket;
use crate::dispatcher::Dispatcher;
use crate::error::Result;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReplayStats {
    pub frames: u64,
    pub tcp_packets: u64,
    pub skipped: u64,
}

/// Pushes every frame of a capture through the dispatcher, then expires
/// the connections left open.
pub fn replay<R: Read>(reader: &mut PcapReader<R>, dispatcher: &mut Dispatcher) -> Result<ReplayStats> {
    let mut stats = ReplayStats::default();
    while let Some(frame) = reader.next_frame()? {
        stats.frames += 1;
        match MetaPacket::from_link_layer(frame.timestamp, frame.link_type, &frame.data) {
            Ok(packet) => {
                stats.tcp_packets += 1;
                dispatcher.inject_meta_packet(&packet);
            }
            Err(e) => {
                debug!("skip frame {}: {}", stats.frames, e);
                stats.skipped += 1;
            }
        }
    }
    dispatcher.flush_all();
    info!(
        "replayed {} frames, {} tcp packets, {} skipped",
        stats.frames, stats.tcp_packets, stats.skipped
    );
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::Arc;

    use parking_lot::Mutex;

    use super::reader::tests::build_pcap;
    use super::*;
    use crate::common::meta_packet::tests::build_frame;
    use crate::common::{TcpFlags, TcpTuple};
    use crate::config::HttpConfig;
    use crate::flow_generator::protocol_logs::http::{HttpAnalyzer, HttpEvent};
    use public::Timestamp;

    #[test]
    fn replay_capture() {
        let client = TcpTuple::new(
            IpAddr::V4(Ipv4Addr::new(172, 16, 0, 1)),
            50000,
            IpAddr::V4(Ipv4Addr::new(172, 16, 0, 2)),
            8080,
        );
        let request = b"GET /a?token=t HTTP/1.1\r\nHost: b\r\n\r\n";
        let response = b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\n\r\n";
        let frames = vec![
            (
                Timestamp::from_millis(1_000),
                build_frame(&client, 1, TcpFlags::PSH | TcpFlags::ACK, request),
            ),
            // arp-sized junk
            (Timestamp::from_millis(1_001), vec![0u8; 42]),
            (
                Timestamp::from_millis(1_030),
                build_frame(&client.reversed(), 1, TcpFlags::PSH | TcpFlags::ACK, response),
            ),
        ];
        let capture = build_pcap(1, &frames);

        let events = Arc::new(Mutex::new(vec![]));
        let sink = events.clone();
        let analyzer = HttpAnalyzer::new(
            HttpConfig {
                hide_keywords: vec!["token".into()],
                ..Default::default()
            },
            Arc::new(move |e: HttpEvent| sink.lock().push(e)),
        );
        let mut dispatcher = Dispatcher::new(vec![analyzer.into()]);
        let mut reader = PcapReader::new(Cursor::new(capture)).unwrap();

        let stats = replay(&mut reader, &mut dispatcher).unwrap();
        assert_eq!(
            stats,
            ReplayStats {
                frames: 3,
                tcp_packets: 2,
                skipped: 1
            }
        );
        let events = events.lock();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].responsetime, 30);
        assert_eq!(events[0].params, "token=xxxxx");
        assert_eq!(events[0].http.code, 404);
        assert_eq!(dispatcher.connection_count(), 0);
    }
}
