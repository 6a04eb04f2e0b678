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

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use log::debug;
use pcap_parser::traits::PcapReaderIterator;
use pcap_parser::{LegacyPcapReader, PcapBlockOwned, PcapError};

use public::Timestamp;

use crate::error::{Error, Result};

const BUFFER_SIZE: usize = 65536;
const LINKTYPE_ETHERNET: i32 = 1;

#[derive(Debug, Clone, PartialEq)]
pub struct RawFrame {
    pub timestamp: Timestamp,
    pub link_type: i32,
    pub data: Vec<u8>,
}

/// Sequential reader of classic pcap captures, microsecond or nanosecond.
pub struct PcapReader<R: Read> {
    reader: LegacyPcapReader<R>,
    link_type: i32,
    nanosecond: bool,
    frames: u64,
}

impl PcapReader<BufReader<File>> {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)
            .map_err(|e| Error::PcapFile(format!("open {}: {}", path.display(), e)))?;
        Self::new(BufReader::new(file))
    }
}

impl<R: Read> PcapReader<R> {
    pub fn new(reader: R) -> Result<Self> {
        let reader = LegacyPcapReader::new(BUFFER_SIZE, reader)
            .map_err(|e| Error::PcapFile(format!("invalid pcap header: {}", e)))?;
        Ok(Self {
            reader,
            link_type: LINKTYPE_ETHERNET,
            nanosecond: false,
            frames: 0,
        })
    }

    pub fn link_type(&self) -> i32 {
        self.link_type
    }

    pub fn frame_count(&self) -> u64 {
        self.frames
    }

    pub fn next_frame(&mut self) -> Result<Option<RawFrame>> {
        loop {
            match self.reader.next() {
                Ok((offset, block)) => {
                    let frame = match block {
                        PcapBlockOwned::LegacyHeader(header) => {
                            self.link_type = header.network.0;
                            self.nanosecond = header.is_nanosecond_precision();
                            debug!(
                                "pcap link type {}, nanosecond {}",
                                self.link_type, self.nanosecond
                            );
                            None
                        }
                        PcapBlockOwned::Legacy(packet) => {
                            let subsec = if self.nanosecond {
                                packet.ts_usec as u64
                            } else {
                                packet.ts_usec as u64 * 1000
                            };
                            let nanos = Timestamp::from_secs(packet.ts_sec as u64).as_nanos() + subsec;
                            Some(RawFrame {
                                timestamp: Timestamp::from_nanos(nanos),
                                link_type: self.link_type,
                                data: packet.data.to_vec(),
                            })
                        }
                        _ => None,
                    };
                    self.reader.consume(offset);
                    if let Some(frame) = frame {
                        self.frames += 1;
                        return Ok(Some(frame));
                    }
                }
                Err(PcapError::Eof) => return Ok(None),
                Err(PcapError::Incomplete(_)) => {
                    self.reader
                        .refill()
                        .map_err(|e| Error::PcapFile(format!("refill: {}", e)))?;
                }
                Err(e) => return Err(Error::PcapFile(format!("parse: {}", e))),
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::io::Cursor;

    use super::*;

    // classic little endian microsecond capture
    pub(crate) fn build_pcap(link_type: u32, frames: &[(Timestamp, Vec<u8>)]) -> Vec<u8> {
        let mut out = vec![];
        out.extend_from_slice(&0xa1b2c3d4u32.to_le_bytes());
        out.extend_from_slice(&2u16.to_le_bytes());
        out.extend_from_slice(&4u16.to_le_bytes());
        out.extend_from_slice(&0i32.to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes());
        out.extend_from_slice(&65535u32.to_le_bytes());
        out.extend_from_slice(&link_type.to_le_bytes());
        for (ts, data) in frames {
            out.extend_from_slice(&(ts.as_secs() as u32).to_le_bytes());
            out.extend_from_slice(&(ts.subsec_nanos() / 1000).to_le_bytes());
            out.extend_from_slice(&(data.len() as u32).to_le_bytes());
            out.extend_from_slice(&(data.len() as u32).to_le_bytes());
            out.extend_from_slice(data);
        }
        out
    }

    #[test]
    fn read_frames() {
        let ts = Timestamp::from_micros(1_700_000_000_123_456);
        let capture = build_pcap(1, &[(ts, vec![1, 2, 3]), (ts, vec![4; 100])]);
        let mut reader = PcapReader::new(Cursor::new(capture)).unwrap();

        let first = reader.next_frame().unwrap().unwrap();
        assert_eq!(first.timestamp, ts);
        assert_eq!(first.link_type, 1);
        assert_eq!(first.data, vec![1, 2, 3]);
        assert_eq!(reader.next_frame().unwrap().unwrap().data.len(), 100);
        assert_eq!(reader.next_frame().unwrap(), None);
        assert_eq!(reader.frame_count(), 2);
    }

    #[test]
    fn raw_ip_link_type() {
        let capture = build_pcap(101, &[(Timestamp::ZERO, vec![0x45])]);
        let mut reader = PcapReader::new(Cursor::new(capture)).unwrap();
        assert_eq!(reader.next_frame().unwrap().unwrap().link_type, 101);
        assert_eq!(reader.link_type(), 101);
    }

    #[test]
    fn not_a_pcap() {
        assert!(PcapReader::new(Cursor::new(b"definitely not a capture file".to_vec())).is_err());
    }
}
