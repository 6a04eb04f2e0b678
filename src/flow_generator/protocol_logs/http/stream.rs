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

use std::mem;

use public::Timestamp;

use super::message::Message;
use crate::common::{PacketDirection, TcpTuple};
use crate::flow_generator::error::{Error, Result};

// consumed bytes are shifted out once this many pile up at the buffer head
const COMPACT_THRESHOLD: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ParseState {
    #[default]
    Start,
    FirstLine,
    Headers,
    Body,
    BodyChunkedStart,
    BodyChunked,
    BodyChunkedWaitFinalCrlf,
}

/// One direction of a connection.
///
/// `data[..consumed]` belongs to messages already handed out and is only
/// kept until the next compaction. `parse_offset` never goes past the end
/// of `data`.
#[derive(Debug)]
pub struct Stream {
    pub(super) data: Vec<u8>,
    pub(super) consumed: usize,
    pub(super) parse_offset: usize,
    pub(super) parse_state: ParseState,
    pub(super) body_received: usize,
    pub(super) last_timestamp: Timestamp,
    pub(super) message: Message,
}

impl Stream {
    pub fn new(timestamp: Timestamp, tuple: TcpTuple, direction: PacketDirection) -> Self {
        let mut message = Message::new(timestamp);
        message.tuple = tuple;
        message.direction = direction;
        Self {
            data: Vec::new(),
            consumed: 0,
            parse_offset: 0,
            parse_state: ParseState::Start,
            body_received: 0,
            last_timestamp: timestamp,
            message,
        }
    }

    pub fn append(&mut self, timestamp: Timestamp, payload: &[u8], max_size: usize) -> Result<()> {
        let buffered = self.buffered() + payload.len();
        if buffered > max_size {
            return Err(Error::StreamTooLarge(buffered));
        }
        self.data.extend_from_slice(payload);
        self.last_timestamp = timestamp;
        Ok(())
    }

    pub fn state(&self) -> ParseState {
        self.parse_state
    }

    pub fn message(&self) -> &Message {
        &self.message
    }

    // bytes held for messages not yet handed out
    pub fn buffered(&self) -> usize {
        self.data.len() - self.consumed
    }

    pub fn unparsed(&self) -> usize {
        self.data.len() - self.parse_offset
    }

    pub fn headers_received(&self) -> bool {
        matches!(
            self.parse_state,
            ParseState::Body
                | ParseState::BodyChunkedStart
                | ParseState::BodyChunked
                | ParseState::BodyChunkedWaitFinalCrlf
        )
    }

    // a message can be cut short once its first line is known
    pub fn first_line_received(&self) -> bool {
        !matches!(self.parse_state, ParseState::Start | ParseState::FirstLine)
    }

    // whether any byte of the current message has been seen
    pub fn has_partial_message(&self) -> bool {
        match self.parse_state {
            ParseState::Start => self.unparsed() > 0,
            _ => self.data.len() > self.message.start,
        }
    }

    // Hands out the completed message, keeping only bytes after it.
    pub fn take_message(&mut self) -> Message {
        let end = self.message.end.min(self.data.len());
        let start = self.message.start.min(end);
        let mut fresh = Message::new(self.last_timestamp);
        fresh.tuple = self.message.tuple;
        fresh.direction = self.message.direction;
        let mut message = mem::replace(&mut self.message, fresh);
        message.raw = self.data[start..end].to_vec();
        self.consume_to(end);
        message
    }

    // Terminates the current message at the end of the buffer, used when the
    // connection closes or expires.
    pub fn take_partial_message(&mut self) -> Message {
        if self.parse_state == ParseState::Start {
            self.message.start = self.parse_offset;
            self.message.timestamp = self.last_timestamp;
        }
        // whatever arrived of the header block has no body after it
        if self.parse_state == ParseState::Headers {
            self.message.body_offset = self.data.len();
        }
        self.parse_offset = self.data.len();
        self.message.end = self.data.len();
        self.message.size = self.message.end - self.message.start;
        self.take_message()
    }

    fn consume_to(&mut self, end: usize) {
        self.consumed = end;
        self.parse_offset = self.parse_offset.max(end);
        self.parse_state = ParseState::Start;
        self.body_received = 0;
        if self.consumed == self.data.len() {
            self.data.clear();
            self.parse_offset = 0;
            self.consumed = 0;
        } else if self.consumed >= COMPACT_THRESHOLD {
            self.data.drain(..self.consumed);
            self.parse_offset -= self.consumed;
            self.consumed = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_stream() -> Stream {
        Stream::new(
            Timestamp::from_millis(5),
            TcpTuple::default(),
            PacketDirection::ServerToClient,
        )
    }

    #[test]
    fn append_limit() {
        let mut s = new_stream();
        assert!(s.append(Timestamp::ZERO, b"0123456789", 16).is_ok());
        assert_eq!(
            s.append(Timestamp::ZERO, b"0123456789", 16),
            Err(Error::StreamTooLarge(20))
        );
        assert_eq!(s.buffered(), 10);
    }

    #[test]
    fn take_message_keeps_tail() {
        let mut s = new_stream();
        s.append(Timestamp::from_millis(7), b"firstsecond", 1024)
            .unwrap();
        s.parse_state = ParseState::Body;
        s.parse_offset = 5;
        s.message.end = 5;
        s.message.size = 5;

        let m = s.take_message();
        assert_eq!(m.raw, b"first");
        assert_eq!(m.direction, PacketDirection::ServerToClient);
        assert_eq!(s.state(), ParseState::Start);
        assert_eq!(s.buffered(), 6);
        assert_eq!(s.message().timestamp, Timestamp::from_millis(7));
        assert_eq!(s.message().direction, PacketDirection::ServerToClient);
        assert!(s.has_partial_message());

        let m = s.take_partial_message();
        assert_eq!(m.raw, b"second");
        assert_eq!(m.size, 6);
        assert_eq!(s.buffered(), 0);
        assert!(!s.has_partial_message());
    }

    #[test]
    fn compaction() {
        let mut s = new_stream();
        let payload = vec![b'x'; COMPACT_THRESHOLD + 10];
        s.append(Timestamp::ZERO, &payload, usize::MAX).unwrap();
        s.parse_offset = COMPACT_THRESHOLD + 2;
        s.message.end = COMPACT_THRESHOLD;
        s.take_message();
        assert_eq!(s.data.len(), 10);
        assert_eq!(s.parse_offset, 2);
        assert_eq!(s.consumed, 0);
    }
}
