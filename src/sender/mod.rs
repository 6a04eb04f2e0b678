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

use std::io::{self, Write};
use std::sync::atomic::{AtomicU64, Ordering};

use log::warn;
use parking_lot::Mutex;

use public::counter::{Counter, CounterType, CounterValue, RefCountable};

use crate::flow_generator::protocol_logs::http::HttpEvent;

/// Publishing side of the analyzer: receives one event per paired
/// transaction.
pub trait EventSender: Send + Sync {
    fn send(&self, event: HttpEvent);
}

impl<F> EventSender for F
where
    F: Fn(HttpEvent) + Send + Sync,
{
    fn send(&self, event: HttpEvent) {
        self(event)
    }
}

#[derive(Debug, Default)]
pub struct SenderCounter {
    pub sent: AtomicU64,
    pub errors: AtomicU64,
}

impl RefCountable for SenderCounter {
    fn get_counters(&self) -> Vec<Counter> {
        vec![
            (
                "sent",
                CounterType::Counted,
                CounterValue::Unsigned(self.sent.load(Ordering::Relaxed)),
            ),
            (
                "errors",
                CounterType::Counted,
                CounterValue::Unsigned(self.errors.load(Ordering::Relaxed)),
            ),
        ]
    }
}

/// Writes every event as one line of JSON.
pub struct JsonSender<W: Write + Send> {
    writer: Mutex<W>,
    counter: SenderCounter,
}

impl<W: Write + Send> JsonSender<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
            counter: SenderCounter::default(),
        }
    }

    pub fn counter(&self) -> &SenderCounter {
        &self.counter
    }

    pub fn flush(&self) -> io::Result<()> {
        self.writer.lock().flush()
    }

    pub fn into_inner(self) -> W {
        self.writer.into_inner()
    }

    fn write_event(&self, event: &HttpEvent) -> io::Result<()> {
        let mut line = serde_json::to_vec(event)?;
        line.push(b'\n');
        self.writer.lock().write_all(&line)
    }
}

impl<W: Write + Send> EventSender for JsonSender<W> {
    fn send(&self, event: HttpEvent) {
        match self.write_event(&event) {
            Ok(_) => {
                self.counter.sent.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                self.counter.errors.fetch_add(1, Ordering::Relaxed);
                warn!("failed to write event: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::flow_generator::protocol_logs::http::{EventStatus, HttpFields};
    use public::Timestamp;

    fn event() -> HttpEvent {
        HttpEvent {
            event_type: "http",
            status: EventStatus::Ok,
            responsetime: 3,
            method: "GET".into(),
            path: "/".into(),
            query: "GET /".into(),
            params: "".into(),
            bytes_in: 1,
            bytes_out: 2,
            timestamp: Timestamp::ZERO,
            src: Default::default(),
            dst: Default::default(),
            real_ip: "".into(),
            user_name: "".into(),
            http: HttpFields::default(),
            request_raw: None,
            response_raw: None,
            notes: vec![],
        }
    }

    #[test]
    fn json_lines() {
        let sender = JsonSender::new(Vec::new());
        sender.send(event());
        sender.send(event());
        assert_eq!(sender.counter().sent.load(Ordering::Relaxed), 2);

        let out = String::from_utf8(sender.into_inner()).unwrap();
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines.len(), 2);
        let value: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(value["responsetime"], 3);
        assert_eq!(value["@timestamp"], "1970-01-01T00:00:00.000Z");
    }

    struct Broken;

    impl Write for Broken {
        fn write(&mut self, _: &[u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "closed"))
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn write_errors_are_counted() {
        let sender = JsonSender::new(Broken);
        sender.send(event());
        assert_eq!(sender.counter().errors.load(Ordering::Relaxed), 1);
    }
}
