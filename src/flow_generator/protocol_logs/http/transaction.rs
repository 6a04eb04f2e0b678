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
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use parking_lot::{Condvar, Mutex};

use public::{
    counter::{Counter, CounterType, CounterValue, RefCountable},
    ChronoMap, Timestamp,
};

use super::event::HeaderValue;
use crate::common::{Endpoint, TcpTuple};

const JANITOR_THREAD_NAME: &str = "http-transaction-janitor";
const MAX_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Request half of a transaction, waiting in the table for its response.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RequestLeg {
    pub timestamp: Timestamp,
    // connection key, oriented as seen by the analyzer
    pub tuple: TcpTuple,
    pub src: Endpoint,
    pub dst: Endpoint,
    pub method: String,
    pub request_uri: String,
    pub path: String,
    pub params: String,
    pub real_ip: String,
    pub user_name: String,
    pub host: String,
    pub user_agent: String,
    pub referer: String,
    pub headers: Option<BTreeMap<String, HeaderValue>>,
    pub raw: Option<String>,
    pub size: usize,
    pub notes: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResponseLeg {
    pub timestamp: Timestamp,
    pub code: u16,
    pub phrase: String,
    pub content_length: usize,
    pub headers: Option<BTreeMap<String, HeaderValue>>,
    pub raw: Option<String>,
    pub size: usize,
    pub notes: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Transaction {
    pub request: RequestLeg,
    pub response: ResponseLeg,
}

#[derive(Debug, Default)]
pub struct TransactionCounter {
    pub requests: AtomicU64,
    pub responses: AtomicU64,
    pub published: AtomicU64,
    pub unmatched_responses: AtomicU64,
    pub overwritten_requests: AtomicU64,
    pub expired: AtomicU64,
}

impl RefCountable for TransactionCounter {
    fn get_counters(&self) -> Vec<Counter> {
        vec![
            (
                "requests",
                CounterType::Counted,
                CounterValue::Unsigned(self.requests.load(Ordering::Relaxed)),
            ),
            (
                "responses",
                CounterType::Counted,
                CounterValue::Unsigned(self.responses.load(Ordering::Relaxed)),
            ),
            (
                "transactions",
                CounterType::Counted,
                CounterValue::Unsigned(self.published.load(Ordering::Relaxed)),
            ),
            (
                "unmatched-responses",
                CounterType::Counted,
                CounterValue::Unsigned(self.unmatched_responses.load(Ordering::Relaxed)),
            ),
            (
                "overwritten-requests",
                CounterType::Counted,
                CounterValue::Unsigned(self.overwritten_requests.load(Ordering::Relaxed)),
            ),
            (
                "expired-transactions",
                CounterType::Counted,
                CounterValue::Unsigned(self.expired.load(Ordering::Relaxed)),
            ),
        ]
    }
}

// Latest packet time, advanced by the wall clock elapsed since it was seen.
// Lets the janitor expire entries during pcap replays as well as live.
struct PacketClock {
    last: Timestamp,
    seen_at: Instant,
}

impl PacketClock {
    fn update(&mut self, timestamp: Timestamp) {
        if timestamp > self.last {
            self.last = timestamp;
            self.seen_at = Instant::now();
        }
    }

    fn now(&self) -> Timestamp {
        self.last + self.seen_at.elapsed()
    }
}

struct TableState {
    // keyed by connection tuple, ordered by expiry deadline
    pending: ChronoMap<Timestamp, TcpTuple, RequestLeg>,
    clock: PacketClock,
}

impl TableState {
    fn expire(&mut self, now: Timestamp, counter: &TransactionCounter) -> usize {
        let mut expired = 0;
        self.pending.forward_time(now, |tuple, _| {
            debug!("transaction {} expired without response", tuple);
            expired += 1;
            None
        });
        counter.expired.fetch_add(expired as u64, Ordering::Relaxed);
        expired
    }
}

/// Pending requests per connection, paired with responses as they complete.
///
/// Requests that see no response within the transaction timeout are dropped
/// by [`TransactionTable::expire`], or periodically by the janitor thread
/// once [`TransactionTable::start`] is called.
pub struct TransactionTable {
    timeout: Duration,
    state: Arc<Mutex<TableState>>,
    counter: Arc<TransactionCounter>,

    running: Arc<Mutex<bool>>,
    timer: Arc<Condvar>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl TransactionTable {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            state: Arc::new(Mutex::new(TableState {
                pending: ChronoMap::new(),
                clock: PacketClock {
                    last: Timestamp::ZERO,
                    seen_at: Instant::now(),
                },
            })),
            counter: Arc::new(TransactionCounter::default()),
            running: Arc::new(Mutex::new(false)),
            timer: Arc::new(Condvar::new()),
            thread: Mutex::new(None),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn counter(&self) -> &Arc<TransactionCounter> {
        &self.counter
    }

    pub fn len(&self) -> usize {
        self.state.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn on_request(&self, request: RequestLeg) {
        self.counter.requests.fetch_add(1, Ordering::Relaxed);
        let mut state = self.state.lock();
        state.clock.update(request.timestamp);
        let tuple = request.tuple;
        let deadline = request.timestamp + self.timeout;
        if state.pending.insert(deadline, tuple, request).is_some() {
            warn!("Two requests without a response. Dropping old request");
            self.counter
                .overwritten_requests
                .fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Pairs a response with the pending request of the same connection.
    pub fn on_response(&self, tuple: &TcpTuple, response: ResponseLeg) -> Option<Transaction> {
        self.counter.responses.fetch_add(1, Ordering::Relaxed);
        let mut state = self.state.lock();
        state.clock.update(response.timestamp);
        let deadline = state.pending.time_of(tuple);
        let Some(request) = state.pending.remove(tuple) else {
            warn!("Response from unknown transaction. Ignoring: {}", tuple);
            self.counter
                .unmatched_responses
                .fetch_add(1, Ordering::Relaxed);
            return None;
        };
        if matches!(deadline, Some(d) if d < response.timestamp) {
            // the janitor has not caught up with it yet
            debug!("response for expired transaction {}", tuple);
            self.counter.expired.fetch_add(1, Ordering::Relaxed);
            return None;
        }
        self.counter.published.fetch_add(1, Ordering::Relaxed);
        Some(Transaction { request, response })
    }

    /// Drops every pending request whose deadline is not after `now`.
    pub fn expire(&self, now: Timestamp) -> usize {
        self.state.lock().expire(now, &self.counter)
    }

    pub fn start(&self) {
        let mut running = self.running.lock();
        if *running {
            debug!("transaction janitor already running");
            return;
        }
        *running = true;
        drop(running);

        let state = self.state.clone();
        let counter = self.counter.clone();
        let thread_running = self.running.clone();
        let timer = self.timer.clone();
        let interval = self.timeout.min(MAX_SWEEP_INTERVAL);
        let spawned = thread::Builder::new()
            .name(JANITOR_THREAD_NAME.to_owned())
            .spawn(move || {
                while Self::wait_for_running(&thread_running, &timer, interval) {
                    let mut state = state.lock();
                    let now = state.clock.now();
                    let expired = state.expire(now, &counter);
                    if expired > 0 {
                        debug!("janitor expired {} transactions", expired);
                    }
                }
            });
        match spawned {
            Ok(handle) => {
                *self.thread.lock() = Some(handle);
                info!("transaction janitor started");
            }
            Err(e) => {
                error!("failed to spawn {}: {}", JANITOR_THREAD_NAME, e);
                *self.running.lock() = false;
            }
        }
    }

    pub fn notify_stop(&self) -> Option<JoinHandle<()>> {
        let mut running = self.running.lock();
        if !*running {
            return None;
        }
        *running = false;
        drop(running);
        self.timer.notify_one();
        self.thread.lock().take()
    }

    pub fn stop(&self) {
        if let Some(handle) = self.notify_stop() {
            let _ = handle.join();
            info!("transaction janitor stopped");
        }
    }

    // returns running status
    fn wait_for_running(running: &Mutex<bool>, timer: &Condvar, interval: Duration) -> bool {
        let mut guard = running.lock();
        if !*guard {
            return false;
        }
        timer.wait_for(&mut guard, interval);
        *guard
    }
}

impl Drop for TransactionTable {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr};

    use super::*;

    fn tuple(port: u16) -> TcpTuple {
        TcpTuple::new(
            IpAddr::V4(Ipv4Addr::new(192, 168, 1, 1)),
            port,
            IpAddr::V4(Ipv4Addr::new(192, 168, 1, 2)),
            80,
        )
    }

    fn request(tuple: TcpTuple, millis: u64) -> RequestLeg {
        RequestLeg {
            timestamp: Timestamp::from_millis(millis),
            tuple,
            method: "GET".into(),
            request_uri: "/".into(),
            ..Default::default()
        }
    }

    fn response(millis: u64) -> ResponseLeg {
        ResponseLeg {
            timestamp: Timestamp::from_millis(millis),
            code: 200,
            phrase: "OK".into(),
            ..Default::default()
        }
    }

    #[test]
    fn pairing() {
        let table = TransactionTable::new(Duration::from_secs(10));
        table.on_request(request(tuple(1000), 0));
        let t = table.on_response(&tuple(1000), response(120)).unwrap();
        assert_eq!(
            t.response.timestamp - t.request.timestamp,
            Duration::from_millis(120)
        );
        assert!(table.is_empty());
        assert_eq!(table.counter().published.load(Ordering::Relaxed), 1);

        // pairs only once
        assert!(table.on_response(&tuple(1000), response(130)).is_none());
        assert_eq!(
            table.counter().unmatched_responses.load(Ordering::Relaxed),
            1
        );
    }

    #[test]
    fn second_request_overwrites() {
        let table = TransactionTable::new(Duration::from_secs(10));
        table.on_request(request(tuple(1000), 0));
        let mut second = request(tuple(1000), 5);
        second.request_uri = "/second".into();
        table.on_request(second);
        assert_eq!(table.len(), 1);
        assert_eq!(
            table.counter().overwritten_requests.load(Ordering::Relaxed),
            1
        );
        let t = table.on_response(&tuple(1000), response(20)).unwrap();
        assert_eq!(t.request.request_uri, "/second");
    }

    #[test]
    fn connections_are_independent() {
        let table = TransactionTable::new(Duration::from_secs(10));
        table.on_request(request(tuple(1000), 0));
        table.on_request(request(tuple(1001), 0));
        assert!(table.on_response(&tuple(1001), response(1)).is_some());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn half_open_expiry() {
        let table = TransactionTable::new(Duration::from_secs(15));
        table.on_request(request(tuple(1000), 0));
        assert_eq!(table.expire(Timestamp::from_secs(14)), 0);
        assert_eq!(table.len(), 1);
        assert_eq!(table.expire(Timestamp::from_secs(16)), 1);
        assert!(table.is_empty());
        assert!(table.on_response(&tuple(1000), response(16_500)).is_none());
        assert_eq!(table.counter().expired.load(Ordering::Relaxed), 1);
        assert_eq!(table.counter().published.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn late_response_is_not_paired() {
        let table = TransactionTable::new(Duration::from_secs(15));
        table.on_request(request(tuple(1000), 0));
        assert!(table.on_response(&tuple(1000), response(16_000)).is_none());
        assert!(table.is_empty());
        assert_eq!(table.counter().expired.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn janitor_sweeps() {
        let table = TransactionTable::new(Duration::from_millis(50));
        table.start();
        table.on_request(request(tuple(1000), 100_000));
        thread::sleep(Duration::from_millis(400));
        assert!(table.is_empty());
        table.stop();
        assert!(table.notify_stop().is_none());
    }

    #[test]
    fn counters() {
        let table = TransactionTable::new(Duration::from_secs(1));
        table.on_request(request(tuple(1000), 0));
        let counters = table.counter().get_counters();
        assert_eq!(counters[0].0, "requests");
        assert_eq!(counters[0].2, CounterValue::Unsigned(1));
    }
}
