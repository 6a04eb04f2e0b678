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

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use http_analyzer::common::{PacketDirection, TcpTuple};
use http_analyzer::config::HttpConfig;
use http_analyzer::flow_generator::protocol_logs::{
    http::{
        extract_parameters, HttpAnalyzer, HttpEvent, MessageParser, RequestLeg, Stream,
        TransactionTable,
    },
    L7ConnectionData, L7ProtocolAnalyzer, ParseParam,
};
use public::Timestamp;

fn tuple() -> TcpTuple {
    TcpTuple::new(
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
        43210,
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
        80,
    )
}

fn response_stream() -> Stream {
    Stream::new(Timestamp::ZERO, tuple(), PacketDirection::ServerToClient)
}

#[test]
fn empty_response_completes() {
    let config = HttpConfig::default();
    let parser = MessageParser::new(&config);
    let mut s = response_stream();
    s.append(
        Timestamp::ZERO,
        b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n",
        usize::MAX,
    )
    .unwrap();
    assert_eq!(parser.parse(&mut s), Ok(true));
    let m = s.message();
    assert_eq!(m.status_code, 200);
    assert_eq!(m.status_phrase, "OK");
    assert_eq!(m.content_length, 0);
}

#[test]
fn split_header_resumes() {
    let config = HttpConfig::default();
    let parser = MessageParser::new(&config);

    let mut whole = response_stream();
    whole
        .append(
            Timestamp::ZERO,
            b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n",
            usize::MAX,
        )
        .unwrap();
    assert_eq!(parser.parse(&mut whole), Ok(true));

    let mut split = response_stream();
    split
        .append(Timestamp::ZERO, b"HTTP/1.1 200 OK\r\nContent-Len", usize::MAX)
        .unwrap();
    assert_eq!(parser.parse(&mut split), Ok(false));
    split
        .append(Timestamp::ZERO, b"gth: 0\r\n\r\n", usize::MAX)
        .unwrap();
    assert_eq!(parser.parse(&mut split), Ok(true));
    assert_eq!(split.message(), whole.message());
}

#[test]
fn hidden_parameter_never_leaks() {
    let hide = vec!["password".to_owned(), "token".to_owned()];
    let testcases: Vec<(&str, Option<&[u8]>, &str)> = vec![
        ("/x?password=hunter2", None, "password=xxxxx"),
        ("/x?PASSWORD=hunter2", None, "PASSWORD=xxxxx"),
        ("/x?PassWord=hunter2&user=ann", None, "PassWord=xxxxx&user=ann"),
        ("/x?pass%77ord=hunter2", None, "password=xxxxx"),
        (
            "/x?password=hunter2&password=hunter3",
            None,
            "password=xxxxx&password=xxxxx",
        ),
        ("/x?Token=hunter2&id=7", None, "Token=xxxxx&id=7"),
        ("/x?passwords=kept&pass=kept2", None, "pass=kept2&passwords=kept"),
        ("/x", Some(&b"Password=hunter2&note=hi"[..]), "Password=xxxxx&note=hi"),
        (
            "/x?user=ann",
            Some(&b"pass%77ord=hunter2"[..]),
            "password=xxxxx&user=ann",
        ),
    ];
    for (uri, form, expected) in testcases {
        let (_, params) = extract_parameters(uri, form, &hide).unwrap();
        assert_eq!(params, expected, "uri {} form {:?}", uri, form);
        assert!(!params.contains("hunter"), "uri {} leaked: {}", uri, params);
    }
}

#[test]
fn chunked_body_reassembles() {
    let config = HttpConfig::default();
    let parser = MessageParser::new(&config);
    let mut s = response_stream();
    s.append(
        Timestamp::ZERO,
        b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n3\r\nabc\r\n2\r\nde\r\n0\r\n\r\n",
        usize::MAX,
    )
    .unwrap();
    assert_eq!(parser.parse(&mut s), Ok(true));
    assert_eq!(s.message().body(), b"abcde");
    assert_eq!(s.message().content_length, 5);
}

#[test]
fn response_time_in_milliseconds() {
    let events = Arc::new(Mutex::new(Vec::<HttpEvent>::new()));
    let sink = events.clone();
    let analyzer = HttpAnalyzer::new(
        HttpConfig::default(),
        Arc::new(move |e: HttpEvent| sink.lock().push(e)),
    );
    let mut data: Option<L7ConnectionData> = None;

    let request = ParseParam {
        timestamp: Timestamp::ZERO,
        payload: b"GET / HTTP/1.1\r\nHost: a\r\n\r\n",
    };
    analyzer.parse(&request, &tuple(), PacketDirection::ClientToServer, &mut data);
    let response = ParseParam {
        timestamp: Timestamp::from_millis(120),
        payload: b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n",
    };
    analyzer.parse(&response, &tuple(), PacketDirection::ServerToClient, &mut data);

    let events = events.lock();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].responsetime, 120);
}

#[test]
fn unanswered_request_expires() {
    let table = TransactionTable::new(Duration::from_secs(15));
    table.on_request(RequestLeg {
        timestamp: Timestamp::ZERO,
        tuple: tuple(),
        method: "GET".into(),
        ..Default::default()
    });
    assert_eq!(table.expire(Timestamp::from_secs(16)), 1);
    assert!(table.is_empty());
}
