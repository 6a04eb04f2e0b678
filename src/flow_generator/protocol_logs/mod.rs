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

pub mod http;

use std::time::Duration;

use enum_dispatch::enum_dispatch;

use public::Timestamp;

use self::http::{HttpAnalyzer, HttpConnectionData};
use crate::common::{PacketDirection, TcpTuple};

/*
 Every application protocol analyzer implements L7ProtocolAnalyzer.

 The dispatcher owns the per-connection state and hands it to the analyzer
 bound to the connection's server port:

        payload (in order, retransmissions trimmed)
                         |
                         v
                      parse() -----> complete messages ----> transaction table
                         |                                         |
             missing bytes: gap_in_stream()                        v
             half closed:   received_fin()                  paired event sent
             idle:          expired()

 gap_in_stream() returns true when the connection state can no longer be
 trusted; the dispatcher then resets it.
*/

pub struct ParseParam<'a> {
    pub timestamp: Timestamp,
    pub payload: &'a [u8],
}

#[enum_dispatch]
pub trait L7ProtocolAnalyzer {
    fn ports(&self) -> Vec<u16>;
    fn connection_timeout(&self) -> Duration;
    fn parse(
        &self,
        param: &ParseParam,
        tuple: &TcpTuple,
        direction: PacketDirection,
        data: &mut Option<L7ConnectionData>,
    );
    fn received_fin(
        &self,
        tuple: &TcpTuple,
        direction: PacketDirection,
        data: &mut Option<L7ConnectionData>,
    );
    fn gap_in_stream(
        &self,
        tuple: &TcpTuple,
        direction: PacketDirection,
        nbytes: usize,
        data: &mut Option<L7ConnectionData>,
    ) -> bool;
    fn expired(&self, tuple: &TcpTuple, data: &mut Option<L7ConnectionData>);
}

#[enum_dispatch(L7ProtocolAnalyzer)]
pub enum L7Analyzer {
    HttpAnalyzer,
}

// connection private state, one variant per analyzer
#[derive(Debug)]
pub enum L7ConnectionData {
    Http(HttpConnectionData),
}
