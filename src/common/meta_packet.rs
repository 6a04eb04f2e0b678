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

use std::net::IpAddr;

use pnet::packet::{
    ethernet::{EtherType, EtherTypes, EthernetPacket},
    ip::IpNextHeaderProtocols,
    ipv4::Ipv4Packet,
    ipv6::Ipv6Packet,
    tcp::TcpPacket,
    vlan::VlanPacket,
    Packet,
};

use super::enums::TcpFlags;
use super::flow::TcpTuple;
use crate::error::{Error, Result};

use public::Timestamp;

const TCP_FLAGS_OFFSET: usize = 13;
const LINUX_SLL_HEADER_SIZE: usize = 16;
const LINUX_SLL_PROTOCOL_OFFSET: usize = 14;

// pcap link-layer header types
pub const LINKTYPE_NULL: i32 = 0;
pub const LINKTYPE_ETHERNET: i32 = 1;
pub const LINKTYPE_RAW: i32 = 101;
pub const LINKTYPE_LINUX_SLL: i32 = 113;

// One decoded TCP segment. The tuple is as seen on the wire, src being the sender.
#[derive(Debug, Clone, Default)]
pub struct MetaPacket {
    pub timestamp: Timestamp,
    pub tuple: TcpTuple,
    pub seq: u32,
    pub flags: TcpFlags,
    pub payload: Vec<u8>,
}

impl MetaPacket {
    pub fn from_link_layer(timestamp: Timestamp, link_type: i32, frame: &[u8]) -> Result<Self> {
        match link_type {
            LINKTYPE_ETHERNET => Self::from_ethernet(timestamp, frame),
            LINKTYPE_RAW => Self::from_ip(timestamp, frame),
            LINKTYPE_NULL => {
                if frame.len() < 4 {
                    return Err(Error::ParsePacketFailed("loopback header".to_owned()));
                }
                Self::from_ip(timestamp, &frame[4..])
            }
            LINKTYPE_LINUX_SLL => {
                if frame.len() < LINUX_SLL_HEADER_SIZE {
                    return Err(Error::ParsePacketFailed("linux sll header".to_owned()));
                }
                let proto = u16::from_be_bytes([
                    frame[LINUX_SLL_PROTOCOL_OFFSET],
                    frame[LINUX_SLL_PROTOCOL_OFFSET + 1],
                ]);
                Self::from_l3(timestamp, EtherType(proto), &frame[LINUX_SLL_HEADER_SIZE..])
            }
            _ => Err(Error::UnsupportedLinkType(link_type)),
        }
    }

    pub fn from_ethernet(timestamp: Timestamp, frame: &[u8]) -> Result<Self> {
        let eth = EthernetPacket::new(frame)
            .ok_or_else(|| Error::ParsePacketFailed("ethernet header".to_owned()))?;
        let mut ether_type = eth.get_ethertype();
        let mut payload = eth.payload();
        // QinQ carries at most two tags
        for _ in 0..2 {
            if ether_type != EtherTypes::Vlan && ether_type != EtherTypes::QinQ {
                break;
            }
            let vlan = VlanPacket::new(payload)
                .ok_or_else(|| Error::ParsePacketFailed("vlan header".to_owned()))?;
            ether_type = vlan.get_ethertype();
            payload = &payload[4..];
        }
        Self::from_l3(timestamp, ether_type, payload)
    }

    pub fn from_ip(timestamp: Timestamp, data: &[u8]) -> Result<Self> {
        match data.first().map(|b| b >> 4) {
            Some(4) => Self::from_l3(timestamp, EtherTypes::Ipv4, data),
            Some(6) => Self::from_l3(timestamp, EtherTypes::Ipv6, data),
            _ => Err(Error::ParsePacketFailed("ip version".to_owned())),
        }
    }

    fn from_l3(timestamp: Timestamp, ether_type: EtherType, data: &[u8]) -> Result<Self> {
        let (src_ip, dst_ip, segment) = if ether_type == EtherTypes::Ipv4 {
            let ip = Ipv4Packet::new(data)
                .ok_or_else(|| Error::ParsePacketFailed("ipv4 header".to_owned()))?;
            if ip.get_next_level_protocol() != IpNextHeaderProtocols::Tcp {
                return Err(Error::ParsePacketFailed("not tcp".to_owned()));
            }
            // fragments are not reassembled
            if ip.get_fragment_offset() != 0 {
                return Err(Error::ParsePacketFailed("ipv4 fragment".to_owned()));
            }
            (
                IpAddr::V4(ip.get_source()),
                IpAddr::V4(ip.get_destination()),
                ip.payload().to_vec(),
            )
        } else if ether_type == EtherTypes::Ipv6 {
            let ip = Ipv6Packet::new(data)
                .ok_or_else(|| Error::ParsePacketFailed("ipv6 header".to_owned()))?;
            if ip.get_next_header() != IpNextHeaderProtocols::Tcp {
                return Err(Error::ParsePacketFailed("not tcp".to_owned()));
            }
            (
                IpAddr::V6(ip.get_source()),
                IpAddr::V6(ip.get_destination()),
                ip.payload().to_vec(),
            )
        } else {
            return Err(Error::ParsePacketFailed(format!(
                "ether type {:?}",
                ether_type
            )));
        };

        let tcp = TcpPacket::new(&segment)
            .ok_or_else(|| Error::ParsePacketFailed("tcp header".to_owned()))?;
        Ok(Self {
            timestamp,
            tuple: TcpTuple::new(src_ip, tcp.get_source(), dst_ip, tcp.get_destination()),
            seq: tcp.get_sequence(),
            flags: TcpFlags::from_bits_truncate(tcp.packet()[TCP_FLAGS_OFFSET]),
            payload: tcp.payload().to_vec(),
        })
    }
}
