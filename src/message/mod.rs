// Copyright 2023 Matthew Ingwersen.
//
// Licensed under the Apache License, Version 2.0 (the "License"); you
// may not use this file except in compliance with the License. You may
// obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or
// implied. See the License for the specific language governing
// permissions and limitations under the License.

//! DNS message handling: the [`Packet`] type and its wire codec.

mod constants;
mod question;
pub mod reader;
mod writer;

pub use question::Question;
pub use reader::Reader;
pub use writer::Writer;

use std::net::SocketAddr;

use crate::rr::Record;

/// The UDP port of Multicast DNS (RFC 6762 § 3).
pub const MDNS_PORT: u16 = 5353;

////////////////////////////////////////////////////////////////////////
// PACKETS                                                            //
////////////////////////////////////////////////////////////////////////

/// A DNS message, parsed or under construction.
///
/// A `Packet` holds the handful of header fields that matter to mDNS
/// (the ID, QR, AA, and TC bits, and the opcode/RCODE for validity
/// checking) plus the four sections. Received packets also carry their
/// `origin`, from which the mDNS-specific predicates are derived:
///
/// * a *query* has QR clear and an empty authority section;
/// * a *probe* has QR clear and a non-empty authority section
///   (RFC 6762 § 8.2);
/// * an *answer* has QR set;
/// * a *legacy* packet originated from a port other than 5353
///   (RFC 6762 § 6.7).
#[derive(Clone, Debug, Default)]
pub struct Packet {
    pub id: u16,
    pub qr: bool,
    pub aa: bool,
    pub tc: bool,
    pub opcode: u8,
    pub rcode: u8,
    pub questions: Vec<Question>,
    pub answers: Vec<Record>,
    pub authorities: Vec<Record>,
    pub additionals: Vec<Record>,
    pub origin: Option<SocketAddr>,
}

impl Packet {
    /// Creates an empty query packet.
    pub fn query() -> Self {
        Self::default()
    }

    /// Creates an empty response packet (QR and AA set, per
    /// RFC 6762 § 18.4).
    pub fn response() -> Self {
        Self {
            qr: true,
            aa: true,
            ..Self::default()
        }
    }

    /// Parses a packet from its on-the-wire form. The `origin` is
    /// attached to the parsed packet. Any parse failure invalidates
    /// the whole packet; callers drop it.
    pub fn parse(octets: &[u8], origin: SocketAddr) -> reader::Result<Self> {
        let mut reader = Reader::try_from(octets)?;
        let mut packet = Self {
            id: reader.id(),
            qr: reader.qr(),
            aa: reader.aa(),
            tc: reader.tc(),
            opcode: reader.opcode(),
            rcode: reader.rcode(),
            origin: Some(origin),
            ..Self::default()
        };
        for _ in 0..reader.qdcount() {
            packet.questions.push(reader.read_question()?);
        }
        for _ in 0..reader.ancount() {
            packet.answers.push(reader.read_rr()?);
        }
        for _ in 0..reader.nscount() {
            packet.authorities.push(reader.read_rr()?);
        }
        for _ in 0..reader.arcount() {
            packet.additionals.push(reader.read_rr()?);
        }
        Ok(packet)
    }

    /// Serializes the packet. The canonical encoding compresses names
    /// greedily against first occurrences, so `encode(parse(p)) == p`
    /// for packets we produced.
    pub fn encode(&self) -> Vec<u8> {
        let mut writer = Writer::new();
        writer.set_id(self.id);
        writer.set_qr(self.qr);
        writer.set_aa(self.aa);
        writer.set_tc(self.tc);
        for question in &self.questions {
            writer.add_question(question);
        }
        for record in &self.answers {
            writer.add_answer(record);
        }
        for record in &self.authorities {
            writer.add_authority(record);
        }
        for record in &self.additionals {
            writer.add_additional(record);
        }
        writer.finish()
    }

    /// Returns whether every section is empty.
    pub fn is_empty(&self) -> bool {
        self.questions.is_empty()
            && self.answers.is_empty()
            && self.authorities.is_empty()
            && self.additionals.is_empty()
    }

    /// Returns whether this packet is a plain query.
    pub fn is_query(&self) -> bool {
        !self.qr && self.authorities.is_empty()
    }

    /// Returns whether this packet is a probe query (a query carrying
    /// proposed records in its authority section).
    pub fn is_probe(&self) -> bool {
        !self.qr && !self.authorities.is_empty()
    }

    /// Returns whether this packet is an answer.
    pub fn is_answer(&self) -> bool {
        self.qr
    }

    /// Returns whether this packet came from a port other than 5353,
    /// which marks its sender as a one-shot ("legacy") resolver.
    pub fn is_legacy(&self) -> bool {
        self.origin.map_or(false, |origin| origin.port() != MDNS_PORT)
    }

    /// Returns whether this packet's origin address is one of
    /// `local_addrs` (i.e., the packet is our own, looped back).
    pub fn is_local(&self, local_addrs: &[std::net::IpAddr]) -> bool {
        self.origin
            .map_or(false, |origin| local_addrs.contains(&origin.ip()))
    }

    /// Returns whether the packet is worth processing: the opcode and
    /// RCODE are both zero, and an answer is authoritative
    /// (RFC 6762 § 18.4 and § 18.11).
    pub fn is_valid(&self) -> bool {
        self.opcode == 0 && self.rcode == 0 && (!self.qr || self.aa)
    }

    /// Splits an oversized packet in two.
    ///
    /// For a query, the first half keeps the questions and raises TC
    /// (its known answers continue in the second half, per
    /// RFC 6762 § 7.2); the answers are distributed evenly. For a
    /// response, the answers are distributed evenly and each half's
    /// additionals are rebuilt from its surviving answers. Packets of
    /// other shapes split into two empty packets, which the caller
    /// will find in its own way.
    pub fn split(&self) -> (Packet, Packet) {
        let mut first = Packet {
            origin: self.origin,
            ..Self::default()
        };
        let mut second = first.clone();
        first.id = self.id;
        second.id = self.id;

        if self.is_query() {
            first.tc = true;
            first.questions = self.questions.clone();
            let half = self.answers.len() / 2;
            first.answers = self.answers[..half].to_vec();
            second.answers = self.answers[half..].to_vec();
        } else if self.is_answer() {
            first.qr = true;
            first.aa = self.aa;
            second.qr = true;
            second.aa = self.aa;
            let split_at = self.answers.len() - self.answers.len() / 2;
            first.answers = self.answers[..split_at].to_vec();
            second.answers = self.answers[split_at..].to_vec();
            first.additionals = rebuild_additionals(&first.answers);
            second.additionals = rebuild_additionals(&second.answers);
        }
        (first, second)
    }
}

/// Rebuilds the additional section of a split response half from its
/// surviving answers.
fn rebuild_additionals(answers: &[Record]) -> Vec<Record> {
    let mut additionals: Vec<Record> = Vec::new();
    for answer in answers {
        for additional in &answer.additionals {
            let duplicate = answers.iter().any(|a| a == additional)
                || additionals.iter().any(|a| a == additional);
            if !duplicate {
                additionals.push(additional.clone());
            }
        }
    }
    additionals
}

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rr::{Rdata, Ttl, Type};
    use std::net::{IpAddr, SocketAddr};

    fn origin(addr: &str, port: u16) -> SocketAddr {
        SocketAddr::new(addr.parse().unwrap(), port)
    }

    fn a_record(name: &str, addr: &str) -> Record {
        Record::new(
            name.parse().unwrap(),
            Type::A,
            Ttl::from(120),
            Rdata::A(addr.parse().unwrap()),
        )
    }

    #[test]
    fn encode_parse_round_trips_byte_exact() {
        let mut packet = Packet::response();
        packet.answers.push(Record::new(
            "_http._tcp.local.".parse().unwrap(),
            Type::PTR,
            Ttl::from(4500),
            Rdata::Ptr("web._http._tcp.local.".parse().unwrap()),
        ));
        packet.answers.push(Record::new(
            "web._http._tcp.local.".parse().unwrap(),
            Type::SRV,
            Ttl::from(120),
            Rdata::Srv {
                priority: 0,
                weight: 0,
                port: 8080,
                target: "host.local.".parse().unwrap(),
            },
        ));
        packet.additionals.push(a_record("host.local.", "10.0.0.2"));

        let octets = packet.encode();
        let parsed = Packet::parse(&octets, origin("10.0.0.2", MDNS_PORT)).unwrap();
        assert_eq!(parsed.answers, packet.answers);
        assert_eq!(parsed.additionals, packet.additionals);
        // The canonical encoding is reproduced byte for byte.
        assert_eq!(parsed.encode(), octets);
    }

    #[test]
    fn predicates_follow_the_sections_and_origin() {
        let mut query = Packet::query();
        query.questions.push(Question::new(
            "_http._tcp.local.".parse().unwrap(),
            Type::PTR,
        ));
        query.origin = Some(origin("10.0.0.2", MDNS_PORT));
        assert!(query.is_query() && !query.is_probe() && !query.is_answer());
        assert!(!query.is_legacy());
        assert!(query.is_valid());

        let mut probe = query.clone();
        probe.authorities.push(a_record("host.local.", "10.0.0.2"));
        assert!(probe.is_probe() && !probe.is_query());

        let mut answer = Packet::response();
        answer.origin = Some(origin("10.0.0.2", 49152));
        answer.answers.push(a_record("host.local.", "10.0.0.2"));
        assert!(answer.is_answer());
        assert!(answer.is_legacy());
        assert!(answer.is_valid());

        // A non-authoritative answer is invalid in mDNS.
        answer.aa = false;
        assert!(!answer.is_valid());
    }

    #[test]
    fn is_local_checks_the_origin_address() {
        let mut packet = Packet::query();
        packet.origin = Some(origin("10.0.0.2", MDNS_PORT));
        let local: Vec<IpAddr> = vec!["10.0.0.2".parse().unwrap()];
        let other: Vec<IpAddr> = vec!["10.0.0.7".parse().unwrap()];
        assert!(packet.is_local(&local));
        assert!(!packet.is_local(&other));
    }

    #[test]
    fn splitting_a_query_keeps_questions_first_and_raises_tc() {
        let mut query = Packet::query();
        query.questions.push(Question::new(
            "_http._tcp.local.".parse().unwrap(),
            Type::PTR,
        ));
        for i in 0..4 {
            query.answers.push(a_record(
                &format!("known{i}.local."),
                &format!("10.0.0.{}", i + 1),
            ));
        }
        let (first, second) = query.split();
        assert!(first.tc);
        assert!(!second.tc);
        assert_eq!(first.questions.len(), 1);
        assert!(second.questions.is_empty());
        assert_eq!(first.answers.len() + second.answers.len(), 4);
    }

    #[test]
    fn splitting_a_response_rebuilds_additionals() {
        let mut response = Packet::response();
        for i in 0..2 {
            let host = format!("host{i}.local.");
            let srv = Record::new(
                format!("svc{i}._http._tcp.local.").parse().unwrap(),
                Type::SRV,
                Ttl::from(120),
                Rdata::Srv {
                    priority: 0,
                    weight: 0,
                    port: 8080,
                    target: host.parse().unwrap(),
                },
            )
            .with_additionals(vec![a_record(&host, "10.0.0.9")]);
            response.answers.push(srv);
        }
        response.additionals = vec![
            a_record("host0.local.", "10.0.0.9"),
            a_record("host1.local.", "10.0.0.9"),
        ];

        let (first, second) = response.split();
        assert_eq!(first.answers.len(), 1);
        assert_eq!(second.answers.len(), 1);
        // Each half carries only the additionals of its own answers.
        assert_eq!(first.additionals, vec![a_record("host0.local.", "10.0.0.9")]);
        assert_eq!(second.additionals, vec![a_record("host1.local.", "10.0.0.9")]);
    }

    #[test]
    fn splitting_other_shapes_yields_empty_packets() {
        let mut probe = Packet::query();
        probe.authorities.push(a_record("host.local.", "10.0.0.2"));
        let (first, second) = probe.split();
        assert!(first.is_empty());
        assert!(second.is_empty());
    }
}
