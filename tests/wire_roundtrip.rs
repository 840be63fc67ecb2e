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

//! Integration tests of the public wire and service APIs.

use std::net::SocketAddr;

use palaver::message::{Packet, Question, MDNS_PORT};
use palaver::name::Name;
use palaver::rr::{Rdata, Record, Ttl, TxtData, TxtValue, Type};
use palaver::service::{Protocol, Service, ServiceType, LOCAL_DOMAIN};

fn origin() -> SocketAddr {
    SocketAddr::new("192.168.1.50".parse().unwrap(), MDNS_PORT)
}

/// Builds the full record bundle of one DNS-SD instance, the way an
/// advertisement would put it on the wire.
fn instance_bundle() -> Packet {
    let service_type = ServiceType::new("printer", Protocol::Tcp).unwrap();
    let fullname = service_type.instance_name("Front Desk", LOCAL_DOMAIN);
    let host: Name = "frontdesk.local.".parse().unwrap();

    let mut txt = TxtData::new();
    txt.insert("txtvers", TxtValue::from("1"));
    txt.insert("paper", TxtValue::from("a4"));
    txt.insert("color", TxtValue::Flag);

    let mut packet = Packet::response();
    packet.answers.push(Record::new(
        service_type.to_name(LOCAL_DOMAIN),
        Type::PTR,
        Ttl::from(4500),
        Rdata::Ptr(fullname.clone()),
    ));
    packet.answers.push(Record::new(
        fullname.clone(),
        Type::SRV,
        Ttl::from(120),
        Rdata::Srv {
            priority: 0,
            weight: 0,
            port: 631,
            target: host.clone(),
        },
    ));
    packet.answers.push(Record::new(
        fullname,
        Type::TXT,
        Ttl::from(4500),
        Rdata::Txt(txt),
    ));
    packet.additionals.push(Record::new(
        host,
        Type::A,
        Ttl::from(120),
        Rdata::A("192.168.1.50".parse().unwrap()),
    ));
    packet
}

#[test]
fn a_full_instance_bundle_round_trips_byte_exact() {
    let packet = instance_bundle();
    let octets = packet.encode();

    let parsed = Packet::parse(&octets, origin()).unwrap();
    assert!(parsed.is_answer());
    assert!(parsed.is_valid());
    assert!(!parsed.is_legacy());
    assert_eq!(parsed.answers, packet.answers);
    assert_eq!(parsed.additionals, packet.additionals);

    // The canonical encoding is stable across a decode/encode cycle,
    // label compression included.
    assert_eq!(parsed.encode(), octets);
}

#[test]
fn compression_makes_the_bundle_small() {
    let packet = instance_bundle();
    let octets = packet.encode();
    // The instance and type names appear four times; without
    // compression this bundle would be well over 300 octets.
    assert!(
        octets.len() < 220,
        "expected a compressed bundle, got {} octets",
        octets.len()
    );
}

#[test]
fn truncated_packets_are_rejected() {
    let octets = instance_bundle().encode();
    for cut in [4, 13, octets.len() / 2, octets.len() - 1] {
        assert!(
            Packet::parse(&octets[..cut], origin()).is_err(),
            "a packet cut to {cut} octets must not parse"
        );
    }
}

#[test]
fn questions_round_trip_with_their_qu_flag() {
    let mut packet = Packet::query();
    packet.questions.push(
        Question::new("_printer._tcp.local.".parse().unwrap(), Type::PTR).unicast(true),
    );
    packet
        .questions
        .push(Question::new("frontdesk.local.".parse().unwrap(), Type::A));

    let parsed = Packet::parse(&packet.encode(), origin()).unwrap();
    assert!(parsed.is_query());
    assert!(parsed.questions[0].unicast_response);
    assert!(!parsed.questions[1].unicast_response);
}

#[test]
fn unknown_record_types_survive_untouched() {
    let mut packet = Packet::response();
    packet.answers.push(Record::new(
        "weird.local.".parse().unwrap(),
        Type::from(0x4242),
        Ttl::from(60),
        Rdata::Other(b"\x00\x01\xff\xfe".to_vec().into_boxed_slice()),
    ));
    let octets = packet.encode();
    let parsed = Packet::parse(&octets, origin()).unwrap();
    assert_eq!(parsed.answers, packet.answers);
    assert_eq!(parsed.encode(), octets);
}

#[test]
fn service_types_and_names_interoperate() {
    let service_type: ServiceType = "_printer._tcp".parse().unwrap();
    let fullname = service_type.instance_name("Front Desk", LOCAL_DOMAIN);
    assert_eq!(fullname.to_string(), "Front Desk._printer._tcp.local.");

    let name_only = Service::name_only(&fullname);
    assert_eq!(name_only.name, "Front Desk");
    assert_eq!(
        name_only.service_type,
        Some(ServiceType::new("printer", Protocol::Tcp).unwrap())
    );
    assert!(name_only.addresses.is_empty());
}
