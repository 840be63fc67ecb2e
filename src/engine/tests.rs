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

//! Scenario tests for the engine and its state machines.
//!
//! The engine is driven synchronously: events are handed to
//! [`Engine::handle_event`] and time is advanced by calling
//! [`Engine::advance`] with fabricated instants, so probing, backoff,
//! and TTL behavior run in microseconds of real time. Outbound packets
//! are captured in `Engine::sent`.

use std::net::SocketAddr;
use std::sync::mpsc::{self, Receiver};
use std::time::{Duration, Instant};

use super::*;
use crate::rr::{Rdata, Ttl, TxtData, TxtValue};

const REMOTE: &str = "192.168.1.50:5353";
const LEGACY_REMOTE: &str = "192.168.1.50:49152";

fn test_engine() -> Engine {
    let (tx, _rx) = mpsc::channel();
    Engine::new(
        "test".to_owned(),
        tx,
        Vec::new(),
        vec!["192.168.1.20".parse().unwrap(), "127.0.0.1".parse().unwrap()],
    )
}

/// Advances the engine from `from` to `to` in 50 ms steps, firing
/// every deadline in between.
fn run_until(engine: &mut Engine, from: Instant, to: Instant) {
    let mut now = from;
    while now < to {
        now = (now + Duration::from_millis(50)).min(to);
        engine.advance(now);
    }
}

fn srv_record(fullname: &str, host: &str, port: u16) -> Record {
    Record::new(
        fullname.parse().unwrap(),
        Type::SRV,
        Ttl::from(120),
        Rdata::Srv {
            priority: 0,
            weight: 0,
            port,
            target: host.parse().unwrap(),
        },
    )
}

fn txt_record(fullname: &str) -> Record {
    let mut txt = TxtData::new();
    txt.insert("path", TxtValue::from("/"));
    Record::new(
        fullname.parse().unwrap(),
        Type::TXT,
        Ttl::from(4500),
        Rdata::Txt(txt),
    )
}

fn a_record(host: &str, addr: &str) -> Record {
    Record::new(
        host.parse().unwrap(),
        Type::A,
        Ttl::from(120),
        Rdata::A(addr.parse().unwrap()),
    )
}

fn ptr_record(type_name: &str, fullname: &str) -> Record {
    Record::new(
        type_name.parse().unwrap(),
        Type::PTR,
        Ttl::from(4500),
        Rdata::Ptr(fullname.parse().unwrap()),
    )
}

fn instance_records(fullname: &str, host: &str, port: u16) -> Vec<Record> {
    vec![
        srv_record(fullname, host, port),
        txt_record(fullname),
        ptr_record("_test._tcp.local.", fullname),
        a_record(host, "192.168.1.20"),
    ]
}

fn start_responder(
    engine: &mut Engine,
    records: Vec<Record>,
    instance: Option<&str>,
    now: Instant,
) -> (MachineId, Receiver<ResponderEvent>) {
    let (events_tx, events_rx) = mpsc::channel();
    let (reply_tx, reply_rx) = mpsc::channel();
    engine.handle_event(
        Event::Command(Command::StartResponder {
            records,
            bridgeable: RecordCollection::new(),
            instance: instance.map(str::to_owned),
            announce_repeats: 1,
            events: events_tx,
            reply: reply_tx,
        }),
        now,
    );
    (reply_rx.recv().unwrap(), events_rx)
}

fn inject(engine: &mut Engine, packet: &Packet, origin: &str, now: Instant) {
    let origin: SocketAddr = origin.parse().unwrap();
    engine.handle_event(Event::Datagram(packet.encode(), origin), now);
}

fn answer_packet(records: Vec<Record>) -> Packet {
    let mut packet = Packet::response();
    packet.answers = records;
    packet
}

fn events_of<T>(rx: &Receiver<T>) -> Vec<T> {
    rx.try_iter().collect()
}

////////////////////////////////////////////////////////////////////////
// PROBING                                                            //
////////////////////////////////////////////////////////////////////////

#[test]
fn probe_on_a_quiet_network_succeeds_after_750ms() {
    let mut engine = test_engine();
    let t0 = Instant::now();
    let records = instance_records("Quiet._test._tcp.local.", "quiet.local.", 8080);
    let (_, events) = start_responder(&mut engine, records, Some("Quiet"), t0);

    // Nothing can complete before the three packets plus the quiet
    // span have elapsed.
    run_until(&mut engine, t0, t0 + Duration::from_millis(700));
    assert!(!events_of(&events)
        .iter()
        .any(|e| matches!(e, ResponderEvent::ProbingComplete)));

    run_until(
        &mut engine,
        t0 + Duration::from_millis(700),
        t0 + Duration::from_millis(1200),
    );
    let seen = events_of(&events);
    assert!(seen
        .iter()
        .any(|e| matches!(e, ResponderEvent::ProbingComplete)));
    assert!(!seen.iter().any(|e| matches!(e, ResponderEvent::Renamed(_))));

    // Exactly three probe packets went out, each with the records in
    // the authority section and a question per name.
    let probes: Vec<&Packet> = engine
        .sent
        .iter()
        .map(|(packet, _)| packet)
        .filter(|packet| packet.is_probe())
        .collect();
    assert_eq!(probes.len(), 3);
    for probe in probes {
        assert!(!probe.questions.is_empty());
        assert_eq!(probe.authorities.len(), 3);
    }

    // The announcement followed.
    assert!(engine
        .sent
        .iter()
        .any(|(packet, dest)| packet.is_answer() && dest.is_none()));
}

#[test]
fn probe_completes_early_when_all_records_are_confirmed() {
    let mut engine = test_engine();
    let t0 = Instant::now();
    let records = instance_records("Twin._test._tcp.local.", "twin.local.", 8080);
    let (_, events) = start_responder(&mut engine, records.clone(), Some("Twin"), t0);

    // An identical twin answers with every proposed record.
    run_until(&mut engine, t0, t0 + Duration::from_millis(300));
    inject(
        &mut engine,
        &answer_packet(records),
        REMOTE,
        t0 + Duration::from_millis(320),
    );
    engine.advance(t0 + Duration::from_millis(320));

    let seen = events_of(&events);
    assert!(seen
        .iter()
        .any(|e| matches!(e, ResponderEvent::ProbingComplete)));
    assert!(!seen.iter().any(|e| matches!(e, ResponderEvent::Renamed(_))));
    // Early success skips the announcement.
    assert!(!engine
        .sent
        .iter()
        .any(|(packet, dest)| packet.is_answer() && dest.is_none()));
}

#[test]
fn conflicting_answer_during_probe_forces_a_rename() {
    let mut engine = test_engine();
    let t0 = Instant::now();
    let records = instance_records("Test #2._test._tcp.local.", "host-a.local.", 4444);
    let (_, events) = start_responder(&mut engine, records, Some("Test #2"), t0);

    // A defender holds the same instance name at a different port.
    run_until(&mut engine, t0, t0 + Duration::from_millis(300));
    inject(
        &mut engine,
        &answer_packet(vec![srv_record(
            "Test #2._test._tcp.local.",
            "host-b.local.",
            5555,
        )]),
        REMOTE,
        t0 + Duration::from_millis(320),
    );
    run_until(
        &mut engine,
        t0 + Duration::from_millis(320),
        t0 + Duration::from_secs(3),
    );

    let seen = events_of(&events);
    let renames: Vec<&ResponderEvent> = seen
        .iter()
        .filter(|e| matches!(e, ResponderEvent::Renamed(_)))
        .collect();
    assert_eq!(renames.len(), 1);
    assert!(
        matches!(renames[0], ResponderEvent::Renamed(name) if name == "Test #2 (2)")
    );
    // The renamed instance eventually wins its probe.
    assert!(seen
        .iter()
        .any(|e| matches!(e, ResponderEvent::ProbingComplete)));
    // Later probes carry the renamed records.
    let last_probe = engine
        .sent
        .iter()
        .map(|(packet, _)| packet)
        .filter(|packet| packet.is_probe())
        .last()
        .unwrap();
    assert!(last_probe.authorities.iter().any(|record| {
        record.name == "Test #2 (2)._test._tcp.local.".parse().unwrap()
    }));
}

#[test]
fn a_second_instance_with_a_taken_name_renames_itself() {
    let mut engine = test_engine();
    let t0 = Instant::now();
    // The first instance's records are already established on the
    // link (they could just as well be our own, looped back).
    inject(
        &mut engine,
        &answer_packet(vec![srv_record(
            "Test #2._test._tcp.local.",
            "host-a.local.",
            4444,
        )]),
        REMOTE,
        t0,
    );

    // A second advertisement claims the same instance name at a
    // different port.
    let records = instance_records("Test #2._test._tcp.local.", "host-b.local.", 5555);
    let (_, events) = start_responder(&mut engine, records, Some("Test #2"), t0);
    run_until(&mut engine, t0, t0 + Duration::from_secs(3));

    let seen = events_of(&events);
    assert!(seen
        .iter()
        .any(|e| matches!(e, ResponderEvent::Renamed(name) if name == "Test #2 (2)")));
    assert!(seen
        .iter()
        .any(|e| matches!(e, ResponderEvent::ProbingComplete)));
    // Nothing was ever announced under the taken name.
    for (packet, _) in &engine.sent {
        for record in packet.answers.iter().chain(packet.authorities.iter()) {
            if record.rr_type == Type::SRV {
                assert_eq!(
                    record.name,
                    "Test #2 (2)._test._tcp.local.".parse().unwrap()
                );
            }
        }
    }
}

#[test]
fn simultaneous_probe_tiebreak_is_deterministic() {
    // The side with the lexicographically smaller record loses and
    // backs off for a second; the other side never notices.
    let our_srv = srv_record("Race._test._tcp.local.", "host-a.local.", 4444);
    let their_srv = srv_record("Race._test._tcp.local.", "host-b.local.", 4444);
    assert_eq!(
        our_srv.cmp_tiebreak(&their_srv),
        std::cmp::Ordering::Less,
        "host-a sorts before host-b"
    );

    // Losing side: the rival's record is greater, so our probe backs
    // off and completion slips past the nominal window.
    let mut engine = test_engine();
    let t0 = Instant::now();
    let (_, events) = start_responder(
        &mut engine,
        vec![our_srv.clone()],
        Some("Race"),
        t0,
    );
    let mut rival = Packet::query();
    rival.authorities = vec![their_srv.clone()];
    inject(&mut engine, &rival, REMOTE, t0 + Duration::from_millis(10));
    run_until(
        &mut engine,
        t0 + Duration::from_millis(10),
        t0 + Duration::from_millis(1700),
    );
    assert!(!events_of(&events)
        .iter()
        .any(|e| matches!(e, ResponderEvent::ProbingComplete)));
    run_until(
        &mut engine,
        t0 + Duration::from_millis(1700),
        t0 + Duration::from_secs(4),
    );
    assert!(events_of(&events)
        .iter()
        .any(|e| matches!(e, ResponderEvent::ProbingComplete)));

    // Winning side: the rival's record is smaller; the probe is
    // unbothered and completes inside the normal window.
    let mut engine = test_engine();
    let t0 = Instant::now();
    let (_, events) = start_responder(
        &mut engine,
        vec![their_srv.clone()],
        Some("Race"),
        t0,
    );
    let mut rival = Packet::query();
    rival.authorities = vec![our_srv.clone()];
    inject(&mut engine, &rival, REMOTE, t0 + Duration::from_millis(10));
    run_until(&mut engine, t0, t0 + Duration::from_millis(1300));
    assert!(events_of(&events)
        .iter()
        .any(|e| matches!(e, ResponderEvent::ProbingComplete)));
}

////////////////////////////////////////////////////////////////////////
// RESPONDING                                                         //
////////////////////////////////////////////////////////////////////////

/// Brings a responder to the responding state and clears the sent log.
fn responding_engine(
    records: Vec<Record>,
    instance: &str,
) -> (Engine, MachineId, Receiver<ResponderEvent>, Instant) {
    let mut engine = test_engine();
    let t0 = Instant::now();
    let (id, events) = start_responder(&mut engine, records, Some(instance), t0);
    run_until(&mut engine, t0, t0 + Duration::from_secs(2));
    assert!(events_of(&events)
        .iter()
        .any(|e| matches!(e, ResponderEvent::ProbingComplete)));
    engine.sent.clear();
    (engine, id, events, t0 + Duration::from_secs(2))
}

#[test]
fn responder_answers_a_ptr_query() {
    let records = instance_records("Web._test._tcp.local.", "web.local.", 8080);
    let (mut engine, _, _, now) = responding_engine(records, "Web");

    let mut query = Packet::query();
    query
        .questions
        .push(Question::new("_test._tcp.local.".parse().unwrap(), Type::PTR));
    inject(&mut engine, &query, REMOTE, now);
    run_until(&mut engine, now, now + Duration::from_millis(300));

    let response = engine
        .sent
        .iter()
        .find(|(packet, dest)| packet.is_answer() && dest.is_none())
        .map(|(packet, _)| packet)
        .expect("a multicast response");
    assert!(response
        .answers
        .iter()
        .any(|record| record.rr_type == Type::PTR));
}

#[test]
fn legacy_queries_get_legacy_unicast_responses() {
    let records = instance_records("Web._test._tcp.local.", "web.local.", 8080);
    let (mut engine, _, _, now) = responding_engine(records, "Web");

    let mut query = Packet::query();
    query.id = 0x1234;
    query
        .questions
        .push(Question::new("Web._test._tcp.local.".parse().unwrap(), Type::SRV));
    inject(&mut engine, &query, LEGACY_REMOTE, now);
    run_until(&mut engine, now, now + Duration::from_millis(200));

    let (response, dest) = engine
        .sent
        .iter()
        .find(|(packet, dest)| packet.is_answer() && dest.is_some())
        .expect("a unicast response");
    assert_eq!(*dest, Some(LEGACY_REMOTE.parse().unwrap()));
    assert_eq!(response.id, 0x1234);
    assert_eq!(response.questions.len(), 1);
    for record in response.answers.iter().chain(response.additionals.iter()) {
        assert!(record.ttl.as_secs() <= 10);
        assert!(!record.cache_flush);
        assert_ne!(record.rr_type, Type::NSEC);
    }
}

#[test]
fn questions_for_missing_types_get_nsec() {
    let records = instance_records("Web._test._tcp.local.", "web.local.", 8080);
    let (mut engine, _, _, now) = responding_engine(records, "Web");

    // We own SRV and TXT at the instance name, but no AAAA.
    let mut query = Packet::query();
    query.questions.push(Question::new(
        "Web._test._tcp.local.".parse().unwrap(),
        Type::AAAA,
    ));
    inject(&mut engine, &query, REMOTE, now);
    run_until(&mut engine, now, now + Duration::from_millis(300));

    let response = engine
        .sent
        .iter()
        .find(|(packet, _)| packet.is_answer())
        .map(|(packet, _)| packet)
        .expect("a response");
    let nsec = response
        .answers
        .iter()
        .find(|record| record.rr_type == Type::NSEC)
        .expect("an NSEC record");
    match &nsec.rdata {
        Rdata::Nsec { types, .. } => {
            assert!(types.contains(&Type::SRV));
            assert!(types.contains(&Type::TXT));
            assert!(!types.contains(&Type::AAAA));
        }
        other => panic!("unexpected rdata {other:?}"),
    }
}

#[test]
fn known_answers_suppress_our_response() {
    let records = instance_records("Web._test._tcp.local.", "web.local.", 8080);
    let (mut engine, _, _, now) = responding_engine(records, "Web");

    let mut query = Packet::query();
    query
        .questions
        .push(Question::new("_test._tcp.local.".parse().unwrap(), Type::PTR));
    // The asker already knows our PTR, fresh.
    query
        .answers
        .push(ptr_record("_test._tcp.local.", "Web._test._tcp.local."));
    inject(&mut engine, &query, REMOTE, now);
    run_until(&mut engine, now, now + Duration::from_millis(300));

    assert!(
        !engine.sent.iter().any(|(packet, _)| packet.is_answer()),
        "a known answer must not be repeated"
    );
}

#[test]
fn goodbye_on_clean_stop_but_not_on_forced_stop() {
    let records = instance_records("Bye._test._tcp.local.", "bye.local.", 8080);
    let (mut engine, id, events, now) = responding_engine(records.clone(), "Bye");

    engine.handle_event(
        Event::Command(Command::StopResponder { id, forced: false }),
        now,
    );
    run_until(&mut engine, now, now + Duration::from_millis(200));
    let goodbye = engine
        .sent
        .iter()
        .find(|(packet, _)| packet.is_answer())
        .map(|(packet, _)| packet)
        .expect("a goodbye packet");
    assert!(goodbye
        .answers
        .iter()
        .all(|record| record.ttl == Ttl::ZERO));
    assert!(events_of(&events)
        .iter()
        .any(|e| matches!(e, ResponderEvent::Stopped)));

    // Forced stop: silence.
    let (mut engine, id, _, now) = responding_engine(records, "Bye");
    engine.handle_event(
        Event::Command(Command::StopResponder { id, forced: true }),
        now,
    );
    run_until(&mut engine, now, now + Duration::from_millis(200));
    assert!(engine.sent.is_empty());
}

#[test]
fn txt_updates_reannounce_only_on_change() {
    let records = instance_records("Upd._test._tcp.local.", "upd.local.", 8080);
    let (mut engine, id, _, now) = responding_engine(records, "Upd");

    let mut same = TxtData::new();
    same.insert("path", TxtValue::from("/"));
    engine.handle_event(
        Event::Command(Command::UpdateResponder {
            id,
            rr_type: Type::TXT,
            apply: Box::new(move |record| {
                record.rdata = Rdata::Txt(same.clone());
            }),
        }),
        now,
    );
    run_until(&mut engine, now, now + Duration::from_millis(300));
    assert!(
        engine.sent.is_empty(),
        "an identical TXT must not be re-announced"
    );

    let mut changed = TxtData::new();
    changed.insert("path", TxtValue::from("/new"));
    engine.handle_event(
        Event::Command(Command::UpdateResponder {
            id,
            rr_type: Type::TXT,
            apply: Box::new(move |record| {
                record.rdata = Rdata::Txt(changed.clone());
            }),
        }),
        now,
    );
    run_until(&mut engine, now, now + Duration::from_millis(300));
    let announce = engine
        .sent
        .iter()
        .find(|(packet, _)| packet.is_answer())
        .map(|(packet, _)| packet)
        .expect("a re-announcement");
    assert!(announce
        .answers
        .iter()
        .any(|record| record.rr_type == Type::TXT));
}

#[test]
fn goodbye_for_our_record_triggers_a_defensive_reannounce() {
    let records = instance_records("Def._test._tcp.local.", "def.local.", 8080);
    let (mut engine, _, _, now) = responding_engine(records.clone(), "Def");

    // Somebody multicasts a goodbye for our SRV record.
    let goodbye = srv_record("Def._test._tcp.local.", "def.local.", 8080).to_goodbye();
    inject(&mut engine, &answer_packet(vec![goodbye]), REMOTE, now);
    run_until(&mut engine, now, now + Duration::from_millis(300));

    let defense = engine
        .sent
        .iter()
        .find(|(packet, _)| packet.is_answer())
        .map(|(packet, _)| packet)
        .expect("a defensive re-announcement");
    assert!(defense.answers.iter().any(|record| {
        record.rr_type == Type::SRV && record.ttl != Ttl::ZERO
    }));
}

////////////////////////////////////////////////////////////////////////
// QUERYING                                                           //
////////////////////////////////////////////////////////////////////////

fn start_query(
    engine: &mut Engine,
    questions: Vec<Question>,
    options: QueryOptions,
    now: Instant,
) -> (MachineId, Receiver<QueryEvent>) {
    let (events_tx, events_rx) = mpsc::channel();
    let (reply_tx, reply_rx) = mpsc::channel();
    engine.handle_event(
        Event::Command(Command::StartQuery {
            questions,
            options,
            events: Some(events_tx),
            reply: reply_tx,
        }),
        now,
    );
    (reply_rx.recv().unwrap(), events_rx)
}

#[test]
fn continuous_queries_carry_known_answers_and_back_off() {
    let mut engine = test_engine();
    let t0 = Instant::now();
    let question = Question::new("_test._tcp.local.".parse().unwrap(), Type::PTR);
    let (_, events) = start_query(
        &mut engine,
        vec![question],
        QueryOptions::default(),
        t0,
    );

    run_until(&mut engine, t0, t0 + Duration::from_millis(200));
    assert_eq!(
        engine
            .sent
            .iter()
            .filter(|(packet, _)| packet.is_query())
            .count(),
        1
    );

    // A shared answer arrives; it is reported and becomes a known
    // answer in the next round.
    inject(
        &mut engine,
        &answer_packet(vec![ptr_record(
            "_test._tcp.local.",
            "Web._test._tcp.local.",
        )]),
        REMOTE,
        t0 + Duration::from_millis(250),
    );
    assert!(events_of(&events)
        .iter()
        .any(|e| matches!(e, QueryEvent::Answer { .. })));

    run_until(
        &mut engine,
        t0 + Duration::from_millis(250),
        t0 + Duration::from_millis(1400),
    );
    let second = engine
        .sent
        .iter()
        .filter(|(packet, _)| packet.is_query())
        .nth(1)
        .map(|(packet, _)| packet)
        .expect("a second round");
    assert_eq!(second.answers.len(), 1);
    assert!(!second.answers[0].cache_flush);

    // The shared question never exhausts; rounds keep coming, spaced
    // exponentially.
    run_until(
        &mut engine,
        t0 + Duration::from_millis(1400),
        t0 + Duration::from_secs(8),
    );
    assert!(
        engine
            .sent
            .iter()
            .filter(|(packet, _)| packet.is_query())
            .count()
            >= 3
    );
}

#[test]
fn one_shot_queries_report_timeouts() {
    let mut engine = test_engine();
    let t0 = Instant::now();
    let (_, events) = start_query(
        &mut engine,
        vec![Question::new("nobody.local.".parse().unwrap(), Type::A)],
        QueryOptions {
            continuous: false,
            ignore_cache: false,
            timeout: Some(Duration::from_secs(2)),
            legacy: false,
        },
        t0,
    );

    run_until(&mut engine, t0, t0 + Duration::from_secs(3));
    let seen = events_of(&events);
    assert!(seen.iter().any(|e| matches!(e, QueryEvent::Timeout)));
    assert!(seen.iter().any(|e| matches!(e, QueryEvent::Stopped)));
}

#[test]
fn one_shot_queries_stop_at_the_first_answer_packet() {
    let mut engine = test_engine();
    let t0 = Instant::now();
    let (_, events) = start_query(
        &mut engine,
        vec![Question::new("host.local.".parse().unwrap(), Type::A)],
        QueryOptions {
            continuous: false,
            ignore_cache: true,
            timeout: Some(Duration::from_secs(5)),
            legacy: false,
        },
        t0,
    );

    inject(
        &mut engine,
        &answer_packet(vec![a_record("host.local.", "192.168.1.77")]),
        REMOTE,
        t0 + Duration::from_millis(100),
    );
    let seen = events_of(&events);
    assert!(seen
        .iter()
        .any(|e| matches!(e, QueryEvent::Answer { record, .. }
            if record.rdata.as_address() == Some("192.168.1.77".parse().unwrap()))));
    assert!(seen.iter().any(|e| matches!(e, QueryEvent::Stopped)));
    // No timeout later.
    run_until(&mut engine, t0, t0 + Duration::from_secs(6));
    assert!(!events_of(&events)
        .iter()
        .any(|e| matches!(e, QueryEvent::Timeout)));
}

#[test]
fn queries_satisfied_from_the_cache_never_hit_the_network() {
    let mut engine = test_engine();
    let t0 = Instant::now();
    // Prime the cache with an answer.
    inject(
        &mut engine,
        &answer_packet(vec![a_record("cached.local.", "192.168.1.88")]),
        REMOTE,
        t0,
    );

    let (_, events) = start_query(
        &mut engine,
        vec![Question::new("cached.local.".parse().unwrap(), Type::A)],
        QueryOptions::default(),
        t0 + Duration::from_millis(10),
    );
    let seen = events_of(&events);
    assert!(seen.iter().any(|e| matches!(e, QueryEvent::Answer { .. })));
    assert!(seen.iter().any(|e| matches!(e, QueryEvent::Stopped)));

    run_until(&mut engine, t0, t0 + Duration::from_secs(2));
    assert!(!engine.sent.iter().any(|(packet, _)| packet.is_query()));
}

#[test]
fn peer_questions_suppress_our_duplicate() {
    let mut engine = test_engine();
    let t0 = Instant::now();
    let question = Question::new("_test._tcp.local.".parse().unwrap(), Type::PTR);
    start_query(&mut engine, vec![question.clone()], QueryOptions::default(), t0);

    // Before our first packet goes out, a peer asks the same question
    // multicast-style with no known answers.
    let mut peer = Packet::query();
    peer.questions.push(question);
    inject(&mut engine, &peer, REMOTE, t0 + Duration::from_millis(5));

    run_until(&mut engine, t0, t0 + Duration::from_millis(200));
    assert!(
        !engine.sent.iter().any(|(packet, _)| packet.is_query()),
        "the first round should have been suppressed"
    );

    // The next round happens anyway.
    run_until(
        &mut engine,
        t0 + Duration::from_millis(200),
        t0 + Duration::from_millis(1400),
    );
    assert!(engine.sent.iter().any(|(packet, _)| packet.is_query()));
}

#[test]
fn stopping_a_query_twice_is_harmless() {
    let mut engine = test_engine();
    let t0 = Instant::now();
    let (id, events) = start_query(
        &mut engine,
        vec![Question::new("x.local.".parse().unwrap(), Type::A)],
        QueryOptions::default(),
        t0,
    );
    engine.handle_event(Event::Command(Command::StopMachine { id }), t0);
    engine.handle_event(Event::Command(Command::StopMachine { id }), t0);
    run_until(&mut engine, t0, t0 + Duration::from_millis(100));

    let stops = events_of(&events)
        .iter()
        .filter(|e| matches!(e, QueryEvent::Stopped))
        .count();
    assert_eq!(stops, 1);
}

////////////////////////////////////////////////////////////////////////
// RESOLVING                                                          //
////////////////////////////////////////////////////////////////////////

fn start_resolver(
    engine: &mut Engine,
    fullname: &str,
    now: Instant,
) -> (MachineId, Receiver<ResolverEvent>) {
    let (events_tx, events_rx) = mpsc::channel();
    let (reply_tx, reply_rx) = mpsc::channel();
    engine.handle_event(
        Event::Command(Command::StartResolver {
            fullname: fullname.parse().unwrap(),
            events: events_tx,
            reply: reply_tx,
        }),
        now,
    );
    (reply_rx.recv().unwrap(), events_rx)
}

#[test]
fn resolver_assembles_a_service_from_scattered_records() {
    let mut engine = test_engine();
    let t0 = Instant::now();
    let (_, events) = start_resolver(&mut engine, "Web._test._tcp.local.", t0);

    // SRV and TXT arrive first; the service is not yet resolved.
    inject(
        &mut engine,
        &answer_packet(vec![
            srv_record("Web._test._tcp.local.", "web.local.", 8080),
            txt_record("Web._test._tcp.local."),
        ]),
        REMOTE,
        t0 + Duration::from_millis(100),
    );
    assert!(events_of(&events).is_empty());

    // The address completes the picture.
    inject(
        &mut engine,
        &answer_packet(vec![a_record("web.local.", "192.168.1.66")]),
        REMOTE,
        t0 + Duration::from_millis(200),
    );
    let seen = events_of(&events);
    let resolved = seen
        .iter()
        .find_map(|e| match e {
            ResolverEvent::Resolved(service) => Some(service),
            _ => None,
        })
        .expect("a resolved service");
    assert_eq!(resolved.name, "Web");
    assert_eq!(resolved.port, Some(8080));
    assert_eq!(resolved.host.as_deref(), Some("web.local."));
    assert_eq!(resolved.addresses, vec!["192.168.1.66".parse::<std::net::IpAddr>().unwrap()]);
    assert!(resolved.txt_raw.is_some());
}

#[test]
fn resolver_uses_the_cache_before_the_network() {
    let mut engine = test_engine();
    let t0 = Instant::now();
    // Everything needed is already cached.
    inject(
        &mut engine,
        &answer_packet(vec![
            srv_record("Hot._test._tcp.local.", "hot.local.", 9090),
            txt_record("Hot._test._tcp.local."),
            a_record("hot.local.", "192.168.1.55"),
        ]),
        REMOTE,
        t0,
    );

    let (_, events) = start_resolver(&mut engine, "Hot._test._tcp.local.", t0);
    let seen = events_of(&events);
    assert!(seen
        .iter()
        .any(|e| matches!(e, ResolverEvent::Resolved(s) if s.port == Some(9090))));
}

#[test]
fn resolver_times_out_into_down() {
    let mut engine = test_engine();
    let t0 = Instant::now();
    let (_, events) = start_resolver(&mut engine, "Ghost._test._tcp.local.", t0);

    run_until(&mut engine, t0, t0 + Duration::from_secs(11));
    assert!(events_of(&events)
        .iter()
        .any(|e| matches!(e, ResolverEvent::Down(_))));
}

#[test]
fn srv_target_change_resets_the_addresses() {
    let mut engine = test_engine();
    let t0 = Instant::now();
    let (_, events) = start_resolver(&mut engine, "Move._test._tcp.local.", t0);

    inject(
        &mut engine,
        &answer_packet(vec![
            srv_record("Move._test._tcp.local.", "old.local.", 8080),
            txt_record("Move._test._tcp.local."),
            a_record("old.local.", "192.168.1.11"),
        ]),
        REMOTE,
        t0 + Duration::from_millis(100),
    );
    assert!(events_of(&events)
        .iter()
        .any(|e| matches!(e, ResolverEvent::Resolved(_))));

    // The SRV moves to a new host: the stale address must go, and the
    // service resolves again only once the new address shows up.
    inject(
        &mut engine,
        &answer_packet(vec![srv_record(
            "Move._test._tcp.local.",
            "new.local.",
            8080,
        )]),
        REMOTE,
        t0 + Duration::from_millis(200),
    );
    inject(
        &mut engine,
        &answer_packet(vec![a_record("new.local.", "192.168.1.12")]),
        REMOTE,
        t0 + Duration::from_millis(300),
    );
    let seen = events_of(&events);
    let last = seen
        .iter()
        .rev()
        .find_map(|e| match e {
            ResolverEvent::Resolved(s) | ResolverEvent::Updated(s) => Some(s),
            _ => None,
        })
        .expect("a re-resolution");
    assert_eq!(last.host.as_deref(), Some("new.local."));
    assert_eq!(
        last.addresses,
        vec!["192.168.1.12".parse::<std::net::IpAddr>().unwrap()]
    );
}

#[test]
fn txt_changes_surface_as_updates() {
    let mut engine = test_engine();
    let t0 = Instant::now();
    let (_, events) = start_resolver(&mut engine, "Chg._test._tcp.local.", t0);

    inject(
        &mut engine,
        &answer_packet(vec![
            srv_record("Chg._test._tcp.local.", "chg.local.", 8080),
            txt_record("Chg._test._tcp.local."),
            a_record("chg.local.", "192.168.1.33"),
        ]),
        REMOTE,
        t0 + Duration::from_millis(100),
    );
    assert!(events_of(&events)
        .iter()
        .any(|e| matches!(e, ResolverEvent::Resolved(_))));

    // Identical TXT: no update.
    inject(
        &mut engine,
        &answer_packet(vec![txt_record("Chg._test._tcp.local.")]),
        REMOTE,
        t0 + Duration::from_millis(200),
    );
    assert!(events_of(&events).is_empty());

    // Changed TXT: an update.
    let mut txt = TxtData::new();
    txt.insert("path", TxtValue::from("/else"));
    inject(
        &mut engine,
        &answer_packet(vec![Record::new(
            "Chg._test._tcp.local.".parse().unwrap(),
            Type::TXT,
            Ttl::from(4500),
            Rdata::Txt(txt),
        )]),
        REMOTE,
        t0 + Duration::from_millis(300),
    );
    assert!(events_of(&events)
        .iter()
        .any(|e| matches!(e, ResolverEvent::Updated(_))));
}

////////////////////////////////////////////////////////////////////////
// WAKE AND CACHE INTERPLAY                                           //
////////////////////////////////////////////////////////////////////////

#[test]
fn wake_makes_a_responder_reprobe() {
    let records = instance_records("Nap._test._tcp.local.", "nap.local.", 8080);
    let (mut engine, _, _, now) = responding_engine(records, "Nap");

    engine.handle_event(Event::Wake, now);
    run_until(&mut engine, now, now + Duration::from_secs(2));
    assert!(
        engine.sent.iter().any(|(packet, _)| packet.is_probe()),
        "the responder must reprobe after a wake"
    );
}

#[test]
fn cache_expiry_reaches_queries_known_answer_lists() {
    let mut engine = test_engine();
    let t0 = Instant::now();
    let question = Question::new("_test._tcp.local.".parse().unwrap(), Type::PTR);
    start_query(&mut engine, vec![question], QueryOptions::default(), t0);

    // A short-lived shared answer becomes known...
    let mut short_ptr = ptr_record("_test._tcp.local.", "Brief._test._tcp.local.");
    short_ptr.ttl = Ttl::from(2);
    inject(
        &mut engine,
        &answer_packet(vec![short_ptr.clone()]),
        REMOTE,
        t0 + Duration::from_millis(10),
    );

    // ...then expires out of the interface cache, which must scrub it
    // from the known-answer list: the round after expiry carries no
    // known answers.
    run_until(&mut engine, t0, t0 + Duration::from_secs(8));
    let last_query = engine
        .sent
        .iter()
        .filter(|(packet, _)| packet.is_query())
        .last()
        .map(|(packet, _)| packet)
        .expect("query rounds");
    assert!(last_query.answers.is_empty());
}
