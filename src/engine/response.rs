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

//! Response senders.
//!
//! Three shapes of response share one machine: ordinary multicast
//! responses (with optional repetition for announcements), goodbyes
//! (TTL-0 clones of the answers), and unicast responses to a specific
//! querier (with the legacy fixups of [RFC 6762 § 6.7] when the
//! querier is a one-shot resolver).
//!
//! The next packet is prepared ahead of its send time so that answers
//! arriving from other responders in the meantime can knock duplicate
//! records out of it ([RFC 6762 § 7.4], duplicate answer
//! suppression).

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use rand::Rng;

use super::Ctx;
use crate::message::{Packet, Question};
use crate::rr::{Record, Ttl, Type};

/// The suppression window for ordinary responses: a record multicast
/// within this span is not repeated.
const SUPPRESSION_WINDOW: Duration = Duration::from_secs(1);

/// The tighter window used for defensive responses, which must assert
/// our records promptly even if they went out recently.
const DEFENSIVE_WINDOW: Duration = Duration::from_millis(250);

/// The TTL ceiling for legacy unicast responses (RFC 6762 § 6.7).
const LEGACY_TTL_CAP: Ttl = Ttl::from_secs(10);

////////////////////////////////////////////////////////////////////////
// STYLES                                                             //
////////////////////////////////////////////////////////////////////////

/// The identity of a legacy querier, echoed back in the response.
#[derive(Clone, Debug)]
pub(crate) struct LegacyInfo {
    pub id: u16,
    pub questions: Vec<Question>,
}

/// Which shape of response this machine sends.
#[derive(Clone, Debug)]
pub(crate) enum ResponseStyle {
    Multicast { defensive: bool, repeats: u32 },
    Goodbye { repeats: u32 },
    Unicast {
        dest: SocketAddr,
        legacy: Option<LegacyInfo>,
        defensive: bool,
    },
}

////////////////////////////////////////////////////////////////////////
// RESPONSE MACHINE                                                   //
////////////////////////////////////////////////////////////////////////

pub(crate) struct Response {
    answers: Vec<Record>,
    /// The records queued for the next packet; incoming duplicate
    /// answers trim this.
    queued: Vec<Record>,
    style: ResponseStyle,
    next_send: Option<Instant>,
    interval: Duration,
    sends_done: u32,
    finished: bool,
}

impl Response {
    pub fn new(answers: Vec<Record>, style: ResponseStyle) -> Self {
        let queued = answers.clone();
        Self {
            answers,
            queued,
            style,
            next_send: None,
            interval: Duration::from_secs(1),
            sends_done: 0,
            finished: false,
        }
    }

    pub fn start(&mut self, ctx: &mut Ctx) {
        // RFC 6762 § 6: responses containing shared records wait a
        // random 20–120 ms so that several responders to the same
        // question interleave; responses that are all-unique, are
        // defending something, or answer a legacy querier go at once.
        let delay = match &self.style {
            ResponseStyle::Goodbye { .. } => Duration::ZERO,
            ResponseStyle::Multicast { defensive: true, .. }
            | ResponseStyle::Unicast { defensive: true, .. }
            | ResponseStyle::Unicast { legacy: Some(_), .. } => Duration::ZERO,
            _ => {
                if self.answers.iter().any(|record| !record.is_unique()) {
                    Duration::from_millis(rand::rng().random_range(20..=120))
                } else {
                    Duration::ZERO
                }
            }
        };
        self.next_send = Some(ctx.now + delay);
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.next_send
    }

    pub fn on_timer(&mut self, ctx: &mut Ctx) {
        if self.finished || self.next_send.map_or(true, |at| at > ctx.now) {
            return;
        }
        self.send_now(ctx);
    }

    fn send_now(&mut self, ctx: &mut Ctx) {
        let (packet, dest) = self.build_packet(ctx);
        if !packet.is_empty() {
            ctx.send(packet, dest);
        }
        self.sends_done += 1;

        let repeats = match &self.style {
            ResponseStyle::Multicast { repeats, .. } | ResponseStyle::Goodbye { repeats } => {
                *repeats
            }
            ResponseStyle::Unicast { .. } => 1,
        };
        if self.sends_done < repeats {
            // Announcement repetition: one second, then doubling
            // (RFC 6762 § 8.3).
            self.next_send = Some(ctx.now + self.interval);
            self.interval *= 2;
            self.queued = self.answers.clone();
        } else {
            self.finished = true;
        }
    }

    fn build_packet(&mut self, ctx: &mut Ctx) -> (Packet, Option<SocketAddr>) {
        match self.style.clone() {
            ResponseStyle::Goodbye { .. } => {
                let mut packet = Packet::response();
                packet.answers = self.answers.iter().map(Record::to_goodbye).collect();
                (packet, None)
            }
            ResponseStyle::Multicast { defensive, .. } => {
                let window = if defensive {
                    DEFENSIVE_WINDOW
                } else {
                    SUPPRESSION_WINDOW
                };
                let answers: Vec<Record> = self
                    .queued
                    .iter()
                    .filter(|record| !ctx.history.has_added_within(record, window, ctx.now))
                    .cloned()
                    .collect();
                let mut packet = Packet::response();
                packet.additionals = collect_additionals(&answers);
                packet.answers = answers;
                (packet, None)
            }
            ResponseStyle::Unicast {
                dest,
                legacy,
                ..
            } => {
                let mut packet = Packet::response();
                let answers = self.queued.clone();
                match legacy {
                    Some(info) => {
                        // Legacy fixups: echo the transaction ID and the
                        // questions, cap TTLs at ten seconds, clear the
                        // cache-flush bit, and strip NSEC records, none
                        // of which a one-shot resolver understands.
                        packet.id = info.id;
                        packet.questions = info.questions;
                        packet.additionals =
                            legacy_fixup(collect_additionals(&answers));
                        packet.answers = legacy_fixup(answers);
                    }
                    None => {
                        packet.additionals = collect_additionals(&answers);
                        packet.answers = answers;
                    }
                }
                (packet, Some(dest))
            }
        }
    }

    /// Duplicate answer suppression: records another responder just
    /// multicast need not be repeated by us.
    pub fn on_answer(&mut self, packet: &Packet, ctx: &mut Ctx) {
        if self.finished
            || matches!(self.style, ResponseStyle::Goodbye { .. })
            || packet.is_local(ctx.local_addrs)
        {
            return;
        }
        for incoming in packet.answers.iter().chain(packet.additionals.iter()) {
            if incoming.ttl == Ttl::ZERO {
                // A goodbye is not a confirmation of the record.
                continue;
            }
            self.queued.retain(|queued| queued != incoming);
        }
    }

    pub fn on_wake(&mut self, _ctx: &mut Ctx) {
        self.finished = true;
    }

    pub fn on_error(&mut self, _message: &str) {}

    pub fn stop(&mut self, _ctx: &mut Ctx) {
        self.finished = true;
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }
}

/// Gathers the additionals that ride along with `answers`: the union
/// of each answer's additional set, minus anything already present as
/// an answer.
fn collect_additionals(answers: &[Record]) -> Vec<Record> {
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

/// Applies the record-level legacy fixups.
fn legacy_fixup(records: Vec<Record>) -> Vec<Record> {
    records
        .into_iter()
        .filter(|record| record.rr_type != Type::NSEC)
        .map(|record| {
            let mut record = record.clone_with_ttl(record.ttl.min(LEGACY_TTL_CAP));
            record.cache_flush = false;
            record
        })
        .collect()
}

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rr::Rdata;

    fn a_record(name: &str, addr: &str, ttl: u32) -> Record {
        Record::new(
            name.parse().unwrap(),
            Type::A,
            Ttl::from(ttl),
            Rdata::A(addr.parse().unwrap()),
        )
    }

    #[test]
    fn legacy_fixup_caps_ttls_and_strips_nsec() {
        let a = a_record("host.local.", "10.0.0.1", 120);
        let nsec = Record::new(
            "host.local.".parse().unwrap(),
            Type::NSEC,
            Ttl::from(120),
            Rdata::Nsec {
                next: "host.local.".parse().unwrap(),
                types: vec![Type::A],
            },
        );
        let fixed = legacy_fixup(vec![a, nsec]);
        assert_eq!(fixed.len(), 1);
        assert_eq!(fixed[0].ttl, Ttl::from(10));
        assert!(!fixed[0].cache_flush);
    }

    #[test]
    fn legacy_fixup_keeps_short_ttls() {
        let a = a_record("host.local.", "10.0.0.1", 4);
        let fixed = legacy_fixup(vec![a]);
        assert_eq!(fixed[0].ttl, Ttl::from(4));
    }

    #[test]
    fn additionals_exclude_answers() {
        let extra = a_record("host.local.", "10.0.0.9", 120);
        let answer = a_record("other.local.", "10.0.0.1", 120)
            .with_additionals(vec![extra.clone(), extra.clone()]);
        let second = extra.clone().with_additionals(vec![extra.clone()]);
        let additionals = collect_additionals(&[answer, second]);
        // `extra` is itself an answer, so nothing remains.
        assert!(additionals.is_empty());
    }
}
