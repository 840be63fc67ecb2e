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

//! The responder state machine: probe, announce, respond, defend.
//!
//! A responder owns the record set of one advertisement on one
//! interface. It probes the unique records ([RFC 6762 § 8.1]),
//! announces them once won (§ 8.3), answers queries for them for as
//! long as it lives (§ 6), defends them against conflicting
//! announcements (§ 9), renames the instance when a conflict cannot
//! be won, and says goodbye when stopped cleanly (§ 10.1).

use std::sync::mpsc::Sender;
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use super::response::{LegacyInfo, Response, ResponseStyle};
use super::{probe::Probe, Ctx, Machine, MachineId, Notice, ResponderEvent};
use crate::message::Packet;
use crate::name::Name;
use crate::rr::{Rdata, Record, RecordCollection, Ttl, Type};

/// How many announcement packets a new record set gets by default.
pub const DEFAULT_ANNOUNCE_REPEATS: u32 = 1;

/// The conflict-budget parameters: at least this many conflicts...
const CONFLICT_BUDGET: u32 = 15;
/// ...within this window...
const CONFLICT_WINDOW: Duration = Duration::from_secs(10);
/// ...delay the next probe by this much...
const CONFLICT_PENALTY: Duration = Duration::from_secs(5);
/// ...and the count resets after this much quiet.
const CONFLICT_QUIET: Duration = Duration::from_secs(15);

/// The TTL given to NSEC records in negative responses.
const NSEC_TTL: Ttl = Ttl::from_secs(120);

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum State {
    Probing,
    Responding,
    Stopped,
}

////////////////////////////////////////////////////////////////////////
// RESPONDER MACHINE                                                  //
////////////////////////////////////////////////////////////////////////

pub(crate) struct Responder {
    records: Vec<Record>,
    bridgeable: RecordCollection,
    /// The instance label this responder may rename on conflict. A
    /// responder without one (say, bare host records) cannot recover
    /// from a conflict.
    instance: Option<String>,
    announce_repeats: u32,
    events: Sender<ResponderEvent>,
    state: State,
    probe: Option<MachineId>,
    conflict_count: u32,
    window_start: Option<Instant>,
    last_conflict: Option<Instant>,
    stopped_emitted: bool,
}

impl Responder {
    pub fn new(
        records: Vec<Record>,
        bridgeable: RecordCollection,
        instance: Option<String>,
        announce_repeats: u32,
        events: Sender<ResponderEvent>,
    ) -> Self {
        Self {
            records,
            bridgeable,
            instance,
            announce_repeats,
            events,
            state: State::Probing,
            probe: None,
            conflict_count: 0,
            window_start: None,
            last_conflict: None,
            stopped_emitted: false,
        }
    }

    pub fn start(&mut self, ctx: &mut Ctx) {
        self.send_probe(ctx);
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        None
    }

    pub fn on_timer(&mut self, _ctx: &mut Ctx) {}

    /// Enters (or re-enters) the probing state. Records the cache
    /// already confirms are skipped; a record the cache contradicts is
    /// a conflict the probe would lose anyway, so the rename happens
    /// right away; if nothing needs probing, the set is either fully
    /// established (early success) or announced outright.
    fn send_probe(&mut self, ctx: &mut Ctx) {
        self.state = State::Probing;
        let unique: Vec<&Record> = self.records.iter().filter(|r| r.is_unique()).collect();
        let mut probe_set: Vec<Record> = Vec::new();
        let mut conflicted = false;
        let mut all_known = !unique.is_empty();
        for record in unique {
            if ctx.cache.get(record, ctx.now).is_some() {
                continue;
            }
            all_known = false;
            if ctx.cache.has_conflict_with(record) {
                debug!(
                    "The cache already contradicts {:?}; the name is taken.",
                    record.name
                );
                conflicted = true;
                continue;
            }
            probe_set.push(record.clone());
        }

        if conflicted {
            self.register_conflict(ctx.now);
            self.rename_and_reprobe(ctx);
        } else if !probe_set.is_empty() {
            let penalty = if self.over_conflict_budget(ctx.now) {
                warn!("Conflict budget exceeded; delaying the next probe by 5 s.");
                CONFLICT_PENALTY
            } else {
                Duration::ZERO
            };
            let probe = Probe::new(probe_set, self.bridgeable.clone(), ctx.current, penalty);
            self.probe = Some(ctx.spawn(Machine::Probe(probe)));
        } else if all_known {
            self.on_probe_success(true, ctx);
        } else {
            self.on_probe_success(false, ctx);
        }
    }

    pub fn on_notice(&mut self, notice: Notice, ctx: &mut Ctx) {
        if self.state == State::Stopped {
            return;
        }
        match notice {
            Notice::ProbeComplete { early } => {
                self.probe = None;
                self.on_probe_success(early, ctx);
            }
            Notice::ProbeConflict => {
                self.probe = None;
                self.register_conflict(ctx.now);
                self.rename_and_reprobe(ctx);
            }
        }
    }

    fn on_probe_success(&mut self, early: bool, ctx: &mut Ctx) {
        self.state = State::Responding;
        let _ = self.events.send(ResponderEvent::ProbingComplete);
        if !early {
            self.announce(self.records.clone(), false, self.announce_repeats, ctx);
        }
    }

    fn announce(&self, records: Vec<Record>, defensive: bool, repeats: u32, ctx: &mut Ctx) {
        if records.is_empty() {
            return;
        }
        let response = Response::new(
            records,
            ResponseStyle::Multicast {
                defensive,
                repeats,
            },
        );
        ctx.spawn(Machine::Response(response));
    }

    /// The conflict budget of § 9: a run of conflicts in a short span
    /// smells like a feedback loop with another host, so back off.
    fn register_conflict(&mut self, now: Instant) {
        if self
            .last_conflict
            .map_or(true, |last| now - last > CONFLICT_QUIET)
        {
            self.conflict_count = 0;
            self.window_start = Some(now);
        }
        self.conflict_count += 1;
        self.last_conflict = Some(now);
    }

    fn over_conflict_budget(&self, now: Instant) -> bool {
        self.conflict_count >= CONFLICT_BUDGET
            && self
                .window_start
                .map_or(false, |start| now - start <= CONFLICT_WINDOW)
    }

    fn rename_and_reprobe(&mut self, ctx: &mut Ctx) {
        match self.instance.clone() {
            Some(label) => {
                let renamed = bump_instance_name(&label);
                info!(
                    "Instance name {:?} is taken; renaming to {:?}.",
                    label, renamed
                );
                self.apply_instance_label(&label, &renamed);
                self.instance = Some(renamed.clone());
                let _ = self.events.send(ResponderEvent::Renamed(renamed));
                self.send_probe(ctx);
            }
            None => {
                let _ = self.events.send(ResponderEvent::Error(
                    "record set lost its probe and cannot be renamed".to_owned(),
                ));
                self.finish();
            }
        }
    }

    /// Sibling bookkeeping: another interface's responder renamed, and
    /// this one must follow without emitting its own rename.
    pub fn apply_rename(&mut self, instance: String, ctx: &mut Ctx) {
        if let Some(label) = self.instance.clone() {
            if label != instance {
                self.apply_instance_label(&label, &instance);
                self.instance = Some(instance);
                if let Some(probe) = self.probe.take() {
                    ctx.stop_machine(probe);
                }
                self.send_probe(ctx);
            }
        }
    }

    /// Rewrites the instance label in every record this responder
    /// owns: owner names of instance-owned records and the targets of
    /// PTR records pointing at the instance.
    fn apply_instance_label(&mut self, old: &str, new: &str) {
        for record in &mut self.records {
            if first_label_is(&record.name, old) {
                record.name = replace_first_label(&record.name, new);
            }
            if let Rdata::Ptr(target) = &record.rdata {
                if first_label_is(target, old) {
                    record.rdata = Rdata::Ptr(replace_first_label(target, new));
                }
            }
            if let Rdata::Nsec { next, types } = &record.rdata {
                if first_label_is(next, old) {
                    record.rdata = Rdata::Nsec {
                        next: replace_first_label(next, new),
                        types: types.clone(),
                    };
                }
            }
            for additional in &mut record.additionals {
                if first_label_is(&additional.name, old) {
                    additional.name = replace_first_label(&additional.name, new);
                }
            }
        }
    }

    /// Live conflict detection and defense (§ 9): while responding,
    /// watch the link's answers for contradictions of our unique
    /// records and for premature goodbyes of our own data.
    pub fn on_answer(&mut self, packet: &Packet, ctx: &mut Ctx) {
        if self.state != State::Responding || packet.is_empty() {
            return;
        }
        let mut conflicted = false;
        let mut defend: Vec<Record> = Vec::new();
        for incoming in packet.answers.iter().chain(packet.additionals.iter()) {
            if let Some(ours) = self.records.iter().find(|r| *r == incoming) {
                // Identical data. A goodbye for it, or a bridged copy
                // looping back, deserves a prompt re-assertion.
                if incoming.ttl == Ttl::ZERO || self.bridgeable.has(incoming) {
                    if !defend.iter().any(|r| r == ours) {
                        defend.push(ours.clone());
                    }
                }
            } else if self
                .records
                .iter()
                .any(|r| r.is_unique() && r.matches_name_of(incoming) && r.rdata != incoming.rdata)
                && !self.bridgeable.has(incoming)
            {
                conflicted = true;
            }
        }
        if conflicted {
            debug!("A live answer contradicts our records; reprobing.");
            if let Some(probe) = self.probe.take() {
                ctx.stop_machine(probe);
            }
            self.register_conflict(ctx.now);
            self.send_probe(ctx);
        } else if !defend.is_empty() {
            self.announce(defend, true, 1, ctx);
        }
    }

    /// Answers the questions in a query or probe packet (§ 6).
    pub fn on_question_packet(&mut self, packet: &Packet, ctx: &mut Ctx) {
        if self.state != State::Responding || packet.questions.is_empty() {
            return;
        }
        let legacy = packet.is_legacy();
        let mut multicast: Vec<Record> = Vec::new();
        let mut unicast: Vec<Record> = Vec::new();

        for question in &packet.questions {
            let answered: Vec<&Record> = self
                .records
                .iter()
                .filter(|record| question.answered_by(record))
                .collect();

            if answered.is_empty() {
                // Negative response (§ 6.1): if the name is ours but
                // the type is not, an NSEC proves the absence.
                if let Some(nsec) = self.negative_response(question) {
                    answered_push(
                        &mut multicast,
                        &mut unicast,
                        nsec,
                        legacy,
                        question.unicast_response,
                    );
                }
                continue;
            }
            // Known-answer suppression (§ 7.1): the asker told us what
            // it already has; fresh entries need no repetition. (No
            // NSEC for a fully suppressed question: the data exists,
            // the asker just has it.)
            for record in answered {
                let known = packet.answers.iter().any(|known| {
                    known == record
                        && known.ttl.as_secs() as u64 * 2 > record.ttl.as_secs() as u64
                });
                if !known {
                    answered_push(
                        &mut multicast,
                        &mut unicast,
                        record.clone(),
                        legacy,
                        question.unicast_response,
                    );
                }
            }
        }

        if !multicast.is_empty() {
            self.announce(multicast, true, 1, ctx);
        }
        if !unicast.is_empty() {
            if let Some(origin) = packet.origin {
                let legacy_info = legacy.then(|| LegacyInfo {
                    id: packet.id,
                    questions: packet.questions.clone(),
                });
                let response = Response::new(
                    unicast,
                    ResponseStyle::Unicast {
                        dest: origin,
                        legacy: legacy_info,
                        defensive: false,
                    },
                );
                ctx.spawn(Machine::Response(response));
            }
        }
    }

    /// Builds the NSEC record asserting which types exist at a name we
    /// own, if the question hits one of our names with a type we lack.
    fn negative_response(&self, question: &crate::message::Question) -> Option<Record> {
        let at_name: Vec<&Record> = self
            .records
            .iter()
            .filter(|record| record.name == question.qname)
            .collect();
        if at_name.is_empty() {
            return None;
        }
        let mut types: Vec<Type> = at_name.iter().map(|record| record.rr_type).collect();
        types.sort();
        types.dedup();
        Some(Record::new(
            question.qname.clone(),
            Type::NSEC,
            NSEC_TTL,
            Rdata::Nsec {
                next: question.qname.clone(),
                types,
            },
        ))
    }

    /// Mutates the records of one type and re-announces if anything
    /// actually changed.
    pub fn update_each(
        &mut self,
        rr_type: Type,
        mut apply: Box<dyn FnMut(&mut Record) + Send>,
        ctx: &mut Ctx,
    ) {
        let mut changed: Vec<Record> = Vec::new();
        for record in &mut self.records {
            if record.rr_type == rr_type {
                let before = record.hash_key();
                apply(record);
                if record.hash_key() != before {
                    changed.push(record.clone());
                }
            }
        }
        if !changed.is_empty() && self.state == State::Responding {
            self.announce(changed, false, 1, ctx);
        }
    }

    pub fn on_wake(&mut self, ctx: &mut Ctx) {
        if self.state == State::Stopped {
            return;
        }
        // Whatever was true before the sleep must be re-established
        // from scratch.
        self.probe = None;
        self.send_probe(ctx);
    }

    pub fn on_error(&mut self, message: &str) {
        let _ = self
            .events
            .send(ResponderEvent::Error(message.to_owned()));
    }

    /// Clean or forced shutdown: a clean stop says goodbye first.
    pub fn shutdown(&mut self, forced: bool, ctx: &mut Ctx) {
        if self.state == State::Stopped {
            return;
        }
        if let Some(probe) = self.probe.take() {
            ctx.stop_machine(probe);
        }
        if !forced && self.state == State::Responding {
            let goodbye = Response::new(
                self.records.clone(),
                ResponseStyle::Goodbye { repeats: 1 },
            );
            ctx.spawn(Machine::Response(goodbye));
        }
        self.finish();
    }

    pub fn stop(&mut self, ctx: &mut Ctx) {
        if let Some(probe) = self.probe.take() {
            ctx.stop_machine(probe);
        }
        self.finish();
    }

    pub fn is_finished(&self) -> bool {
        self.state == State::Stopped
    }

    fn finish(&mut self) {
        self.state = State::Stopped;
        if !self.stopped_emitted {
            self.stopped_emitted = true;
            let _ = self.events.send(ResponderEvent::Stopped);
        }
    }
}

/// Routes one answer record to the multicast or unicast bucket.
fn answered_push(
    multicast: &mut Vec<Record>,
    unicast: &mut Vec<Record>,
    record: Record,
    legacy: bool,
    wants_unicast: bool,
) {
    let bucket = if legacy || wants_unicast {
        unicast
    } else {
        multicast
    };
    if !bucket.iter().any(|existing| *existing == record) {
        bucket.push(record);
    }
}

/// Returns whether a name's first label equals `label`, ignoring
/// ASCII case.
fn first_label_is(name: &Name, label: &str) -> bool {
    !name.is_root() && name.label(0).eq_ignore_ascii_case(label.as_bytes())
}

/// Replaces a name's first label.
fn replace_first_label(name: &Name, label: &str) -> Name {
    name.superdomain(1)
        .expect("instance names have more than one label")
        .prepend(label.as_bytes())
        .expect("renamed label must fit where the old one did")
}

/// Produces the next name in the `Name`, `Name (2)`, `Name (3)`, ...
/// sequence of RFC 6762 § 9.
pub(crate) fn bump_instance_name(label: &str) -> String {
    if let Some(open) = label.rfind(" (") {
        if let Some(count) = label[open + 2..].strip_suffix(')') {
            if let Ok(count) = count.parse::<u32>() {
                if count >= 2 {
                    return format!("{} ({})", &label[..open], count + 1);
                }
            }
        }
    }
    format!("{label} (2)")
}

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////
