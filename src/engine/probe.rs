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

//! The probe state machine of [RFC 6762 § 8.1–8.2].
//!
//! Before unique records may be used they must be *probed*: asked for
//! on the link three times, 250 ms apart, with the proposed records in
//! the authority section. If nobody objects within 750 ms of the first
//! packet, the records are won. An objection can arrive two ways: an
//! authoritative answer carrying different data for one of the names
//! (a defending host), or a simultaneous probe from another host for
//! the same names, which is settled by the lexicographic tiebreak of
//! § 8.2.1.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::time::{Duration, Instant};

use log::debug;
use rand::Rng;

use super::{Ctx, MachineId, Notice};
use crate::message::{Packet, Question};
use crate::rr::{Record, RecordCollection, Type};

/// Spacing between probe packets.
const PROBE_INTERVAL: Duration = Duration::from_millis(250);

/// How long after the first packet the probe completes, absent
/// objections.
const PROBE_SPAN: Duration = Duration::from_millis(750);

/// How long a tiebreak loser waits before starting over.
const RESTART_DELAY: Duration = Duration::from_secs(1);

/// The outcome of one lexicographic comparison round.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Tiebreak {
    Won,
    Lost,
    Tied,
}

////////////////////////////////////////////////////////////////////////
// PROBE MACHINE                                                      //
////////////////////////////////////////////////////////////////////////

pub(crate) struct Probe {
    records: Vec<Record>,
    collection: RecordCollection,
    /// Records the owner publishes on other interfaces; a "conflict"
    /// matching one of these is our own traffic reflected back by a
    /// bridge, not an objection.
    bridgeable: RecordCollection,
    parent: MachineId,
    extra_delay: Duration,
    next_send: Option<Instant>,
    complete_at: Option<Instant>,
    first_send: Option<Instant>,
    sends_done: u8,
    finished: bool,
}

impl Probe {
    pub fn new(
        records: Vec<Record>,
        bridgeable: RecordCollection,
        parent: MachineId,
        extra_delay: Duration,
    ) -> Self {
        let collection = records.iter().cloned().collect();
        Self {
            records,
            collection,
            bridgeable,
            parent,
            extra_delay,
            next_send: None,
            complete_at: None,
            first_send: None,
            sends_done: 0,
            finished: false,
        }
    }

    pub fn start(&mut self, ctx: &mut Ctx) {
        // RFC 6762 § 8.1: a random initial delay desynchronizes hosts
        // that power on together.
        let jitter = Duration::from_millis(rand::rng().random_range(0..250));
        self.next_send = Some(ctx.now + self.extra_delay + jitter);
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        match (self.next_send, self.complete_at) {
            (Some(send), Some(complete)) => Some(send.min(complete)),
            (Some(send), None) => Some(send),
            (None, complete) => complete,
        }
    }

    pub fn on_timer(&mut self, ctx: &mut Ctx) {
        if self.finished {
            return;
        }
        if self.complete_at.map_or(false, |at| at <= ctx.now) {
            self.succeed(false, ctx);
            return;
        }
        if self.next_send.map_or(false, |at| at <= ctx.now) {
            self.send_probe(ctx);
        }
    }

    fn send_probe(&mut self, ctx: &mut Ctx) {
        let mut packet = Packet::query();
        let mut asked: Vec<&crate::name::Name> = Vec::new();
        for record in &self.records {
            if !asked.contains(&&record.name) {
                asked.push(&record.name);
                packet
                    .questions
                    .push(Question::new(record.name.clone(), Type::ANY));
            }
        }
        packet.authorities = self.records.clone();
        ctx.send(packet, None);

        self.first_send.get_or_insert(ctx.now);
        self.sends_done += 1;
        if self.sends_done < 3 {
            self.next_send = Some(ctx.now + PROBE_INTERVAL);
        } else {
            self.next_send = None;
            self.complete_at = Some(self.first_send.unwrap() + PROBE_SPAN);
        }
    }

    /// Handles an incoming answer during the probe window: either
    /// somebody confirms every proposed record (early success: the
    /// records are already established, usually by an identical twin
    /// of ourselves), or somebody defends conflicting data.
    pub fn on_answer(&mut self, packet: &Packet, ctx: &mut Ctx) {
        if self.finished {
            return;
        }
        let theirs: RecordCollection = packet
            .answers
            .iter()
            .chain(packet.additionals.iter())
            .cloned()
            .collect();
        if theirs.has_each(self.records.iter()) {
            self.succeed(true, ctx);
            return;
        }
        let conflicts = self.collection.get_conflicts(&theirs);
        if conflicts
            .iter()
            .any(|record| !self.bridgeable.has(record))
        {
            debug!("Probe lost to a defending answer.");
            self.finished = true;
            ctx.notify(self.parent, Notice::ProbeConflict);
        }
    }

    /// Handles a simultaneous probe from another host: the § 8.2.1
    /// tiebreak. Our own looped-back probes are ignored.
    pub fn on_probe(&mut self, packet: &Packet, ctx: &mut Ctx) {
        if self.finished || packet.is_local(ctx.local_addrs) {
            return;
        }
        if self.tiebreak(&packet.authorities) == Tiebreak::Lost {
            debug!("Probe lost a simultaneous-probe tiebreak; backing off 1 s.");
            self.sends_done = 0;
            self.first_send = None;
            self.complete_at = None;
            self.next_send = Some(ctx.now + RESTART_DELAY);
        }
    }

    /// Compares our proposed records against a rival prober's
    /// authority section. Both sides are grouped by owner name; names
    /// the rival probes that we do not are no business of ours. Each
    /// shared group is sorted into canonical order and compared
    /// pairwise; the first difference decides, and if one list runs
    /// out first, the shorter list loses.
    fn tiebreak(&self, rival: &[Record]) -> Tiebreak {
        let ours = group_by_name(self.records.iter());
        let theirs = group_by_name(rival.iter());
        let mut outcome = Tiebreak::Tied;
        for (name, their_group) in &theirs {
            let our_group = match ours.get(name) {
                Some(group) => group,
                None => continue,
            };
            match compare_groups(our_group, their_group) {
                Tiebreak::Lost => return Tiebreak::Lost,
                Tiebreak::Won => outcome = Tiebreak::Won,
                Tiebreak::Tied => {}
            }
        }
        outcome
    }

    pub fn on_wake(&mut self, _ctx: &mut Ctx) {
        // The owning responder reprobes after a wake; this instance is
        // obsolete.
        self.finished = true;
    }

    pub fn on_error(&mut self, _message: &str) {}

    pub fn stop(&mut self, _ctx: &mut Ctx) {
        self.finished = true;
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    fn succeed(&mut self, early: bool, ctx: &mut Ctx) {
        self.finished = true;
        ctx.notify(self.parent, Notice::ProbeComplete { early });
    }
}

/// Groups records by case-folded owner name, sorting each group into
/// canonical comparison order.
fn group_by_name<'a, I: Iterator<Item = &'a Record>>(
    records: I,
) -> HashMap<Vec<u8>, Vec<&'a Record>> {
    let mut groups: HashMap<Vec<u8>, Vec<&Record>> = HashMap::new();
    for record in records {
        let key = record.name.wire_repr().to_ascii_uppercase();
        groups.entry(key).or_default().push(record);
    }
    for group in groups.values_mut() {
        group.sort_by(|a, b| a.cmp_tiebreak(b));
    }
    groups
}

/// Compares two sorted groups pairwise, from our point of view.
fn compare_groups(ours: &[&Record], theirs: &[&Record]) -> Tiebreak {
    for (our_record, their_record) in ours.iter().zip(theirs.iter()) {
        match our_record.cmp_tiebreak(their_record) {
            Ordering::Less => return Tiebreak::Lost,
            Ordering::Greater => return Tiebreak::Won,
            Ordering::Equal => {}
        }
    }
    match ours.len().cmp(&theirs.len()) {
        Ordering::Less => Tiebreak::Lost,
        Ordering::Greater => Tiebreak::Won,
        Ordering::Equal => Tiebreak::Tied,
    }
}

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rr::{Rdata, Ttl};

    fn a_record(name: &str, addr: &str) -> Record {
        Record::new(
            name.parse().unwrap(),
            Type::A,
            Ttl::from(120),
            Rdata::A(addr.parse().unwrap()),
        )
    }

    #[test]
    fn tiebreak_is_antisymmetric() {
        let our_record = a_record("host.local.", "10.0.0.1");
        let their_record = a_record("host.local.", "10.0.0.2");
        let ours = vec![&our_record];
        let theirs = vec![&their_record];
        assert_eq!(compare_groups(&ours, &theirs), Tiebreak::Lost);
        assert_eq!(compare_groups(&theirs, &ours), Tiebreak::Won);
    }

    #[test]
    fn shorter_group_loses() {
        let one = a_record("host.local.", "10.0.0.1");
        let two = a_record("host.local.", "10.0.0.2");
        let ours = vec![&one];
        let theirs = vec![&one, &two];
        assert_eq!(compare_groups(&ours, &theirs), Tiebreak::Lost);
        assert_eq!(compare_groups(&theirs, &ours), Tiebreak::Won);
    }

    #[test]
    fn identical_groups_tie() {
        let one = a_record("host.local.", "10.0.0.1");
        let ours = vec![&one];
        let theirs = vec![&one];
        assert_eq!(compare_groups(&ours, &theirs), Tiebreak::Tied);
    }

    #[test]
    fn grouping_folds_case_and_sorts() {
        let big = a_record("HOST.local.", "10.0.0.200");
        let small = a_record("host.local.", "10.0.0.1");
        let groups = group_by_name([&big, &small].into_iter());
        assert_eq!(groups.len(), 1);
        let group = groups.values().next().unwrap();
        // Sorted ascending: 10.0.0.1 before 10.0.0.200.
        assert_eq!(group[0], &small);
        assert_eq!(group[1], &big);
    }
}
