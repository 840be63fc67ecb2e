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

//! The query state machine of [RFC 6762 § 5].
//!
//! A *continuous* query keeps a set of questions alive: it asks with
//! exponential backoff, accounts for answers it has already seen
//! (known-answer suppression, § 7.1), defers to identical questions
//! asked by peers (duplicate question suppression, § 7.3), and only
//! rests when every question for a unique record has been answered.
//! Questions about shared records are never exhausted.
//!
//! A *one-shot* query asks once and stops at the first answer packet,
//! or reports a timeout. One-shot queries may run from an ephemeral
//! socket, making them "legacy" queries that OS-resident responders
//! answer directly (§ 6.7).

use std::net::UdpSocket;
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;

use super::{Ctx, QueryEvent};
use crate::cache::{CacheEvent, ExpiringRecordCollection};
use crate::message::Packet;
use crate::message::Question;
use crate::net::socket::multicast_destination_v4;
use crate::rr::Record;

/// The starting retransmission interval.
const INITIAL_INTERVAL: Duration = Duration::from_secs(1);

/// The retransmission backoff ceiling (RFC 6762 § 5.2: intervals
/// double up to one hour).
const MAX_INTERVAL: Duration = Duration::from_secs(3600);

////////////////////////////////////////////////////////////////////////
// OPTIONS                                                            //
////////////////////////////////////////////////////////////////////////

/// How a [`Query`] behaves. Explicit state, not boolean-flag builder
/// calls: a query is continuous or one-shot, consults the cache or
/// not, and is compliant or legacy, all decided at construction.
#[derive(Clone, Debug)]
pub struct QueryOptions {
    /// Keep asking until the questions are exhausted (`true`), or stop
    /// at the first answer packet (`false`).
    pub continuous: bool,
    /// Skip the cache pre-check before the first send.
    pub ignore_cache: bool,
    /// For one-shot queries: report `timeout` if no answer arrives in
    /// time.
    pub timeout: Option<Duration>,
    /// Send from an ephemeral socket (a "legacy" query).
    pub legacy: bool,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            continuous: true,
            ignore_cache: false,
            timeout: None,
            legacy: false,
        }
    }
}

////////////////////////////////////////////////////////////////////////
// QUERY MACHINE                                                      //
////////////////////////////////////////////////////////////////////////

pub(crate) struct Query {
    questions: Vec<Question>,
    original: Vec<Question>,
    /// The questions queued for the next packet; peers asking the same
    /// thing trim this.
    queued: Vec<Question>,
    known_answers: ExpiringRecordCollection,
    options: QueryOptions,
    events: Option<Sender<QueryEvent>>,
    socket: Option<Arc<UdpSocket>>,
    next_send: Option<Instant>,
    timeout_at: Option<Instant>,
    interval: Duration,
    answered: bool,
    finished: bool,
}

impl Query {
    pub fn new(
        questions: Vec<Question>,
        options: QueryOptions,
        events: Option<Sender<QueryEvent>>,
        socket: Option<Arc<UdpSocket>>,
    ) -> Self {
        Self {
            original: questions.clone(),
            queued: questions.clone(),
            questions,
            known_answers: ExpiringRecordCollection::new(),
            options,
            events,
            socket,
            next_send: None,
            timeout_at: None,
            interval: INITIAL_INTERVAL,
            answered: false,
            finished: false,
        }
    }

    pub fn start(&mut self, ctx: &mut Ctx) {
        self.timeout_at = self.options.timeout.map(|timeout| ctx.now + timeout);

        if !self.options.ignore_cache {
            let mut hits: Vec<Record> = Vec::new();
            for question in &self.questions {
                for hit in ctx.cache.find(question, ctx.now) {
                    if !hits.contains(&hit) {
                        hits.push(hit);
                    }
                }
            }
            if !hits.is_empty() {
                for (index, hit) in hits.iter().enumerate() {
                    let related: Vec<Record> = hits
                        .iter()
                        .enumerate()
                        .filter(|(other, _)| *other != index)
                        .map(|(_, record)| record.clone())
                        .collect();
                    self.account_for(hit, ctx);
                    self.emit(QueryEvent::Answer {
                        record: hit.clone(),
                        related,
                    });
                }
                self.answered = true;
                if !self.options.continuous || self.questions.is_empty() {
                    self.finish();
                    return;
                }
            }
        }

        self.queued = self.questions.clone();
        // RFC 6762 § 5.2: the first packet waits a random 20–120 ms.
        let delay = Duration::from_millis(rand::rng().random_range(20..=120));
        self.next_send = Some(ctx.now + delay);
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        [self.next_send, self.timeout_at, self.known_answers.next_deadline()]
            .into_iter()
            .flatten()
            .min()
    }

    pub fn on_timer(&mut self, ctx: &mut Ctx) {
        if self.finished {
            return;
        }
        // Age the known-answer list; what expires here just stops
        // being included in future packets.
        self.known_answers.advance(ctx.now);

        if self
            .timeout_at
            .map_or(false, |at| at <= ctx.now)
        {
            self.timeout_at = None;
            if !self.answered {
                self.emit(QueryEvent::Timeout);
            }
            if !self.options.continuous {
                self.finish();
                return;
            }
        }

        if self.next_send.map_or(false, |at| at <= ctx.now) {
            self.send_now(ctx);
        }
    }

    fn send_now(&mut self, ctx: &mut Ctx) {
        if self.questions.is_empty() {
            self.finish();
            return;
        }
        let questions: Vec<Question> = self
            .queued
            .iter()
            .filter(|question| self.questions.contains(*question))
            .cloned()
            .collect();

        if !questions.is_empty() {
            let mut packet = Packet::query();
            packet.questions = questions;
            packet.answers = self.fresh_known_answers(ctx.now);
            match &self.socket {
                Some(socket) => {
                    ctx.send_via(socket.clone(), packet, Some(multicast_destination_v4()))
                }
                None => ctx.send(packet, None),
            }
        }

        self.next_send = Some(ctx.now + self.interval);
        self.interval = (self.interval * 2).min(MAX_INTERVAL);
        // Prepare the next packet now, so that peers asking the same
        // questions in the meantime can trim it.
        self.queued = self.questions.clone();
    }

    /// Returns the known answers still fresh enough to suppress peer
    /// responses: remaining TTL above half the original (RFC 6762
    /// § 7.1). The cache-flush bit is cleared on the copies.
    fn fresh_known_answers(&self, now: Instant) -> Vec<Record> {
        let mut fresh = Vec::new();
        for record in self.known_answers.iter() {
            if let Some(current) = self.known_answers.get(record, now) {
                if current.ttl.as_secs() as u64 * 2 > record.ttl.as_secs() as u64 {
                    let mut copy = current;
                    copy.cache_flush = false;
                    fresh.push(copy);
                }
            }
        }
        fresh
    }

    /// Feeds one answering record into the bookkeeping: unique answers
    /// retire their question, shared answers go on the known-answer
    /// list.
    fn account_for(&mut self, record: &Record, ctx: &mut Ctx) {
        if record.is_unique() {
            self.questions.retain(|question| !question.answered_by(record));
            self.queued.retain(|question| !question.answered_by(record));
        } else {
            self.known_answers.add(record.clone(), ctx.now);
        }
    }

    pub fn on_answer(&mut self, packet: &Packet, ctx: &mut Ctx) {
        if self.finished {
            return;
        }
        let records: Vec<&Record> = packet
            .answers
            .iter()
            .chain(packet.additionals.iter())
            .collect();
        for index in 0..records.len() {
            let record = records[index];
            if self
                .questions
                .iter()
                .any(|question| question.answered_by(record))
            {
                self.answered = true;
                let related: Vec<Record> = records
                    .iter()
                    .enumerate()
                    .filter(|(other, _)| *other != index)
                    .map(|(_, r)| (*r).clone())
                    .collect();
                self.account_for(record, ctx);
                self.emit(QueryEvent::Answer {
                    record: record.clone(),
                    related,
                });
            }
        }
        // A one-shot query is done after its first answer packet,
        // whatever the packet contained.
        if !self.options.continuous {
            self.finish();
        } else if self.questions.is_empty() {
            self.finish();
        }
    }

    /// Duplicate question suppression (RFC 6762 § 7.3): a peer asking
    /// one of our queued questions, multicast-style and with no known
    /// answers, will elicit the very responses we want.
    pub fn on_query(&mut self, packet: &Packet, ctx: &mut Ctx) {
        if self.finished || packet.is_local(ctx.local_addrs) || !packet.answers.is_empty() {
            return;
        }
        for incoming in &packet.questions {
            if incoming.unicast_response {
                // QU answers go only to the asker; they save us
                // nothing.
                continue;
            }
            self.queued
                .retain(|queued| queued.name_key() != incoming.name_key());
        }
    }

    pub fn on_cache(&mut self, event: &CacheEvent, _ctx: &mut Ctx) {
        if let CacheEvent::Expired(record) = event {
            // Aged out of the interface cache: no longer a known
            // answer either.
            self.known_answers.delete(record);
        }
    }

    pub fn on_wake(&mut self, ctx: &mut Ctx) {
        if self.finished {
            return;
        }
        self.questions = self.original.clone();
        self.queued = self.questions.clone();
        self.interval = INITIAL_INTERVAL;
        self.next_send = Some(ctx.now);
    }

    pub fn on_error(&mut self, _message: &str) {}

    pub fn stop(&mut self, _ctx: &mut Ctx) {
        self.finish();
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    fn finish(&mut self) {
        if !self.finished {
            self.finished = true;
            self.emit(QueryEvent::Stopped);
        }
    }

    fn emit(&self, event: QueryEvent) {
        if let Some(events) = &self.events {
            let _ = events.send(event);
        }
    }
}
