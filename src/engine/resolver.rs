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

//! The service resolver: from an instance name to a usable service.
//!
//! A browser learns *that* an instance exists from a single PTR
//! record; turning that into something connectable takes the SRV
//! record (host and port), the TXT record (metadata), and at least one
//! address record for the SRV target ([RFC 6763 § 12]). The resolver
//! gathers those pieces in whatever order they arrive, queries for the
//! ones that don't, watches the cache to keep them fresh, and reports
//! when the instance changes or disappears.

use std::net::IpAddr;
use std::sync::mpsc::Sender;
use std::time::{Duration, Instant};

use log::debug;

use super::query::{Query, QueryOptions};
use super::{CacheEvent, Ctx, Machine, MachineId, ResolverEvent};
use crate::message::{Packet, Question};
use crate::name::Name;
use crate::rr::{Record, TxtData, Type};
use crate::service::{Service, LOCAL_DOMAIN};

/// How long an unresolved resolver waits before giving up.
const RESOLVE_TIMEOUT: Duration = Duration::from_secs(10);

/// The window over which cache reissue marks are batched into one
/// refresh query.
const BATCH_WINDOW: Duration = Duration::from_secs(1);

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum State {
    Unresolved,
    Resolved,
    Stopped,
}

////////////////////////////////////////////////////////////////////////
// RESOLVER MACHINE                                                   //
////////////////////////////////////////////////////////////////////////

pub(crate) struct Resolver {
    fullname: Name,
    events: Sender<ResolverEvent>,
    state: State,
    deadline: Option<Instant>,
    target: Option<Name>,
    port: Option<u16>,
    txt: Option<TxtData>,
    txt_raw: Option<Vec<u8>>,
    addresses: Vec<IpAddr>,
    query: Option<MachineId>,
    batch: Vec<Question>,
    batch_at: Option<Instant>,
}

impl Resolver {
    pub fn new(fullname: Name, events: Sender<ResolverEvent>) -> Self {
        Self {
            fullname,
            events,
            state: State::Unresolved,
            deadline: None,
            target: None,
            port: None,
            txt: None,
            txt_raw: None,
            addresses: Vec::new(),
            query: None,
            batch: Vec::new(),
            batch_at: None,
        }
    }

    pub fn start(&mut self, ctx: &mut Ctx) {
        self.deadline = Some(ctx.now + RESOLVE_TIMEOUT);
        // Whatever the cache already knows counts immediately.
        let mut known: Vec<Record> = Vec::new();
        for question in self.missing_questions() {
            known.extend(ctx.cache.find(&question, ctx.now));
        }
        self.ingest(&known);
        // Address questions may only have become known after the SRV
        // told us the target.
        let mut addresses: Vec<Record> = Vec::new();
        for question in self.missing_questions() {
            addresses.extend(ctx.cache.find(&question, ctx.now));
        }
        self.ingest(&addresses);
        self.check_progress(true, ctx);
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        [self.deadline, self.batch_at].into_iter().flatten().min()
    }

    pub fn on_timer(&mut self, ctx: &mut Ctx) {
        if self.state == State::Stopped {
            return;
        }
        if self.batch_at.map_or(false, |at| at <= ctx.now) {
            self.batch_at = None;
            let questions = std::mem::take(&mut self.batch);
            if !questions.is_empty() {
                // The refresh must hit the network: the cache is what
                // told us the records are aging.
                let query = Query::new(
                    questions,
                    QueryOptions {
                        continuous: false,
                        ignore_cache: true,
                        timeout: None,
                        legacy: false,
                    },
                    None,
                    None,
                );
                ctx.spawn(Machine::Query(query));
            }
        }
        if self
            .deadline
            .map_or(false, |at| at <= ctx.now && self.state == State::Unresolved)
        {
            debug!("Service {:?} never resolved; giving up.", self.fullname);
            self.down(ctx);
        }
    }

    /// Returns whether all four pieces are in hand.
    fn resolved(&self) -> bool {
        self.target.is_some()
            && self.port.is_some()
            && self.txt_raw.is_some()
            && !self.addresses.is_empty()
    }

    /// Folds a batch of records into the resolver's state, returning
    /// whether anything changed. Goodbyes are ignored here; the cache
    /// turns them into expirations which arrive via `on_cache`.
    fn ingest(&mut self, records: &[Record]) -> bool {
        let mut changed = false;
        for record in records {
            if record.ttl.as_secs() == 0 {
                continue;
            }
            match &record.rdata {
                crate::rr::Rdata::Srv { port, target, .. }
                    if record.name == self.fullname =>
                {
                    if self.port != Some(*port) {
                        self.port = Some(*port);
                        changed = true;
                    }
                    if self.target.as_ref() != Some(target) {
                        self.target = Some(target.clone());
                        self.addresses.clear();
                        changed = true;
                    }
                }
                crate::rr::Rdata::Txt(data) if record.name == self.fullname => {
                    let raw = data.to_wire();
                    if self.txt_raw.as_ref() != Some(&raw) {
                        self.txt_raw = Some(raw);
                        self.txt = Some(data.clone());
                        changed = true;
                    }
                }
                crate::rr::Rdata::A(_) | crate::rr::Rdata::Aaaa(_) => {
                    if let (Some(target), Some(address)) =
                        (&self.target, record.rdata.as_address())
                    {
                        if record.name == *target && !self.addresses.contains(&address) {
                            self.addresses.push(address);
                            changed = true;
                        }
                    }
                }
                _ => {}
            }
        }
        changed
    }

    /// Reacts to the current state of the pieces: transition between
    /// resolved and unresolved, emit the appropriate event, and keep a
    /// query running for whatever is missing.
    fn check_progress(&mut self, changed: bool, ctx: &mut Ctx) {
        if self.state == State::Stopped {
            return;
        }
        if self.resolved() {
            if let Some(query) = self.query.take() {
                ctx.stop_machine(query);
            }
            match self.state {
                State::Unresolved => {
                    self.state = State::Resolved;
                    self.deadline = None;
                    let _ = self.events.send(ResolverEvent::Resolved(self.service()));
                }
                State::Resolved if changed => {
                    let _ = self.events.send(ResolverEvent::Updated(self.service()));
                }
                _ => {}
            }
        } else {
            if self.state == State::Resolved {
                self.state = State::Unresolved;
                self.deadline = Some(ctx.now + RESOLVE_TIMEOUT);
            }
            if changed || self.query.is_none() {
                self.ensure_query(ctx);
            }
        }
    }

    /// (Re)starts the continuous query for the missing pieces.
    fn ensure_query(&mut self, ctx: &mut Ctx) {
        let questions = self.missing_questions();
        if questions.is_empty() {
            return;
        }
        if let Some(query) = self.query.take() {
            ctx.stop_machine(query);
        }
        let query = Query::new(questions, QueryOptions::default(), None, None);
        self.query = Some(ctx.spawn(Machine::Query(query)));
    }

    fn missing_questions(&self) -> Vec<Question> {
        let mut questions = Vec::new();
        if self.target.is_none() || self.port.is_none() {
            questions.push(Question::new(self.fullname.clone(), Type::SRV));
        }
        if self.txt_raw.is_none() {
            questions.push(Question::new(self.fullname.clone(), Type::TXT));
        }
        if let Some(target) = &self.target {
            if self.addresses.is_empty() {
                questions.push(Question::new(target.clone(), Type::A));
                questions.push(Question::new(target.clone(), Type::AAAA));
            }
        }
        questions
    }

    pub fn on_answer(&mut self, packet: &Packet, ctx: &mut Ctx) {
        if self.state == State::Stopped {
            return;
        }
        let records: Vec<Record> = packet
            .answers
            .iter()
            .chain(packet.additionals.iter())
            .cloned()
            .collect();
        let changed = self.ingest(&records);
        if changed || !self.resolved() {
            self.check_progress(changed, ctx);
        }
    }

    /// Cache lifecycle events: reissue marks trigger a batched
    /// refresh; expirations take pieces away.
    pub fn on_cache(&mut self, event: &CacheEvent, ctx: &mut Ctx) {
        if self.state == State::Stopped {
            return;
        }
        match event {
            CacheEvent::Reissue(record) => {
                if self.is_relevant(record) {
                    let question = Question::new(record.name.clone(), record.rr_type);
                    if !self
                        .batch
                        .iter()
                        .any(|queued| queued.name_key() == question.name_key())
                    {
                        self.batch.push(question);
                    }
                    self.batch_at.get_or_insert(ctx.now + BATCH_WINDOW);
                }
            }
            CacheEvent::Expired(record) => self.on_expired(record, ctx),
        }
    }

    fn on_expired(&mut self, record: &Record, ctx: &mut Ctx) {
        match record.rr_type {
            Type::SRV if record.name == self.fullname => self.down(ctx),
            Type::PTR => {
                if record.rdata.as_ptr() == Some(&self.fullname) {
                    self.down(ctx);
                }
            }
            Type::TXT if record.name == self.fullname => {
                self.txt = None;
                self.txt_raw = None;
                self.check_progress(true, ctx);
            }
            Type::A | Type::AAAA => {
                if let (Some(target), Some(address)) = (&self.target, record.rdata.as_address()) {
                    if record.name == *target {
                        self.addresses.retain(|known| *known != address);
                        if self.addresses.is_empty() {
                            self.check_progress(true, ctx);
                        }
                    }
                }
            }
            _ => {}
        }
    }

    fn is_relevant(&self, record: &Record) -> bool {
        match record.rr_type {
            Type::SRV | Type::TXT => record.name == self.fullname,
            Type::A | Type::AAAA => self
                .target
                .as_ref()
                .map_or(false, |target| record.name == *target),
            Type::PTR => record.rdata.as_ptr() == Some(&self.fullname),
            _ => false,
        }
    }

    /// Builds the externally visible service snapshot. The collections
    /// inside are copies; callers can do as they please with them.
    pub fn service(&self) -> Service {
        Service {
            fullname: self.fullname.to_string(),
            name: String::from_utf8_lossy(self.fullname.label(0)).into_owned(),
            service_type: self
                .fullname
                .superdomain(1)
                .map(|t| t.to_string())
                .and_then(|t| t.parse().ok()),
            domain: LOCAL_DOMAIN.to_owned(),
            host: self.target.as_ref().map(Name::to_string),
            port: self.port,
            addresses: self.addresses.clone(),
            txt: self.txt.clone(),
            txt_raw: self.txt_raw.clone(),
        }
    }

    pub fn on_wake(&mut self, ctx: &mut Ctx) {
        if self.state == State::Stopped {
            return;
        }
        // The cache was cleared; everything must be re-verified.
        self.state = State::Unresolved;
        self.deadline = Some(ctx.now + RESOLVE_TIMEOUT);
        self.ensure_query(ctx);
    }

    pub fn on_error(&mut self, _message: &str) {}

    fn down(&mut self, ctx: &mut Ctx) {
        if self.state != State::Stopped {
            self.state = State::Stopped;
            let _ = self.events.send(ResolverEvent::Down(self.service()));
            if let Some(query) = self.query.take() {
                ctx.stop_machine(query);
            }
        }
    }

    pub fn stop(&mut self, ctx: &mut Ctx) {
        self.state = State::Stopped;
        if let Some(query) = self.query.take() {
            ctx.stop_machine(query);
        }
    }

    pub fn is_finished(&self) -> bool {
        self.state == State::Stopped
    }
}
