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

//! The per-interface protocol engine.
//!
//! Everything stateful about one network interface (its sockets, its
//! record cache, its outbound history, and every running state
//! machine) lives on a single engine thread and is driven by one
//! event channel. Socket reader threads, the sleep watcher, and the public
//! handles all *post* events; only the engine thread touches the
//! state. That confinement is what makes the timer-heavy protocol
//! logic tractable: within the engine there is no locking and no
//! reentrancy, and every handler sees the cache exactly as the
//! preceding event left it.
//!
//! State machines interact with each other and with the network
//! exclusively through deferred [`Action`]s collected during a
//! dispatch and applied when it finishes, so a machine never observes
//! another machine (or itself) mid-callback.

pub mod probe;
pub mod query;
pub mod resolver;
pub mod responder;
pub mod response;

#[cfg(test)]
mod tests;

use std::collections::VecDeque;
use std::net::{IpAddr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Instant;

use lazy_static::lazy_static;
use log::{debug, error, info, warn};
use slab::Slab;

use crate::cache::{CacheEvent, ExpiringRecordCollection};
use crate::message::{Packet, Question, MDNS_PORT};
use crate::name::Name;
use crate::net::platform::{all_addresses, resolve_specifier, UnknownInterface};
use crate::net::socket::{self, multicast_destination_v4};
use crate::net::{system_platform, SleepWatcher};
use crate::rr::{Record, RecordCollection, Type};
use crate::service::Service;
use crate::util::is_linklocal_destination;

use probe::Probe;
use query::Query;
use resolver::Resolver;
use responder::Responder;
use response::Response;

pub use query::QueryOptions;

////////////////////////////////////////////////////////////////////////
// IDENTIFIERS AND EVENTS                                             //
////////////////////////////////////////////////////////////////////////

/// Identifies a state machine within one engine.
pub type MachineId = usize;

/// Interface-level events, delivered to monitor subscribers.
#[derive(Clone, Debug)]
pub enum InterfaceEvent {
    /// A valid answer packet arrived (already merged into the cache).
    Answer(Packet),
    /// A valid probe packet arrived.
    Probe(Packet),
    /// A valid query packet arrived.
    Query(Packet),
    /// A cached record reached a reissue mark.
    CacheReissue(Record),
    /// A cached record expired and was removed.
    CacheExpired(Record),
    /// The interface failed fatally and has shut down.
    Error(String),
}

/// Events emitted by a [`Query`] machine.
#[derive(Clone, Debug)]
pub enum QueryEvent {
    /// A record answering one of the query's questions arrived,
    /// together with the other records that shared its packet.
    Answer {
        record: Record,
        related: Vec<Record>,
    },
    /// A one-shot query's deadline passed without an answer.
    Timeout,
    /// The query has stopped.
    Stopped,
}

/// Events emitted by a [`Responder`] machine.
#[derive(Clone, Debug)]
pub enum ResponderEvent {
    /// Probing finished; the records are established on the link.
    ProbingComplete,
    /// A conflict forced a rename; the new instance label is carried.
    Renamed(String),
    /// The responder has stopped.
    Stopped,
    /// The responder failed fatally.
    Error(String),
}

/// Events emitted by a [`Resolver`] machine.
#[derive(Clone, Debug)]
pub enum ResolverEvent {
    /// The service is fully resolved for the first time (or again
    /// after having gone unresolved).
    Resolved(Service),
    /// A resolved service's details changed.
    Updated(Service),
    /// The service is gone (records expired, or it never resolved).
    /// The snapshot identifies which service, and carries whatever
    /// was known about it.
    Down(Service),
}

/// Cross-machine notifications, delivered as deferred actions.
#[derive(Clone, Debug)]
pub(crate) enum Notice {
    /// A probe owned by the target completed successfully.
    ProbeComplete { early: bool },
    /// A probe owned by the target hit a conflict.
    ProbeConflict,
}

////////////////////////////////////////////////////////////////////////
// COMMANDS                                                           //
////////////////////////////////////////////////////////////////////////

/// Commands posted to an engine by the public handles.
pub enum Command {
    /// Start a responder for a record set.
    StartResponder {
        records: Vec<Record>,
        bridgeable: RecordCollection,
        instance: Option<String>,
        announce_repeats: u32,
        events: Sender<ResponderEvent>,
        reply: Sender<MachineId>,
    },
    /// Mutate the target responder's records of one type and
    /// re-announce if anything changed.
    UpdateResponder {
        id: MachineId,
        rr_type: Type,
        apply: Box<dyn FnMut(&mut Record) + Send>,
    },
    /// Rename the target responder's instance (sibling bookkeeping
    /// after another interface's responder renamed).
    RenameResponder { id: MachineId, instance: String },
    /// Stop the target responder, saying goodbye first unless
    /// `forced`.
    StopResponder { id: MachineId, forced: bool },
    /// Start a query.
    StartQuery {
        questions: Vec<Question>,
        options: QueryOptions,
        events: Option<Sender<QueryEvent>>,
        reply: Sender<MachineId>,
    },
    /// Start a service resolver for an instance.
    StartResolver {
        fullname: Name,
        events: Sender<ResolverEvent>,
        reply: Sender<MachineId>,
    },
    /// Stop any machine by id.
    StopMachine { id: MachineId },
    /// Subscribe to interface-level events.
    Monitor { events: Sender<InterfaceEvent> },
    /// Shut the engine down.
    Shutdown,
}

/// Events arriving on the engine channel.
pub(crate) enum Event {
    Datagram(Vec<u8>, SocketAddr),
    Command(Command),
    Wake,
}

////////////////////////////////////////////////////////////////////////
// MACHINES                                                           //
////////////////////////////////////////////////////////////////////////

/// The five machine kinds an engine can run.
pub(crate) enum Machine {
    Probe(Probe),
    Response(Response),
    Query(Query),
    Responder(Responder),
    Resolver(Resolver),
}

macro_rules! delegate {
    ($self:ident, $m:ident => $body:expr) => {
        match $self {
            Machine::Probe($m) => $body,
            Machine::Response($m) => $body,
            Machine::Query($m) => $body,
            Machine::Responder($m) => $body,
            Machine::Resolver($m) => $body,
        }
    };
}

impl Machine {
    fn start(&mut self, ctx: &mut Ctx) {
        delegate!(self, m => m.start(ctx))
    }

    fn next_deadline(&self) -> Option<Instant> {
        delegate!(self, m => m.next_deadline())
    }

    fn on_timer(&mut self, ctx: &mut Ctx) {
        delegate!(self, m => m.on_timer(ctx))
    }

    fn on_answer(&mut self, packet: &Packet, ctx: &mut Ctx) {
        match self {
            Machine::Probe(m) => m.on_answer(packet, ctx),
            Machine::Response(m) => m.on_answer(packet, ctx),
            Machine::Query(m) => m.on_answer(packet, ctx),
            Machine::Responder(m) => m.on_answer(packet, ctx),
            Machine::Resolver(m) => m.on_answer(packet, ctx),
        }
    }

    fn on_probe(&mut self, packet: &Packet, ctx: &mut Ctx) {
        match self {
            Machine::Probe(m) => m.on_probe(packet, ctx),
            Machine::Responder(m) => m.on_question_packet(packet, ctx),
            _ => {}
        }
    }

    fn on_query(&mut self, packet: &Packet, ctx: &mut Ctx) {
        match self {
            Machine::Query(m) => m.on_query(packet, ctx),
            Machine::Responder(m) => m.on_question_packet(packet, ctx),
            _ => {}
        }
    }

    fn on_cache(&mut self, event: &CacheEvent, ctx: &mut Ctx) {
        match self {
            Machine::Query(m) => m.on_cache(event, ctx),
            Machine::Resolver(m) => m.on_cache(event, ctx),
            _ => {}
        }
    }

    fn on_notice(&mut self, notice: Notice, ctx: &mut Ctx) {
        if let Machine::Responder(m) = self {
            m.on_notice(notice, ctx)
        }
    }

    fn on_wake(&mut self, ctx: &mut Ctx) {
        delegate!(self, m => m.on_wake(ctx))
    }

    fn on_error(&mut self, message: &str) {
        delegate!(self, m => m.on_error(message))
    }

    fn stop(&mut self, ctx: &mut Ctx) {
        delegate!(self, m => m.stop(ctx))
    }

    fn is_finished(&self) -> bool {
        delegate!(self, m => m.is_finished())
    }
}

////////////////////////////////////////////////////////////////////////
// DISPATCH CONTEXT AND DEFERRED ACTIONS                              //
////////////////////////////////////////////////////////////////////////

/// What a machine may do during a dispatch. Mutable protocol state
/// (cache, history) is borrowed directly; everything that would
/// reenter a machine (sends, stops, notifications) is deferred.
pub(crate) struct Ctx<'a> {
    pub now: Instant,
    /// The id of the machine being dispatched.
    pub current: MachineId,
    pub cache: &'a mut ExpiringRecordCollection,
    pub history: &'a mut ExpiringRecordCollection,
    pub local_addrs: &'a [IpAddr],
    machines: &'a mut Slab<Option<Machine>>,
    pending_start: &'a mut VecDeque<MachineId>,
    actions: &'a mut VecDeque<Action>,
}

pub(crate) enum Action {
    Send {
        packet: Packet,
        via: Option<Arc<UdpSocket>>,
        dest: Option<SocketAddr>,
    },
    Notify {
        target: MachineId,
        notice: Notice,
    },
    Stop {
        target: MachineId,
    },
}

impl Ctx<'_> {
    /// Registers a machine; it starts once the current dispatch
    /// completes. Returns its id immediately.
    pub fn spawn(&mut self, machine: Machine) -> MachineId {
        let id = self.machines.insert(Some(machine));
        self.pending_start.push_back(id);
        id
    }

    /// Queues a packet for the interface sockets (multicast when
    /// `dest` is `None`).
    pub fn send(&mut self, packet: Packet, dest: Option<SocketAddr>) {
        self.actions.push_back(Action::Send {
            packet,
            via: None,
            dest,
        });
    }

    /// Queues a packet for a specific socket (the ephemeral socket of
    /// a legacy query).
    pub fn send_via(&mut self, via: Arc<UdpSocket>, packet: Packet, dest: Option<SocketAddr>) {
        self.actions.push_back(Action::Send {
            packet,
            via: Some(via),
            dest,
        });
    }

    /// Queues a notification for another machine.
    pub fn notify(&mut self, target: MachineId, notice: Notice) {
        self.actions.push_back(Action::Notify { target, notice });
    }

    /// Queues a stop of another machine (or the caller itself).
    pub fn stop_machine(&mut self, target: MachineId) {
        self.actions.push_back(Action::Stop { target });
    }
}

////////////////////////////////////////////////////////////////////////
// THE ENGINE                                                         //
////////////////////////////////////////////////////////////////////////

/// The state owned by one engine thread.
pub(crate) struct Engine {
    key: String,
    tx: Sender<Event>,
    sockets: Vec<Arc<UdpSocket>>,
    reader_stops: Vec<Arc<AtomicBool>>,
    cache: ExpiringRecordCollection,
    history: ExpiringRecordCollection,
    machines: Slab<Option<Machine>>,
    pending_start: VecDeque<MachineId>,
    actions: VecDeque<Action>,
    monitors: Vec<Sender<InterfaceEvent>>,
    local_addrs: Vec<IpAddr>,
    dropped_packets: u64,
    failed: bool,
    shutdown: bool,
    #[cfg(test)]
    pub sent: Vec<(Packet, Option<SocketAddr>)>,
}

impl Engine {
    pub fn new(
        key: String,
        tx: Sender<Event>,
        sockets: Vec<Arc<UdpSocket>>,
        local_addrs: Vec<IpAddr>,
    ) -> Self {
        Self {
            key,
            tx,
            sockets,
            reader_stops: Vec::new(),
            cache: ExpiringRecordCollection::new(),
            history: ExpiringRecordCollection::new(),
            machines: Slab::new(),
            pending_start: VecDeque::new(),
            actions: VecDeque::new(),
            monitors: Vec::new(),
            local_addrs,
            dropped_packets: 0,
            failed: false,
            shutdown: false,
            #[cfg(test)]
            sent: Vec::new(),
        }
    }

    /// The engine thread's main loop: wait for the next event or
    /// deadline, handle it, fire due timers, and apply deferred work.
    pub fn run(mut self, rx: Receiver<Event>) {
        debug!("Engine for interface {:?} starting.", self.key);
        loop {
            let event = match self.next_deadline() {
                Some(deadline) => {
                    let timeout = deadline.saturating_duration_since(Instant::now());
                    match rx.recv_timeout(timeout) {
                        Ok(event) => Some(event),
                        Err(RecvTimeoutError::Timeout) => None,
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                None => match rx.recv() {
                    Ok(event) => Some(event),
                    Err(_) => break,
                },
            };
            let now = Instant::now();
            if let Some(event) = event {
                self.handle_event(event, now);
            }
            self.advance(now);
            if self.shutdown || self.failed {
                break;
            }
        }
        self.teardown();
        debug!("Engine for interface {:?} stopped.", self.key);
    }

    /// Computes the earliest pending deadline across the cache, the
    /// history, and every machine.
    pub fn next_deadline(&self) -> Option<Instant> {
        let mut deadline = self.cache.next_deadline();
        for candidate in [self.history.next_deadline()]
            .into_iter()
            .chain(self.machines.iter().map(|(_, slot)| {
                slot.as_ref().and_then(Machine::next_deadline)
            }))
            .flatten()
        {
            deadline = Some(deadline.map_or(candidate, |d: Instant| d.min(candidate)));
        }
        deadline
    }

    /// Handles one event. Public within the crate so that tests can
    /// drive an engine synchronously with fabricated times.
    pub fn handle_event(&mut self, event: Event, now: Instant) {
        match event {
            Event::Datagram(octets, origin) => self.handle_datagram(&octets, origin, now),
            Event::Command(command) => self.handle_command(command, now),
            Event::Wake => self.handle_wake(now),
        }
    }

    /// Fires every due timer and applies all deferred work. Tests call
    /// this directly to simulate the passage of time.
    pub fn advance(&mut self, now: Instant) {
        // Cache events first: handlers must see the post-expiry cache.
        for event in self.cache.advance(now) {
            match &event {
                CacheEvent::Reissue(record) => {
                    self.emit(InterfaceEvent::CacheReissue(record.clone()))
                }
                CacheEvent::Expired(record) => {
                    self.emit(InterfaceEvent::CacheExpired(record.clone()))
                }
            }
            self.dispatch_all(now, |machine, ctx| machine.on_cache(&event, ctx));
        }
        self.history.advance(now);

        let due: Vec<MachineId> = self
            .machines
            .iter()
            .filter(|(_, slot)| {
                slot.as_ref()
                    .and_then(Machine::next_deadline)
                    .map_or(false, |deadline| deadline <= now)
            })
            .map(|(id, _)| id)
            .collect();
        for id in due {
            self.dispatch_one(id, now, |machine, ctx| machine.on_timer(ctx));
        }
        self.drain(now);
    }

    fn handle_datagram(&mut self, octets: &[u8], origin: SocketAddr, now: Instant) {
        let packet = match Packet::parse(octets, origin) {
            Ok(packet) => packet,
            Err(err) => {
                self.dropped_packets += 1;
                debug!("Dropping malformed packet from {}: {}.", origin, err);
                return;
            }
        };
        if !packet.is_valid() {
            self.dropped_packets += 1;
            return;
        }

        if packet.is_answer() && origin.port() == MDNS_PORT {
            for record in packet.answers.iter().chain(packet.additionals.iter()) {
                if record.is_unique() {
                    self.cache.flush_related(record, now);
                }
                self.cache.add(record.clone(), now);
            }
            self.emit(InterfaceEvent::Answer(packet.clone()));
            self.dispatch_all(now, |machine, ctx| machine.on_answer(&packet, ctx));
        } else if packet.is_probe() && origin.port() == MDNS_PORT {
            self.emit(InterfaceEvent::Probe(packet.clone()));
            self.dispatch_all(now, |machine, ctx| machine.on_probe(&packet, ctx));
        } else if packet.is_query() {
            self.emit(InterfaceEvent::Query(packet.clone()));
            self.dispatch_all(now, |machine, ctx| machine.on_query(&packet, ctx));
        }
        self.drain(now);
    }

    fn handle_command(&mut self, command: Command, now: Instant) {
        match command {
            Command::StartResponder {
                records,
                bridgeable,
                instance,
                announce_repeats,
                events,
                reply,
            } => {
                let responder =
                    Responder::new(records, bridgeable, instance, announce_repeats, events);
                let id = self.spawn(Machine::Responder(responder));
                let _ = reply.send(id);
            }
            Command::UpdateResponder { id, rr_type, apply } => {
                self.dispatch_one(id, now, move |machine, ctx| {
                    if let Machine::Responder(responder) = machine {
                        responder.update_each(rr_type, apply, ctx);
                    }
                });
            }
            Command::RenameResponder { id, instance } => {
                self.dispatch_one(id, now, move |machine, ctx| {
                    if let Machine::Responder(responder) = machine {
                        responder.apply_rename(instance, ctx);
                    }
                });
            }
            Command::StopResponder { id, forced } => {
                self.dispatch_one(id, now, move |machine, ctx| {
                    if let Machine::Responder(responder) = machine {
                        responder.shutdown(forced, ctx);
                    } else {
                        machine.stop(ctx);
                    }
                });
            }
            Command::StartQuery {
                questions,
                options,
                events,
                reply,
            } => {
                let legacy_socket = if options.legacy {
                    match self.open_aux_socket() {
                        Ok(socket) => Some(socket),
                        Err(err) => {
                            warn!("Failed to open a legacy query socket: {}.", err);
                            None
                        }
                    }
                } else {
                    None
                };
                let query = Query::new(questions, options, events, legacy_socket);
                let id = self.spawn(Machine::Query(query));
                let _ = reply.send(id);
            }
            Command::StartResolver {
                fullname,
                events,
                reply,
            } => {
                let resolver = Resolver::new(fullname, events);
                let id = self.spawn(Machine::Resolver(resolver));
                let _ = reply.send(id);
            }
            Command::StopMachine { id } => {
                self.dispatch_one(id, now, |machine, ctx| machine.stop(ctx));
            }
            Command::Monitor { events } => self.monitors.push(events),
            Command::Shutdown => self.shutdown = true,
        }
        self.drain(now);
    }

    fn handle_wake(&mut self, now: Instant) {
        info!("Interface {:?} woke from sleep; restarting machines.", self.key);
        // Nothing cached from before the sleep can be trusted.
        self.cache.clear();
        self.history.clear();
        self.dispatch_all(now, |machine, ctx| machine.on_wake(ctx));
        self.drain(now);
    }

    /// Registers a machine directly (command path); it starts on the
    /// next drain.
    fn spawn(&mut self, machine: Machine) -> MachineId {
        let id = self.machines.insert(Some(machine));
        self.pending_start.push_back(id);
        id
    }

    /// Dispatches `f` to one machine, with the take/call/put dance
    /// that lets the machine reach the rest of the engine through a
    /// [`Ctx`].
    fn dispatch_one<F>(&mut self, id: MachineId, now: Instant, f: F)
    where
        F: FnOnce(&mut Machine, &mut Ctx),
    {
        let mut machine = match self.machines.get_mut(id).and_then(Option::take) {
            Some(machine) => machine,
            None => return,
        };
        {
            let mut ctx = Ctx {
                now,
                current: id,
                cache: &mut self.cache,
                history: &mut self.history,
                local_addrs: &self.local_addrs,
                machines: &mut self.machines,
                pending_start: &mut self.pending_start,
                actions: &mut self.actions,
            };
            f(&mut machine, &mut ctx);
        }
        let finished = machine.is_finished();
        if let Some(slot) = self.machines.get_mut(id) {
            *slot = Some(machine);
        }
        if finished {
            self.machines.try_remove(id);
        }
    }

    /// Dispatches `f` to every machine registered at the start of the
    /// call. Machines spawned during the dispatch see only later
    /// events.
    fn dispatch_all<F>(&mut self, now: Instant, mut f: F)
    where
        F: FnMut(&mut Machine, &mut Ctx),
    {
        let ids: Vec<MachineId> = self.machines.iter().map(|(id, _)| id).collect();
        for id in ids {
            self.dispatch_one(id, now, &mut f);
        }
    }

    /// Applies deferred work (starts, sends, notices, stops) until
    /// none remains.
    fn drain(&mut self, now: Instant) {
        loop {
            if let Some(id) = self.pending_start.pop_front() {
                self.dispatch_one(id, now, |machine, ctx| machine.start(ctx));
                continue;
            }
            match self.actions.pop_front() {
                Some(Action::Send { packet, via, dest }) => {
                    self.send_packet(&packet, via.as_ref(), dest, now)
                }
                Some(Action::Notify { target, notice }) => {
                    self.dispatch_one(target, now, move |machine, ctx| {
                        machine.on_notice(notice, ctx)
                    });
                }
                Some(Action::Stop { target }) => {
                    self.dispatch_one(target, now, |machine, ctx| machine.stop(ctx));
                }
                None => break,
            }
        }
    }

    /// Sends a packet per the interface rules: drop when the engine
    /// has failed, the packet is empty, or the destination is not on
    /// the link; record multicast answers into the history; split on
    /// EMSGSIZE; treat any other send failure as fatal.
    fn send_packet(
        &mut self,
        packet: &Packet,
        via: Option<&Arc<UdpSocket>>,
        dest: Option<SocketAddr>,
        now: Instant,
    ) {
        if self.failed || packet.is_empty() {
            return;
        }
        if let Some(dest) = dest {
            if !is_linklocal_destination(dest.ip()) {
                debug!("Refusing to send to off-link destination {}.", dest);
                return;
            }
        }
        if packet.is_answer() && dest.is_none() {
            for record in packet.answers.iter().chain(packet.additionals.iter()) {
                self.history.add(record.clone(), now);
            }
        }
        #[cfg(test)]
        self.sent.push((packet.clone(), dest));

        let target = dest.unwrap_or_else(multicast_destination_v4);
        let octets = packet.encode();
        let sockets: Vec<Arc<UdpSocket>> = match via {
            Some(socket) => vec![socket.clone()],
            None => self.sockets.clone(),
        };
        for sock in sockets {
            if target.is_ipv4() != sock.local_addr().map_or(true, |a| a.is_ipv4()) {
                continue;
            }
            match sock.send_to(&octets, target) {
                Ok(_) => {}
                Err(err) if is_message_too_long(&err) => {
                    debug!("Packet for {} exceeded the MTU; splitting.", target);
                    let (first, second) = packet.split();
                    self.send_packet(&first, Some(&sock), dest, now);
                    self.send_packet(&second, Some(&sock), dest, now);
                }
                Err(err) => {
                    self.fail(format!("send to {} failed: {}", target, err), now);
                    return;
                }
            }
        }
    }

    /// Handles a fatal interface error: every machine learns about it
    /// and stops; monitors get `Error`; the engine shuts down.
    fn fail(&mut self, message: String, now: Instant) {
        if self.failed {
            return;
        }
        error!("Interface {:?} failed: {}.", self.key, message);
        self.failed = true;
        self.emit(InterfaceEvent::Error(message.clone()));
        let ids: Vec<MachineId> = self.machines.iter().map(|(id, _)| id).collect();
        for id in ids {
            self.dispatch_one(id, now, |machine, ctx| {
                machine.on_error(&message);
                machine.stop(ctx);
            });
        }
    }

    /// Opens an ephemeral socket for a legacy query and spawns a
    /// reader thread feeding the engine channel.
    fn open_aux_socket(&mut self) -> std::io::Result<Arc<UdpSocket>> {
        let sock = Arc::new(socket::bind_ephemeral_v4()?);
        let stop = Arc::new(AtomicBool::new(false));
        self.reader_stops.push(stop.clone());
        spawn_reader(sock.clone(), self.tx.clone(), stop);
        Ok(sock)
    }

    /// Lets the engine own the stop flags of externally spawned
    /// reader threads so teardown can stop them.
    pub fn adopt_reader_stop(&mut self, stop: Arc<AtomicBool>) {
        self.reader_stops.push(stop);
    }

    fn emit(&mut self, event: InterfaceEvent) {
        self.monitors
            .retain(|monitor| monitor.send(event.clone()).is_ok());
    }

    fn teardown(&mut self) {
        for stop in &self.reader_stops {
            stop.store(true, Ordering::Relaxed);
        }
        let now = Instant::now();
        let ids: Vec<MachineId> = self.machines.iter().map(|(id, _)| id).collect();
        for id in ids {
            self.dispatch_one(id, now, |machine, ctx| machine.stop(ctx));
        }
        self.drain_discarding();
        self.machines.clear();
        self.cache.clear();
        self.history.clear();
        self.sockets.clear();
        if self.dropped_packets > 0 {
            debug!(
                "Interface {:?} dropped {} malformed packets over its lifetime.",
                self.key, self.dropped_packets
            );
        }
    }

    /// Discards deferred work during teardown (nothing may hit the
    /// network anymore).
    fn drain_discarding(&mut self) {
        self.pending_start.clear();
        self.actions.clear();
    }
}

/// Returns whether an I/O error is the OS's "message too long".
fn is_message_too_long(err: &std::io::Error) -> bool {
    #[cfg(target_os = "linux")]
    const EMSGSIZE: i32 = 90;
    #[cfg(all(unix, not(target_os = "linux")))]
    const EMSGSIZE: i32 = 40;
    #[cfg(windows)]
    const EMSGSIZE: i32 = 10040;
    err.raw_os_error() == Some(EMSGSIZE)
}

/// Spawns a thread that reads datagrams from `sock` and posts them to
/// the engine until `stop` is raised or the channel closes.
fn spawn_reader(sock: Arc<UdpSocket>, tx: Sender<Event>, stop: Arc<AtomicBool>) {
    thread::Builder::new()
        .name("mdns-reader".to_owned())
        .spawn(move || {
            let mut buffer = [0u8; 9000];
            while !stop.load(Ordering::Relaxed) {
                match sock.recv_from(&mut buffer) {
                    Ok((len, origin)) => {
                        let octets = buffer[..len].to_vec();
                        if tx.send(Event::Datagram(octets, origin)).is_err() {
                            break;
                        }
                    }
                    Err(err)
                        if err.kind() == std::io::ErrorKind::WouldBlock
                            || err.kind() == std::io::ErrorKind::TimedOut => {}
                    Err(err) => {
                        debug!("Socket reader exiting: {}.", err);
                        break;
                    }
                }
            }
        })
        .expect("failed to spawn a socket reader thread");
}

////////////////////////////////////////////////////////////////////////
// INTERFACE HANDLES AND REGISTRY                                     //
////////////////////////////////////////////////////////////////////////

/// A shared handle to one network interface's engine.
///
/// Handles are obtained from [`Interface::get`] and are reference
/// counted through [`Interface::bind`] / [`Interface::stop_using`]:
/// the first bind brings the sockets and the engine thread up, and
/// the last release tears everything down.
#[derive(Clone)]
pub struct Interface {
    shared: Arc<Shared>,
}

struct Shared {
    key: String,
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    refcount: usize,
    tx: Option<Sender<Event>>,
    watcher: Option<SleepWatcher>,
    reader_stops: Vec<Arc<AtomicBool>>,
    thread: Option<thread::JoinHandle<()>>,
}

lazy_static! {
    static ref REGISTRY: Mutex<std::collections::HashMap<String, Interface>> =
        Mutex::new(std::collections::HashMap::new());
}

/// An error from interface lookup or binding.
#[derive(Debug)]
pub enum InterfaceError {
    Unknown(UnknownInterface),
    Io(std::io::Error),
    NotBound,
}

impl std::fmt::Display for InterfaceError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Self::Unknown(err) => err.fmt(f),
            Self::Io(err) => write!(f, "binding the interface failed: {}", err),
            Self::NotBound => f.write_str("the interface is not bound"),
        }
    }
}

impl std::error::Error for InterfaceError {}

impl From<std::io::Error> for InterfaceError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err)
    }
}

impl Interface {
    /// Returns the shared handle for an interface specifier: `""` for
    /// the catch-all, an IPv4 literal, or an OS interface name. The
    /// same normalized key always yields the same handle.
    pub fn get(specifier: &str) -> Result<Interface, InterfaceError> {
        let map = system_platform().interfaces();
        let key = resolve_specifier(specifier, &map).map_err(InterfaceError::Unknown)?;
        let mut registry = REGISTRY.lock().unwrap();
        Ok(registry
            .entry(key.clone())
            .or_insert_with(|| Interface {
                shared: Arc::new(Shared {
                    key,
                    state: Mutex::new(State::default()),
                }),
            })
            .clone())
    }

    /// The normalized interface key.
    pub fn key(&self) -> &str {
        &self.shared.key
    }

    /// Binds the interface, bringing up sockets, readers, the sleep
    /// watcher, and the engine thread on first use. Subsequent binds
    /// only increment the reference count.
    pub fn bind(&self) -> Result<(), InterfaceError> {
        let mut state = self.shared.state.lock().unwrap();
        if state.tx.is_some() {
            state.refcount += 1;
            return Ok(());
        }

        let map = system_platform().interfaces();
        let outgoing = if self.shared.key == "any" {
            None
        } else {
            map.get(&self.shared.key).and_then(|entries| {
                entries.iter().find_map(|entry| match entry.address {
                    IpAddr::V4(v4) => Some(v4),
                    IpAddr::V6(_) => None,
                })
            })
        };
        let sock = Arc::new(socket::bind_multicast_v4(outgoing)?);
        let local_addrs = all_addresses(&map);
        for addr in &local_addrs {
            if let IpAddr::V4(v4) = addr {
                if let Err(err) = socket::join_group_v4(&sock, *v4) {
                    // Not every address can join (p2p links, tunnels);
                    // reception on the others still works.
                    warn!("Could not join the mDNS group on {}: {}.", v4, err);
                }
            }
        }

        let (tx, rx) = mpsc::channel();
        let stop = Arc::new(AtomicBool::new(false));
        spawn_reader(sock.clone(), tx.clone(), stop.clone());

        let mut engine = Engine::new(
            self.shared.key.clone(),
            tx.clone(),
            vec![sock],
            local_addrs,
        );
        engine.adopt_reader_stop(stop.clone());
        let thread = thread::Builder::new()
            .name(format!("mdns-engine-{}", self.shared.key))
            .spawn(move || engine.run(rx))?;

        let wake_tx = tx.clone();
        let watcher = SleepWatcher::spawn(move || {
            let _ = wake_tx.send(Event::Wake);
        });

        info!("Interface {:?} bound.", self.shared.key);
        state.refcount = 1;
        state.tx = Some(tx);
        state.watcher = Some(watcher);
        state.reader_stops = vec![stop];
        state.thread = Some(thread);
        Ok(())
    }

    /// Releases one reference. When the count reaches zero the engine
    /// shuts down, sockets close, and the cache empties.
    pub fn stop_using(&self) {
        let mut state = self.shared.state.lock().unwrap();
        state.refcount = state.refcount.saturating_sub(1);
        if state.refcount > 0 {
            return;
        }
        if let Some(tx) = state.tx.take() {
            let _ = tx.send(Event::Command(Command::Shutdown));
        }
        for stop in state.reader_stops.drain(..) {
            stop.store(true, Ordering::Relaxed);
        }
        if let Some(watcher) = state.watcher.take() {
            watcher.stop();
        }
        if let Some(thread) = state.thread.take() {
            let _ = thread.join();
        }
        info!("Interface {:?} released.", self.shared.key);
    }

    /// Posts a command to the engine.
    pub fn command(&self, command: Command) -> Result<(), InterfaceError> {
        let state = self.shared.state.lock().unwrap();
        match &state.tx {
            Some(tx) => tx
                .send(Event::Command(command))
                .map_err(|_| InterfaceError::NotBound),
            None => Err(InterfaceError::NotBound),
        }
    }
}
