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

//! Browsing a service type.
//!
//! A browser keeps a continuous PTR query alive for its service type
//! and watches the interface's answer stream. Each discovered
//! instance gets a service resolver in the engine (unless resolution
//! was declined), and the resolvers' reports surface as
//! `ServiceUp` / `ServiceChanged` / `ServiceDown`.

use std::collections::HashMap;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread;

use log::debug;

use super::SdError;
use crate::engine::{
    Command, Interface, InterfaceEvent, MachineId, QueryOptions, ResolverEvent,
};
use crate::message::Question;
use crate::name::Name;
use crate::rr::Type;
use crate::service::{Service, ServiceType, LOCAL_DOMAIN};

/// Events reported by a [`Browser`].
#[derive(Clone, Debug)]
pub enum BrowserEvent {
    /// An instance appeared (with full details, or name-only for a
    /// non-resolving browser).
    ServiceUp(Service),
    /// A resolved instance's details changed.
    ServiceChanged(Service),
    /// An instance disappeared.
    ServiceDown(Service),
    /// The underlying interface failed.
    Error(String),
}

////////////////////////////////////////////////////////////////////////
// BUILDER                                                            //
////////////////////////////////////////////////////////////////////////

/// Configures a [`Browser`] before it starts.
pub struct BrowserBuilder {
    service_type: ServiceType,
    resolve: bool,
    interface: String,
}

impl BrowserBuilder {
    /// Controls whether discovered instances are resolved. A
    /// non-resolving browser reports `ServiceUp` with name-only
    /// services. Defaults to resolving.
    pub fn resolve(mut self, resolve: bool) -> Self {
        self.resolve = resolve;
        self
    }

    /// Selects a network interface by specifier. Defaults to the
    /// catch-all.
    pub fn interface(mut self, specifier: &str) -> Self {
        self.interface = specifier.to_owned();
        self
    }

    /// Binds the interface and starts browsing.
    pub fn start(self) -> Result<Browser, SdError> {
        let interface = Interface::get(&self.interface)?;
        interface.bind()?;

        let type_name = self.service_type.to_name(LOCAL_DOMAIN);

        // The continuous PTR query generates the questions; the
        // answers are observed through the interface monitor, which
        // also reports cache expirations.
        let (reply_tx, reply_rx) = mpsc::channel();
        interface.command(Command::StartQuery {
            questions: vec![Question::new(type_name.clone(), Type::PTR)],
            options: QueryOptions::default(),
            events: None,
            reply: reply_tx,
        })?;
        let query = reply_rx.recv().map_err(|_| SdError::Timeout)?;

        let (monitor_tx, monitor_rx) = mpsc::channel();
        interface.command(Command::Monitor { events: monitor_tx })?;

        let (public_tx, public_rx) = mpsc::channel();
        let (resolver_tx, resolver_rx) = mpsc::channel();
        let known = Arc::new(Mutex::new(HashMap::new()));

        spawn_discovery_worker(
            interface.clone(),
            type_name,
            self.resolve,
            monitor_rx,
            resolver_tx,
            public_tx.clone(),
            known.clone(),
        );
        if self.resolve {
            spawn_resolution_worker(resolver_rx, public_tx, known.clone());
        }

        Ok(Browser {
            interface,
            query,
            known,
            events: public_rx,
            stopped: Mutex::new(false),
        })
    }
}

////////////////////////////////////////////////////////////////////////
// BROWSER                                                            //
////////////////////////////////////////////////////////////////////////

/// A running browse operation for one service type.
pub struct Browser {
    interface: Interface,
    query: MachineId,
    known: Arc<Mutex<HashMap<String, Option<MachineId>>>>,
    events: Receiver<BrowserEvent>,
    stopped: Mutex<bool>,
}

impl Browser {
    /// Starts building a browser for `service_type`.
    pub fn builder(service_type: ServiceType) -> BrowserBuilder {
        BrowserBuilder {
            service_type,
            resolve: true,
            interface: String::new(),
        }
    }

    /// The event stream: `ServiceUp`, `ServiceChanged`, `ServiceDown`,
    /// `Error`.
    pub fn events(&self) -> &Receiver<BrowserEvent> {
        &self.events
    }

    /// The instances currently known, by full name.
    pub fn known_instances(&self) -> Vec<String> {
        self.known.lock().unwrap().keys().cloned().collect()
    }

    /// Stops browsing and releases the interface.
    pub fn stop(&self) {
        let mut stopped = self.stopped.lock().unwrap();
        if *stopped {
            return;
        }
        *stopped = true;
        let _ = self.interface.command(Command::StopMachine { id: self.query });
        for resolver in self.known.lock().unwrap().values().flatten() {
            let _ = self
                .interface
                .command(Command::StopMachine { id: *resolver });
        }
        self.interface.stop_using();
    }
}

impl Drop for Browser {
    fn drop(&mut self) {
        self.stop();
    }
}

////////////////////////////////////////////////////////////////////////
// WORKERS                                                            //
////////////////////////////////////////////////////////////////////////

/// Watches the interface's answer stream for PTR records of the
/// browsed type (discovery) and, for non-resolving browsers, for
/// their expiration (departure).
#[allow(clippy::too_many_arguments)]
fn spawn_discovery_worker(
    interface: Interface,
    type_name: Name,
    resolve: bool,
    monitor: Receiver<InterfaceEvent>,
    resolver_tx: Sender<ResolverEvent>,
    public: Sender<BrowserEvent>,
    known: Arc<Mutex<HashMap<String, Option<MachineId>>>>,
) {
    thread::Builder::new()
        .name("mdns-browse-discovery".to_owned())
        .spawn(move || {
            while let Ok(event) = monitor.recv() {
                match event {
                    InterfaceEvent::Answer(packet) => {
                        for record in packet.answers.iter().chain(packet.additionals.iter()) {
                            if record.rr_type != Type::PTR
                                || record.name != type_name
                                || record.ttl.as_secs() == 0
                            {
                                continue;
                            }
                            let fullname = match record.rdata.as_ptr() {
                                Some(fullname) => fullname.clone(),
                                None => continue,
                            };
                            let key = fullname.to_string();
                            if known.lock().unwrap().contains_key(&key) {
                                continue;
                            }
                            debug!("Discovered instance {:?}.", key);
                            if resolve {
                                let (reply_tx, reply_rx) = mpsc::channel();
                                if interface
                                    .command(Command::StartResolver {
                                        fullname,
                                        events: resolver_tx.clone(),
                                        reply: reply_tx,
                                    })
                                    .is_err()
                                {
                                    continue;
                                }
                                let resolver = reply_rx.recv().ok();
                                known.lock().unwrap().insert(key, resolver);
                            } else {
                                known.lock().unwrap().insert(key, None);
                                let up = Service::name_only(&fullname);
                                if public.send(BrowserEvent::ServiceUp(up)).is_err() {
                                    return;
                                }
                            }
                        }
                    }
                    InterfaceEvent::CacheExpired(record) => {
                        if resolve
                            || record.rr_type != Type::PTR
                            || record.name != type_name
                        {
                            continue;
                        }
                        if let Some(fullname) = record.rdata.as_ptr() {
                            let key = fullname.to_string();
                            if known.lock().unwrap().remove(&key).is_some() {
                                let down = Service::name_only(fullname);
                                if public.send(BrowserEvent::ServiceDown(down)).is_err() {
                                    return;
                                }
                            }
                        }
                    }
                    InterfaceEvent::Error(message) => {
                        let _ = public.send(BrowserEvent::Error(message));
                        return;
                    }
                    _ => {}
                }
            }
        })
        .expect("failed to spawn the browse discovery thread");
}

/// Forwards resolver reports to the public stream, retiring instances
/// that go down.
fn spawn_resolution_worker(
    resolver_rx: Receiver<ResolverEvent>,
    public: Sender<BrowserEvent>,
    known: Arc<Mutex<HashMap<String, Option<MachineId>>>>,
) {
    thread::Builder::new()
        .name("mdns-browse-resolution".to_owned())
        .spawn(move || {
            while let Ok(event) = resolver_rx.recv() {
                let forwarded = match event {
                    ResolverEvent::Resolved(service) => BrowserEvent::ServiceUp(service),
                    ResolverEvent::Updated(service) => BrowserEvent::ServiceChanged(service),
                    ResolverEvent::Down(service) => {
                        known.lock().unwrap().remove(&service.fullname);
                        BrowserEvent::ServiceDown(service)
                    }
                };
                if public.send(forwarded).is_err() {
                    return;
                }
            }
        })
        .expect("failed to spawn the browse resolution thread");
}
