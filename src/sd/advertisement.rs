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

//! Advertising a service instance.

use std::net::IpAddr;
use std::sync::mpsc::{self, Receiver};
use std::sync::{Arc, Mutex};
use std::thread;

use log::debug;

use super::SdError;
use crate::engine::{
    responder::DEFAULT_ANNOUNCE_REPEATS, Command, Interface, MachineId, ResponderEvent,
};
use crate::name::Name;
use crate::net::system_platform;
use crate::rr::{Rdata, Record, RecordCollection, Ttl, TxtData, Type};
use crate::service::{self, ServiceType, LOCAL_DOMAIN};

/// The TTL of host address and SRV records (RFC 6762 § 10).
const HOST_TTL: Ttl = Ttl::from_secs(120);

/// The TTL of PTR and TXT records (RFC 6762 § 10).
const SERVICE_TTL: Ttl = Ttl::from_secs(4500);

/// Events reported by an [`Advertisement`].
#[derive(Clone, Debug)]
pub enum AdvertisementEvent {
    /// Probing succeeded everywhere; the instance is discoverable.
    Active,
    /// A name conflict forced a rename; the new instance label is
    /// carried.
    InstanceRenamed(String),
    /// The advertisement has stopped.
    Stopped,
    /// The advertisement failed.
    Error(String),
}

////////////////////////////////////////////////////////////////////////
// BUILDER                                                            //
////////////////////////////////////////////////////////////////////////

/// Configures an [`Advertisement`] before it starts.
pub struct AdvertisementBuilder {
    service_type: ServiceType,
    port: u16,
    instance: String,
    host: Option<String>,
    txt: TxtData,
    interface: String,
    announce_repeats: u32,
}

impl AdvertisementBuilder {
    /// Sets the instance label. Defaults to the service name.
    pub fn instance_name(mut self, instance: &str) -> Self {
        self.instance = instance.to_owned();
        self
    }

    /// Sets the advertised host label (without the domain). Defaults
    /// to the instance label.
    pub fn host(mut self, host: &str) -> Self {
        self.host = Some(host.to_owned());
        self
    }

    /// Sets the TXT data. Defaults to empty.
    pub fn txt(mut self, txt: TxtData) -> Self {
        self.txt = txt;
        self
    }

    /// Selects a network interface by specifier. Defaults to the
    /// catch-all.
    pub fn interface(mut self, specifier: &str) -> Self {
        self.interface = specifier.to_owned();
        self
    }

    /// Sets how many announcement packets are sent after probing.
    pub fn announce_repeats(mut self, repeats: u32) -> Self {
        self.announce_repeats = repeats.max(1);
        self
    }

    /// Validates the configuration, binds the interface, and starts
    /// probing.
    pub fn start(self) -> Result<Advertisement, SdError> {
        service::validate_instance_name(&self.instance)?;
        service::validate_port(self.port)?;
        service::validate_txt(&self.txt)?;

        let interface = Interface::get(&self.interface)?;
        interface.bind()?;

        let host_label = self.host.clone().unwrap_or_else(|| self.instance.clone());
        let records = build_records(
            &self.service_type,
            &self.instance,
            &host_label,
            self.port,
            &self.txt,
        );

        let (events_tx, events_rx) = mpsc::channel();
        let (reply_tx, reply_rx) = mpsc::channel();
        interface.command(Command::StartResponder {
            records,
            bridgeable: RecordCollection::new(),
            instance: Some(self.instance.clone()),
            announce_repeats: self.announce_repeats,
            events: events_tx,
            reply: reply_tx,
        })?;
        let responder = reply_rx.recv().map_err(|_| SdError::Timeout)?;

        let instance = Arc::new(Mutex::new(self.instance.clone()));
        let (public_tx, public_rx) = mpsc::channel();
        let forward_instance = instance.clone();
        thread::Builder::new()
            .name("mdns-advertisement".to_owned())
            .spawn(move || {
                let mut active = false;
                while let Ok(event) = events_rx.recv() {
                    let forwarded = match event {
                        ResponderEvent::ProbingComplete => {
                            if active {
                                continue;
                            }
                            active = true;
                            AdvertisementEvent::Active
                        }
                        ResponderEvent::Renamed(label) => {
                            *forward_instance.lock().unwrap() = label.clone();
                            AdvertisementEvent::InstanceRenamed(label)
                        }
                        ResponderEvent::Stopped => AdvertisementEvent::Stopped,
                        ResponderEvent::Error(message) => AdvertisementEvent::Error(message),
                    };
                    let done = matches!(forwarded, AdvertisementEvent::Stopped);
                    if public_tx.send(forwarded).is_err() || done {
                        break;
                    }
                }
            })
            .expect("failed to spawn the advertisement event thread");

        Ok(Advertisement {
            interface,
            responder,
            service_type: self.service_type,
            port: self.port,
            instance,
            txt: Mutex::new(self.txt),
            events: public_rx,
            stopped: Mutex::new(false),
        })
    }
}

////////////////////////////////////////////////////////////////////////
// ADVERTISEMENT                                                      //
////////////////////////////////////////////////////////////////////////

/// A running advertisement of one service instance.
pub struct Advertisement {
    interface: Interface,
    responder: MachineId,
    service_type: ServiceType,
    port: u16,
    instance: Arc<Mutex<String>>,
    txt: Mutex<TxtData>,
    events: Receiver<AdvertisementEvent>,
    stopped: Mutex<bool>,
}

impl Advertisement {
    /// Starts building an advertisement of `service_type` on `port`.
    pub fn builder(
        service_type: ServiceType,
        port: u16,
    ) -> AdvertisementBuilder {
        let instance = service_type.name.clone();
        AdvertisementBuilder {
            service_type,
            port,
            instance,
            host: None,
            txt: TxtData::new(),
            interface: String::new(),
            announce_repeats: DEFAULT_ANNOUNCE_REPEATS,
        }
    }

    /// The event stream: `Active`, `InstanceRenamed`, `Stopped`,
    /// `Error`.
    pub fn events(&self) -> &Receiver<AdvertisementEvent> {
        &self.events
    }

    /// The current instance label (it may have been renamed).
    pub fn instance_name(&self) -> String {
        self.instance.lock().unwrap().clone()
    }

    /// The advertised service type.
    pub fn service_type(&self) -> &ServiceType {
        &self.service_type
    }

    /// The advertised port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Replaces the TXT data. Identical data is a no-op; changed data
    /// is re-announced, and attached browsers will report the change.
    pub fn update_txt(&self, txt: TxtData) -> Result<(), SdError> {
        service::validate_txt(&txt)?;
        {
            let mut current = self.txt.lock().unwrap();
            if *current == txt {
                debug!("TXT update is identical; nothing to do.");
                return Ok(());
            }
            *current = txt.clone();
        }
        self.interface.command(Command::UpdateResponder {
            id: self.responder,
            rr_type: Type::TXT,
            apply: Box::new(move |record| {
                record.rdata = Rdata::Txt(txt.clone());
            }),
        })?;
        Ok(())
    }

    /// Stops the advertisement. A clean stop (`forced == false`) says
    /// goodbye so observers notice promptly; a forced stop goes
    /// silent, leaving observers to their record TTLs.
    pub fn stop(&self, forced: bool) {
        let mut stopped = self.stopped.lock().unwrap();
        if *stopped {
            return;
        }
        *stopped = true;
        let _ = self.interface.command(Command::StopResponder {
            id: self.responder,
            forced,
        });
        self.interface.stop_using();
    }
}

impl Drop for Advertisement {
    fn drop(&mut self) {
        self.stop(true);
    }
}

////////////////////////////////////////////////////////////////////////
// RECORD CONSTRUCTION                                                //
////////////////////////////////////////////////////////////////////////

/// Builds the record set of one instance: SRV and TXT at the instance
/// name, A/AAAA for the host, a PTR from the service type (plus one
/// per subtype), and the enumerator PTR that lets
/// `_services._dns-sd._udp` browsers find the type itself.
fn build_records(
    service_type: &ServiceType,
    instance: &str,
    host_label: &str,
    port: u16,
    txt: &TxtData,
) -> Vec<Record> {
    let type_name = ServiceType {
        subtypes: Vec::new(),
        ..service_type.clone()
    }
    .to_name(LOCAL_DOMAIN);
    let fullname = service_type.instance_name(instance, LOCAL_DOMAIN);
    let host: Name = format!("{}.{}", host_label.replace('.', "-"), LOCAL_DOMAIN)
        .parse()
        .expect("host labels are valid by construction");

    let address_records: Vec<Record> = host_addresses()
        .into_iter()
        .map(|address| match address {
            IpAddr::V4(v4) => Record::new(host.clone(), Type::A, HOST_TTL, Rdata::A(v4)),
            IpAddr::V6(v6) => Record::new(host.clone(), Type::AAAA, HOST_TTL, Rdata::Aaaa(v6)),
        })
        .collect();

    let srv = Record::new(
        fullname.clone(),
        Type::SRV,
        HOST_TTL,
        Rdata::Srv {
            priority: 0,
            weight: 0,
            port,
            target: host.clone(),
        },
    )
    .with_additionals(address_records.clone());

    let txt_record = Record::new(
        fullname.clone(),
        Type::TXT,
        SERVICE_TTL,
        Rdata::Txt(txt.clone()),
    );

    let mut ptr_additionals = vec![srv.clone(), txt_record.clone()];
    ptr_additionals.extend(address_records.iter().cloned());
    let ptr = Record::new(
        type_name.clone(),
        Type::PTR,
        SERVICE_TTL,
        Rdata::Ptr(fullname.clone()),
    )
    .with_additionals(ptr_additionals.clone());

    let enumerator = Record::new(
        "_services._dns-sd._udp.local.".parse().unwrap(),
        Type::PTR,
        SERVICE_TTL,
        Rdata::Ptr(type_name),
    );

    let mut records = vec![srv, txt_record, ptr, enumerator];
    for subtype in &service_type.subtypes {
        let subtype_name: Name = format!(
            "_{}._sub._{}.{}.{}",
            subtype,
            service_type.name,
            service_type.protocol.label(),
            LOCAL_DOMAIN
        )
        .parse()
        .expect("validated subtypes make valid names");
        records.push(
            Record::new(
                subtype_name,
                Type::PTR,
                SERVICE_TTL,
                Rdata::Ptr(fullname.clone()),
            )
            .with_additionals(ptr_additionals.clone()),
        );
    }
    records.extend(address_records);
    records
}

/// The external addresses the host should advertise.
fn host_addresses() -> Vec<IpAddr> {
    let map = system_platform().interfaces();
    let mut addresses = Vec::new();
    for entries in map.values() {
        for entry in entries {
            if !entry.internal && !addresses.contains(&entry.address) {
                addresses.push(entry.address);
            }
        }
    }
    if addresses.is_empty() {
        // A host with only a loopback still deserves to work, for
        // same-machine discovery at least.
        addresses.push(IpAddr::V4(std::net::Ipv4Addr::LOCALHOST));
    }
    addresses
}

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::Protocol;

    #[test]
    fn build_records_produces_the_instance_bundle() {
        let service_type = ServiceType::new("test", Protocol::Tcp).unwrap();
        let mut txt = TxtData::new();
        txt.insert("path", crate::rr::TxtValue::from("/"));
        let records = build_records(&service_type, "Test #1", "Test #1", 4444, &txt);

        let fullname: Name = "Test #1._test._tcp.local.".parse().unwrap();
        let srv = records
            .iter()
            .find(|r| r.rr_type == Type::SRV)
            .expect("an SRV record");
        assert_eq!(srv.name, fullname);
        let (_, _, port, target) = srv.rdata.as_srv().unwrap();
        assert_eq!(port, 4444);
        assert_eq!(*target, "Test #1.local.".parse::<Name>().unwrap());

        let ptr = records
            .iter()
            .find(|r| r.rr_type == Type::PTR && r.name == "_test._tcp.local.".parse().unwrap())
            .expect("a PTR record");
        assert_eq!(ptr.rdata.as_ptr().unwrap(), &fullname);
        assert!(!ptr.additionals.is_empty());

        let enumerator = records
            .iter()
            .find(|r| {
                r.name == "_services._dns-sd._udp.local.".parse().unwrap()
            })
            .expect("the enumerator PTR");
        assert_eq!(
            enumerator.rdata.as_ptr().unwrap(),
            &"_test._tcp.local.".parse().unwrap()
        );

        assert!(records.iter().any(|r| r.rr_type == Type::A || r.rr_type == Type::AAAA));
    }
}
