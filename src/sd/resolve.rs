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

//! One-shot lookups.
//!
//! These helpers ask a single question on the multicast group and
//! return the first usable answer. The record-level lookups go out as
//! *legacy* queries, from an ephemeral port as [RFC 6762 § 6.7] wants
//! of a one-shot resolver, so that an OS-resident responder on this
//! very host will answer them like any other.

use std::net::IpAddr;
use std::sync::mpsc;
use std::time::Duration;

use super::SdError;
use crate::engine::{Command, Interface, QueryEvent, QueryOptions, ResolverEvent};
use crate::message::Question;
use crate::name::Name;
use crate::rr::{Record, TxtData, Type};
use crate::service::Service;

/// Performs a one-shot legacy query for `(name, rr_type)` and returns
/// the first answering record.
pub fn resolve_record(
    name: &Name,
    rr_type: Type,
    timeout: Duration,
) -> Result<Record, SdError> {
    let interface = Interface::get("")?;
    interface.bind()?;
    let result = resolve_record_on(&interface, name, rr_type, timeout);
    interface.stop_using();
    result
}

fn resolve_record_on(
    interface: &Interface,
    name: &Name,
    rr_type: Type,
    timeout: Duration,
) -> Result<Record, SdError> {
    let (events_tx, events_rx) = mpsc::channel();
    let (reply_tx, reply_rx) = mpsc::channel();
    interface.command(Command::StartQuery {
        questions: vec![Question::new(name.clone(), rr_type)],
        options: QueryOptions {
            continuous: false,
            ignore_cache: false,
            timeout: Some(timeout),
            legacy: true,
        },
        events: Some(events_tx),
        reply: reply_tx,
    })?;
    let _query = reply_rx.recv().map_err(|_| SdError::Timeout)?;

    // One channel read covers every outcome: the machine reports an
    // answer, a timeout, or (having stopped some other way) nothing.
    match events_rx.recv_timeout(timeout + Duration::from_secs(1)) {
        Ok(QueryEvent::Answer { record, .. }) => Ok(record),
        Ok(QueryEvent::Timeout) => Err(SdError::Timeout),
        Ok(QueryEvent::Stopped) => Err(SdError::NotFound),
        Err(_) => Err(SdError::Timeout),
    }
}

/// Resolves a hostname (e.g. `host.local.`) to an address.
pub fn resolve_address(hostname: &str, timeout: Duration) -> Result<IpAddr, SdError> {
    let name: Name = hostname.parse().map_err(|_| SdError::NotFound)?;
    let record = resolve_record(&name, Type::A, timeout)?;
    record.rdata.as_address().ok_or(SdError::NotFound)
}

/// Resolves the SRV record of a full service instance name.
pub fn resolve_srv(fullname: &str, timeout: Duration) -> Result<Record, SdError> {
    let name: Name = fullname.parse().map_err(|_| SdError::NotFound)?;
    resolve_record(&name, Type::SRV, timeout)
}

/// Resolves the TXT data of a full service instance name.
pub fn resolve_txt(fullname: &str, timeout: Duration) -> Result<TxtData, SdError> {
    let name: Name = fullname.parse().map_err(|_| SdError::NotFound)?;
    let record = resolve_record(&name, Type::TXT, timeout)?;
    record.rdata.as_txt().cloned().ok_or(SdError::NotFound)
}

/// Resolves a full service instance name (e.g.
/// `Web Server._http._tcp.local.`) into a complete [`Service`], using
/// a short-lived service resolver in the engine.
pub fn resolve_service(fullname: &str, timeout: Duration) -> Result<Service, SdError> {
    let name: Name = fullname.parse().map_err(|_| SdError::NotFound)?;
    let interface = Interface::get("")?;
    interface.bind()?;

    let (events_tx, events_rx) = mpsc::channel();
    let (reply_tx, reply_rx) = mpsc::channel();
    let started = interface.command(Command::StartResolver {
        fullname: name,
        events: events_tx,
        reply: reply_tx,
    });
    let result = match started {
        Ok(()) => match reply_rx.recv() {
            Ok(resolver) => {
                let result = match events_rx.recv_timeout(timeout) {
                    Ok(ResolverEvent::Resolved(service)) => Ok(service),
                    Ok(ResolverEvent::Down(_)) => Err(SdError::NotFound),
                    Ok(_) => Err(SdError::NotFound),
                    Err(_) => Err(SdError::Timeout),
                };
                let _ = interface.command(Command::StopMachine { id: resolver });
                result
            }
            Err(_) => Err(SdError::Timeout),
        },
        Err(err) => Err(err.into()),
    };
    interface.stop_using();
    result
}
