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

//! Enumeration of the host's network interfaces.
//!
//! The protocol engine consumes exactly one capability from the host
//! platform here: a map from interface name to addresses. It is
//! expressed as the [`Platform`] trait so that tests can substitute a
//! fixture topology; production code uses the [`if_addrs`]-backed
//! [`system_platform`]. The active platform is process-wide state with
//! lazy initialization and an explicit override for tests.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, RwLock};

use lazy_static::lazy_static;

/// One address bound to a network interface.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct IfAddress {
    pub address: IpAddr,
    /// Whether the interface is internal (loopback).
    pub internal: bool,
}

impl IfAddress {
    /// Returns whether this is an IPv4 address.
    pub fn is_ipv4(&self) -> bool {
        self.address.is_ipv4()
    }
}

/// A map from OS interface name to the (non-empty) list of addresses
/// bound on it.
pub type InterfaceMap = HashMap<String, Vec<IfAddress>>;

/// The interface-enumeration capability required from the host.
///
/// Results are not cached by the engine; each call reflects the
/// current state of the host.
pub trait Platform: Send + Sync {
    fn interfaces(&self) -> InterfaceMap;
}

/// The production [`Platform`], backed by getifaddrs(3) through the
/// `if-addrs` crate.
struct SystemPlatform;

impl Platform for SystemPlatform {
    fn interfaces(&self) -> InterfaceMap {
        let mut map = InterfaceMap::new();
        match if_addrs::get_if_addrs() {
            Ok(addrs) => {
                for interface in addrs {
                    let entry = IfAddress {
                        address: interface.ip(),
                        internal: interface.is_loopback(),
                    };
                    map.entry(interface.name).or_default().push(entry);
                }
            }
            Err(err) => log::warn!("Failed to enumerate network interfaces: {}", err),
        }
        map
    }
}

lazy_static! {
    static ref ACTIVE: RwLock<Arc<dyn Platform>> = RwLock::new(Arc::new(SystemPlatform));
}

/// Returns the active [`Platform`].
pub fn system_platform() -> Arc<dyn Platform> {
    ACTIVE.read().unwrap().clone()
}

/// Replaces the active [`Platform`]. Intended for tests that need a
/// fixed interface topology.
pub fn set_platform(platform: Arc<dyn Platform>) {
    *ACTIVE.write().unwrap() = platform;
}

/// Returns every distinct address in `map`, loopbacks included.
pub fn all_addresses(map: &InterfaceMap) -> Vec<IpAddr> {
    let mut addresses: Vec<IpAddr> = Vec::new();
    for entries in map.values() {
        for entry in entries {
            if !addresses.contains(&entry.address) {
                addresses.push(entry.address);
            }
        }
    }
    addresses
}

/// Resolves an interface specifier to an OS interface name:
///
/// * an empty specifier selects the catch-all pseudo-interface `any`;
/// * an IPv4 literal selects the interface holding that address; and
/// * anything else must name an interface in `map` exactly.
pub fn resolve_specifier(specifier: &str, map: &InterfaceMap) -> Result<String, UnknownInterface> {
    if specifier.is_empty() {
        return Ok("any".to_owned());
    }
    if let Ok(wanted) = specifier.parse::<IpAddr>() {
        for (name, entries) in map {
            if entries.iter().any(|entry| entry.address == wanted) {
                return Ok(name.clone());
            }
        }
        return Err(UnknownInterface(specifier.to_owned()));
    }
    if map.contains_key(specifier) {
        Ok(specifier.to_owned())
    } else {
        Err(UnknownInterface(specifier.to_owned()))
    }
}

/// An error indicating that an interface specifier did not resolve.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct UnknownInterface(pub String);

impl std::fmt::Display for UnknownInterface {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "unknown network interface: {}", self.0)
    }
}

impl std::error::Error for UnknownInterface {}

#[cfg(test)]
pub mod fixtures {
    use super::*;

    /// A [`Platform`] with a fixed topology, for tests.
    pub struct FixturePlatform(pub InterfaceMap);

    impl Platform for FixturePlatform {
        fn interfaces(&self) -> InterfaceMap {
            self.0.clone()
        }
    }

    /// A topology with a loopback and one LAN interface.
    pub fn two_interfaces() -> InterfaceMap {
        let mut map = InterfaceMap::new();
        map.insert(
            "lo".to_owned(),
            vec![IfAddress {
                address: "127.0.0.1".parse().unwrap(),
                internal: true,
            }],
        );
        map.insert(
            "eth0".to_owned(),
            vec![
                IfAddress {
                    address: "192.168.1.20".parse().unwrap(),
                    internal: false,
                },
                IfAddress {
                    address: "fe80::1".parse().unwrap(),
                    internal: false,
                },
            ],
        );
        map
    }
}
