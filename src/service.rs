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

//! DNS-SD service naming: service types, instance names, and the
//! resolved [`Service`] bundle.

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use crate::name::Name;
use crate::rr::{TxtData, TxtValue};

/// The conventional mDNS top-level domain.
pub const LOCAL_DOMAIN: &str = "local.";

/// The service-type enumerator name of [RFC 6763 § 9],
/// `_services._dns-sd._udp.<domain>`.
pub const ENUMERATOR: &str = "_services._dns-sd._udp";

////////////////////////////////////////////////////////////////////////
// PROTOCOLS                                                          //
////////////////////////////////////////////////////////////////////////

/// The transport protocol label of a service type.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    /// Returns the DNS label, with its underscore.
    pub fn label(self) -> &'static str {
        match self {
            Self::Tcp => "_tcp",
            Self::Udp => "_udp",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Tcp => f.write_str("tcp"),
            Self::Udp => f.write_str("udp"),
        }
    }
}

////////////////////////////////////////////////////////////////////////
// SERVICE TYPES                                                      //
////////////////////////////////////////////////////////////////////////

/// A DNS-SD service type: `_<name>._<protocol>`, possibly narrowed by
/// a subtype (`_<sub>._sub._<name>._<protocol>`, [RFC 6763 § 7.1]).
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct ServiceType {
    pub name: String,
    pub protocol: Protocol,
    pub subtypes: Vec<String>,
}

impl ServiceType {
    /// Creates a service type, validating the service name.
    pub fn new(name: &str, protocol: Protocol) -> Result<Self, ValidationError> {
        validate_service_name(name)?;
        Ok(Self {
            name: name.to_owned(),
            protocol,
            subtypes: Vec::new(),
        })
    }

    /// Creates the service-type enumerator pseudo-type.
    pub fn enumerator() -> Self {
        Self {
            name: "services._dns-sd".to_owned(),
            protocol: Protocol::Udp,
            subtypes: Vec::new(),
        }
    }

    /// Returns whether this is the enumerator pseudo-type.
    pub fn is_enumerator(&self) -> bool {
        self.name == "services._dns-sd"
    }

    /// Returns the browsing name for the type in `domain`, e.g.
    /// `_http._tcp.local.` (or the subtype form when a subtype is
    /// set).
    pub fn to_name(&self, domain: &str) -> Name {
        let mut text = String::new();
        if let Some(subtype) = self.subtypes.first() {
            text.push('_');
            text.push_str(subtype);
            text.push_str("._sub.");
        }
        text.push('_');
        text.push_str(&self.name);
        text.push('.');
        text.push_str(self.protocol.label());
        text.push('.');
        text.push_str(domain);
        text.parse().expect("validated service type made an invalid name")
    }

    /// Returns the full instance name `<instance>.<type>.<domain>`.
    pub fn instance_name(&self, instance: &str, domain: &str) -> Name {
        let base = format!(
            "_{}.{}.{}",
            self.name,
            self.protocol.label(),
            domain
        );
        let base: Name = base.parse().expect("validated service type made an invalid name");
        base.prepend(instance.as_bytes())
            .expect("validated instance label made an invalid name")
    }
}

impl FromStr for ServiceType {
    type Err = ValidationError;

    /// Parses `_http._tcp`, `_http._tcp.local.`, or the subtype form
    /// `_printer._sub._http._tcp`. The enumerator name parses to the
    /// enumerator pseudo-type.
    fn from_str(text: &str) -> Result<Self, Self::Err> {
        let trimmed = text
            .strip_suffix('.')
            .unwrap_or(text)
            .strip_suffix(".local")
            .unwrap_or_else(|| text.strip_suffix('.').unwrap_or(text));
        if trimmed.eq_ignore_ascii_case(ENUMERATOR.strip_suffix(".local").unwrap_or(ENUMERATOR)) {
            return Ok(Self::enumerator());
        }

        let labels: Vec<&str> = trimmed.split('.').collect();
        let (subtypes, name, protocol_label) = match labels.as_slice() {
            [name, protocol] => (Vec::new(), *name, *protocol),
            [subtype, sub, name, protocol] if sub.eq_ignore_ascii_case("_sub") => {
                let subtype = subtype
                    .strip_prefix('_')
                    .ok_or(ValidationError::BadServiceType)?;
                (vec![subtype.to_owned()], *name, *protocol)
            }
            _ => return Err(ValidationError::BadServiceType),
        };
        let name = name.strip_prefix('_').ok_or(ValidationError::BadServiceType)?;
        let protocol = match protocol_label {
            _ if protocol_label.eq_ignore_ascii_case("_tcp") => Protocol::Tcp,
            _ if protocol_label.eq_ignore_ascii_case("_udp") => Protocol::Udp,
            _ => return Err(ValidationError::BadProtocol),
        };
        validate_service_name(name)?;
        let mut parsed = Self::new(name, protocol)?;
        parsed.subtypes = subtypes;
        Ok(parsed)
    }
}

impl fmt::Display for ServiceType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "_{}.{}", self.name, self.protocol.label())
    }
}

////////////////////////////////////////////////////////////////////////
// VALIDATION                                                         //
////////////////////////////////////////////////////////////////////////

/// An error reporting invalid user-supplied service data.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ValidationError {
    BadServiceType,
    BadProtocol,
    ServiceNameEmpty,
    ServiceNameTooLong,
    ServiceNameBadChar(char),
    ServiceNameBadHyphen,
    ServiceNameNeedsLetter,
    InstanceNameEmpty,
    InstanceNameTooLong,
    PortZero,
    TxtKeyEmpty,
    TxtKeyBadChar(char),
    TxtEntryTooLong(String),
    TxtTooLong,
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::BadServiceType => f.write_str("service type must look like _name._tcp"),
            Self::BadProtocol => f.write_str("service protocol must be _tcp or _udp"),
            Self::ServiceNameEmpty => f.write_str("service name is empty"),
            Self::ServiceNameTooLong => f.write_str("service name is longer than 15 characters"),
            Self::ServiceNameBadChar(c) => {
                write!(f, "service name contains forbidden character {c:?}")
            }
            Self::ServiceNameBadHyphen => {
                f.write_str("service name starts or ends with a hyphen")
            }
            Self::ServiceNameNeedsLetter => f.write_str("service name needs at least one letter"),
            Self::InstanceNameEmpty => f.write_str("instance name is empty"),
            Self::InstanceNameTooLong => f.write_str("instance name is longer than 63 octets"),
            Self::PortZero => f.write_str("port must be nonzero"),
            Self::TxtKeyEmpty => f.write_str("TXT key is empty"),
            Self::TxtKeyBadChar(c) => write!(f, "TXT key contains forbidden character {c:?}"),
            Self::TxtEntryTooLong(key) => {
                write!(f, "TXT entry {key:?} is longer than 255 octets")
            }
            Self::TxtTooLong => f.write_str("TXT data is longer than 1300 octets"),
        }
    }
}

impl std::error::Error for ValidationError {}

/// Validates a service name per [RFC 6763 § 7.2]: at most fifteen
/// characters of letters, digits, and interior hyphens, with at least
/// one letter. (The special enumerator name is handled elsewhere.)
///
/// [RFC 6763 § 7.2]: https://datatracker.ietf.org/doc/html/rfc6763#section-7.2
pub fn validate_service_name(name: &str) -> Result<(), ValidationError> {
    if name.is_empty() {
        return Err(ValidationError::ServiceNameEmpty);
    }
    if name == "services._dns-sd" {
        return Ok(());
    }
    if name.len() > 15 {
        return Err(ValidationError::ServiceNameTooLong);
    }
    if name.starts_with('-') || name.ends_with('-') {
        return Err(ValidationError::ServiceNameBadHyphen);
    }
    let mut has_letter = false;
    for c in name.chars() {
        match c {
            'a'..='z' | 'A'..='Z' => has_letter = true,
            '0'..='9' | '-' => {}
            other => return Err(ValidationError::ServiceNameBadChar(other)),
        }
    }
    if has_letter {
        Ok(())
    } else {
        Err(ValidationError::ServiceNameNeedsLetter)
    }
}

/// Validates a service instance label: nonempty and at most 63 octets
/// (a DNS label). Any UTF-8 is welcome (RFC 6763 § 4.1.1).
pub fn validate_instance_name(instance: &str) -> Result<(), ValidationError> {
    if instance.is_empty() {
        Err(ValidationError::InstanceNameEmpty)
    } else if instance.len() > 63 {
        Err(ValidationError::InstanceNameTooLong)
    } else {
        Ok(())
    }
}

/// Validates a port.
pub fn validate_port(port: u16) -> Result<(), ValidationError> {
    if port == 0 {
        Err(ValidationError::PortZero)
    } else {
        Ok(())
    }
}

/// Validates TXT data per [RFC 6763 § 6]: printable-ASCII keys
/// without `=`, entries of at most 255 octets, and a total size the
/// RFC considers sane (1300 octets).
///
/// [RFC 6763 § 6]: https://datatracker.ietf.org/doc/html/rfc6763#section-6
pub fn validate_txt(txt: &TxtData) -> Result<(), ValidationError> {
    for (key, value) in txt.entries() {
        if key.is_empty() {
            return Err(ValidationError::TxtKeyEmpty);
        }
        for c in key.chars() {
            if !(' '..='~').contains(&c) || c == '=' {
                return Err(ValidationError::TxtKeyBadChar(c));
            }
        }
        let value_len = match value {
            TxtValue::Flag => 0,
            TxtValue::Empty => 1,
            TxtValue::Octets(octets) => 1 + octets.len(),
        };
        if key.len() + value_len > 255 {
            return Err(ValidationError::TxtEntryTooLong(key.clone()));
        }
    }
    if txt.to_wire().len() > 1300 {
        return Err(ValidationError::TxtTooLong);
    }
    Ok(())
}

////////////////////////////////////////////////////////////////////////
// RESOLVED SERVICES                                                  //
////////////////////////////////////////////////////////////////////////

/// A resolved service instance: the aggregation of its PTR, SRV, TXT,
/// and address records.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Service {
    /// The full instance name, e.g. `Web Server._http._tcp.local.`.
    pub fullname: String,
    /// The instance label alone, e.g. `Web Server`.
    pub name: String,
    /// The service type, e.g. `_http._tcp`.
    pub service_type: Option<ServiceType>,
    /// The domain, conventionally `local.`.
    pub domain: String,
    /// The target host from the SRV record.
    pub host: Option<String>,
    /// The port from the SRV record.
    pub port: Option<u16>,
    /// The addresses of the target host.
    pub addresses: Vec<IpAddr>,
    /// The parsed TXT data.
    pub txt: Option<TxtData>,
    /// The raw TXT RDATA octets.
    pub txt_raw: Option<Vec<u8>>,
}

impl Service {
    /// Creates a name-only `Service`, the shape delivered by browsers
    /// that were asked not to resolve.
    pub fn name_only(fullname: &Name) -> Self {
        let name = String::from_utf8_lossy(fullname.label(0)).into_owned();
        let service_type = fullname
            .superdomain(1)
            .map(|t| t.to_string())
            .and_then(|t| t.parse().ok());
        Self {
            fullname: fullname.to_string(),
            name,
            service_type,
            domain: LOCAL_DOMAIN.to_owned(),
            ..Self::default()
        }
    }
}

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////
