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

//! Implementation of the [`Rdata`] type and DNS RDATA processing.

use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};

use super::{Type, TxtData};
use crate::name::Name;

////////////////////////////////////////////////////////////////////////
// RDATA TYPE                                                         //
////////////////////////////////////////////////////////////////////////

/// The RDATA of a resource record.
///
/// The record types that DNS-SD traffics in are parsed into typed
/// variants. Everything else is preserved as opaque octets and written
/// back byte-exact ([RFC 3597]), so that records we do not understand
/// still cache, compare, and forward correctly.
///
/// NSEC carries only the "restricted form" used by mDNS for negative
/// responses ([RFC 6762 § 6.1]): a next-domain name and an existence
/// bitmap whose window block 0 covers RR types 1 through 255.
///
/// [RFC 3597]: https://datatracker.ietf.org/doc/html/rfc3597
/// [RFC 6762 § 6.1]: https://datatracker.ietf.org/doc/html/rfc6762#section-6.1
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub enum Rdata {
    A(Ipv4Addr),
    Aaaa(Ipv6Addr),
    Ptr(Name),
    Srv {
        priority: u16,
        weight: u16,
        port: u16,
        target: Name,
    },
    Txt(TxtData),
    Nsec {
        next: Name,
        types: Vec<Type>,
    },
    Other(Box<[u8]>),
}

/// How one piece of RDATA should be written into a message.
///
/// Domain names embedded in RDATA may be eligible for compression; the
/// writer needs to know which pieces are names and which are plain
/// octets.
pub enum Component<'a> {
    /// A domain name that may be compressed.
    CompressibleName(&'a Name),

    /// A domain name that must be written in full.
    UncompressibleName(&'a Name),

    /// Octets to copy through unchanged.
    Other(&'a [u8]),
}

/// An error signaling that RDATA could not be read from a message.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum ReadRdataError {
    UnexpectedEom,
    InvalidName(crate::name::Error),
    InvalidLength,
}

impl From<crate::name::Error> for ReadRdataError {
    fn from(err: crate::name::Error) -> Self {
        Self::InvalidName(err)
    }
}

impl fmt::Display for ReadRdataError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Self::UnexpectedEom => f.write_str("unexpected end of message in RDATA"),
            Self::InvalidName(err) => write!(f, "invalid name in RDATA: {}", err),
            Self::InvalidLength => f.write_str("RDATA has invalid length for its type"),
        }
    }
}

impl std::error::Error for ReadRdataError {}

impl Rdata {
    /// Reads RDATA of type `rr_type` and length `rdlength` from a
    /// message, starting at `cursor`. Embedded domain names in PTR,
    /// SRV, and NSEC RDATA are decompressed against the whole message;
    /// unrecognized types are captured opaquely.
    pub fn read(
        rr_type: Type,
        message: &[u8],
        cursor: usize,
        rdlength: u16,
    ) -> Result<Self, ReadRdataError> {
        let rdlength = rdlength as usize;
        let end = cursor + rdlength;
        if end > message.len() {
            return Err(ReadRdataError::UnexpectedEom);
        }
        let octets = &message[cursor..end];
        match rr_type {
            Type::A => {
                let array: [u8; 4] = octets.try_into().or(Err(ReadRdataError::InvalidLength))?;
                Ok(Self::A(array.into()))
            }
            Type::AAAA => {
                let array: [u8; 16] = octets.try_into().or(Err(ReadRdataError::InvalidLength))?;
                Ok(Self::Aaaa(array.into()))
            }
            Type::PTR => {
                let (target, len) = Name::try_from_compressed(message, cursor)?;
                if len != rdlength {
                    Err(ReadRdataError::InvalidLength)
                } else {
                    Ok(Self::Ptr(target))
                }
            }
            Type::SRV => {
                if rdlength < 7 {
                    return Err(ReadRdataError::InvalidLength);
                }
                let priority = u16::from_be_bytes(octets[0..2].try_into().unwrap());
                let weight = u16::from_be_bytes(octets[2..4].try_into().unwrap());
                let port = u16::from_be_bytes(octets[4..6].try_into().unwrap());
                let (target, len) = Name::try_from_compressed(message, cursor + 6)?;
                if 6 + len != rdlength {
                    Err(ReadRdataError::InvalidLength)
                } else {
                    Ok(Self::Srv {
                        priority,
                        weight,
                        port,
                        target,
                    })
                }
            }
            Type::TXT => Ok(Self::Txt(TxtData::from_wire(octets))),
            Type::NSEC => {
                let (next, len) = Name::try_from_compressed(message, cursor)?;
                let types = parse_nsec_bitmap(&octets[len.min(rdlength)..])?;
                Ok(Self::Nsec { next, types })
            }
            _ => Ok(Self::Other(octets.into())),
        }
    }

    /// Returns the [`Component`]s to write for this RDATA. Plain-octet
    /// components borrow from `scratch`, which the caller provides as
    /// an empty buffer outliving the returned components.
    pub fn components<'a>(&'a self, scratch: &'a mut Vec<u8>) -> Vec<Component<'a>> {
        match self {
            Self::A(addr) => {
                scratch.extend_from_slice(&addr.octets());
                vec![Component::Other(&scratch[..])]
            }
            Self::Aaaa(addr) => {
                scratch.extend_from_slice(&addr.octets());
                vec![Component::Other(&scratch[..])]
            }
            Self::Ptr(target) => vec![Component::CompressibleName(target)],
            Self::Srv {
                priority,
                weight,
                port,
                target,
            } => {
                scratch.extend_from_slice(&priority.to_be_bytes());
                scratch.extend_from_slice(&weight.to_be_bytes());
                scratch.extend_from_slice(&port.to_be_bytes());
                // RFC 6762 § 18.14 permits compressing the SRV target
                // in mDNS messages.
                vec![
                    Component::Other(&scratch[..]),
                    Component::CompressibleName(target),
                ]
            }
            Self::Txt(data) => {
                *scratch = data.to_wire();
                vec![Component::Other(&scratch[..])]
            }
            Self::Nsec { next, types } => {
                write_nsec_bitmap(types, scratch);
                vec![
                    Component::UncompressibleName(next),
                    Component::Other(&scratch[..]),
                ]
            }
            Self::Other(octets) => vec![Component::Other(&octets[..])],
        }
    }

    /// Serializes the RDATA in canonical (uncompressed) form. This is
    /// the encoding used for content hashing and for the lexicographic
    /// comparison of simultaneous probes ([RFC 6762 § 8.2], "raw
    /// uncompressed rdata").
    ///
    /// [RFC 6762 § 8.2]: https://datatracker.ietf.org/doc/html/rfc6762#section-8.2
    pub fn canonical_octets(&self) -> Vec<u8> {
        let mut scratch = Vec::new();
        let mut octets = Vec::new();
        for component in self.components(&mut scratch) {
            match component {
                Component::CompressibleName(name) | Component::UncompressibleName(name) => {
                    octets.extend_from_slice(name.wire_repr())
                }
                Component::Other(other) => octets.extend_from_slice(other),
            }
        }
        octets
    }

    /// Returns the SRV fields, if this is SRV RDATA.
    pub fn as_srv(&self) -> Option<(u16, u16, u16, &Name)> {
        match self {
            Self::Srv {
                priority,
                weight,
                port,
                target,
            } => Some((*priority, *weight, *port, target)),
            _ => None,
        }
    }

    /// Returns the PTR target, if this is PTR RDATA.
    pub fn as_ptr(&self) -> Option<&Name> {
        match self {
            Self::Ptr(target) => Some(target),
            _ => None,
        }
    }

    /// Returns the TXT data, if this is TXT RDATA.
    pub fn as_txt(&self) -> Option<&TxtData> {
        match self {
            Self::Txt(data) => Some(data),
            _ => None,
        }
    }

    /// Returns the address, if this is A or AAAA RDATA.
    pub fn as_address(&self) -> Option<std::net::IpAddr> {
        match self {
            Self::A(addr) => Some((*addr).into()),
            Self::Aaaa(addr) => Some((*addr).into()),
            _ => None,
        }
    }
}

////////////////////////////////////////////////////////////////////////
// NSEC TYPE BITMAPS (RESTRICTED FORM)                                //
////////////////////////////////////////////////////////////////////////

/// Parses the type bitmap of a restricted-form NSEC record. Only
/// window block 0 is meaningful in mDNS; later blocks are ignored.
fn parse_nsec_bitmap(mut octets: &[u8]) -> Result<Vec<Type>, ReadRdataError> {
    let mut types = Vec::new();
    while octets.len() >= 2 {
        let window = octets[0];
        let len = octets[1] as usize;
        if len > 32 || octets.len() < 2 + len {
            return Err(ReadRdataError::InvalidLength);
        }
        if window == 0 {
            for (byte_index, &byte) in octets[2..2 + len].iter().enumerate() {
                for bit in 0..8 {
                    if byte & (0x80 >> bit) != 0 {
                        types.push(Type::from((byte_index * 8 + bit) as u16));
                    }
                }
            }
        }
        octets = &octets[2 + len..];
    }
    Ok(types)
}

/// Writes the window-0 type bitmap of a restricted-form NSEC record.
/// Types above 255 cannot be represented and are skipped.
fn write_nsec_bitmap(types: &[Type], out: &mut Vec<u8>) {
    let mut bitmap = [0u8; 32];
    let mut max_byte = 0;
    for &rr_type in types {
        let value = u16::from(rr_type);
        if value == 0 || value > 255 {
            continue;
        }
        let byte = (value / 8) as usize;
        bitmap[byte] |= 0x80 >> (value % 8);
        max_byte = max_byte.max(byte);
    }
    out.push(0);
    out.push((max_byte + 1) as u8);
    out.extend_from_slice(&bitmap[..=max_byte]);
}

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////
