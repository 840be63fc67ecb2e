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

//! Implementation of the [`Reader`] type to read on-the-wire DNS
//! messages.

use std::fmt;

use super::constants::*;
use super::Question;
use crate::class::Class;
use crate::name::{self, Name};
use crate::rr::{Rdata, Record, Ttl};

////////////////////////////////////////////////////////////////////////
// READER                                                             //
////////////////////////////////////////////////////////////////////////

/// A "frame" around a buffer containing a DNS message that enables
/// reading the message data.
///
/// A `Reader` is constructed using its [`TryFrom`] implementation. Any
/// underlying buffer for a reader must contain at least a full DNS
/// message header of 12 octets; otherwise the construction will fail.
///
/// Since header information is in a fixed position, it can be read at
/// any time through the appropriate `Reader` methods. Questions and
/// resource records are read sequentially with
/// [`Reader::read_question`] and [`Reader::read_rr`], which advance a
/// cursor that starts at the first octet after the header.
///
/// Per [RFC 6762 § 18], the RD, RA, Z, AD, and CD header bits are
/// ignored on reading.
///
/// [RFC 6762 § 18]: https://datatracker.ietf.org/doc/html/rfc6762#section-18
#[derive(Eq, PartialEq)]
pub struct Reader<'a> {
    octets: &'a [u8],
    cursor: usize,
}

impl<'a> Reader<'a> {
    /// Returns the 16-bit ID of the message.
    pub fn id(&self) -> u16 {
        u16::from_be_bytes(self.octets[ID_START..ID_END].try_into().unwrap())
    }

    /// Returns whether the QR (query response) bit is set.
    pub fn qr(&self) -> bool {
        (self.octets[QR_BYTE] & QR_MASK) != 0
    }

    /// Returns the raw opcode of the message.
    pub fn opcode(&self) -> u8 {
        (self.octets[OPCODE_BYTE] & OPCODE_MASK) >> OPCODE_SHIFT
    }

    /// Returns whether the AA (authoritative answer) bit is set.
    pub fn aa(&self) -> bool {
        (self.octets[AA_BYTE] & AA_MASK) != 0
    }

    /// Returns whether the TC (truncation) bit is set.
    pub fn tc(&self) -> bool {
        (self.octets[TC_BYTE] & TC_MASK) != 0
    }

    /// Returns the raw RCODE of the message.
    pub fn rcode(&self) -> u8 {
        self.octets[RCODE_BYTE] & RCODE_MASK
    }

    /// Returns the number of questions in the message.
    pub fn qdcount(&self) -> u16 {
        u16::from_be_bytes(self.octets[QDCOUNT_START..QDCOUNT_END].try_into().unwrap())
    }

    /// Returns the number of answers in the message.
    pub fn ancount(&self) -> u16 {
        u16::from_be_bytes(self.octets[ANCOUNT_START..ANCOUNT_END].try_into().unwrap())
    }

    /// Returns the number of authority records in the message.
    pub fn nscount(&self) -> u16 {
        u16::from_be_bytes(self.octets[NSCOUNT_START..NSCOUNT_END].try_into().unwrap())
    }

    /// Returns the number of additional records in the message.
    pub fn arcount(&self) -> u16 {
        u16::from_be_bytes(self.octets[ARCOUNT_START..ARCOUNT_END].try_into().unwrap())
    }

    /// Reads a [`Question`] starting at the current cursor.
    pub fn read_question(&mut self) -> Result<Question> {
        let (qname, qname_len) =
            Name::try_from_compressed(self.octets, self.cursor).map_err(Error::InvalidName)?;
        let qname_end = self.cursor + qname_len;
        let qtype = read_u16(&self.octets[qname_end.min(self.octets.len())..])?.into();
        let (qclass, unicast_response) =
            Class::from_wire(read_u16(&self.octets[(qname_end + 2).min(self.octets.len())..])?);
        self.cursor = qname_end + 4;
        Ok(Question {
            qname,
            qtype,
            qclass,
            unicast_response,
        })
    }

    /// Reads a resource record at the current cursor. The record's
    /// RDATA is decompressed and parsed per its type; unknown types
    /// are captured opaquely.
    pub fn read_rr(&mut self) -> Result<Record> {
        let (name, name_len) =
            Name::try_from_compressed(self.octets, self.cursor).map_err(Error::InvalidName)?;
        let name_end = self.cursor + name_len;
        if name_end + 10 > self.octets.len() {
            return Err(Error::UnexpectedEomInField);
        }
        let rr_type = read_u16(&self.octets[name_end..])?.into();
        let (class, cache_flush) = Class::from_wire(read_u16(&self.octets[name_end + 2..])?);
        let ttl = Ttl::from(read_u32(&self.octets[name_end + 4..])?);
        let rdlength = read_u16(&self.octets[name_end + 8..])?;
        let rdata = Rdata::read(rr_type, self.octets, name_end + 10, rdlength)?;
        self.cursor = name_end + 10 + rdlength as usize;
        Ok(Record {
            name,
            rr_type,
            class,
            cache_flush,
            ttl,
            rdata,
            additionals: Vec::new(),
        })
    }

    /// Returns whether the `Reader`'s cursor has reached the end of
    /// the message.
    pub fn at_eom(&self) -> bool {
        self.cursor >= self.octets.len()
    }
}

impl<'a> TryFrom<&'a [u8]> for Reader<'a> {
    type Error = Error;

    fn try_from(octets: &'a [u8]) -> Result<Self> {
        if octets.len() >= HEADER_SIZE {
            Ok(Self {
                octets,
                cursor: HEADER_SIZE,
            })
        } else {
            Err(Error::HeaderTooShort)
        }
    }
}

impl fmt::Debug for Reader<'_> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Reader")
            .field("id", &self.id())
            .field("qr", &self.qr())
            .field("opcode", &self.opcode())
            .field("aa", &self.aa())
            .field("tc", &self.tc())
            .field("rcode", &self.rcode())
            .field("qdcount", &self.qdcount())
            .field("ancount", &self.ancount())
            .field("nscount", &self.nscount())
            .field("arcount", &self.arcount())
            .field("cursor", &self.cursor)
            .finish()
    }
}

////////////////////////////////////////////////////////////////////////
// HELPERS FOR READING MULTI-BYTE INTEGERS                            //
////////////////////////////////////////////////////////////////////////

/// Reads a network-byte-order `u16` from the beginning of `octets`.
fn read_u16(octets: &[u8]) -> Result<u16> {
    let array = octets
        .get(0..2)
        .ok_or(Error::UnexpectedEomInField)?
        .try_into()
        .unwrap();
    Ok(u16::from_be_bytes(array))
}

/// Reads a network-byte-order `u32` from the beginning of `octets`.
fn read_u32(octets: &[u8]) -> Result<u32> {
    let array = octets
        .get(0..4)
        .ok_or(Error::UnexpectedEomInField)?
        .try_into()
        .unwrap();
    Ok(u32::from_be_bytes(array))
}

////////////////////////////////////////////////////////////////////////
// ERRORS                                                             //
////////////////////////////////////////////////////////////////////////

/// An error signaling that a [`Question`] or resource record could not
/// be read.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Error {
    HeaderTooShort,
    UnexpectedEomInField,
    InvalidName(name::Error),
    InvalidRdata(crate::rr::ReadRdataError),
}

impl From<crate::rr::ReadRdataError> for Error {
    fn from(err: crate::rr::ReadRdataError) -> Self {
        Self::InvalidRdata(err)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Self::HeaderTooShort => f.write_str("header too short"),
            Self::UnexpectedEomInField => f.write_str("unexpected end of message in field"),
            Self::InvalidName(err) => write!(f, "invalid name: {}", err),
            Self::InvalidRdata(err) => err.fmt(f),
        }
    }
}

impl std::error::Error for Error {}

/// The type returned by fallible [`Reader`] methods.
pub type Result<T> = std::result::Result<T, Error>;

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rr::Type;

    /// An mDNS response advertising a single PTR record for
    /// `_http._tcp.local.` pointing at `web._http._tcp.local.`,
    /// with the instance name compressed against the question name.
    const PTR_ANSWER_MESSAGE: &[u8] =
        b"\x00\x00\x84\x00\x00\x00\x00\x01\x00\x00\x00\x00\x05_http\x04_tcp\
          \x05local\x00\x00\x0c\x00\x01\x00\x00\x11\x94\x00\x06\x03web\xc0\x0c";

    #[test]
    fn reader_reads_an_mdns_response() {
        let mut reader = Reader::try_from(PTR_ANSWER_MESSAGE).unwrap();
        assert_eq!(reader.id(), 0);
        assert!(reader.qr());
        assert!(reader.aa());
        assert_eq!(reader.opcode(), 0);
        assert_eq!(reader.rcode(), 0);
        assert_eq!(reader.qdcount(), 0);
        assert_eq!(reader.ancount(), 1);

        let record = reader.read_rr().unwrap();
        assert_eq!(record.name, "_http._tcp.local.".parse().unwrap());
        assert_eq!(record.rr_type, Type::PTR);
        assert_eq!(record.class, Class::IN);
        assert!(!record.cache_flush);
        assert_eq!(record.ttl, Ttl::from(4500));
        assert_eq!(
            record.rdata.as_ptr().unwrap(),
            &"web._http._tcp.local.".parse().unwrap()
        );
        assert!(reader.at_eom());
    }

    #[test]
    fn reader_splits_the_cache_flush_bit() {
        // An A record with the cache-flush bit set (class 0x8001).
        let message = b"\x00\x00\x84\x00\x00\x00\x00\x01\x00\x00\x00\x00\
                        \x04host\x05local\x00\x00\x01\x80\x01\x00\x00\x00\x78\
                        \x00\x04\x0a\x00\x00\x01";
        let mut reader = Reader::try_from(&message[..]).unwrap();
        let record = reader.read_rr().unwrap();
        assert_eq!(record.class, Class::IN);
        assert!(record.cache_flush);
    }

    #[test]
    fn reader_constructor_rejects_short_message() {
        for size in 0..HEADER_SIZE {
            let buf = vec![0; size];
            assert_eq!(Reader::try_from(buf.as_slice()), Err(Error::HeaderTooShort));
        }
    }

    #[test]
    fn truncated_rr_is_rejected() {
        let message = b"\x00\x00\x84\x00\x00\x00\x00\x01\x00\x00\x00\x00\
                        \x04host\x05local\x00\x00\x01\x80";
        let mut reader = Reader::try_from(&message[..]).unwrap();
        assert_eq!(reader.read_rr(), Err(Error::UnexpectedEomInField));
    }
}
