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

//! Implementation of the [`Writer`] type to write on-the-wire DNS
//! messages.

use std::collections::HashMap;

use super::constants::*;
use super::Question;
use crate::name::Name;
use crate::rr::{Component, Record};

////////////////////////////////////////////////////////////////////////
// WRITER                                                             //
////////////////////////////////////////////////////////////////////////

/// Serializes a DNS message.
///
/// The `Writer` appends questions and resource records sequentially
/// (callers write the sections in order: questions, answers,
/// authorities, additionals) and patches the header counts when
/// [`Writer::finish`] is called.
///
/// Domain names are compressed with label pointers ([RFC 1035
/// § 4.1.4]): whenever a suffix of the name being written has already
/// been written, the *first* occurrence of that suffix is pointed at.
/// Matching is ASCII-case-insensitive, which is both permitted and
/// what keeps repeated service names from bloating mDNS packets.
///
/// Per [RFC 6762 § 18], the RD, RA, Z, AD, and CD header bits are
/// always written as zero.
///
/// [RFC 1035 § 4.1.4]: https://datatracker.ietf.org/doc/html/rfc1035#section-4.1.4
/// [RFC 6762 § 18]: https://datatracker.ietf.org/doc/html/rfc6762#section-18
pub struct Writer {
    octets: Vec<u8>,
    qdcount: u16,
    ancount: u16,
    nscount: u16,
    arcount: u16,
    /// Offsets of the first occurrence of each name suffix written so
    /// far, keyed by the lowercased uncompressed wire form.
    suffixes: HashMap<Vec<u8>, u16>,
}

impl Writer {
    /// Creates a `Writer` with a zeroed header.
    pub fn new() -> Self {
        Self {
            octets: vec![0; HEADER_SIZE],
            qdcount: 0,
            ancount: 0,
            nscount: 0,
            arcount: 0,
            suffixes: HashMap::new(),
        }
    }

    /// Sets the 16-bit ID of the message.
    pub fn set_id(&mut self, id: u16) {
        self.octets[ID_START..ID_END].copy_from_slice(&id.to_be_bytes());
    }

    /// Sets or clears the QR (query response) bit.
    pub fn set_qr(&mut self, qr: bool) {
        if qr {
            self.octets[QR_BYTE] |= QR_MASK;
        } else {
            self.octets[QR_BYTE] &= !QR_MASK;
        }
    }

    /// Sets or clears the AA (authoritative answer) bit.
    pub fn set_aa(&mut self, aa: bool) {
        if aa {
            self.octets[AA_BYTE] |= AA_MASK;
        } else {
            self.octets[AA_BYTE] &= !AA_MASK;
        }
    }

    /// Sets or clears the TC (truncation) bit.
    pub fn set_tc(&mut self, tc: bool) {
        if tc {
            self.octets[TC_BYTE] |= TC_MASK;
        } else {
            self.octets[TC_BYTE] &= !TC_MASK;
        }
    }

    /// Adds a question to the message.
    pub fn add_question(&mut self, question: &Question) {
        self.write_name(&question.qname, true);
        self.push_u16(question.qtype.into());
        self.push_u16(question.qclass.to_wire(question.unicast_response));
        self.qdcount += 1;
    }

    /// Adds a resource record to the answer section.
    pub fn add_answer(&mut self, record: &Record) {
        self.write_rr(record);
        self.ancount += 1;
    }

    /// Adds a resource record to the authority section.
    pub fn add_authority(&mut self, record: &Record) {
        self.write_rr(record);
        self.nscount += 1;
    }

    /// Adds a resource record to the additional section.
    pub fn add_additional(&mut self, record: &Record) {
        self.write_rr(record);
        self.arcount += 1;
    }

    /// Finishes the message, patching the header counts, and returns
    /// the octets.
    pub fn finish(mut self) -> Vec<u8> {
        self.octets[QDCOUNT_START..QDCOUNT_END].copy_from_slice(&self.qdcount.to_be_bytes());
        self.octets[ANCOUNT_START..ANCOUNT_END].copy_from_slice(&self.ancount.to_be_bytes());
        self.octets[NSCOUNT_START..NSCOUNT_END].copy_from_slice(&self.nscount.to_be_bytes());
        self.octets[ARCOUNT_START..ARCOUNT_END].copy_from_slice(&self.arcount.to_be_bytes());
        self.octets
    }

    /// Writes one resource record at the current end of the message.
    /// The RDLENGTH field is reserved before the RDATA is written and
    /// back-patched afterwards, since compression inside the RDATA
    /// changes its length.
    fn write_rr(&mut self, record: &Record) {
        self.write_name(&record.name, true);
        self.push_u16(record.rr_type.into());
        self.push_u16(record.class.to_wire(record.cache_flush));
        self.push_u32(record.ttl.into());

        let rdlength_start = self.octets.len();
        self.push_u16(0);
        let mut scratch = Vec::new();
        for component in record.rdata.components(&mut scratch) {
            match component {
                Component::CompressibleName(name) => self.write_name(name, true),
                Component::UncompressibleName(name) => self.write_name(name, false),
                Component::Other(octets) => self.octets.extend_from_slice(octets),
            }
        }
        let rdlength = (self.octets.len() - rdlength_start - 2) as u16;
        self.octets[rdlength_start..rdlength_start + 2]
            .copy_from_slice(&rdlength.to_be_bytes());
    }

    /// Writes a domain name at the current end of the message. With
    /// `compress`, the longest already-written suffix is replaced by a
    /// pointer to its first occurrence. Either way, the suffixes that
    /// were written out in full are recorded for later matches.
    fn write_name(&mut self, name: &Name, compress: bool) {
        let n_labels = name.len();
        let mut pointer = None;
        let mut literal_labels = n_labels;

        if compress {
            // The terminal root label is never worth a pointer, so the
            // scan covers proper suffixes starting at each label.
            for skip in 0..n_labels - 1 {
                let suffix = lowercased(&name.wire_repr()[name_label_offset(name, skip)..]);
                if let Some(&offset) = self.suffixes.get(&suffix) {
                    pointer = Some(offset);
                    literal_labels = skip;
                    break;
                }
            }
        }

        // Record the first occurrence of each suffix we are about to
        // write in full. Offsets beyond the 14-bit pointer range can
        // never be referenced and are not recorded.
        for skip in 0..literal_labels.min(n_labels - 1) {
            let offset = self.octets.len() + name_label_offset(name, skip);
            if offset < 0x4000 {
                let suffix = lowercased(&name.wire_repr()[name_label_offset(name, skip)..]);
                self.suffixes.entry(suffix).or_insert(offset as u16);
            }
        }

        match pointer {
            Some(offset) => {
                let prefix_len = name_label_offset(name, literal_labels);
                self.octets.extend_from_slice(&name.wire_repr()[..prefix_len]);
                self.push_u16(0xc000 | offset);
            }
            None => self.octets.extend_from_slice(name.wire_repr()),
        }
    }

    fn push_u16(&mut self, value: u16) {
        self.octets.extend_from_slice(&value.to_be_bytes());
    }

    fn push_u32(&mut self, value: u32) {
        self.octets.extend_from_slice(&value.to_be_bytes());
    }
}

impl Default for Writer {
    fn default() -> Self {
        Self::new()
    }
}

/// Returns the offset of label `n` within `name`'s wire form.
fn name_label_offset(name: &Name, n: usize) -> usize {
    let mut offset = 0;
    for skip in 0..n {
        offset += name.label(skip).len() + 1;
    }
    offset
}

/// Returns an ASCII-lowercased copy of `octets`.
fn lowercased(octets: &[u8]) -> Vec<u8> {
    octets.iter().map(u8::to_ascii_lowercase).collect()
}

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rr::{Rdata, Ttl, Type};

    #[test]
    fn identical_names_collapse_to_pointers() {
        let name: Name = "_http._tcp.local.".parse().unwrap();
        let mut writer = Writer::new();
        writer.add_question(&Question::new(name.clone(), Type::PTR));
        writer.add_answer(&Record::new(
            name.clone(),
            Type::PTR,
            Ttl::from(4500),
            Rdata::Ptr("web._http._tcp.local.".parse().unwrap()),
        ));
        let octets = writer.finish();

        // The answer's owner is a bare pointer to offset 12, and the
        // PTR target is "web" + a pointer to the same offset.
        let owner_at = HEADER_SIZE + 18 + 4;
        assert_eq!(&octets[owner_at..owner_at + 2], b"\xc0\x0c");
        let rdata_at = owner_at + 2 + 10;
        assert_eq!(&octets[rdata_at..rdata_at + 6], b"\x03web\xc0\x0c");
    }

    #[test]
    fn compression_matches_case_insensitively() {
        let mut writer = Writer::new();
        writer.add_question(&Question::new("host.LOCAL.".parse().unwrap(), Type::A));
        writer.add_question(&Question::new("other.local.".parse().unwrap(), Type::A));
        let octets = writer.finish();

        // The second question's "local" suffix points into the first.
        let second_at = HEADER_SIZE + 12 + 4;
        assert_eq!(&octets[second_at..second_at + 6], b"\x05other");
        assert_eq!(&octets[second_at + 6..second_at + 8], b"\xc0\x11");
    }

    #[test]
    fn first_occurrence_wins() {
        let mut writer = Writer::new();
        writer.add_question(&Question::new("a.local.".parse().unwrap(), Type::A));
        writer.add_question(&Question::new("b.local.".parse().unwrap(), Type::A));
        writer.add_question(&Question::new("c.local.".parse().unwrap(), Type::A));
        let octets = writer.finish();

        // Both later questions point at "local" inside the first, at
        // offset 12 + 2 = 14.
        let second_at = HEADER_SIZE + 10 + 4;
        assert_eq!(&octets[second_at..second_at + 4], b"\x01b\xc0\x0e");
        let third_at = second_at + 4 + 4;
        assert_eq!(&octets[third_at..third_at + 4], b"\x01c\xc0\x0e");
    }

    #[test]
    fn rdlength_is_backpatched_around_compression() {
        let mut writer = Writer::new();
        writer.add_answer(&Record::new(
            "web._http._tcp.local.".parse().unwrap(),
            Type::SRV,
            Ttl::from(120),
            Rdata::Srv {
                priority: 0,
                weight: 0,
                port: 8080,
                target: "web._http._tcp.local.".parse().unwrap(),
            },
        ));
        let octets = writer.finish();

        // Owner written in full (22 octets from offset 12), then
        // type/class/ttl (8), then RDLENGTH. The SRV target compresses
        // to a single pointer, so RDLENGTH is 6 + 2 = 8.
        let rdlength_at = HEADER_SIZE + 22 + 8;
        assert_eq!(&octets[rdlength_at..rdlength_at + 2], &[0, 8]);
        assert_eq!(&octets[rdlength_at + 2 + 6..rdlength_at + 2 + 8], b"\xc0\x0c");
    }
}
