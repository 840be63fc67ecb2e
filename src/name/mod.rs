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

//! Implementation of data structures related to domain names.
//!
//! Multicast DNS names differ from classic DNS names in one important
//! way: [RFC 6762 § 16] makes them UTF-8. Service instance labels in
//! particular routinely contain spaces and punctuation (for example
//! `Living Room Printer._ipp._tcp.local.`), so [`Name`] accepts
//! arbitrary octets in labels and only treats ASCII letters specially
//! for case-insensitive comparison.
//!
//! [RFC 6762 § 16]: https://datatracker.ietf.org/doc/html/rfc6762#section-16

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

mod error;
mod wire;
pub use error::Error;

/// The maximum number of labels in a domain name.
const MAX_N_LABELS: usize = 128;

/// The maximum length of the uncompressed on-the-wire representation of
/// a domain name.
const MAX_WIRE_LEN: usize = 255;

/// The maximum length of a label in a domain name (not including the
/// octet that provides the length).
const MAX_LABEL_LEN: usize = 63;

////////////////////////////////////////////////////////////////////////
// NAME STRUCTURE                                                     //
////////////////////////////////////////////////////////////////////////

/// A validated domain name.
///
/// A `Name` owns the uncompressed on-the-wire representation of the
/// name ([RFC 1035 § 3.1]) together with the offset of each label in
/// that representation. It is always fully qualified: the final label
/// is the null label.
///
/// `Name`s can be constructed in several ways:
///
/// * through the [`FromStr`] implementation, which parses the dotted
///   textual form (`\.` and `\\` escapes are honored);
/// * from uncompressed on-the-wire data through
///   [`Name::try_from_uncompressed`]; and
/// * from compressed on-the-wire data through
///   [`Name::try_from_compressed`], which follows compression pointers
///   through an entire message buffer.
///
/// Equality, ordering, and hashing are ASCII-case-insensitive, since
/// that is how names compare on the wire.
///
/// [RFC 1035 § 3.1]: https://datatracker.ietf.org/doc/html/rfc1035#section-3.1
#[derive(Clone)]
pub struct Name {
    wire_repr: Box<[u8]>,
    label_offsets: Box<[u8]>,
}

impl Name {
    /// Constructs a `Name` from parts already validated by the parsing
    /// routines in [`wire`] or by [`FromStr`].
    fn from_parts(wire_repr: Box<[u8]>, label_offsets: Box<[u8]>) -> Self {
        Self {
            wire_repr,
            label_offsets,
        }
    }

    /// Returns a `Name` representing the DNS root, `.`.
    pub fn root() -> Self {
        Self {
            wire_repr: Box::new([0]),
            label_offsets: Box::new([0]),
        }
    }

    /// Returns the number of labels in this `Name`, including the null
    /// label.
    #[allow(clippy::len_without_is_empty)] // A domain name is never empty!
    pub fn len(&self) -> usize {
        self.label_offsets.len()
    }

    /// Returns whether the `Name` is the DNS root `.`.
    pub fn is_root(&self) -> bool {
        self.len() == 1
    }

    /// Returns the uncompressed on-the-wire representation of the
    /// `Name`.
    pub fn wire_repr(&self) -> &[u8] {
        &self.wire_repr
    }

    /// Returns the on-the-wire representation of the first `n` labels
    /// of the `Name`, e.g. for writing a partially compressed name.
    pub fn wire_repr_to(&self, n: usize) -> &[u8] {
        &self.wire_repr[..self.label_offsets[n] as usize]
    }

    /// Returns an iterator over the labels of this `Name`, not
    /// including the final null label.
    pub fn labels(&self) -> Labels {
        Labels {
            name: self,
            front: 0,
            back: self.len() - 1,
        }
    }

    /// Returns the octets of label `n`.
    pub fn label(&self, n: usize) -> &[u8] {
        let start = self.label_offsets[n] as usize;
        let len = self.wire_repr[start] as usize;
        &self.wire_repr[start + 1..start + 1 + len]
    }

    /// Returns whether this `Name` is equal to or a subdomain of
    /// `other`.
    pub fn eq_or_subdomain_of(&self, other: &Name) -> bool {
        self.len() >= other.len()
            && self
                .labels()
                .rev()
                .zip(other.labels().rev())
                .all(|(a, b)| a.eq_ignore_ascii_case(b))
    }

    /// Returns the superdomain obtained by skipping the first `skip`
    /// labels of the `Name`, or `None` if there aren't enough labels.
    pub fn superdomain(&self, skip: usize) -> Option<Name> {
        if skip < self.len() {
            let start = self.label_offsets[skip] as usize;
            let wire_repr: Box<[u8]> = self.wire_repr[start..].into();
            let label_offsets: Box<[u8]> = self.label_offsets[skip..]
                .iter()
                .map(|offset| offset - start as u8)
                .collect();
            Some(Self::from_parts(wire_repr, label_offsets))
        } else {
            None
        }
    }

    /// Constructs the subdomain obtained by prepending `label` to this
    /// `Name`. This fails if the label is empty or too long, or if the
    /// resulting name would be too long.
    pub fn prepend(&self, label: &[u8]) -> Result<Name, Error> {
        if label.is_empty() {
            return Err(Error::NullNonTerminal);
        } else if label.len() > MAX_LABEL_LEN {
            return Err(Error::LabelTooLong);
        } else if self.wire_repr.len() + label.len() + 1 > MAX_WIRE_LEN
            || self.len() >= MAX_N_LABELS
        {
            return Err(Error::NameTooLong);
        }
        let mut wire_repr = Vec::with_capacity(self.wire_repr.len() + label.len() + 1);
        wire_repr.push(label.len() as u8);
        wire_repr.extend_from_slice(label);
        wire_repr.extend_from_slice(&self.wire_repr);
        let mut label_offsets = Vec::with_capacity(self.len() + 1);
        label_offsets.push(0);
        let shift = (label.len() + 1) as u8;
        label_offsets.extend(self.label_offsets.iter().map(|offset| offset + shift));
        Ok(Self::from_parts(wire_repr.into(), label_offsets.into()))
    }

    /// Writes the ASCII-lowercased on-the-wire representation of the
    /// `Name` into the provided hasher. Two names that differ only in
    /// ASCII case feed identical octets.
    pub fn hash_lowercase<H: Hasher>(&self, state: &mut H) {
        for octet in self.wire_repr.iter() {
            state.write_u8(octet.to_ascii_lowercase());
        }
    }

    /// Tries to parse a compressed name present at index `start` of the
    /// provided buffer. Pointers are followed; indices given in
    /// pointers are treated as indices in `octets` (so generally one
    /// will pass an entire DNS message in `octets`). On success this
    /// returns the new `Name` and the number of contiguous octets read
    /// at `start` (i.e., how far to advance a message cursor).
    pub fn try_from_compressed(octets: &[u8], start: usize) -> Result<(Self, usize), Error> {
        wire::parse_compressed_name(octets, start)
    }

    /// Tries to parse an uncompressed name present at the start of the
    /// provided buffer. The name need not occupy the entire buffer;
    /// extra data is ignored. On success, the new `Name` is returned
    /// along with its length in octets.
    pub fn try_from_uncompressed(octets: &[u8]) -> Result<(Self, usize), Error> {
        wire::parse_uncompressed_name(octets, false)
    }

    /// Like [`Name::try_from_uncompressed`], but the name must occupy
    /// the entire buffer.
    pub fn try_from_uncompressed_all(octets: &[u8]) -> Result<Self, Error> {
        wire::parse_uncompressed_name(octets, true).map(|(name, _)| name)
    }
}

////////////////////////////////////////////////////////////////////////
// TRAIT IMPLEMENTATIONS                                              //
////////////////////////////////////////////////////////////////////////

impl PartialEq for Name {
    fn eq(&self, other: &Self) -> bool {
        self.wire_repr.eq_ignore_ascii_case(&other.wire_repr)
    }
}

impl Eq for Name {}

impl PartialOrd for Name {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Name {
    fn cmp(&self, other: &Self) -> Ordering {
        let this = self.wire_repr.iter().map(u8::to_ascii_lowercase);
        let that = other.wire_repr.iter().map(u8::to_ascii_lowercase);
        this.cmp(that)
    }
}

impl Hash for Name {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.hash_lowercase(state);
    }
}

impl FromStr for Name {
    type Err = Error;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        if text.is_empty() {
            return Err(Error::StrEmpty);
        } else if text == "." {
            return Ok(Self::root());
        }

        let mut wire_repr: Vec<u8> = Vec::with_capacity(text.len() + 2);
        let mut label_offsets: Vec<u8> = Vec::new();
        let mut label: Vec<u8> = Vec::new();
        let mut chars = text.bytes();
        let mut terminated = false;

        let mut flush = |label: &mut Vec<u8>| -> Result<(), Error> {
            if label.is_empty() {
                return Err(Error::EmptyLabel);
            } else if label.len() > MAX_LABEL_LEN {
                return Err(Error::LabelTooLong);
            }
            label_offsets.push(wire_repr.len() as u8);
            wire_repr.push(label.len() as u8);
            wire_repr.append(label);
            if wire_repr.len() + 1 > MAX_WIRE_LEN || label_offsets.len() + 1 > MAX_N_LABELS {
                Err(Error::NameTooLong)
            } else {
                Ok(())
            }
        };

        while let Some(octet) = chars.next() {
            match octet {
                b'.' => {
                    flush(&mut label)?;
                    if chars.len() == 0 {
                        terminated = true;
                    }
                }
                b'\\' => match chars.next() {
                    Some(escaped @ (b'.' | b'\\')) => label.push(escaped),
                    _ => return Err(Error::InvalidEscape),
                },
                _ => label.push(octet),
            }
        }
        if !terminated {
            // Accept names without the trailing dot by qualifying them.
            flush(&mut label)?;
        }
        label_offsets.push(wire_repr.len() as u8);
        wire_repr.push(0);
        Ok(Self::from_parts(wire_repr.into(), label_offsets.into()))
    }
}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.is_root() {
            return f.write_str(".");
        }
        for label in self.labels() {
            // Labels are generally UTF-8 (RFC 6762 § 16); anything that
            // isn't is rendered lossily.
            for c in String::from_utf8_lossy(label).chars() {
                match c {
                    '.' | '\\' => write!(f, "\\{c}")?,
                    _ => write!(f, "{c}")?,
                }
            }
            f.write_str(".")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Name {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{self}")
    }
}

////////////////////////////////////////////////////////////////////////
// LABEL ITERATOR                                                     //
////////////////////////////////////////////////////////////////////////

/// An iterator over the labels of a [`Name`], front to back, excluding
/// the terminal null label.
pub struct Labels<'a> {
    name: &'a Name,
    front: usize,
    back: usize,
}

impl<'a> Iterator for Labels<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<Self::Item> {
        if self.front < self.back {
            let label = self.name.label(self.front);
            self.front += 1;
            Some(label)
        } else {
            None
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.back - self.front;
        (remaining, Some(remaining))
    }
}

impl DoubleEndedIterator for Labels<'_> {
    fn next_back(&mut self) -> Option<Self::Item> {
        if self.front < self.back {
            self.back -= 1;
            Some(self.name.label(self.back))
        } else {
            None
        }
    }
}

impl ExactSizeIterator for Labels<'_> {}

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_str_parses_dotted_names() {
        let name: Name = "example.test.".parse().unwrap();
        assert_eq!(name.wire_repr(), b"\x07example\x04test\x00");
        assert_eq!(name.len(), 3);
    }

    #[test]
    fn from_str_qualifies_relative_names() {
        let relative: Name = "example.test".parse().unwrap();
        let qualified: Name = "example.test.".parse().unwrap();
        assert_eq!(relative, qualified);
    }

    #[test]
    fn from_str_honors_escapes() {
        let name: Name = r"Test #1\.rev._http._tcp.local.".parse().unwrap();
        assert_eq!(name.label(0), b"Test #1.rev");
        assert_eq!(name.len(), 5);
        assert_eq!(name.to_string(), r"Test #1\.rev._http._tcp.local.");
        assert_eq!(r"a\b".parse::<Name>(), Err(Error::InvalidEscape));
    }

    #[test]
    fn from_str_rejects_empty_labels() {
        assert_eq!("example..test.".parse::<Name>(), Err(Error::EmptyLabel));
        assert_eq!(".example.".parse::<Name>(), Err(Error::EmptyLabel));
    }

    #[test]
    fn from_str_accepts_utf8_and_spaces() {
        let name: Name = "Büro Printer._ipp._tcp.local.".parse().unwrap();
        assert_eq!(name.label(0), "Büro Printer".as_bytes());
        assert_eq!(name.to_string(), "Büro Printer._ipp._tcp.local.");
    }

    #[test]
    fn equality_ignores_ascii_case() {
        let lower: Name = "example.local.".parse().unwrap();
        let upper: Name = "EXAMPLE.LOCAL.".parse().unwrap();
        assert_eq!(lower, upper);

        let mut lower_hash = std::collections::hash_map::DefaultHasher::new();
        let mut upper_hash = std::collections::hash_map::DefaultHasher::new();
        lower.hash(&mut lower_hash);
        upper.hash(&mut upper_hash);
        assert_eq!(lower_hash.finish(), upper_hash.finish());
    }

    #[test]
    fn eq_or_subdomain_of_works() {
        let service: Name = "_http._tcp.local.".parse().unwrap();
        let instance: Name = "Web Server._http._tcp.local.".parse().unwrap();
        let other: Name = "_ipp._tcp.local.".parse().unwrap();
        assert!(instance.eq_or_subdomain_of(&service));
        assert!(service.eq_or_subdomain_of(&service));
        assert!(!service.eq_or_subdomain_of(&instance));
        assert!(!instance.eq_or_subdomain_of(&other));
    }

    #[test]
    fn superdomain_skips_labels() {
        let instance: Name = "Web Server._http._tcp.local.".parse().unwrap();
        let service = instance.superdomain(1).unwrap();
        assert_eq!(service, "_http._tcp.local.".parse().unwrap());
        assert_eq!(instance.superdomain(4).unwrap(), Name::root());
        assert!(instance.superdomain(5).is_none());
    }

    #[test]
    fn prepend_builds_subdomains() {
        let service: Name = "_http._tcp.local.".parse().unwrap();
        let instance = service.prepend(b"Web Server").unwrap();
        assert_eq!(instance, "Web Server._http._tcp.local.".parse().unwrap());
    }

    #[test]
    fn labels_iterate_both_ways() {
        let name: Name = "a.b.c.".parse().unwrap();
        let forward: Vec<_> = name.labels().collect();
        assert_eq!(forward, vec![b"a", b"b", b"c"]);
        let backward: Vec<_> = name.labels().rev().collect();
        assert_eq!(backward, vec![b"c", b"b", b"a"]);
    }

    #[test]
    fn root_is_root() {
        assert!(Name::root().is_root());
        assert_eq!(Name::root().to_string(), ".");
        assert_eq!(".".parse::<Name>().unwrap(), Name::root());
    }
}
