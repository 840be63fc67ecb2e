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

//! DNS-SD TXT record data ([RFC 6763 § 6]).
//!
//! [RFC 6763 § 6]: https://datatracker.ietf.org/doc/html/rfc6763#section-6

use std::fmt;
use std::hash::{Hash, Hasher};

////////////////////////////////////////////////////////////////////////
// TXT VALUES                                                         //
////////////////////////////////////////////////////////////////////////

/// The value bound to a key in a DNS-SD TXT record.
///
/// [RFC 6763 § 6.4] distinguishes three shapes of entry: a bare key
/// ("attribute present, with no value", conventionally a boolean true),
/// a key with an empty value (`key=`), and a key with octets after the
/// `=`. The octets are frequently, but not necessarily, UTF-8 text.
///
/// [RFC 6763 § 6.4]: https://datatracker.ietf.org/doc/html/rfc6763#section-6.4
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub enum TxtValue {
    /// The key appears with no `=` at all.
    Flag,

    /// The key appears with an `=` and nothing after it.
    Empty,

    /// The key appears with an `=` followed by octets.
    Octets(Vec<u8>),
}

impl TxtValue {
    /// Returns the value octets, if any. [`Flag`](Self::Flag) yields
    /// `None`; [`Empty`](Self::Empty) yields an empty slice.
    pub fn octets(&self) -> Option<&[u8]> {
        match self {
            Self::Flag => None,
            Self::Empty => Some(&[]),
            Self::Octets(octets) => Some(octets),
        }
    }
}

impl From<&str> for TxtValue {
    fn from(text: &str) -> Self {
        if text.is_empty() {
            Self::Empty
        } else {
            Self::Octets(text.as_bytes().to_vec())
        }
    }
}

impl From<&[u8]> for TxtValue {
    fn from(octets: &[u8]) -> Self {
        if octets.is_empty() {
            Self::Empty
        } else {
            Self::Octets(octets.to_vec())
        }
    }
}

impl From<bool> for TxtValue {
    fn from(_: bool) -> Self {
        Self::Flag
    }
}

////////////////////////////////////////////////////////////////////////
// TXT DATA                                                           //
////////////////////////////////////////////////////////////////////////

/// The ordered key/value entries of a DNS-SD TXT record.
///
/// Entries keep their insertion order for the wire (clients are told to
/// put the most important entries first), but *hashing* is
/// order-insensitive and key-case-insensitive, so that two TXT records
/// that differ only in entry order or key case are interchangeable.
/// Keys are ASCII; [RFC 6763 § 6.4] makes them case-insensitive.
#[derive(Clone, Debug, Default)]
pub struct TxtData {
    entries: Vec<(String, TxtValue)>,
}

impl TxtData {
    /// Creates an empty `TxtData`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an entry. A re-added key replaces the earlier value in
    /// place, keeping its original position.
    pub fn insert(&mut self, key: &str, value: TxtValue) {
        match self
            .entries
            .iter_mut()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
        {
            Some(slot) => slot.1 = value,
            None => self.entries.push((key.to_owned(), value)),
        }
    }

    /// Looks up a key, case-insensitively.
    pub fn get(&self, key: &str) -> Option<&TxtValue> {
        self.entries
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v)
    }

    /// Returns the entries in insertion order.
    pub fn entries(&self) -> &[(String, TxtValue)] {
        &self.entries
    }

    /// Returns whether there are no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Serializes the entries into the RFC 1035 character-string form
    /// used on the wire: each entry is one length-prefixed string. An
    /// empty `TxtData` yields the single empty string that an empty
    /// DNS-SD TXT record must carry ([RFC 6763 § 6.1]).
    ///
    /// [RFC 6763 § 6.1]: https://datatracker.ietf.org/doc/html/rfc6763#section-6.1
    pub fn to_wire(&self) -> Vec<u8> {
        if self.entries.is_empty() {
            return vec![0];
        }
        let mut octets = Vec::new();
        for (key, value) in &self.entries {
            let len = key.len()
                + match value {
                    TxtValue::Flag => 0,
                    TxtValue::Empty => 1,
                    TxtValue::Octets(v) => 1 + v.len(),
                };
            octets.push(len.min(255) as u8);
            let mut entry = Vec::with_capacity(len);
            entry.extend_from_slice(key.as_bytes());
            match value {
                TxtValue::Flag => {}
                TxtValue::Empty => entry.push(b'='),
                TxtValue::Octets(v) => {
                    entry.push(b'=');
                    entry.extend_from_slice(v);
                }
            }
            entry.truncate(255);
            octets.extend_from_slice(&entry);
        }
        octets
    }

    /// Parses TXT data from its on-the-wire character-string form.
    /// Strings with no `=` become flags; strings starting with `=` or
    /// empty strings are skipped per [RFC 6763 § 6.4]; only the first
    /// occurrence of a key is kept.
    ///
    /// [RFC 6763 § 6.4]: https://datatracker.ietf.org/doc/html/rfc6763#section-6.4
    pub fn from_wire(mut octets: &[u8]) -> Self {
        let mut data = Self::new();
        while let Some((&len, rest)) = octets.split_first() {
            let len = (len as usize).min(rest.len());
            let (entry, rest) = rest.split_at(len);
            octets = rest;
            if entry.is_empty() || entry[0] == b'=' {
                continue;
            }
            let (key, value) = match entry.iter().position(|&o| o == b'=') {
                Some(eq) => (&entry[..eq], TxtValue::from(&entry[eq + 1..])),
                None => (entry, TxtValue::Flag),
            };
            let key = String::from_utf8_lossy(key).into_owned();
            if data.get(&key).is_none() {
                data.entries.push((key, value));
            }
        }
        data
    }
}

impl PartialEq for TxtData {
    fn eq(&self, other: &Self) -> bool {
        if self.entries.len() != other.entries.len() {
            return false;
        }
        self.entries.iter().all(|(key, value)| {
            other
                .get(key)
                .map_or(false, |other_value| value == other_value)
        })
    }
}

impl Eq for TxtData {}

impl Hash for TxtData {
    fn hash<H: Hasher>(&self, state: &mut H) {
        // Order-insensitive: hash entries in sorted-key order, with
        // keys lowercased, so that insertion order and key case do not
        // affect the result.
        let mut sorted: Vec<_> = self
            .entries
            .iter()
            .map(|(key, value)| (key.to_ascii_lowercase(), value))
            .collect();
        sorted.sort_by(|a, b| a.0.cmp(&b.0));
        for (key, value) in sorted {
            key.hash(state);
            value.hash(state);
        }
    }
}

impl fmt::Display for TxtData {
    // The textual convention of dns-sd(1): entries separated by
    // spaces, values rendered lossily as UTF-8.
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for (i, (key, value)) in self.entries.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            match value {
                TxtValue::Flag => write!(f, "{key}")?,
                TxtValue::Empty => write!(f, "{key}=")?,
                TxtValue::Octets(v) => write!(f, "{key}={}", String::from_utf8_lossy(v))?,
            }
        }
        Ok(())
    }
}

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::hash_map::DefaultHasher;

    fn hash_of(data: &TxtData) -> u64 {
        let mut hasher = DefaultHasher::new();
        data.hash(&mut hasher);
        hasher.finish()
    }

    #[test]
    fn wire_form_round_trips() {
        let mut data = TxtData::new();
        data.insert("txtvers", TxtValue::from("1"));
        data.insert("path", TxtValue::from("/printers/front"));
        data.insert("color", TxtValue::Flag);
        data.insert("note", TxtValue::Empty);

        let wire = data.to_wire();
        let parsed = TxtData::from_wire(&wire);
        assert_eq!(parsed, data);
        assert_eq!(parsed.to_wire(), wire);
    }

    #[test]
    fn empty_data_is_a_single_empty_string() {
        assert_eq!(TxtData::new().to_wire(), vec![0]);
        assert!(TxtData::from_wire(&[0]).is_empty());
    }

    #[test]
    fn hashing_ignores_entry_order_and_key_case() {
        let mut a = TxtData::new();
        a.insert("first", TxtValue::from("1"));
        a.insert("second", TxtValue::from("2"));
        let mut b = TxtData::new();
        b.insert("Second", TxtValue::from("2"));
        b.insert("FIRST", TxtValue::from("1"));
        assert_eq!(a, b);
        assert_eq!(hash_of(&a), hash_of(&b));
    }

    #[test]
    fn hashing_distinguishes_values() {
        let mut a = TxtData::new();
        a.insert("key", TxtValue::from("1"));
        let mut b = TxtData::new();
        b.insert("key", TxtValue::from("2"));
        assert_ne!(a, b);
        assert_ne!(hash_of(&a), hash_of(&b));
    }

    #[test]
    fn from_wire_skips_malformed_entries() {
        // "=value" and "" entries must be silently ignored; a repeated
        // key keeps its first value.
        let wire = b"\x06=value\x00\x05key=1\x05key=2";
        let data = TxtData::from_wire(wire);
        assert_eq!(data.entries().len(), 1);
        assert_eq!(data.get("key"), Some(&TxtValue::from("1")));
    }
}
