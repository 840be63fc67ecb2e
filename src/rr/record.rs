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

//! Implementation of the [`Record`] type for DNS resource records.

use std::cmp::Ordering;
use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};

use super::{Rdata, Ttl, Type};
use crate::class::Class;
use crate::name::Name;

////////////////////////////////////////////////////////////////////////
// RECORD STRUCTURE                                                   //
////////////////////////////////////////////////////////////////////////

/// A DNS resource record.
///
/// Records are compared and collected by *content*: two records are
/// interchangeable exactly when their owner name (case-insensitively),
/// type, class, and RDATA match. The TTL, the cache-flush flag, and the
/// attached additionals never participate in identity; a goodbye
/// (TTL 0) copy of a record is still "the same record".
///
/// Two derived 64-bit keys serve the collections:
///
/// * [`Record::hash_key`] covers name + type + class + canonical
///   RDATA and identifies the record's full content.
/// * [`Record::name_key`] covers only name + type + class and groups
///   records that answer the same question.
///
/// The `additionals` list names records that should ride along when
/// this record is sent in a response (e.g. the SRV and TXT records
/// accompanying a DNS-SD PTR answer, per [RFC 6763 § 12]).
///
/// [RFC 6763 § 12]: https://datatracker.ietf.org/doc/html/rfc6763#section-12
#[derive(Clone)]
pub struct Record {
    pub name: Name,
    pub rr_type: Type,
    pub class: Class,
    pub cache_flush: bool,
    pub ttl: Ttl,
    pub rdata: Rdata,
    pub additionals: Vec<Record>,
}

impl Record {
    /// Creates an IN-class record. The cache-flush flag starts out set
    /// for unique record types, which is how the record would be
    /// announced.
    pub fn new(name: Name, rr_type: Type, ttl: Ttl, rdata: Rdata) -> Self {
        Self {
            name,
            rr_type,
            class: Class::IN,
            cache_flush: rr_type.is_unique(),
            ttl,
            rdata,
            additionals: Vec::new(),
        }
    }

    /// Attaches additional records, builder-style.
    pub fn with_additionals(mut self, additionals: Vec<Record>) -> Self {
        self.additionals = additionals;
        self
    }

    /// Returns whether records of this record's type are expected to
    /// be unique on the link.
    pub fn is_unique(&self) -> bool {
        self.rr_type.is_unique()
    }

    /// Returns the content key: a 64-bit hash of the lowercased owner
    /// name, type, class, and canonical RDATA.
    pub fn hash_key(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.name.hash_lowercase(&mut hasher);
        u16::from(self.rr_type).hash(&mut hasher);
        u16::from(self.class).hash(&mut hasher);
        self.rdata.canonical_octets().hash(&mut hasher);
        hasher.finish()
    }

    /// Returns the name key: a 64-bit hash of the lowercased owner
    /// name, type, and class.
    pub fn name_key(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.name.hash_lowercase(&mut hasher);
        u16::from(self.rr_type).hash(&mut hasher);
        u16::from(self.class).hash(&mut hasher);
        hasher.finish()
    }

    /// Returns whether this record answers the same (name, type,
    /// class) as `other`, i.e. whether their name keys collide.
    pub fn matches_name_of(&self, other: &Record) -> bool {
        self.rr_type == other.rr_type && self.class == other.class && self.name == other.name
    }

    /// Returns a clone with the given TTL.
    pub fn clone_with_ttl(&self, ttl: Ttl) -> Self {
        let mut clone = self.clone();
        clone.ttl = ttl;
        clone
    }

    /// Returns the goodbye form of the record: a clone with TTL 0.
    pub fn to_goodbye(&self) -> Self {
        self.clone_with_ttl(Ttl::ZERO)
    }

    /// Compares two records lexicographically in the order prescribed
    /// for probe tiebreaking by [RFC 6762 § 8.2]: class (excluding the
    /// cache-flush bit), then type, then raw uncompressed RDATA, byte
    /// by byte (a shorter RDATA that is a prefix of a longer one
    /// compares less).
    ///
    /// [RFC 6762 § 8.2]: https://datatracker.ietf.org/doc/html/rfc6762#section-8.2
    pub fn cmp_tiebreak(&self, other: &Record) -> Ordering {
        u16::from(self.class)
            .cmp(&u16::from(other.class))
            .then_with(|| u16::from(self.rr_type).cmp(&u16::from(other.rr_type)))
            .then_with(|| self.rdata.canonical_octets().cmp(&other.rdata.canonical_octets()))
    }
}

impl PartialEq for Record {
    fn eq(&self, other: &Self) -> bool {
        self.matches_name_of(other) && self.rdata == other.rdata
    }
}

impl Eq for Record {}

impl Hash for Record {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.hash_key());
    }
}

impl fmt::Debug for Record {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{} {} {}{} {} {:?}",
            self.name,
            self.ttl,
            self.class,
            if self.cache_flush { "+flush" } else { "" },
            self.rr_type,
            self.rdata,
        )
    }
}

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////
