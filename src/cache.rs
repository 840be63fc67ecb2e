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

//! A record collection whose entries age out on their TTLs.
//!
//! [`ExpiringRecordCollection`] backs both the per-interface answer
//! cache and the outbound-history collection used for duplicate
//! suppression. Rather than owning timers, the collection computes
//! deadlines and is *advanced*: the owning event loop asks for
//! [`next_deadline`](ExpiringRecordCollection::next_deadline), sleeps
//! until then, and calls
//! [`advance`](ExpiringRecordCollection::advance), collecting the
//! reissue and expiry events that have come due. All time enters
//! through [`Instant`] parameters, which keeps every TTL behavior
//! testable without waiting for wall-clock TTLs to elapse.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use rand::Rng;

use crate::message::Question;
use crate::rr::{Record, Ttl, Type};

/// The fractions of a record's TTL at which a cache user should
/// consider re-querying for it (RFC 6762 § 5.2).
const REISSUE_FRACTIONS: [f64; 4] = [0.80, 0.85, 0.90, 0.95];

/// Spread applied to each reissue mark and to expiry, to keep many
/// caches from converging on the same instant (RFC 6762 § 5.2 calls
/// for a two-percent spread).
const JITTER: f64 = 0.02;

/// How long a record marked by [`ExpiringRecordCollection::set_to_expire`]
/// lingers before deletion (RFC 6762 § 10.2's one-second grace).
const EXPIRE_DELAY: Duration = Duration::from_secs(1);

////////////////////////////////////////////////////////////////////////
// EVENTS                                                             //
////////////////////////////////////////////////////////////////////////

/// An event produced by [`ExpiringRecordCollection::advance`].
#[derive(Clone, Debug)]
pub enum CacheEvent {
    /// A record has reached a reissue mark (80/85/90/95% of its TTL);
    /// whoever depends on it should consider asking for it again.
    Reissue(Record),

    /// A record's TTL ran out (or its goodbye grace period ended); it
    /// has been removed from the collection.
    Expired(Record),
}

////////////////////////////////////////////////////////////////////////
// ENTRIES                                                            //
////////////////////////////////////////////////////////////////////////

#[derive(Clone, Debug)]
struct Entry {
    record: Record,
    added: Instant,
    /// Pending reissue marks, earliest first.
    reissues: Vec<Instant>,
    expires: Instant,
    /// Set once the entry is condemned by `set_to_expire`; `expires`
    /// then holds the deletion time.
    condemned: bool,
}

impl Entry {
    fn next_deadline(&self) -> Instant {
        match self.reissues.first() {
            Some(&reissue) => reissue.min(self.expires),
            None => self.expires,
        }
    }
}

////////////////////////////////////////////////////////////////////////
// EXPIRING RECORD COLLECTION                                         //
////////////////////////////////////////////////////////////////////////

/// A set of records, keyed by content, in which each record ages out
/// at the end of its TTL.
#[derive(Clone, Debug, Default)]
pub struct ExpiringRecordCollection {
    entries: HashMap<u64, Entry>,
}

impl ExpiringRecordCollection {
    /// Creates an empty collection.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of live records.
    pub fn size(&self) -> usize {
        self.entries.len()
    }

    /// Returns whether the collection is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Adds a record at time `now`, scheduling its reissue marks and
    /// expiry. Re-adding a record refreshes its timers (and lifts any
    /// pending condemnation). A record with TTL 0 is not stored;
    /// instead the stored copy, if any, is condemned, per
    /// [RFC 6762 § 10.2].
    ///
    /// [RFC 6762 § 10.2]: https://datatracker.ietf.org/doc/html/rfc6762#section-10.2
    pub fn add(&mut self, record: Record, now: Instant) {
        if record.ttl == Ttl::ZERO {
            self.set_to_expire(&record, now);
            return;
        }
        let ttl = record.ttl.as_duration();
        let mut rng = rand::rng();
        let reissues = REISSUE_FRACTIONS
            .iter()
            .map(|fraction| {
                let spread = rng.random_range(-JITTER..=JITTER);
                now + ttl.mul_f64(fraction + spread)
            })
            .collect();
        let expires = now + ttl.mul_f64(1.0 + rng.random_range(0.0..=JITTER));
        self.entries.insert(
            record.hash_key(),
            Entry {
                record,
                added: now,
                reissues,
                expires,
                condemned: false,
            },
        );
    }

    /// Adds every record from an iterator at time `now`.
    pub fn add_each<I: IntoIterator<Item = Record>>(&mut self, records: I, now: Instant) {
        for record in records {
            self.add(record, now);
        }
    }

    /// Returns whether a record with the same content is present.
    pub fn has(&self, record: &Record) -> bool {
        self.entries.contains_key(&record.hash_key())
    }

    /// Returns a clone of the stored record with its TTL decremented
    /// by the time elapsed since it was added.
    pub fn get(&self, record: &Record, now: Instant) -> Option<Record> {
        self.entries.get(&record.hash_key()).map(|entry| {
            entry
                .record
                .clone_with_ttl(entry.record.ttl.saturating_sub(now - entry.added))
        })
    }

    /// Returns whether the record was (most recently) added within the
    /// past `window`.
    pub fn has_added_within(&self, record: &Record, window: Duration, now: Instant) -> bool {
        self.entries
            .get(&record.hash_key())
            .map_or(false, |entry| now - entry.added <= window)
    }

    /// Removes the record with the same content, returning it if
    /// present.
    pub fn delete(&mut self, record: &Record) -> Option<Record> {
        self.entries.remove(&record.hash_key()).map(|e| e.record)
    }

    /// Removes every record.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Condemns the stored copy of `record`: its reissue marks are
    /// dropped and a single deletion is scheduled [`EXPIRE_DELAY`]
    /// from `now`. If a deletion is already scheduled, the earlier
    /// schedule stands. Absent records are ignored.
    pub fn set_to_expire(&mut self, record: &Record, now: Instant) {
        if let Some(entry) = self.entries.get_mut(&record.hash_key()) {
            if !entry.condemned {
                entry.condemned = true;
                entry.reissues.clear();
                entry.expires = now + EXPIRE_DELAY;
            }
        }
    }

    /// Condemns every record related to `unique` (same name, type, and
    /// class) other than `unique` itself, provided it has been in the
    /// collection for more than a second. This implements the
    /// cache-flush rule of [RFC 6762 § 10.2]: when a unique record
    /// arrives, stale data for the same name must go, but records
    /// received in the last second survive (several hosts may be
    /// legitimately announcing together).
    ///
    /// [RFC 6762 § 10.2]: https://datatracker.ietf.org/doc/html/rfc6762#section-10.2
    pub fn flush_related(&mut self, unique: &Record, now: Instant) {
        if !unique.is_unique() {
            return;
        }
        let own_key = unique.hash_key();
        let condemnable: Vec<Record> = self
            .entries
            .values()
            .filter(|entry| {
                entry.record.matches_name_of(unique)
                    && entry.record.hash_key() != own_key
                    && now - entry.added > Duration::from_secs(1)
            })
            .map(|entry| entry.record.clone())
            .collect();
        for record in condemnable {
            self.set_to_expire(&record, now);
        }
    }

    /// Returns whether `candidate` conflicts with a stored record:
    /// `candidate` is unique and some stored record shares its name,
    /// type, and class with different RDATA.
    pub fn has_conflict_with(&self, candidate: &Record) -> bool {
        candidate.is_unique()
            && !self.has(candidate)
            && self.entries.values().any(|entry| {
                entry.record.matches_name_of(candidate) && entry.record.rdata != candidate.rdata
            })
    }

    /// Finds the stored records that answer `question`: the owner name
    /// and class match, and the record's type matches the question's
    /// (or the question asks for ANY). Clones with elapsed-adjusted
    /// TTLs are returned.
    pub fn find(&self, question: &Question, now: Instant) -> Vec<Record> {
        self.entries
            .values()
            .filter(|entry| {
                let record = &entry.record;
                record.class == question.qclass
                    && (question.qtype == Type::ANY || record.rr_type == question.qtype)
                    && record.name == question.qname
            })
            .map(|entry| {
                entry
                    .record
                    .clone_with_ttl(entry.record.ttl.saturating_sub(now - entry.added))
            })
            .collect()
    }

    /// Returns an iterator over the stored records.
    pub fn iter(&self) -> impl Iterator<Item = &Record> {
        self.entries.values().map(|entry| &entry.record)
    }

    /// Returns the earliest instant at which [`advance`] would have
    /// something to do, or `None` if the collection is empty.
    ///
    /// [`advance`]: ExpiringRecordCollection::advance
    pub fn next_deadline(&self) -> Option<Instant> {
        self.entries.values().map(Entry::next_deadline).min()
    }

    /// Fires every deadline at or before `now`, returning the events
    /// in firing order (reissue marks for a record precede its
    /// expiry). Expired records are removed.
    pub fn advance(&mut self, now: Instant) -> Vec<CacheEvent> {
        let mut events = Vec::new();
        let mut expired_keys = Vec::new();
        for (&key, entry) in self.entries.iter_mut() {
            while entry.reissues.first().map_or(false, |&mark| mark <= now) {
                entry.reissues.remove(0);
                events.push(CacheEvent::Reissue(entry.record.clone()));
            }
            if entry.expires <= now {
                expired_keys.push(key);
            }
        }
        for key in expired_keys {
            if let Some(entry) = self.entries.remove(&key) {
                events.push(CacheEvent::Expired(entry.record));
            }
        }
        events
    }
}

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////
