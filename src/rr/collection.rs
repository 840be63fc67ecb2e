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

//! Implementation of the [`RecordCollection`] set type.

use std::collections::HashMap;

use super::Record;

////////////////////////////////////////////////////////////////////////
// RECORD COLLECTIONS                                                 //
////////////////////////////////////////////////////////////////////////

/// A set of records keyed by content.
///
/// At most one record per content key (see [`Record::hash_key`]) can be
/// present; adding an equal record replaces the stored one (picking up,
/// for example, a refreshed TTL). Iteration order is unspecified.
#[derive(Clone, Debug, Default)]
pub struct RecordCollection {
    records: HashMap<u64, Record>,
}

impl RecordCollection {
    /// Creates an empty collection.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of records in the collection.
    pub fn size(&self) -> usize {
        self.records.len()
    }

    /// Returns whether the collection is empty.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Adds a record, replacing any stored record with the same
    /// content.
    pub fn add(&mut self, record: Record) {
        self.records.insert(record.hash_key(), record);
    }

    /// Adds every record from an iterator.
    pub fn add_each<I: IntoIterator<Item = Record>>(&mut self, records: I) {
        for record in records {
            self.add(record);
        }
    }

    /// Returns the stored record with the same content as `record`.
    pub fn get(&self, record: &Record) -> Option<&Record> {
        self.records.get(&record.hash_key())
    }

    /// Returns whether a record with the same content is present.
    pub fn has(&self, record: &Record) -> bool {
        self.records.contains_key(&record.hash_key())
    }

    /// Returns whether every record of `records` is present.
    pub fn has_each<'a, I: IntoIterator<Item = &'a Record>>(&self, records: I) -> bool {
        records.into_iter().all(|record| self.has(record))
    }

    /// Returns whether any record of `records` is present.
    pub fn has_any<'a, I: IntoIterator<Item = &'a Record>>(&self, records: I) -> bool {
        records.into_iter().any(|record| self.has(record))
    }

    /// Removes the record with the same content as `record`, returning
    /// it if it was present.
    pub fn delete(&mut self, record: &Record) -> Option<Record> {
        self.records.remove(&record.hash_key())
    }

    /// Removes every record.
    pub fn clear(&mut self) {
        self.records.clear();
    }

    /// Returns an iterator over the records.
    pub fn iter(&self) -> impl Iterator<Item = &Record> {
        self.records.values()
    }

    /// Consumes the collection, returning its records.
    pub fn into_vec(self) -> Vec<Record> {
        self.records.into_values().collect()
    }

    /// Returns the records as a vector of clones.
    pub fn to_vec(&self) -> Vec<Record> {
        self.records.values().cloned().collect()
    }

    /// Returns the records for which `predicate` holds.
    pub fn filter<F: FnMut(&Record) -> bool>(&self, mut predicate: F) -> Vec<&Record> {
        self.records.values().filter(|r| predicate(r)).collect()
    }

    /// Returns whether both collections hold exactly the same record
    /// contents.
    pub fn equals(&self, other: &Self) -> bool {
        self.size() == other.size() && other.iter().all(|record| self.has(record))
    }

    /// Returns the records of `self` that are not in `other`.
    pub fn difference(&self, other: &Self) -> Vec<&Record> {
        self.filter(|record| !other.has(record))
    }

    /// Returns the records of `self` that are also in `other`.
    pub fn intersection(&self, other: &Self) -> Vec<&Record> {
        self.filter(|record| other.has(record))
    }

    /// Finds the records of `other` that conflict with this
    /// collection: records absent here for which we hold a *unique*
    /// record with the same name, type, and class but different RDATA.
    ///
    /// Records present in both collections are set aside before
    /// comparing. That matters when a peer legitimately publishes some
    /// of the very same records (say, additional addresses for a name
    /// both hosts share); the common records must not count as
    /// evidence against the rest.
    pub fn get_conflicts<'a>(&self, other: &'a Self) -> Vec<&'a Record> {
        let ours: Vec<&Record> = self.difference(other);
        other
            .iter()
            .filter(|candidate| !self.has(candidate))
            .filter(|candidate| {
                ours.iter().any(|held| {
                    held.is_unique()
                        && held.matches_name_of(candidate)
                        && held.rdata != candidate.rdata
                })
            })
            .collect()
    }

    /// Returns whether `candidate` conflicts with this collection:
    /// `candidate` is unique and some stored record shares its name,
    /// type, and class with different RDATA. A stored copy of the
    /// identical record never conflicts.
    pub fn has_conflict_with(&self, candidate: &Record) -> bool {
        candidate.is_unique()
            && !self.has(candidate)
            && self
                .records
                .values()
                .any(|held| held.matches_name_of(candidate) && held.rdata != candidate.rdata)
    }
}

impl FromIterator<Record> for RecordCollection {
    fn from_iter<I: IntoIterator<Item = Record>>(records: I) -> Self {
        let mut collection = Self::new();
        collection.add_each(records);
        collection
    }
}

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////
