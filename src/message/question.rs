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

//! Implementation of the [`Question`] type.

use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};

use crate::class::Class;
use crate::name::Name;
use crate::rr::{Record, Type};

/// A question from the question section of a DNS message.
///
/// In Multicast DNS the top bit of the class field does not belong to
/// the class: it is the unicast-response (QU) flag of
/// [RFC 6762 § 5.4]. A QU question invites the responder to reply
/// directly to the querier instead of to the multicast group.
///
/// [RFC 6762 § 5.4]: https://datatracker.ietf.org/doc/html/rfc6762#section-5.4
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Question {
    pub qname: Name,
    pub qtype: Type,
    pub qclass: Class,
    pub unicast_response: bool,
}

impl Question {
    /// Creates an IN-class multicast (QM) question.
    pub fn new(qname: Name, qtype: Type) -> Self {
        Self {
            qname,
            qtype,
            qclass: Class::IN,
            unicast_response: false,
        }
    }

    /// Sets the QU flag, builder-style.
    pub fn unicast(mut self, unicast_response: bool) -> Self {
        self.unicast_response = unicast_response;
        self
    }

    /// Returns a 64-bit key over the lowercased name, type, and class.
    /// Two questions with the same key ask the same thing (the QU flag
    /// does not participate).
    pub fn name_key(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.qname.hash_lowercase(&mut hasher);
        u16::from(self.qtype).hash(&mut hasher);
        u16::from(self.qclass).hash(&mut hasher);
        hasher.finish()
    }

    /// Returns whether `record` answers this question: the names
    /// match, the classes match, and the record's type equals the
    /// question's (or the question asks for ANY).
    pub fn answered_by(&self, record: &Record) -> bool {
        self.qclass == record.class
            && (self.qtype == Type::ANY || self.qtype == record.rr_type)
            && self.qname == record.name
    }
}

impl fmt::Display for Question {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{} {} {}{}",
            self.qname,
            self.qclass,
            self.qtype,
            if self.unicast_response { " QU" } else { "" }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rr::{Rdata, Ttl};

    #[test]
    fn answered_by_honors_any() {
        let question = Question::new("host.local.".parse().unwrap(), Type::ANY);
        let record = Record::new(
            "HOST.local.".parse().unwrap(),
            Type::A,
            Ttl::from(120),
            Rdata::A("10.0.0.1".parse().unwrap()),
        );
        assert!(question.answered_by(&record));

        let specific = Question::new("host.local.".parse().unwrap(), Type::AAAA);
        assert!(!specific.answered_by(&record));
    }

    #[test]
    fn name_key_ignores_the_qu_flag() {
        let qm = Question::new("host.local.".parse().unwrap(), Type::A);
        let qu = qm.clone().unicast(true);
        assert_eq!(qm.name_key(), qu.name_key());
    }
}
