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

//! Implementation of the [`Class`] type for DNS classes.

use std::fmt;
use std::str::FromStr;

use crate::util::Caseless;

/// Represents a class in the DNS.
///
/// A class is represented on the wire as an unsigned 16-bit integer,
/// but in Multicast DNS only the low 15 bits name the class. The top bit is
/// repurposed ([RFC 6762 § 10.2] and [§ 18.12]) as the cache-flush flag
/// on response records and the unicast-response (QU) flag on questions.
/// `Class` therefore holds only the low 15 bits; the flag travels
/// separately on [`Record`](crate::rr::Record) and
/// [`Question`](crate::message::Question). The only classes seen in
/// mDNS are [`IN`](Class::IN) and [`ANY`](Class::ANY).
///
/// [RFC 6762 § 10.2]: https://datatracker.ietf.org/doc/html/rfc6762#section-10.2
/// [§ 18.12]: https://datatracker.ietf.org/doc/html/rfc6762#section-18.12
#[derive(Clone, Copy, Eq, Hash, PartialEq, PartialOrd, Ord)]
pub struct Class(u16);

impl Class {
    pub const IN: Self = Self(1);
    pub const ANY: Self = Self(255);

    /// The top bit of the on-the-wire class field: cache-flush on
    /// records, QU on questions.
    pub const FLAG_MASK: u16 = 0x8000;

    /// Splits an on-the-wire class field into the flag bit and the
    /// 15-bit class.
    pub fn from_wire(value: u16) -> (Self, bool) {
        (Self(value & !Self::FLAG_MASK), value & Self::FLAG_MASK != 0)
    }

    /// Assembles the on-the-wire class field from this class and the
    /// flag bit.
    pub fn to_wire(self, flag: bool) -> u16 {
        if flag {
            self.0 | Self::FLAG_MASK
        } else {
            self.0
        }
    }
}

impl From<u16> for Class {
    fn from(value: u16) -> Self {
        Class(value & !Self::FLAG_MASK)
    }
}

impl From<Class> for u16 {
    fn from(class: Class) -> Self {
        class.0
    }
}

impl FromStr for Class {
    type Err = &'static str;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        match Caseless(text) {
            Caseless("IN") => Ok(Self::IN),
            Caseless("ANY") => Ok(Self::ANY),
            _ => {
                if text
                    .get(0..5)
                    .map_or(false, |prefix| prefix.eq_ignore_ascii_case("CLASS"))
                {
                    text[5..]
                        .parse::<u16>()
                        .map(Self::from)
                        .or(Err("class value is not a valid unsigned 16-bit integer"))
                } else {
                    Err("unknown class")
                }
            }
        }
    }
}

impl fmt::Debug for Class {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", *self)
    }
}

impl fmt::Display for Class {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Self::IN => write!(f, "IN"),
            Self::ANY => write!(f, "ANY"),
            Self(value) => write!(f, "CLASS{}", value), // RFC 3597 § 5
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Class;

    #[test]
    fn from_wire_splits_the_flag_bit() {
        assert_eq!(Class::from_wire(0x8001), (Class::IN, true));
        assert_eq!(Class::from_wire(0x0001), (Class::IN, false));
        assert_eq!(Class::IN.to_wire(true), 0x8001);
        assert_eq!(Class::ANY.to_wire(false), 0x00ff);
    }

    #[test]
    fn displays_according_to_rfc3597() {
        // CLASS255 is ANY; CLASS4660 is unassigned.
        let class = Class::from(0x1234);
        assert_eq!(class.to_string(), "CLASS4660");
    }

    #[test]
    fn parses_according_to_rfc3597() {
        let class_in: Class = "CLASS1".parse().unwrap();
        assert_eq!(class_in, Class::IN);
    }
}
