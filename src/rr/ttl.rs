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

//! Provides the [`Ttl`] type for record times-to-live.

use std::fmt;
use std::time::Duration;

/// The time-to-live of a record, in whole seconds.
///
/// This is a thin wrapper around [`u32`], the on-the-wire size of the
/// field. Arithmetic saturates: a TTL never wraps below zero when
/// decremented by elapsed time.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Ttl(u32);

impl Ttl {
    /// A TTL of zero seconds, the "goodbye" TTL of [RFC 6762 § 10.1].
    ///
    /// [RFC 6762 § 10.1]: https://datatracker.ietf.org/doc/html/rfc6762#section-10.1
    pub const ZERO: Self = Self(0);

    /// Creates a TTL from whole seconds. Unlike the [`From`]
    /// implementation, this is usable in const context.
    pub const fn from_secs(secs: u32) -> Self {
        Self(secs)
    }

    /// Returns the TTL as a number of seconds.
    pub fn as_secs(self) -> u32 {
        self.0
    }

    /// Returns the TTL as a [`Duration`].
    pub fn as_duration(self) -> Duration {
        Duration::from_secs(self.0 as u64)
    }

    /// Subtracts `elapsed` whole seconds, saturating at zero.
    pub fn saturating_sub(self, elapsed: Duration) -> Self {
        Self(self.0.saturating_sub(elapsed.as_secs().min(u32::MAX as u64) as u32))
    }

    /// Returns the smaller of this TTL and `cap`.
    pub fn min(self, cap: Self) -> Self {
        Self(self.0.min(cap.0))
    }
}

impl From<u32> for Ttl {
    fn from(raw: u32) -> Self {
        Self(raw)
    }
}

impl From<Ttl> for u32 {
    fn from(ttl: Ttl) -> Self {
        ttl.0
    }
}

impl fmt::Display for Ttl {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
