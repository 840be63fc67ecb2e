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

//! Palaver is a pure-userland implementation of Multicast DNS
//! ([RFC 6762]) and DNS-Based Service Discovery ([RFC 6763]).
//!
//! The crate provides three capabilities:
//!
//! * **Advertising.** [`sd::Advertisement`] publishes a service instance
//!   on the link so that peers can discover it, probing for name
//!   ownership and defending the records once claimed.
//! * **Browsing.** [`sd::Browser`] watches a service type continuously,
//!   reporting instances as they appear, change, and disappear, and
//!   (optionally) keeping each instance resolved to a host, port,
//!   addresses, and TXT data.
//! * **One-shot resolution.** The functions in [`sd::resolve`] perform
//!   single lookups of specific records on the multicast group. Their
//!   queries are sent from an ephemeral port ("legacy" queries, in the
//!   language of [RFC 6762 § 6.7]), so that any OS-resident responder on
//!   the same host will answer them too.
//!
//! Underneath the façade sits the protocol engine: the wire codec
//! ([`message`], [`name`], [`rr`]), the shared per-interface state
//! (cache, outbound history, and socket fan-out in [`net`] and
//! [`engine`]), and the cooperating state machines that implement
//! probing, responding, querying, and service resolution.
//!
//! Palaver coexists with a compliant responder (e.g. Avahi or Bonjour)
//! on the same host by sharing the multicast group with `SO_REUSEADDR`
//! and by marking its one-shot queries as legacy.
//!
//! [RFC 6762]: https://datatracker.ietf.org/doc/html/rfc6762
//! [RFC 6762 § 6.7]: https://datatracker.ietf.org/doc/html/rfc6762#section-6.7
//! [RFC 6763]: https://datatracker.ietf.org/doc/html/rfc6763

pub mod cache;
pub mod class;
pub mod engine;
pub mod message;
pub mod name;
pub mod net;
pub mod rr;
pub mod sd;
pub mod service;

mod util;
