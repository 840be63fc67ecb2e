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

//! Construction of the UDP sockets used for Multicast DNS.
//!
//! Sharing port 5353 with an OS-resident responder requires the socket
//! options to be set before binding, which `std` cannot do; the
//! sockets are therefore built with `socket2` and then converted to
//! [`std::net::UdpSocket`] for I/O.

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};

use crate::message::MDNS_PORT;

/// The IPv4 multicast group of mDNS (RFC 6762 § 3).
pub const MDNS_GROUP_V4: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 251);

/// The IPv6 multicast group of mDNS (RFC 6762 § 3).
pub const MDNS_GROUP_V6: Ipv6Addr = Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 0xfb);

/// The read timeout used by socket reader threads so that they can
/// observe their stop flag.
pub const READER_POLL: Duration = Duration::from_millis(250);

/// Returns the IPv4 multicast destination `224.0.0.251:5353`.
pub fn multicast_destination_v4() -> SocketAddr {
    SocketAddr::V4(SocketAddrV4::new(MDNS_GROUP_V4, MDNS_PORT))
}

/// Creates the shared mDNS socket: `SO_REUSEADDR` (and, on Unix,
/// `SO_REUSEPORT`) so that an OS-resident responder can keep its own
/// binding, multicast loopback on, TTL 255 (RFC 6762 § 11), bound to
/// `0.0.0.0:5353`. If `outgoing` is given, it becomes the socket's
/// outgoing multicast interface.
///
/// Group membership is *not* joined here; the interface layer joins
/// the group once per local address.
pub fn bind_multicast_v4(outgoing: Option<Ipv4Addr>) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    socket.set_multicast_loop_v4(true)?;
    socket.set_multicast_ttl_v4(255)?;
    socket.set_ttl(255)?;
    if let Some(address) = outgoing {
        socket.set_multicast_if_v4(&address)?;
    }
    let bind_to = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, MDNS_PORT);
    socket.bind(&bind_to.into())?;
    let socket: UdpSocket = socket.into();
    socket.set_read_timeout(Some(READER_POLL))?;
    Ok(socket)
}

/// Joins the mDNS group on one local address. Per-address failures
/// are expected (interfaces without multicast, tunnels, and the like)
/// and are the caller's to log.
pub fn join_group_v4(socket: &UdpSocket, local: Ipv4Addr) -> io::Result<()> {
    socket.join_multicast_v4(&MDNS_GROUP_V4, &local)
}

/// Creates the ephemeral socket used by one-shot ("legacy") queries:
/// bound to an OS-assigned port, with TTL 255 so responders do not
/// discount the packets.
pub fn bind_ephemeral_v4() -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_ttl(255)?;
    socket.set_multicast_ttl_v4(255)?;
    let bind_to = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0);
    socket.bind(&bind_to.into())?;
    let socket: UdpSocket = socket.into();
    socket.set_read_timeout(Some(READER_POLL))?;
    Ok(socket)
}
