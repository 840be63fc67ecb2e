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

//! Command-line argument handling for `palaverd`.

use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
#[command(about = "Multicast DNS service discovery", version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Advertise a service instance until interrupted.
    Advertise(AdvertiseArgs),

    /// Browse a service type, printing instances as they come and go.
    Browse(BrowseArgs),

    /// Resolve one service instance and print it.
    Resolve(ResolveArgs),
}

#[derive(Args)]
pub struct AdvertiseArgs {
    /// The service type, e.g. _http._tcp
    pub service_type: String,

    /// The port the service listens on.
    pub port: u16,

    /// The instance name (defaults to the service name).
    #[arg(short, long)]
    pub name: Option<String>,

    /// TXT entries, as key=value (repeatable).
    #[arg(short, long = "txt")]
    pub txt: Vec<String>,

    /// The network interface to advertise on (name or IPv4 address).
    #[arg(short, long, default_value = "")]
    pub interface: String,
}

#[derive(Args)]
pub struct BrowseArgs {
    /// The service type to browse, e.g. _http._tcp, or the enumerator
    /// _services._dns-sd._udp to list types.
    pub service_type: String,

    /// Report instance names only; skip resolution.
    #[arg(long)]
    pub no_resolve: bool,

    /// The network interface to browse on (name or IPv4 address).
    #[arg(short, long, default_value = "")]
    pub interface: String,
}

#[derive(Args)]
pub struct ResolveArgs {
    /// The full instance name, e.g. "Web Server._http._tcp.local."
    pub fullname: String,

    /// How long to wait, in seconds.
    #[arg(short, long, default_value_t = 5)]
    pub timeout: u64,
}
