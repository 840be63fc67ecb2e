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

//! `palaverd`: advertise, browse, and resolve mDNS services from the
//! command line.

mod args;

use std::process;
use std::sync::mpsc::RecvTimeoutError;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use env_logger::Env;
use log::{error, info};
use signal_hook::consts::signal::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;

use palaver::rr::{TxtData, TxtValue};
use palaver::sd::{resolve, Advertisement, AdvertisementEvent, Browser, BrowserEvent};
use palaver::service::ServiceType;

use crate::args::{AdvertiseArgs, BrowseArgs, Cli, Command, ResolveArgs};

fn main() {
    env_logger::init_from_env(Env::new().default_filter_or("warn"));

    let cli = Cli::parse();
    let result = match cli.command {
        Command::Advertise(args) => advertise(args),
        Command::Browse(args) => browse(args),
        Command::Resolve(args) => resolve_one(args),
    };
    if let Err(err) = result {
        error!("Failed: {:#}.", err);
        process::exit(1);
    }
}

/// Installs SIGINT/SIGTERM handling, returning the signal iterator.
fn set_up_signals() -> Result<Signals> {
    Signals::new([SIGINT, SIGTERM]).context("failed to set up signal handling")
}

fn advertise(args: AdvertiseArgs) -> Result<()> {
    let service_type: ServiceType = args
        .service_type
        .parse()
        .context("invalid service type")?;
    let mut txt = TxtData::new();
    for entry in &args.txt {
        match entry.split_once('=') {
            Some((key, value)) => txt.insert(key, TxtValue::from(value)),
            None => txt.insert(entry, TxtValue::Flag),
        }
    }

    let mut builder = Advertisement::builder(service_type, args.port)
        .txt(txt)
        .interface(&args.interface);
    if let Some(name) = &args.name {
        builder = builder.instance_name(name);
    }
    let advertisement = builder.start().context("failed to start advertising")?;

    let mut signals = set_up_signals()?;
    info!("Advertising; press Ctrl-C to stop.");
    loop {
        // Poll both the event stream and the signals.
        match advertisement
            .events()
            .recv_timeout(Duration::from_millis(200))
        {
            Ok(AdvertisementEvent::Active) => {
                println!("active: {}", advertisement.instance_name());
            }
            Ok(AdvertisementEvent::InstanceRenamed(name)) => {
                println!("renamed: {}", name);
            }
            Ok(AdvertisementEvent::Error(message)) => {
                anyhow::bail!("advertisement failed: {message}");
            }
            Ok(AdvertisementEvent::Stopped) => break,
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
        if signals.pending().next().is_some() {
            info!("Interrupted; sending goodbyes.");
            advertisement.stop(false);
            break;
        }
    }
    Ok(())
}

fn browse(args: BrowseArgs) -> Result<()> {
    let service_type: ServiceType = args
        .service_type
        .parse()
        .context("invalid service type")?;
    let browser = Browser::builder(service_type)
        .resolve(!args.no_resolve)
        .interface(&args.interface)
        .start()
        .context("failed to start browsing")?;

    let mut signals = set_up_signals()?;
    info!("Browsing; press Ctrl-C to stop.");
    loop {
        match browser.events().recv_timeout(Duration::from_millis(200)) {
            Ok(BrowserEvent::ServiceUp(service)) => match service.port {
                Some(port) => println!(
                    "up: {} at {}:{} {:?}",
                    service.fullname,
                    service.host.as_deref().unwrap_or("?"),
                    port,
                    service.addresses,
                ),
                None => println!("up: {}", service.fullname),
            },
            Ok(BrowserEvent::ServiceChanged(service)) => {
                println!(
                    "changed: {} txt={}",
                    service.fullname,
                    service
                        .txt
                        .as_ref()
                        .map(ToString::to_string)
                        .unwrap_or_default()
                );
            }
            Ok(BrowserEvent::ServiceDown(service)) => {
                println!("down: {}", service.fullname);
            }
            Ok(BrowserEvent::Error(message)) => anyhow::bail!("browsing failed: {message}"),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
        if signals.pending().next().is_some() {
            browser.stop();
            break;
        }
    }
    Ok(())
}

fn resolve_one(args: ResolveArgs) -> Result<()> {
    let timeout = Duration::from_secs(args.timeout);
    let service = resolve::resolve_service(&args.fullname, timeout)
        .context("failed to resolve the service")?;
    println!("{}", service.fullname);
    println!(
        "  host: {}  port: {}",
        service.host.as_deref().unwrap_or("?"),
        service.port.map(|p| p.to_string()).unwrap_or_default(),
    );
    for address in &service.addresses {
        println!("  address: {}", address);
    }
    if let Some(txt) = &service.txt {
        if !txt.is_empty() {
            println!("  txt: {}", txt);
        }
    }
    Ok(())
}
