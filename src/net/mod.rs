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

//! Platform-facing pieces: interface enumeration, multicast socket
//! construction, and the sleep-wake watcher.

pub mod platform;
pub mod socket;
pub mod wake;

pub use platform::{set_platform, system_platform, IfAddress, InterfaceMap, Platform};
pub use wake::SleepWatcher;
