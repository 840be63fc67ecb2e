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

//! The DNS-SD façade: advertising, browsing, and one-shot lookups.

mod advertisement;
mod browser;
pub mod resolve;

pub use advertisement::{Advertisement, AdvertisementEvent};
pub use browser::{Browser, BrowserEvent};

use std::fmt;

use crate::engine::InterfaceError;
use crate::service::ValidationError;

/// Errors reported by the façade.
#[derive(Debug)]
pub enum SdError {
    /// User-supplied input failed validation.
    Validation(ValidationError),
    /// The underlying interface could not be found or bound.
    Interface(InterfaceError),
    /// The operation did not complete in the allotted time.
    Timeout,
    /// The record or service asked for was not found.
    NotFound,
}

impl fmt::Display for SdError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Validation(err) => err.fmt(f),
            Self::Interface(err) => err.fmt(f),
            Self::Timeout => f.write_str("the operation timed out"),
            Self::NotFound => f.write_str("nothing answered"),
        }
    }
}

impl std::error::Error for SdError {}

impl From<ValidationError> for SdError {
    fn from(err: ValidationError) -> Self {
        Self::Validation(err)
    }
}

impl From<InterfaceError> for SdError {
    fn from(err: InterfaceError) -> Self {
        Self::Interface(err)
    }
}
