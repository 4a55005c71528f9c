use core::{fmt::Display, str::FromStr};

use chrono::{DateTime, NaiveDateTime, Utc};
use compact_str::{CompactString, ToCompactString as _};
use serde::{Deserialize, Serialize};

pub mod blob;
pub mod framer;
pub mod message;
pub mod schema;
pub mod xml;

mod element;
mod error;
mod macros;
mod property;
mod state;
pub use element::*;
pub use error::*;
pub use property::*;
pub use state::*;

/// Identifies a vector property within a session.
///
/// Renders as `device.name`; a name of `*` addresses every vector of the device.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PropertyKey {
    pub device: CompactString,
    pub name: CompactString,
}

impl PropertyKey {
    pub const WILDCARD: &str = "*";

    pub fn new(device: impl AsRef<str>, name: impl AsRef<str>) -> Self {
        Self {
            device: device.as_ref().to_compact_string(),
            name: name.as_ref().to_compact_string(),
        }
    }

    pub fn wildcard(device: impl AsRef<str>) -> Self {
        Self::new(device, Self::WILDCARD)
    }

    pub fn is_wildcard(&self) -> bool {
        self.name == Self::WILDCARD
    }
}

impl Display for PropertyKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}.{}", self.device, self.name)
    }
}

impl FromStr for PropertyKey {
    type Err = &'static str;

    // device names may contain dots, vector names by convention do not
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.rsplit_once('.') {
            Some(("", _)) => Err("empty device in {device}.{name}"),
            Some((_, "")) => Err("empty name in {device}.{name}"),
            Some((device, name)) => Ok(Self::new(device, name)),
            None => Err("expected {device}.{name}"),
        }
    }
}

const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

/// Formats a timestamp the way the protocol carries it (UTC, no zone suffix)
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

pub fn parse_timestamp(s: &str) -> Result<DateTime<Utc>, ModelError> {
    let trimmed = s.trim().trim_end_matches('Z');

    NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%dT%H:%M:%S%.f")
        .map(|naive| naive.and_utc())
        .map_err(|_| ModelError::value("timestamp", s))
}
