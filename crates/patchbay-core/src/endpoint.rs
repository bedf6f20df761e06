//! Endpoint specifications.
//!
//! A dispatcher attaches transport endpoints given as `"<scheme>:<address>"`
//! strings, e.g. `unix:/run/calc.sock` or `tcp:127.0.0.1:8888`. The spec is
//! immutable once attached; [`EndpointSpec::to_string`] renders the original
//! form back, which is also what gets announced to the broker.

use core::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::EndpointParseError;

/// A parsed transport endpoint address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EndpointSpec {
    /// Unix domain socket at a filesystem path.
    Unix(PathBuf),
    /// TCP socket, address in `host:port` form.
    Tcp(String),
}

impl FromStr for EndpointSpec {
    type Err = EndpointParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (scheme, address) = s
            .split_once(':')
            .ok_or(EndpointParseError::MissingScheme)?;
        if address.is_empty() {
            return Err(EndpointParseError::EmptyAddress);
        }
        match scheme {
            "unix" => Ok(Self::Unix(PathBuf::from(address))),
            "tcp" => Ok(Self::Tcp(address.to_string())),
            other => Err(EndpointParseError::UnknownScheme(other.to_string())),
        }
    }
}

impl fmt::Display for EndpointSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unix(path) => write!(f, "unix:{}", path.display()),
            Self::Tcp(addr) => write!(f, "tcp:{addr}"),
        }
    }
}
