//! Client identifiers.
//!
//! A client picks its identifier once and keeps it across reconnects. The
//! value doubles as the stream id on the wire, so it has to be a multiple
//! of 4.

use std::fmt;
use std::str::FromStr;

use rand::Rng;
use serde::{Deserialize, Serialize};

pub use sigpost_config::limits::MAX_CLIENT_ID;

/// Errors from constructing a [`ClientId`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClientIdError {
    #[error("client id {0} is not a multiple of 4")]
    Misaligned(u64),

    #[error("client id {0} is out of range (must be below {MAX_CLIENT_ID})")]
    OutOfRange(u64),

    #[error("client id {0:?} is not an integer")]
    NotANumber(String),
}

/// A validated client identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u64", into = "u64")]
pub struct ClientId(u64);

impl ClientId {
    /// Validate a raw identifier.
    pub fn new(raw: u64) -> Result<Self, ClientIdError> {
        if raw >= MAX_CLIENT_ID {
            return Err(ClientIdError::OutOfRange(raw));
        }
        if raw % 4 != 0 {
            return Err(ClientIdError::Misaligned(raw));
        }
        Ok(Self(raw))
    }

    /// Draw a fresh identifier uniformly from the whole id space.
    pub fn generate() -> Self {
        let slot = rand::rng().random_range(0..MAX_CLIENT_ID / 4);
        Self(slot * 4)
    }

    /// The raw integer.
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl TryFrom<u64> for ClientId {
    type Error = ClientIdError;

    fn try_from(raw: u64) -> Result<Self, Self::Error> {
        Self::new(raw)
    }
}

impl From<ClientId> for u64 {
    fn from(id: ClientId) -> Self {
        id.0
    }
}

impl FromStr for ClientId {
    type Err = ClientIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s
            .trim()
            .parse::<u64>()
            .map_err(|_| ClientIdError::NotANumber(s.to_string()))?;
        Self::new(raw)
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
