//! 128-bit identities for providers, sublayers and filters
//!
//! Fresh identities are random version-4 values: the 7th byte carries the
//! version nibble `0100` and the 9th byte the variant bits `10xx`. The
//! random draw comes from the operating system's CSPRNG; if the draw fails
//! the generator panics instead of handing out a predictable or zero key.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Opaque 128-bit key naming a provider, sublayer, filter, layer or field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identity(Uuid);

impl Identity {
    /// All-zero identity. Never produced by [`Identity::new`].
    pub const NIL: Identity = Identity(Uuid::nil());

    /// Generates a fresh random identity.
    ///
    /// There is no `Default`: a defaulted key would be random, not empty.
    /// Use [`Identity::NIL`] for the empty key.
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub const fn from_u128(value: u128) -> Self {
        Self(Uuid::from_u128(value))
    }

    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    /// Builds an identity from the engine's field-wise representation
    /// (`u32`, `u16`, `u16`, `[u8; 8]`).
    pub const fn from_fields(d1: u32, d2: u16, d3: u16, d4: [u8; 8]) -> Self {
        Self(Uuid::from_fields(d1, d2, d3, &d4))
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }

    pub fn as_fields(&self) -> (u32, u16, u16, &[u8; 8]) {
        self.0.as_fields()
    }

    pub fn is_nil(&self) -> bool {
        self.0.is_nil()
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl From<Uuid> for Identity {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0.hyphenated(), f)
    }
}

impl FromStr for Identity {
    type Err = crate::core::error::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| crate::core::error::Error::InvalidInput(format!("identity '{s}': {e}")))
    }
}
