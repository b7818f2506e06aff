use std::fmt;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Smallest code `generate` can produce.
pub const CODE_MIN: u16 = 1000;
/// Largest code `generate` can produce.
pub const CODE_MAX: u16 = 9999;

/// Room key typed in by the joining peer.
///
/// Generated codes are four decimal digits, but any non-empty string is a
/// usable room key. Nothing here rejects short or non-numeric codes.
#[derive(Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PairingCode(String);

impl PairingCode {
    pub fn new(code: impl Into<String>) -> Self {
        Self(code.into())
    }

    /// Draw a uniform code in `[CODE_MIN, CODE_MAX]`.
    pub fn generate<R: Rng + ?Sized>(rng: &mut R) -> Self {
        Self(rng.gen_range(CODE_MIN..=CODE_MAX).to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Whether this looks like a generated code (exactly four ASCII digits).
    pub fn is_well_formed(&self) -> bool {
        self.0.len() == 4 && self.0.bytes().all(|b| b.is_ascii_digit())
    }
}

impl fmt::Display for PairingCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PairingCode {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

impl From<String> for PairingCode {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl AsRef<str> for PairingCode {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
