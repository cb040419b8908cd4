use std::borrow::Borrow;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::error::IdentityError;

/// Opaque name of a signaling endpoint.
///
/// Identities become topic levels, so the bus separator and wildcard
/// characters are rejected up front.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(Arc<str>);

impl PeerId {
    pub fn new(raw: impl AsRef<str>) -> Result<Self, IdentityError> {
        let raw = raw.as_ref();
        let reason = if raw.is_empty() {
            Some("empty")
        } else if raw.contains('/') {
            Some("contains '/'")
        } else if raw.contains('#') || raw.contains('+') {
            Some("contains a topic wildcard")
        } else if raw.chars().any(char::is_whitespace) {
            Some("contains whitespace")
        } else {
            None
        };
        match reason {
            Some(reason) => Err(IdentityError {
                raw: raw.to_string(),
                reason,
            }),
            None => Ok(Self(Arc::from(raw))),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for PeerId {
    type Err = IdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<&str> for PeerId {
    type Error = IdentityError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl Borrow<str> for PeerId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for PeerId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
