//! Stream tokens.
//!
//! A [`StreamToken`] marks how far a client has consumed every event source.
//! It carries one position per source name. The notifier only passes tokens
//! around; event sources are the only code that reads or advances them.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Token parse errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TokenError {
    /// A component is not of the form `name:position`.
    #[error("Malformed token component: {0}")]
    MalformedComponent(String),

    /// A position is not an unsigned integer.
    #[error("Invalid position in token component: {0}")]
    InvalidPosition(String),

    /// The same source appears twice.
    #[error("Duplicate source in token: {0}")]
    DuplicateSource(String),
}

/// A composite cursor over all event sources.
///
/// Zero positions are never stored, so two tokens are equal exactly when every
/// source is at the same position.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct StreamToken {
    positions: BTreeMap<String, u64>,
}

impl StreamToken {
    /// Create an empty token (every source at position zero).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the position recorded for a source. Absent sources are at zero.
    #[must_use]
    pub fn position(&self, source: &str) -> u64 {
        self.positions.get(source).copied().unwrap_or(0)
    }

    /// Return a copy of this token with `source` moved to `position`.
    ///
    /// A component never moves backwards.
    #[must_use]
    pub fn advance(&self, source: &str, position: u64) -> Self {
        let mut next = self.clone();
        if position > self.position(source) {
            next.positions.insert(source.to_string(), position);
        }
        next
    }

    /// Iterate over `(source, position)` pairs in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, u64)> {
        self.positions.iter().map(|(name, pos)| (name.as_str(), *pos))
    }
}

impl PartialOrd for StreamToken {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        let mut less = false;
        let mut greater = false;

        for name in self.positions.keys().chain(other.positions.keys()) {
            match self.position(name).cmp(&other.position(name)) {
                Ordering::Less => less = true,
                Ordering::Greater => greater = true,
                Ordering::Equal => {}
            }
        }

        match (less, greater) {
            (false, false) => Some(Ordering::Equal),
            (true, false) => Some(Ordering::Less),
            (false, true) => Some(Ordering::Greater),
            (true, true) => None,
        }
    }
}

impl fmt::Display for StreamToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (name, pos)) in self.positions.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{name}:{pos}")?;
        }
        Ok(())
    }
}

impl FromStr for StreamToken {
    type Err = TokenError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut positions = BTreeMap::new();

        for component in s.split(',').filter(|c| !c.is_empty()) {
            let (name, pos) = component
                .split_once(':')
                .filter(|(name, _)| !name.is_empty())
                .ok_or_else(|| TokenError::MalformedComponent(component.to_string()))?;

            let pos: u64 = pos
                .parse()
                .map_err(|_| TokenError::InvalidPosition(component.to_string()))?;

            if positions.insert(name.to_string(), pos).is_some() {
                return Err(TokenError::DuplicateSource(name.to_string()));
            }
        }
        positions.retain(|_, pos| *pos > 0);

        Ok(Self { positions })
    }
}

impl TryFrom<String> for StreamToken {
    type Error = TokenError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<StreamToken> for String {
    fn from(token: StreamToken) -> Self {
        token.to_string()
    }
}
