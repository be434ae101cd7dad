//! Identity types for users and rooms.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Maximum identifier length in bytes.
pub const MAX_ID_LENGTH: usize = 256;

/// Identifier validation errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdError {
    /// The identifier is empty.
    #[error("{0} cannot be empty")]
    Empty(&'static str),

    /// The identifier exceeds [`MAX_ID_LENGTH`].
    #[error("{0} too long")]
    TooLong(&'static str),

    /// The identifier contains non-ASCII or control characters.
    #[error("{0} contains invalid characters")]
    InvalidCharacters(&'static str),
}

/// Validate an identifier.
///
/// `kind` names the identifier in the error ("user id", "room id").
///
/// # Errors
///
/// Returns an error if the identifier is empty, too long or not printable ASCII.
pub fn validate_id(kind: &'static str, value: &str) -> Result<(), IdError> {
    if value.is_empty() {
        return Err(IdError::Empty(kind));
    }
    if value.len() > MAX_ID_LENGTH {
        return Err(IdError::TooLong(kind));
    }
    if !value.chars().all(|c| c.is_ascii() && !c.is_ascii_control()) {
        return Err(IdError::InvalidCharacters(kind));
    }
    Ok(())
}

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident, $kind:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create an identifier without validation.
            #[must_use]
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Create a validated identifier.
            ///
            /// # Errors
            ///
            /// Returns an error if the identifier is not acceptable.
            pub fn parse(id: impl Into<String>) -> Result<Self, IdError> {
                let id = id.into();
                validate_id($kind, &id)?;
                Ok(Self(id))
            }

            /// Get the ID as a string slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }
    };
}

string_id!(
    /// Identity of a user whose client may hold long-poll requests.
    UserId,
    "user id"
);

string_id!(
    /// Identity of a room.
    RoomId,
    "room id"
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_validation() {
        assert!(validate_id("room id", "!abc:example.org").is_ok());
        assert_eq!(validate_id("room id", ""), Err(IdError::Empty("room id")));
        assert_eq!(
            validate_id("user id", "bad\nid"),
            Err(IdError::InvalidCharacters("user id"))
        );

        let long_id = "a".repeat(MAX_ID_LENGTH + 1);
        assert_eq!(validate_id("user id", &long_id), Err(IdError::TooLong("user id")));
    }

    #[test]
    fn test_parse_and_display() {
        let user = UserId::parse("@alice:example.org").unwrap();
        assert_eq!(user.to_string(), "@alice:example.org");
        assert!(RoomId::parse("").is_err());

        let room: RoomId = "!room:example.org".into();
        assert_eq!(room.as_str(), "!room:example.org");
    }

    #[test]
    fn test_serde_is_transparent() {
        let user = UserId::new("@bob:example.org");
        let json = serde_json::to_string(&user).unwrap();
        assert_eq!(json, "\"@bob:example.org\"");
    }
}
