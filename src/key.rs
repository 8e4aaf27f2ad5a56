//! Keys and tokens.
//!
//! A [`Key`] names the rendezvous point on the broker where one `subscribe`
//! and one `reply` meet. A [`Token`] is the credential sent along with a call.
//! Both are cheap to clone and immutable once built.

use std::fmt;
use std::sync::Arc;

use crate::{EsubError, Result};

/// Topic identifier pairing a subscriber with a replier.
///
/// Always non-empty. The broker treats it as opaque; the HTTP transport
/// percent-encodes it as a single path segment.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Key(Arc<str>);

impl Key {
    // ---

    /// Validate and wrap a key.
    ///
    /// # Errors
    ///
    /// Returns [`EsubError::InvalidKey`] if `key` is empty.
    pub fn new(key: impl Into<Arc<str>>) -> Result<Self> {
        // ---
        let key = key.into();
        if key.is_empty() {
            return Err(EsubError::InvalidKey("key must not be empty".into()));
        }
        Ok(Self(key))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Key({:?})", &*self.0)
    }
}

impl TryFrom<&str> for Key {
    type Error = EsubError;

    fn try_from(value: &str) -> Result<Self> {
        Key::new(value)
    }
}

impl TryFrom<String> for Key {
    type Error = EsubError;

    fn try_from(value: String) -> Result<Self> {
        Key::new(value)
    }
}

/// Authorization credential.
///
/// The secret is only reachable through [`Token::expose`]. `Debug` and
/// `Display` print a placeholder so a token can sit inside structs that get
/// logged.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Token(Arc<str>);

impl Token {
    pub fn new(token: impl Into<Arc<str>>) -> Self {
        Self(token.into())
    }

    /// The raw secret, for putting on the wire.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Token(***)")
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("***")
    }
}

impl From<&str> for Token {
    fn from(value: &str) -> Self {
        Token::new(value)
    }
}

impl From<String> for Token {
    fn from(value: String) -> Self {
        Token::new(value)
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn test_empty_key_rejected() {
        // ---
        assert!(matches!(Key::new(""), Err(EsubError::InvalidKey(_))));
        assert!(matches!(Key::try_from(String::new()), Err(EsubError::InvalidKey(_))));
    }

    #[test]
    fn test_key_keeps_its_text() {
        // ---
        let key = Key::new("orders/eu west").unwrap();
        assert_eq!(key.as_str(), "orders/eu west");
        assert_eq!(key.to_string(), "orders/eu west");
    }

    #[test]
    fn test_token_is_redacted() {
        // ---
        let token = Token::from("secret");
        assert_eq!(format!("{token:?}"), "Token(***)");
        assert_eq!(token.to_string(), "***");
        assert_eq!(token.expose(), "secret");

        let wrapped = Some(token);
        assert!(!format!("{wrapped:?}").contains("secret"));
    }
}
