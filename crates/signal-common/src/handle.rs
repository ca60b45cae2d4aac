//! Rendezvous handles.
//!
//! A handle begins with a lowercase letter, continues with lowercase letters
//! or digits optionally separated by single underscores, and is between 3 and
//! 32 characters long.

use regex::Regex;
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;
use thiserror::Error;

/// Minimum handle length in characters.
pub const MIN_LEN: usize = 3;
/// Maximum handle length in characters.
pub const MAX_LEN: usize = 32;

const HANDLE_PATTERN: &str = r"^[a-z](?:_?[a-z0-9]){2,31}$";

fn pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(HANDLE_PATTERN).expect("handle pattern is a valid regex"))
}

/// Reasons a string is not a valid handle.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandleError {
    /// Shorter than [`MIN_LEN`] or longer than [`MAX_LEN`].
    #[error("handle must be 3-32 characters long, got {0}")]
    Length(usize),
    /// Violates the character grammar.
    #[error("handle must be lowercase letters or digits separated by single underscores, starting with a letter")]
    Syntax,
}

/// A syntactically valid rendezvous handle.
///
/// # Examples
///
/// ```
/// use signal_common::Handle;
/// assert!("abc_12".parse::<Handle>().is_ok());
/// assert!("a__b".parse::<Handle>().is_err());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Handle(String);

impl Handle {
    /// Validates `s` and wraps it.
    ///
    /// # Errors
    ///
    /// Returns [`HandleError`] if `s` violates the length bounds or grammar.
    pub fn parse(s: &str) -> Result<Self, HandleError> {
        if !(MIN_LEN..=MAX_LEN).contains(&s.len()) {
            return Err(HandleError::Length(s.len()));
        }
        if !pattern().is_match(s) {
            return Err(HandleError::Syntax);
        }
        Ok(Self(s.to_owned()))
    }

    /// The handle as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for Handle {
    type Err = HandleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Handle {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
