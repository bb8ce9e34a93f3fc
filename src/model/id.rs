use std::fmt::{Display, Formatter};

use thiserror::Error;

/// Our election IDs are integers.
pub type ElectionId = u32;
/// Our election location IDs are integers.
pub type LocationId = u32;
/// Our user IDs are integers.
pub type UserId = u32;

/// Longest decimal string that can still fit a `u32`.
const MAX_DIGITS: usize = 10;

/// A strictly positive integer identifier parsed from untrusted input.
///
/// Only plain ASCII decimal digits are accepted: no sign, no whitespace, no
/// exponent. Anything else is rejected before it can reach a lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PositiveId(u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum IdError {
    #[error("identifier is empty")]
    Empty,
    #[error("identifier contains a non-digit character")]
    NotNumeric,
    #[error("identifier is out of range")]
    OutOfRange,
    #[error("identifier must be positive")]
    Zero,
}

impl PositiveId {
    pub fn parse(raw: &str) -> Result<Self, IdError> {
        if raw.is_empty() {
            return Err(IdError::Empty);
        }
        if !raw.bytes().all(|b| b.is_ascii_digit()) {
            return Err(IdError::NotNumeric);
        }
        if raw.len() > MAX_DIGITS {
            return Err(IdError::OutOfRange);
        }
        match raw.parse::<u32>() {
            Ok(0) => Err(IdError::Zero),
            Ok(id) => Ok(Self(id)),
            Err(_) => Err(IdError::OutOfRange),
        }
    }

    pub fn get(self) -> u32 {
        self.0
    }
}

impl Display for PositiveId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
