//! Canonical phone identifier.
//!
//! Grounded on `resources/numbers.py::PhoneNumber`: parse as an international
//! number first, retry assuming the default country prefix on failure.
//! Equality is on the normalized E.164 form.
//!
//! Unlike the source, the wildcard `"*"` routing token is *not* folded into
//! `PartialEq` for `PhoneId` itself (see [`RouteKey`]) — conflating identity
//! with pattern-match made every `PhoneId == "*"` comparison silently true,
//! which is surprising at every call site that didn't intend a wildcard.

use std::fmt;

use phonenumber::{Mode, PhoneNumber};
use serde::{Deserialize, Serialize};

use crate::error::{StoryError, StoryResult};

const DEFAULT_COUNTRY: phonenumber::country::Id = phonenumber::country::US;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PhoneId {
    e164: String,
}

impl PhoneId {
    /// Parse a raw string (digits, with or without a leading `+`). Tries the
    /// input as-is first; on failure retries with `+1` prepended, matching
    /// the source's `phonenumbers.parse(number)` / `phonenumbers.parse("+1"
    /// + number)` fallback.
    pub fn parse(raw: &str) -> StoryResult<Self> {
        let raw = raw.trim();
        if let Ok(n) = phonenumber::parse(Some(DEFAULT_COUNTRY), raw) {
            if n.is_valid() {
                return Ok(Self::from_parsed(&n));
            }
        }
        let with_prefix = format!("+1{raw}");
        if let Ok(n) = phonenumber::parse(Some(DEFAULT_COUNTRY), with_prefix.as_str()) {
            if n.is_valid() {
                return Ok(Self::from_parsed(&n));
            }
        }
        Err(StoryError::invalid_number(raw))
    }

    fn from_parsed(n: &PhoneNumber) -> Self {
        Self { e164: n.format().mode(Mode::E164).to_string() }
    }

    /// Construct directly from an already-normalized E.164 string, e.g. when
    /// deserializing from the KV store. Does not re-validate.
    pub fn from_e164(e164: impl Into<String>) -> Self {
        Self { e164: e164.into() }
    }

    pub fn e164(&self) -> &str {
        &self.e164
    }

    /// National format within the US/Canada, international elsewhere —
    /// matches the source's `PhoneNumber.friendly`.
    pub fn friendly(&self) -> String {
        match phonenumber::parse(None, self.e164.as_str()) {
            Ok(n) => {
                let mode = if n.country().id() == Some(DEFAULT_COUNTRY) {
                    Mode::National
                } else {
                    Mode::International
                };
                n.format().mode(mode).to_string()
            }
            Err(_) => self.e164.clone(),
        }
    }
}

impl PartialEq for PhoneId {
    fn eq(&self, other: &Self) -> bool {
        self.e164 == other.e164
    }
}
impl Eq for PhoneId {}

impl std::hash::Hash for PhoneId {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.e164.hash(state);
    }
}

impl fmt::Display for PhoneId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.friendly())
    }
}

/// Routing key distinguishing an exact number from the wildcard fallback.
/// Replaces the source's `PhoneNumber == "*"` overload with an explicit
/// variant rather than an overloaded equality check.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RouteKey {
    Exact(PhoneId),
    Any,
}

impl RouteKey {
    pub fn matches(&self, candidate: &PhoneId) -> bool {
        match self {
            RouteKey::Exact(p) => p == candidate,
            RouteKey::Any => true,
        }
    }

    pub fn parse(raw: &str) -> StoryResult<Self> {
        if raw == "*" {
            Ok(RouteKey::Any)
        } else {
            Ok(RouteKey::Exact(PhoneId::parse(raw)?))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_clean_e164() {
        let p = PhoneId::parse("+15105551234").unwrap();
        assert_eq!(p.e164(), "+15105551234");
    }

    #[test]
    fn parses_bare_ten_digit_as_us_number() {
        let p = PhoneId::parse("5105551234").unwrap();
        assert_eq!(p.e164(), "+15105551234");
    }

    #[test]
    fn equality_is_on_normalized_form_only() {
        let a = PhoneId::parse("5105551234").unwrap();
        let b = PhoneId::parse("+15105551234").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn route_key_any_matches_everything() {
        let p = PhoneId::parse("5105551234").unwrap();
        assert!(RouteKey::Any.matches(&p));
    }

    #[test]
    fn route_key_exact_only_matches_same_number() {
        let a = PhoneId::parse("5105551234").unwrap();
        let b = PhoneId::parse("5105559999").unwrap();
        assert!(!RouteKey::Exact(a.clone()).matches(&b));
        assert!(RouteKey::Exact(a.clone()).matches(&a));
    }

    #[test]
    fn rejects_garbage_input() {
        assert!(PhoneId::parse("not-a-number").is_err());
    }
}
