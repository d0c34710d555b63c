//! Who may chat with whom.
//!
//! Two users may only share a chat window when their categories differ, and
//! users of the restricted category may reply but never open a new window.

use crate::error::ProtocolError;

pub const DEFAULT_RESTRICTED_INITIATOR: &str = "exhibitor";

/// Canonical key for the unordered pair `{a, b}`: lower id first, joined by `&`.
pub fn participants_key(a: u64, b: u64) -> String {
    let (low, high) = if a <= b { (a, b) } else { (b, a) };
    format!("{low}&{high}")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatPolicy {
    restricted_initiator: Option<String>,
}

impl Default for ChatPolicy {
    fn default() -> Self {
        Self::new(Some(DEFAULT_RESTRICTED_INITIATOR.to_string()))
    }
}

impl ChatPolicy {
    pub fn new(restricted_initiator: Option<String>) -> Self {
        Self {
            restricted_initiator: restricted_initiator.filter(|c| !c.is_empty()),
        }
    }

    pub fn restricted_initiator(&self) -> Option<&str> {
        self.restricted_initiator.as_deref()
    }

    pub fn is_restricted(&self, category: &str) -> bool {
        self.restricted_initiator.as_deref() == Some(category)
    }

    pub fn check_pair(&self, from_category: &str, to_category: &str) -> Result<(), ProtocolError> {
        if from_category == to_category {
            return Err(ProtocolError::SameCategory {
                category: from_category.to_string(),
            });
        }
        Ok(())
    }

    /// Only consulted when no window exists yet for the pair.
    pub fn check_initiator(&self, from_category: &str) -> Result<(), ProtocolError> {
        if self.is_restricted(from_category) {
            return Err(ProtocolError::RestrictedInitiator {
                category: from_category.to_string(),
            });
        }
        Ok(())
    }
}
