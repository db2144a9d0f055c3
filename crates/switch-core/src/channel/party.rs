//! Party identification carried by a channel

use serde::{Deserialize, Serialize};

/// Number and name of one party of a call
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartyId {
    pub number: Option<String>,
    pub name: Option<String>,
    /// Presentation restricted
    pub restricted: bool,
}

impl PartyId {
    pub fn new(number: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            number: Some(number.into()),
            name: Some(name.into()),
            restricted: false,
        }
    }

    pub fn number(number: impl Into<String>) -> Self {
        Self {
            number: Some(number.into()),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.number.is_none() && self.name.is_none()
    }
}

/// Redirection history of a call
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Redirecting {
    /// Party that redirected the call
    pub from: PartyId,
    /// Party the call was redirected to
    pub to: PartyId,
    pub count: u32,
    pub reason: Option<String>,
}
