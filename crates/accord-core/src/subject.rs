//! Communication subjects.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A named topic two endpoints may want to talk about.
///
/// Equality is by name only.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommunicationSubject(String);

impl CommunicationSubject {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn name(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CommunicationSubject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CommunicationSubject {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}
