//! Offline capability descriptions.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identity of a capability type without loading its implementation.
///
/// Two descriptors name the same contract when both the type name and the
/// defining module match.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CapabilityDescriptor {
    /// Fully-qualified contract name (e.g. `telemetry::ReadSensor`).
    pub type_name: String,
    /// Module that defines the contract (e.g. `telemetry-contracts`).
    pub module: String,
}

impl CapabilityDescriptor {
    pub fn new(type_name: impl Into<String>, module: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            module: module.into(),
        }
    }
}

impl fmt::Display for CapabilityDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}, {}", self.type_name, self.module)
    }
}

/// Whether a capability is a request/response command or a push notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityKind {
    Command,
    Notification,
}

impl fmt::Display for CapabilityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CapabilityKind::Command => f.write_str("command"),
            CapabilityKind::Notification => f.write_str("notification"),
        }
    }
}

/// A statically known capability contract.
///
/// Implemented by application marker types so stand-ins can be looked up by
/// type instead of by descriptor value.
pub trait Contract {
    const KIND: CapabilityKind;

    fn descriptor() -> CapabilityDescriptor;
}
