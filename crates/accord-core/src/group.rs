//! Per-subject capability groups.

use crate::{CapabilityDescriptor, CapabilityKind, CommunicationSubject, VersionedFallbackSet};
use serde::{Deserialize, Serialize};

/// Commands and notifications one endpoint offers (or needs) for a subject.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubjectGroup {
    pub subject: CommunicationSubject,
    #[serde(default)]
    pub commands: Vec<VersionedFallbackSet>,
    #[serde(default)]
    pub notifications: Vec<VersionedFallbackSet>,
}

impl SubjectGroup {
    pub fn new(subject: impl Into<CommunicationSubject>) -> Self {
        Self {
            subject: subject.into(),
            commands: Vec::new(),
            notifications: Vec::new(),
        }
    }

    pub fn with_command(mut self, set: VersionedFallbackSet) -> Self {
        self.commands.push(set);
        self
    }

    pub fn with_notification(mut self, set: VersionedFallbackSet) -> Self {
        self.notifications.push(set);
        self
    }

    pub fn sets(&self, kind: CapabilityKind) -> &[VersionedFallbackSet] {
        match kind {
            CapabilityKind::Command => &self.commands,
            CapabilityKind::Notification => &self.notifications,
        }
    }

    /// Whether any fallback set of `kind` already names `descriptor`.
    pub fn mentions(&self, kind: CapabilityKind, descriptor: &CapabilityDescriptor) -> bool {
        self.sets(kind).iter().any(|set| set.contains(descriptor))
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty() && self.notifications.is_empty()
    }
}
