//! Process-wide capability catalog.
//!
//! Holds, per subject, what the local endpoint provides and what it
//! requires from remote endpoints. Populated at start-up and read-only
//! once the node accepts connections.

use crate::matcher;
use crate::{
    CapabilityDescriptor, CapabilityKind, CommunicationSubject, FallbackSetError,
    SubjectGroup, VersionedCapability, VersionedFallbackSet,
};
use std::collections::BTreeMap;
use std::fmt;

/// Which half of the catalog a group belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Provided,
    Required,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Provided => f.write_str("provided"),
            Role::Required => f.write_str("required"),
        }
    }
}

/// Provided and required subject groups of the local endpoint.
#[derive(Debug, Clone, Default)]
pub struct CapabilityCatalog {
    provided: BTreeMap<CommunicationSubject, SubjectGroup>,
    required: BTreeMap<CommunicationSubject, SubjectGroup>,
}

impl CapabilityCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register capabilities this endpoint offers for a subject.
    pub fn provide(&mut self, group: SubjectGroup) -> Result<(), CatalogError> {
        self.register(Role::Provided, group)
    }

    /// Register capabilities this endpoint needs from remotes for a subject.
    pub fn require(&mut self, group: SubjectGroup) -> Result<(), CatalogError> {
        self.register(Role::Required, group)
    }

    /// Merge `group` into the role's existing group for the subject.
    ///
    /// Nothing is registered if any descriptor is already known for the
    /// same subject, role and kind.
    fn register(&mut self, role: Role, group: SubjectGroup) -> Result<(), CatalogError> {
        let groups = match role {
            Role::Provided => &mut self.provided,
            Role::Required => &mut self.required,
        };

        let existing = groups.get(&group.subject);
        for kind in [CapabilityKind::Command, CapabilityKind::Notification] {
            let mut seen = Vec::new();
            for alt in group.sets(kind).iter().flat_map(VersionedFallbackSet::iter) {
                let known = existing.is_some_and(|g| g.mentions(kind, &alt.descriptor));
                if known || seen.contains(&&alt.descriptor) {
                    return Err(CatalogError::CapabilityAlreadyRegistered {
                        role,
                        subject: group.subject.clone(),
                        descriptor: alt.descriptor.clone(),
                    });
                }
                seen.push(&alt.descriptor);
            }
        }

        match groups.get_mut(&group.subject) {
            Some(current) => {
                current.commands.extend(group.commands);
                current.notifications.extend(group.notifications);
            }
            None => {
                groups.insert(group.subject.clone(), group);
            }
        }
        Ok(())
    }

    pub fn provided(&self, subject: &CommunicationSubject) -> Result<&SubjectGroup, CatalogError> {
        self.provided
            .get(subject)
            .ok_or_else(|| CatalogError::UnknownSubject(subject.clone()))
    }

    pub fn required(&self, subject: &CommunicationSubject) -> Result<&SubjectGroup, CatalogError> {
        self.required
            .get(subject)
            .ok_or_else(|| CatalogError::UnknownSubject(subject.clone()))
    }

    /// Every provided group, in subject order. This is what gets offered to
    /// each newly connected endpoint.
    pub fn provided_groups(&self) -> Vec<SubjectGroup> {
        self.provided.values().cloned().collect()
    }

    pub fn required_groups(&self) -> impl Iterator<Item = &SubjectGroup> {
        self.required.values()
    }

    pub fn subjects(&self) -> impl Iterator<Item = &CommunicationSubject> {
        let mut subjects: Vec<_> = self.provided.keys().chain(self.required.keys()).collect();
        subjects.sort();
        subjects.dedup();
        subjects.into_iter()
    }

    /// Whether the descriptor is provided as a capability of `kind` under any subject.
    pub fn provides(&self, kind: CapabilityKind, descriptor: &CapabilityDescriptor) -> bool {
        self.provided.values().any(|g| g.mentions(kind, descriptor))
    }

    /// Check a remote offer against the locally required groups.
    ///
    /// A required subject resolves when the remote offers that subject and
    /// every required command and notification fallback set overlaps one
    /// of the remote's sets. Only resolved subjects contribute selections.
    pub fn match_offer(&self, offered: &[SubjectGroup]) -> OfferMatch {
        let mut result = OfferMatch::default();

        for required in self.required.values() {
            let Some(remote) = offered.iter().find(|g| g.subject == required.subject) else {
                continue;
            };

            let commands = resolve_all(&required.commands, &remote.commands);
            let notifications = resolve_all(&required.notifications, &remote.notifications);
            let (Some(commands), Some(notifications)) = (commands, notifications) else {
                result.unresolved_subjects.push(required.subject.clone());
                continue;
            };

            result.resolved_subjects.push(required.subject.clone());
            for pick in commands {
                if !result.commands.contains(pick) {
                    result.commands.push(pick.clone());
                }
            }
            for pick in notifications {
                if !result.notifications.contains(pick) {
                    result.notifications.push(pick.clone());
                }
            }
        }

        result
    }
}

fn resolve_all<'a>(
    required: &'a [VersionedFallbackSet],
    offered: &[VersionedFallbackSet],
) -> Option<Vec<&'a VersionedCapability>> {
    required
        .iter()
        .map(|set| matcher::resolve_against(set, offered))
        .collect()
}

/// Outcome of matching a remote offer against local requirements.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OfferMatch {
    pub resolved_subjects: Vec<CommunicationSubject>,
    pub unresolved_subjects: Vec<CommunicationSubject>,
    pub commands: Vec<VersionedCapability>,
    pub notifications: Vec<VersionedCapability>,
}

impl OfferMatch {
    /// At least one required subject is fully satisfied.
    pub fn is_desired(&self) -> bool {
        !self.resolved_subjects.is_empty()
    }

    pub fn selected(&self, kind: CapabilityKind) -> Vec<CapabilityDescriptor> {
        let picks = match kind {
            CapabilityKind::Command => &self.commands,
            CapabilityKind::Notification => &self.notifications,
        };
        picks.iter().map(|p| p.descriptor.clone()).collect()
    }
}

/// Catalog registration and lookup errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CatalogError {
    #[error("{descriptor} is already {role} for subject {subject}")]
    CapabilityAlreadyRegistered {
        role: Role,
        subject: CommunicationSubject,
        descriptor: CapabilityDescriptor,
    },
    #[error("unknown subject: {0}")]
    UnknownSubject(CommunicationSubject),
    #[error(transparent)]
    FallbackSet(#[from] FallbackSetError),
}
