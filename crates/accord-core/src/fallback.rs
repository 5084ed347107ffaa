//! Versioned fallback sets.
//!
//! A fallback set lists mutually exclusive alternatives for one logical
//! capability. Any single alternative satisfies the capability as long as
//! the other side knows the same contract.

use crate::{CapabilityDescriptor, CapabilityVersion};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// One alternative of a fallback set.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VersionedCapability {
    pub descriptor: CapabilityDescriptor,
    pub version: CapabilityVersion,
}

impl VersionedCapability {
    pub fn new(descriptor: CapabilityDescriptor, version: CapabilityVersion) -> Self {
        Self {
            descriptor,
            version,
        }
    }
}

/// Ordered, non-empty alternatives with distinct versions and descriptors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<VersionedCapability>", into = "Vec<VersionedCapability>")]
pub struct VersionedFallbackSet {
    alternatives: Vec<VersionedCapability>,
}

impl VersionedFallbackSet {
    pub fn new(alternatives: Vec<VersionedCapability>) -> Result<Self, FallbackSetError> {
        if alternatives.is_empty() {
            return Err(FallbackSetError::Empty);
        }

        let mut versions = HashSet::new();
        let mut descriptors = HashSet::new();
        for alt in &alternatives {
            if !versions.insert(alt.version) {
                return Err(FallbackSetError::DuplicateVersion(alt.version));
            }
            if !descriptors.insert(&alt.descriptor) {
                return Err(FallbackSetError::DuplicateDescriptor(alt.descriptor.clone()));
            }
        }

        Ok(Self { alternatives })
    }

    /// A fallback set with a single alternative.
    pub fn single(descriptor: CapabilityDescriptor, version: CapabilityVersion) -> Self {
        Self {
            alternatives: vec![VersionedCapability::new(descriptor, version)],
        }
    }

    pub fn alternatives(&self) -> &[VersionedCapability] {
        &self.alternatives
    }

    pub fn iter(&self) -> impl Iterator<Item = &VersionedCapability> {
        self.alternatives.iter()
    }

    pub fn contains(&self, descriptor: &CapabilityDescriptor) -> bool {
        self.alternatives.iter().any(|a| &a.descriptor == descriptor)
    }

    pub fn len(&self) -> usize {
        self.alternatives.len()
    }

    /// Always false; kept for clippy's `len_without_is_empty`.
    pub fn is_empty(&self) -> bool {
        self.alternatives.is_empty()
    }
}

impl TryFrom<Vec<VersionedCapability>> for VersionedFallbackSet {
    type Error = FallbackSetError;

    fn try_from(alternatives: Vec<VersionedCapability>) -> Result<Self, Self::Error> {
        Self::new(alternatives)
    }
}

impl From<VersionedFallbackSet> for Vec<VersionedCapability> {
    fn from(set: VersionedFallbackSet) -> Self {
        set.alternatives
    }
}

/// Invalid fallback set construction.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FallbackSetError {
    #[error("fallback set must contain at least one alternative")]
    Empty,
    #[error("fallback set lists version {0} more than once")]
    DuplicateVersion(CapabilityVersion),
    #[error("fallback set lists {0} more than once")]
    DuplicateDescriptor(CapabilityDescriptor),
}
