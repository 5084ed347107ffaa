//! Version fallback matching.
//!
//! Two alternatives are "similar contracts" when their descriptors are
//! identical; versions are only used to pick a winner among matches.
//!
//! The winner is the match with the numerically *lowest* version of the
//! first set. Candidates are sorted ascending by version (ties by descriptor)
//! and the first one is taken. Whether the highest shared version would be
//! the better policy is an open product question, so the policy is kept
//! explicit here and covered by tests.

use crate::{VersionedCapability, VersionedFallbackSet};

/// True iff some alternative of `a` names the same contract as some
/// alternative of `b`.
pub fn overlaps(a: &VersionedFallbackSet, b: &VersionedFallbackSet) -> bool {
    a.iter().any(|left| b.contains(&left.descriptor))
}

/// The alternative of `a` both sides can use, if any.
///
/// Among all alternatives of `a` whose descriptor also appears in `b`,
/// returns the one with the lowest version.
pub fn best_common_version<'a>(
    a: &'a VersionedFallbackSet,
    b: &VersionedFallbackSet,
) -> Option<&'a VersionedCapability> {
    let mut candidates: Vec<&VersionedCapability> = a
        .iter()
        .filter(|left| b.contains(&left.descriptor))
        .collect();

    candidates.sort_by(|x, y| {
        x.version
            .cmp(&y.version)
            .then_with(|| x.descriptor.cmp(&y.descriptor))
    });
    candidates.into_iter().next()
}

/// Find the first set in `offered` that overlaps `required` and pick the
/// alternative to use from `required`.
pub fn resolve_against<'a>(
    required: &'a VersionedFallbackSet,
    offered: &[VersionedFallbackSet],
) -> Option<&'a VersionedCapability> {
    offered
        .iter()
        .filter(|candidate| overlaps(required, candidate))
        .find_map(|candidate| best_common_version(required, candidate))
}
