//! Core types for Accord.
//!
//! This crate provides the value types both endpoints agree on: endpoint
//! identifiers, subjects, versioned capability descriptions, the local
//! capability catalog, the fallback matcher, and the wire messages. It has
//! no runtime; see `accord-interaction` for the handshake, proxies and
//! dispatcher.

mod catalog;
mod descriptor;
mod endpoint;
mod fallback;
mod group;
pub mod matcher;
mod message;
mod subject;
mod version;

pub use catalog::{CapabilityCatalog, CatalogError, OfferMatch, Role};
pub use descriptor::{CapabilityDescriptor, CapabilityKind, Contract};
pub use endpoint::{EndpointId, EndpointIdParseError, EndpointKind};
pub use fallback::{FallbackSetError, VersionedCapability, VersionedFallbackSet};
pub use group::SubjectGroup;
pub use message::{Decision, Envelope, InteractionMessage, MessageId, WireParameter};
pub use subject::CommunicationSubject;
pub use version::{CapabilityVersion, VersionParseError};

/// Handshake progress of one remote endpoint, as seen from outside.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandshakeStatus {
    /// No handshake state exists.
    Unknown,
    /// Offers or decisions are still outstanding.
    Negotiating,
    /// Capabilities were committed to the proxy hubs.
    Approved,
    /// One side denied the interaction.
    Rejected,
    /// Both sides were neutral; nothing to do.
    Amicable,
    /// Transport failure or disconnect ended the handshake.
    Abandoned,
}
