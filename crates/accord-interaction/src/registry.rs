//! Locally implemented capabilities.
//!
//! Each command member is registered once with an explicit parameter
//! layout and an async handler. The registry is filled at start-up and
//! shared read-only afterwards.

use accord_core::{CapabilityCatalog, CapabilityDescriptor, EndpointId, MessageId};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::sync::Arc;

/// Where the value of a declared parameter comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParameterOrigin {
    /// Supplied by the caller, matched by name.
    FromCaller,
    /// The id of the endpoint that sent the invocation.
    InvokingEndpointId,
    /// The id of the invocation request message.
    InvokingRequestId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParameterSpec {
    pub name: String,
    pub origin: ParameterOrigin,
}

/// A command member: capability descriptor plus member name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CapabilityId {
    pub capability: CapabilityDescriptor,
    pub member: String,
}

impl CapabilityId {
    pub fn new(capability: CapabilityDescriptor, member: impl Into<String>) -> Self {
        Self {
            capability,
            member: member.into(),
        }
    }
}

impl fmt::Display for CapabilityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}", self.capability.type_name, self.member)
    }
}

/// Who is invoking, handed to every handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvocationContext {
    pub endpoint: EndpointId,
    pub request_id: MessageId,
}

/// Failure reported by a handler.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InvocationFault {
    #[error("{0}")]
    Failed(String),
    #[error("invocation cancelled")]
    Cancelled,
}

impl InvocationFault {
    pub fn failed(message: impl Into<String>) -> Self {
        InvocationFault::Failed(message.into())
    }
}

pub type HandlerResult = Result<Option<Value>, InvocationFault>;

/// Fixed-signature invocation target.
pub type CapabilityHandler =
    Arc<dyn Fn(InvocationContext, Vec<Value>) -> BoxFuture<'static, HandlerResult> + Send + Sync>;

/// A bound local implementation of one command member.
#[derive(Clone)]
pub struct CapabilityDefinition {
    pub id: CapabilityId,
    pub returns_value: bool,
    pub parameters: Vec<ParameterSpec>,
    pub target: CapabilityHandler,
}

impl CapabilityDefinition {
    /// A member without parameters that returns nothing; extend with the
    /// chained setters.
    pub fn new<F, Fut>(
        capability: CapabilityDescriptor,
        member: impl Into<String>,
        handler: F,
    ) -> Self
    where
        F: Fn(InvocationContext, Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        Self {
            id: CapabilityId::new(capability, member),
            returns_value: false,
            parameters: Vec::new(),
            target: Arc::new(move |ctx, args| handler(ctx, args).boxed()),
        }
    }

    /// Append a caller-supplied parameter.
    pub fn param(self, name: impl Into<String>) -> Self {
        self.param_from(name, ParameterOrigin::FromCaller)
    }

    pub fn param_from(mut self, name: impl Into<String>, origin: ParameterOrigin) -> Self {
        self.parameters.push(ParameterSpec {
            name: name.into(),
            origin,
        });
        self
    }

    pub fn returning(mut self) -> Self {
        self.returns_value = true;
        self
    }

    fn validate(&self) -> Result<(), RegistryError> {
        if self.id.member.is_empty() {
            return Err(RegistryError::InvalidCapabilityShape {
                id: self.id.clone(),
                reason: "member name is empty".into(),
            });
        }

        let mut names = HashSet::new();
        let mut endpoint_slots = 0;
        let mut request_slots = 0;
        for param in &self.parameters {
            if param.name.is_empty() || !names.insert(param.name.as_str()) {
                return Err(RegistryError::InvalidCapabilityShape {
                    id: self.id.clone(),
                    reason: format!("parameter name {:?} is empty or repeated", param.name),
                });
            }
            match param.origin {
                ParameterOrigin::FromCaller => {}
                ParameterOrigin::InvokingEndpointId => endpoint_slots += 1,
                ParameterOrigin::InvokingRequestId => request_slots += 1,
            }
        }

        if endpoint_slots > 1 || request_slots > 1 {
            return Err(RegistryError::InvalidParameterOrigin {
                id: self.id.clone(),
                reason: "each invocation origin may be bound to one parameter only".into(),
            });
        }
        Ok(())
    }
}

impl fmt::Debug for CapabilityDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CapabilityDefinition")
            .field("id", &self.id)
            .field("returns_value", &self.returns_value)
            .field("parameters", &self.parameters)
            .finish_non_exhaustive()
    }
}

/// Registration errors. Raised to the registering caller; nothing is
/// registered when one occurs.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("{0} is already registered")]
    CapabilityAlreadyRegistered(CapabilityId),
    #[error("{id} has an invalid shape: {reason}")]
    InvalidCapabilityShape { id: CapabilityId, reason: String },
    #[error("{id} has an invalid parameter origin: {reason}")]
    InvalidParameterOrigin { id: CapabilityId, reason: String },
}

/// Dispatch table of locally bound command members.
#[derive(Debug, Default)]
pub struct CapabilityRegistry {
    definitions: HashMap<CapabilityId, Arc<CapabilityDefinition>>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, definition: CapabilityDefinition) -> Result<(), RegistryError> {
        definition.validate()?;
        if self.definitions.contains_key(&definition.id) {
            return Err(RegistryError::CapabilityAlreadyRegistered(definition.id));
        }
        self.definitions
            .insert(definition.id.clone(), Arc::new(definition));
        Ok(())
    }

    pub fn resolve(&self, id: &CapabilityId) -> Option<Arc<CapabilityDefinition>> {
        self.definitions.get(id).cloned()
    }

    pub fn contains(&self, id: &CapabilityId) -> bool {
        self.definitions.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }

    /// Provided commands in `catalog` that have no registered member.
    pub fn unimplemented(&self, catalog: &CapabilityCatalog) -> Vec<CapabilityDescriptor> {
        let implemented: HashSet<&CapabilityDescriptor> =
            self.definitions.keys().map(|id| &id.capability).collect();

        let mut missing: Vec<_> = catalog
            .provided_groups()
            .into_iter()
            .flat_map(|g| g.commands)
            .flat_map(|set| set.alternatives().to_vec())
            .map(|alt| alt.descriptor)
            .filter(|d| !implemented.contains(d))
            .collect();
        missing.sort();
        missing.dedup();
        missing
    }
}
