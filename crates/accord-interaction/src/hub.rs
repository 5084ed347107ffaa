//! Per-endpoint proxy hubs.
//!
//! A hub owns the stand-ins of one capability kind for every signed-in
//! endpoint. The map lock is held only for map mutation; factory calls and
//! event delivery happen outside of it so a slow factory or a listener that
//! calls back into the hub cannot stall other endpoints.
//!
//! Every installed set carries the session it was signed in for. A later
//! session replaces an earlier one of the same endpoint, and a session can
//! only take back what it installed itself.

use accord_core::{CapabilityDescriptor, CapabilityKind, Contract, EndpointId};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Produces a stand-in for one capability of one endpoint.
pub trait ProxyFactory<P>: Send + Sync {
    fn build(
        &self,
        endpoint: &EndpointId,
        capability: &CapabilityDescriptor,
    ) -> Result<P, HubError>;
}

impl<P, F> ProxyFactory<P> for F
where
    F: Fn(&EndpointId, &CapabilityDescriptor) -> Result<P, HubError> + Send + Sync,
{
    fn build(
        &self,
        endpoint: &EndpointId,
        capability: &CapabilityDescriptor,
    ) -> Result<P, HubError> {
        self(endpoint, capability)
    }
}

/// Capability availability changes, raised to application code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HubEvent {
    /// Stand-ins for these capabilities can now be looked up.
    CapabilitiesAvailable {
        endpoint: EndpointId,
        kind: CapabilityKind,
        capabilities: Vec<CapabilityDescriptor>,
    },
    /// Every stand-in for the endpoint was dropped.
    CapabilitiesRemoved {
        endpoint: EndpointId,
        kind: CapabilityKind,
    },
}

impl HubEvent {
    pub fn endpoint(&self) -> &EndpointId {
        match self {
            HubEvent::CapabilitiesAvailable { endpoint, .. }
            | HubEvent::CapabilitiesRemoved { endpoint, .. } => endpoint,
        }
    }
}

/// Hub errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HubError {
    #[error("endpoint {0} is already signed in")]
    AlreadySignedIn(EndpointId),
    #[error("failed to build stand-in for {capability}: {reason}")]
    ProxyConstructionFailed {
        capability: CapabilityDescriptor,
        reason: String,
    },
}

/// Object-safe view of a hub used by the handshake to commit selections.
///
/// `session` is the handshake generation the commit belongs to.
pub trait SignInTarget: Send + Sync {
    fn kind(&self) -> CapabilityKind;

    /// Returns the capabilities that ended up installed.
    fn sign_in(
        &self,
        endpoint: &EndpointId,
        session: u64,
        capabilities: &[CapabilityDescriptor],
    ) -> Result<Vec<CapabilityDescriptor>, HubError>;

    /// Removes the endpoint's stand-ins only if `session` installed them.
    fn sign_off(&self, endpoint: &EndpointId, session: u64) -> bool;
}

type ProxyMap<P> = HashMap<CapabilityDescriptor, Arc<P>>;

struct Installed<P> {
    session: u64,
    proxies: ProxyMap<P>,
}

struct HubState<P> {
    installed: HashMap<EndpointId, Installed<P>>,
    /// Endpoints whose factories are running right now, and for which session.
    signing_in: HashMap<EndpointId, u64>,
}

impl<P> HubState<P> {
    fn proxies(&self, endpoint: &EndpointId) -> Option<&ProxyMap<P>> {
        self.installed.get(endpoint).map(|i| &i.proxies)
    }

    /// The newest session that holds or is building the endpoint's set.
    fn current_session(&self, endpoint: &EndpointId) -> Option<u64> {
        let building = self.signing_in.get(endpoint).copied();
        let installed = self.installed.get(endpoint).map(|i| i.session);
        building.max(installed)
    }
}

/// Stand-ins of one kind, indexed by endpoint and capability.
pub struct ProxyHub<P> {
    kind: CapabilityKind,
    factory: Arc<dyn ProxyFactory<P>>,
    state: Mutex<HubState<P>>,
    events: broadcast::Sender<HubEvent>,
}

impl<P: Send + Sync + 'static> ProxyHub<P> {
    pub fn new(kind: CapabilityKind, factory: Arc<dyn ProxyFactory<P>>, capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity.max(1));
        Self {
            kind,
            factory,
            state: Mutex::new(HubState {
                installed: HashMap::new(),
                signing_in: HashMap::new(),
            }),
            events,
        }
    }

    pub fn kind(&self) -> CapabilityKind {
        self.kind
    }

    /// Listen for sign-in and sign-off events.
    pub fn subscribe(&self) -> broadcast::Receiver<HubEvent> {
        self.events.subscribe()
    }

    /// Build stand-ins for `offered` and install them as one set.
    ///
    /// A factory failure skips that capability only. If the endpoint signs
    /// off while the factories run, nothing is installed.
    pub fn on_endpoint_signed_in(
        &self,
        endpoint: &EndpointId,
        offered: &[CapabilityDescriptor],
    ) -> Result<Vec<CapabilityDescriptor>, HubError> {
        self.on_session_signed_in(endpoint, 0, offered)
    }

    /// [`on_endpoint_signed_in`](Self::on_endpoint_signed_in) on behalf of
    /// `session`. Stand-ins of an earlier session are replaced; the same or
    /// a later session already present is an error.
    pub fn on_session_signed_in(
        &self,
        endpoint: &EndpointId,
        session: u64,
        offered: &[CapabilityDescriptor],
    ) -> Result<Vec<CapabilityDescriptor>, HubError> {
        {
            let mut state = self.state.lock();
            if let Some(current) = state.current_session(endpoint) {
                if current >= session {
                    return Err(HubError::AlreadySignedIn(endpoint.clone()));
                }
                debug!(%endpoint, kind = %self.kind, current, session, "replacing earlier session");
            }
            state.signing_in.insert(endpoint.clone(), session);
        }

        let mut built: ProxyMap<P> = HashMap::with_capacity(offered.len());
        let mut installed = Vec::with_capacity(offered.len());
        for capability in offered {
            if built.contains_key(capability) {
                continue;
            }
            match self.factory.build(endpoint, capability) {
                Ok(proxy) => {
                    built.insert(capability.clone(), Arc::new(proxy));
                    installed.push(capability.clone());
                }
                Err(err) => {
                    warn!(%endpoint, %capability, kind = %self.kind, "skipping capability: {err}");
                }
            }
        }

        {
            let mut state = self.state.lock();
            if state.signing_in.get(endpoint) != Some(&session) {
                debug!(%endpoint, kind = %self.kind, session, "sign-in cancelled or superseded");
                return Ok(Vec::new());
            }
            state.signing_in.remove(endpoint);
            state.installed.insert(
                endpoint.clone(),
                Installed {
                    session,
                    proxies: built,
                },
            );
        }

        info!(%endpoint, kind = %self.kind, count = installed.len(), "endpoint signed in");
        let _ = self.events.send(HubEvent::CapabilitiesAvailable {
            endpoint: endpoint.clone(),
            kind: self.kind,
            capabilities: installed.clone(),
        });
        Ok(installed)
    }

    /// Drop every stand-in of the endpoint, whichever session installed it.
    /// Returns false if there was nothing to drop.
    pub fn on_endpoint_signed_off(&self, endpoint: &EndpointId) -> bool {
        let removed = {
            let mut state = self.state.lock();
            let was_pending = state.signing_in.remove(endpoint).is_some();
            state.installed.remove(endpoint).is_some() || was_pending
        };
        self.signed_off(endpoint, removed)
    }

    /// Drop the endpoint's stand-ins only if `session` installed them or
    /// is still building them.
    pub fn on_session_signed_off(&self, endpoint: &EndpointId, session: u64) -> bool {
        let removed = {
            let mut state = self.state.lock();
            let was_pending = state.signing_in.get(endpoint) == Some(&session);
            if was_pending {
                state.signing_in.remove(endpoint);
            }
            let was_installed = state
                .installed
                .get(endpoint)
                .is_some_and(|i| i.session == session);
            if was_installed {
                state.installed.remove(endpoint);
            }
            was_pending || was_installed
        };
        self.signed_off(endpoint, removed)
    }

    fn signed_off(&self, endpoint: &EndpointId, removed: bool) -> bool {
        if removed {
            info!(%endpoint, kind = %self.kind, "endpoint signed off");
            let _ = self.events.send(HubEvent::CapabilitiesRemoved {
                endpoint: endpoint.clone(),
                kind: self.kind,
            });
        }
        removed
    }

    pub fn has_capability_for(
        &self,
        endpoint: &EndpointId,
        capability: &CapabilityDescriptor,
    ) -> bool {
        self.state
            .lock()
            .proxies(endpoint)
            .is_some_and(|m| m.contains_key(capability))
    }

    pub fn capability_for(
        &self,
        endpoint: &EndpointId,
        capability: &CapabilityDescriptor,
    ) -> Option<Arc<P>> {
        self.state
            .lock()
            .proxies(endpoint)
            .and_then(|m| m.get(capability))
            .cloned()
    }

    /// Typed lookup through a [`Contract`].
    pub fn capability_of<C: Contract>(&self, endpoint: &EndpointId) -> Option<Arc<P>> {
        self.capability_for(endpoint, &C::descriptor())
    }

    /// Capabilities installed for the endpoint, sorted.
    pub fn capabilities_of(&self, endpoint: &EndpointId) -> Vec<CapabilityDescriptor> {
        let mut caps: Vec<_> = self
            .state
            .lock()
            .proxies(endpoint)
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default();
        caps.sort();
        caps
    }

    /// Signed-in endpoints, sorted.
    pub fn endpoints(&self) -> Vec<EndpointId> {
        let mut endpoints: Vec<_> = self.state.lock().installed.keys().cloned().collect();
        endpoints.sort();
        endpoints
    }

    /// Every stand-in for `capability` across endpoints.
    pub fn all_for(&self, capability: &CapabilityDescriptor) -> Vec<(EndpointId, Arc<P>)> {
        let mut found: Vec<_> = self
            .state
            .lock()
            .installed
            .iter()
            .filter_map(|(endpoint, i)| {
                let proxy = i.proxies.get(capability)?;
                Some((endpoint.clone(), Arc::clone(proxy)))
            })
            .collect();
        found.sort_by(|a, b| a.0.cmp(&b.0));
        found
    }
}

impl<P: Send + Sync + 'static> SignInTarget for ProxyHub<P> {
    fn kind(&self) -> CapabilityKind {
        self.kind
    }

    fn sign_in(
        &self,
        endpoint: &EndpointId,
        session: u64,
        capabilities: &[CapabilityDescriptor],
    ) -> Result<Vec<CapabilityDescriptor>, HubError> {
        self.on_session_signed_in(endpoint, session, capabilities)
    }

    fn sign_off(&self, endpoint: &EndpointId, session: u64) -> bool {
        self.on_session_signed_off(endpoint, session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Stub {
        endpoint: EndpointId,
        capability: CapabilityDescriptor,
    }

    fn d(name: &str) -> CapabilityDescriptor {
        CapabilityDescriptor::new(name, "test-contracts")
    }

    fn hub_failing_on(name: &'static str) -> ProxyHub<Stub> {
        let factory = move |endpoint: &EndpointId, capability: &CapabilityDescriptor| {
            if capability.type_name == name {
                Err(HubError::ProxyConstructionFailed {
                    capability: capability.clone(),
                    reason: "boom".into(),
                })
            } else {
                Ok(Stub {
                    endpoint: endpoint.clone(),
                    capability: capability.clone(),
                })
            }
        };
        ProxyHub::new(CapabilityKind::Command, Arc::new(factory), 8)
    }

    #[test]
    fn failed_factory_skips_only_that_capability() {
        let hub = hub_failing_on("D2");
        let mut events = hub.subscribe();
        let e = EndpointId::local("e1");

        let installed = hub.on_endpoint_signed_in(&e, &[d("D1"), d("D2")]).unwrap();
        assert_eq!(installed, vec![d("D1")]);

        let proxy = hub.capability_for(&e, &d("D1")).unwrap();
        assert_eq!(proxy.endpoint, e);
        assert_eq!(proxy.capability, d("D1"));
        assert!(hub.capability_for(&e, &d("D2")).is_none());

        assert_eq!(
            events.try_recv().unwrap(),
            HubEvent::CapabilitiesAvailable {
                endpoint: e.clone(),
                kind: CapabilityKind::Command,
                capabilities: vec![d("D1")],
            }
        );
    }

    #[test]
    fn sign_off_removes_everything() {
        let hub = hub_failing_on("D2");
        let e = EndpointId::local("e1");
        hub.on_endpoint_signed_in(&e, &[d("D1"), d("D2")]).unwrap();
        let mut events = hub.subscribe();

        assert!(hub.on_endpoint_signed_off(&e));
        assert!(!hub.has_capability_for(&e, &d("D1")));
        assert!(!hub.has_capability_for(&e, &d("D2")));
        assert!(hub.endpoints().is_empty());
        assert!(matches!(
            events.try_recv().unwrap(),
            HubEvent::CapabilitiesRemoved { .. }
        ));
    }

    #[test]
    fn sign_off_unknown_endpoint_is_noop() {
        let hub = hub_failing_on("none");
        let mut events = hub.subscribe();
        assert!(!hub.on_endpoint_signed_off(&EndpointId::local("ghost")));
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn second_sign_in_is_rejected() {
        let hub = hub_failing_on("none");
        let e = EndpointId::local("e1");
        hub.on_endpoint_signed_in(&e, &[d("D1")]).unwrap();
        assert_eq!(
            hub.on_endpoint_signed_in(&e, &[d("D3")]),
            Err(HubError::AlreadySignedIn(e.clone()))
        );
        assert_eq!(hub.capabilities_of(&e), vec![d("D1")]);
    }

    #[test]
    fn endpoints_are_isolated() {
        let hub = hub_failing_on("none");
        let a = EndpointId::local("a");
        let b = EndpointId::local("b");
        hub.on_endpoint_signed_in(&a, &[d("D1")]).unwrap();
        hub.on_endpoint_signed_in(&b, &[d("D1"), d("D2")]).unwrap();
        hub.on_endpoint_signed_off(&a);

        assert_eq!(hub.endpoints(), vec![b.clone()]);
        assert_eq!(hub.all_for(&d("D1")).len(), 1);
        assert!(hub.has_capability_for(&b, &d("D2")));
    }

    #[test]
    fn later_session_replaces_earlier_one() {
        let hub = hub_failing_on("none");
        let e = EndpointId::local("e1");
        hub.on_session_signed_in(&e, 3, &[d("D1")]).unwrap();

        assert_eq!(
            hub.on_session_signed_in(&e, 3, &[d("D2")]),
            Err(HubError::AlreadySignedIn(e.clone()))
        );
        assert_eq!(
            hub.on_session_signed_in(&e, 2, &[d("D2")]),
            Err(HubError::AlreadySignedIn(e.clone()))
        );
        assert_eq!(hub.on_session_signed_in(&e, 5, &[d("D2")]), Ok(vec![d("D2")]));
        assert_eq!(hub.capabilities_of(&e), vec![d("D2")]);
    }

    #[test]
    fn session_sign_off_leaves_other_sessions_alone() {
        let hub = hub_failing_on("none");
        let e = EndpointId::local("e1");
        hub.on_session_signed_in(&e, 1, &[d("D1")]).unwrap();
        hub.on_session_signed_in(&e, 2, &[d("D2")]).unwrap();
        let mut events = hub.subscribe();

        assert!(!hub.on_session_signed_off(&e, 1));
        assert!(hub.has_capability_for(&e, &d("D2")));
        assert!(events.try_recv().is_err());

        assert!(hub.on_session_signed_off(&e, 2));
        assert!(hub.endpoints().is_empty());
    }

    #[test]
    fn sign_off_during_sign_in_discards_result() {
        use std::sync::OnceLock;

        let slot: Arc<OnceLock<Arc<ProxyHub<Stub>>>> = Arc::new(OnceLock::new());
        let hub_ref = Arc::clone(&slot);
        let factory = move |endpoint: &EndpointId, capability: &CapabilityDescriptor| {
            if let Some(hub) = hub_ref.get() {
                hub.on_endpoint_signed_off(endpoint);
            }
            Ok(Stub {
                endpoint: endpoint.clone(),
                capability: capability.clone(),
            })
        };
        let hub = Arc::new(ProxyHub::new(CapabilityKind::Notification, Arc::new(factory), 8));
        let _ = slot.set(Arc::clone(&hub));

        let e = EndpointId::local("flaky");
        let installed = hub.on_endpoint_signed_in(&e, &[d("N1")]).unwrap();
        assert!(installed.is_empty());
        assert!(!hub.has_capability_for(&e, &d("N1")));
    }
}
