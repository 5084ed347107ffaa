//! In-process transport.
//!
//! A [`LoopbackNetwork`] connects any number of endpoints living in the
//! same process. Each endpoint joins to get a [`LoopbackTransport`] for
//! outbound traffic and a receiver of [`InboundEvent`]s. Links between
//! endpoints are explicit so tests can decide exactly which side learns
//! about a connection first.
//!
//! Replies are matched to pending [`ProtocolLayer::send_message_and_await`]
//! calls by `in_response_to`; everything else lands in the receiver.

use crate::protocol::{InboundEvent, ProtocolLayer, TransportError};
use accord_core::{EndpointId, Envelope, MessageId};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace};

type Reply = oneshot::Sender<Result<Envelope, TransportError>>;

struct Port {
    events: mpsc::UnboundedSender<InboundEvent>,
    /// Outstanding send-and-await calls issued by this endpoint.
    pending: Mutex<HashMap<MessageId, (EndpointId, Reply)>>,
}

impl Port {
    fn push(&self, event: InboundEvent) {
        if self.events.send(event).is_err() {
            trace!("loopback receiver dropped");
        }
    }

    fn fail_pending_to(&self, peer: &EndpointId) {
        let mut pending = self.pending.lock();
        let ids: Vec<MessageId> = pending
            .iter()
            .filter(|(_, (to, _))| to == peer)
            .map(|(id, _)| *id)
            .collect();
        for id in ids {
            if let Some((_, reply)) = pending.remove(&id) {
                let _ = reply.send(Err(TransportError::Disconnected(peer.clone())));
            }
        }
    }
}

/// Drops the pending entry when the caller stops waiting, answered or not.
struct PendingRequest {
    port: Arc<Port>,
    id: MessageId,
}

impl Drop for PendingRequest {
    fn drop(&mut self) {
        self.port.pending.lock().remove(&self.id);
    }
}

/// One delivered message, as seen by the network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub from: EndpointId,
    pub to: EndpointId,
    pub kind: &'static str,
}

struct NetworkState {
    ports: HashMap<EndpointId, Arc<Port>>,
    /// Undirected links, stored with the smaller endpoint first.
    links: BTreeSet<(EndpointId, EndpointId)>,
}

/// Registry of in-process endpoints and the links between them.
pub struct LoopbackNetwork {
    state: RwLock<NetworkState>,
    traffic: Mutex<Vec<Delivery>>,
}

fn link_key(a: &EndpointId, b: &EndpointId) -> (EndpointId, EndpointId) {
    if a <= b {
        (a.clone(), b.clone())
    } else {
        (b.clone(), a.clone())
    }
}

impl LoopbackNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: RwLock::new(NetworkState {
                ports: HashMap::new(),
                links: BTreeSet::new(),
            }),
            traffic: Mutex::new(Vec::new()),
        })
    }

    /// Register `endpoint`. Joining again under the same id replaces the
    /// previous registration.
    pub fn join(
        self: &Arc<Self>,
        endpoint: EndpointId,
    ) -> (Arc<LoopbackTransport>, mpsc::UnboundedReceiver<InboundEvent>) {
        let (events, receiver) = mpsc::unbounded_channel();
        let port = Arc::new(Port {
            events,
            pending: Mutex::new(HashMap::new()),
        });
        self.state.write().ports.insert(endpoint.clone(), port);
        debug!(%endpoint, "joined loopback network");
        let transport = Arc::new(LoopbackTransport {
            local: endpoint,
            network: Arc::clone(self),
        });
        (transport, receiver)
    }

    /// Link two endpoints without telling either of them.
    pub fn link(&self, a: &EndpointId, b: &EndpointId) {
        self.state.write().links.insert(link_key(a, b));
    }

    /// Tell `to` that `about` is connected.
    pub fn announce(&self, to: &EndpointId, about: &EndpointId) {
        if let Some(port) = self.port(to) {
            port.push(InboundEvent::Connected(about.clone()));
        }
    }

    /// Link two endpoints and announce each to the other.
    pub fn connect(&self, a: &EndpointId, b: &EndpointId) {
        self.link(a, b);
        self.announce(a, b);
        self.announce(b, a);
    }

    /// Cut the link. Pending requests across it fail with
    /// [`TransportError::Disconnected`] and both sides get a disconnect event.
    pub fn disconnect(&self, a: &EndpointId, b: &EndpointId) -> bool {
        let (removed, port_a, port_b) = {
            let mut state = self.state.write();
            let removed = state.links.remove(&link_key(a, b));
            (removed, state.ports.get(a).cloned(), state.ports.get(b).cloned())
        };
        if !removed {
            return false;
        }
        debug!(%a, %b, "loopback link cut");
        if let Some(port) = port_a {
            port.fail_pending_to(b);
            port.push(InboundEvent::Disconnected(b.clone()));
        }
        if let Some(port) = port_b {
            port.fail_pending_to(a);
            port.push(InboundEvent::Disconnected(a.clone()));
        }
        true
    }

    pub fn is_linked(&self, a: &EndpointId, b: &EndpointId) -> bool {
        self.state.read().links.contains(&link_key(a, b))
    }

    /// Every message delivered so far, in delivery order.
    pub fn traffic(&self) -> Vec<Delivery> {
        self.traffic.lock().clone()
    }

    /// How many messages of `kind` went from `from` to `to`.
    pub fn count(&self, from: &EndpointId, to: &EndpointId, kind: &str) -> usize {
        self.traffic
            .lock()
            .iter()
            .filter(|d| &d.from == from && &d.to == to && d.kind == kind)
            .count()
    }

    fn port(&self, endpoint: &EndpointId) -> Option<Arc<Port>> {
        self.state.read().ports.get(endpoint).cloned()
    }

    fn deliver(
        &self,
        from: &EndpointId,
        to: &EndpointId,
        envelope: Envelope,
    ) -> Result<(), TransportError> {
        let port = {
            let state = self.state.read();
            if !state.links.contains(&link_key(from, to)) {
                return Err(TransportError::EndpointUnreachable(to.clone()));
            }
            state
                .ports
                .get(to)
                .cloned()
                .ok_or_else(|| TransportError::EndpointUnreachable(to.clone()))?
        };

        self.traffic.lock().push(Delivery {
            from: from.clone(),
            to: to.clone(),
            kind: envelope.body.kind(),
        });
        trace!(%from, %to, kind = envelope.body.kind(), "loopback delivery");

        let waiting = envelope
            .in_response_to()
            .and_then(|id| port.pending.lock().remove(&id));
        match waiting {
            Some((_, reply)) => {
                let _ = reply.send(Ok(envelope));
            }
            None => port.push(InboundEvent::Message(envelope)),
        }
        Ok(())
    }
}

/// Outbound half of one endpoint on a [`LoopbackNetwork`].
pub struct LoopbackTransport {
    local: EndpointId,
    network: Arc<LoopbackNetwork>,
}

impl LoopbackTransport {
    pub fn network(&self) -> &Arc<LoopbackNetwork> {
        &self.network
    }
}

#[async_trait]
impl ProtocolLayer for LoopbackTransport {
    fn local_endpoint(&self) -> &EndpointId {
        &self.local
    }

    async fn send_message_to(
        &self,
        endpoint: &EndpointId,
        envelope: Envelope,
    ) -> Result<(), TransportError> {
        self.network.deliver(&self.local, endpoint, envelope)
    }

    async fn send_message_and_await(
        &self,
        endpoint: &EndpointId,
        envelope: Envelope,
    ) -> Result<Envelope, TransportError> {
        let port = self.network.port(&self.local).ok_or(TransportError::Closed)?;
        let id = envelope.id;
        let (reply, response) = oneshot::channel();
        port.pending.lock().insert(id, (endpoint.clone(), reply));
        let _pending = PendingRequest { port, id };

        self.network.deliver(&self.local, endpoint, envelope)?;
        response
            .await
            .unwrap_or_else(|_| Err(TransportError::Disconnected(endpoint.clone())))
    }
}
