//! Capability handshake.
//!
//! Every connected endpoint gets one negotiation: each side sends its
//! provided subjects exactly once and answers the other side's offer with a
//! [`Decision`]. Once both offers have crossed and both decisions are known
//! the handshake concludes and, if anyone wanted it, the selected
//! capabilities are committed to the proxy hubs.
//!
//! The two entry points (our connect event and the remote's offer) may
//! arrive in either order. Responses to our own offer arrive on whatever
//! task the transport resolves them on; a generation number tells those
//! continuations whether the state they were started for still exists.

use crate::config::NodeConfig;
use crate::hub::SignInTarget;
use crate::protocol::{ProtocolLayer, TransportError};
use accord_core::{
    CapabilityCatalog, CapabilityDescriptor, CapabilityKind, Decision, EndpointId, HandshakeStatus,
    InteractionMessage, MessageId, OfferMatch, SubjectGroup,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Veto point consulted for every remote offer.
pub trait HandshakePolicy: Send + Sync {
    /// Returning false answers the offer with [`Decision::Denied`].
    fn admit(&self, endpoint: &EndpointId, offered: &[SubjectGroup]) -> bool;
}

impl<F> HandshakePolicy for F
where
    F: Fn(&EndpointId, &[SubjectGroup]) -> bool + Send + Sync,
{
    fn admit(&self, endpoint: &EndpointId, offered: &[SubjectGroup]) -> bool {
        self(endpoint, offered)
    }
}

/// Admits every endpoint.
#[derive(Debug, Clone, Copy, Default)]
pub struct AdmitAll;

impl HandshakePolicy for AdmitAll {
    fn admit(&self, _endpoint: &EndpointId, _offered: &[SubjectGroup]) -> bool {
        true
    }
}

/// How a handshake ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeOutcome {
    pub endpoint: EndpointId,
    pub status: HandshakeStatus,
    /// Command stand-ins that were installed. Empty unless approved.
    pub commands: Vec<CapabilityDescriptor>,
    /// Notification stand-ins that were installed. Empty unless approved.
    pub notifications: Vec<CapabilityDescriptor>,
}

impl HandshakeOutcome {
    fn bare(endpoint: EndpointId, status: HandshakeStatus) -> Self {
        Self {
            endpoint,
            status,
            commands: Vec::new(),
            notifications: Vec::new(),
        }
    }
}

#[derive(Debug)]
struct HandshakeState {
    generation: u64,
    offer_sent: bool,
    offer_received: bool,
    local_decision: Option<Decision>,
    remote_decision: Option<Decision>,
    selection: OfferMatch,
}

impl HandshakeState {
    fn new(generation: u64) -> Self {
        Self {
            generation,
            offer_sent: false,
            offer_received: false,
            local_decision: None,
            remote_decision: None,
            selection: OfferMatch::default(),
        }
    }

    fn is_complete(&self) -> bool {
        self.offer_sent
            && self.offer_received
            && self.local_decision.is_some()
            && self.remote_decision.is_some()
    }
}

#[derive(Debug, Clone, Copy)]
struct Concluded {
    generation: u64,
    status: HandshakeStatus,
    local_decision: Option<Decision>,
}

#[derive(Default)]
struct Shared {
    states: HashMap<EndpointId, HandshakeState>,
    concluded: HashMap<EndpointId, Concluded>,
    /// What each endpoint offered us, kept while it stays interesting.
    remote_offers: HashMap<EndpointId, Vec<SubjectGroup>>,
}

/// Drives the per-endpoint handshake state machine.
pub struct HandshakeConductor {
    protocol: Arc<dyn ProtocolLayer>,
    catalog: Arc<CapabilityCatalog>,
    policy: Arc<dyn HandshakePolicy>,
    commands: Arc<dyn SignInTarget>,
    notifications: Arc<dyn SignInTarget>,
    timeout: Duration,
    generation: AtomicU64,
    shared: Mutex<Shared>,
    outcomes: broadcast::Sender<HandshakeOutcome>,
}

impl HandshakeConductor {
    pub fn new(
        protocol: Arc<dyn ProtocolLayer>,
        catalog: Arc<CapabilityCatalog>,
        policy: Arc<dyn HandshakePolicy>,
        commands: Arc<dyn SignInTarget>,
        notifications: Arc<dyn SignInTarget>,
        config: &NodeConfig,
    ) -> Self {
        let (outcomes, _) = broadcast::channel(config.channel_capacity());
        Self {
            protocol,
            catalog,
            policy,
            commands,
            notifications,
            timeout: config.handshake_timeout(),
            generation: AtomicU64::new(1),
            shared: Mutex::new(Shared::default()),
            outcomes,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HandshakeOutcome> {
        self.outcomes.subscribe()
    }

    pub fn status(&self, endpoint: &EndpointId) -> HandshakeStatus {
        let shared = self.shared.lock();
        if shared.states.contains_key(endpoint) {
            return HandshakeStatus::Negotiating;
        }
        shared
            .concluded
            .get(endpoint)
            .map_or(HandshakeStatus::Unknown, |c| c.status)
    }

    /// The subjects `endpoint` offered, if its offer is still relevant.
    pub fn remote_offer(&self, endpoint: &EndpointId) -> Option<Vec<SubjectGroup>> {
        self.shared.lock().remote_offers.get(endpoint).cloned()
    }

    /// A new connection: start negotiating and send our offer.
    pub async fn endpoint_connected(&self, endpoint: &EndpointId) {
        if self.begin(endpoint) {
            self.initiate_handshake_with(endpoint).await;
        }
    }

    /// Create the handshake state for a new connection. Returns false if
    /// this connection already negotiated.
    pub fn begin(&self, endpoint: &EndpointId) -> bool {
        let mut shared = self.shared.lock();
        if shared.concluded.contains_key(endpoint) {
            debug!(%endpoint, "handshake already concluded for this connection");
            return false;
        }
        if !shared.states.contains_key(endpoint) {
            let generation = self.next_generation();
            shared
                .states
                .insert(endpoint.clone(), HandshakeState::new(generation));
            debug!(%endpoint, generation, "handshake started");
        }
        true
    }

    /// Send our provided subjects to `endpoint` unless that already happened
    /// for this connection, then wait for its decision.
    pub async fn initiate_handshake_with(&self, endpoint: &EndpointId) {
        let generation = {
            let mut shared = self.shared.lock();
            let Some(state) = shared.states.get_mut(endpoint) else {
                debug!(%endpoint, "no handshake in progress, offer not sent");
                return;
            };
            if state.offer_sent {
                return;
            }
            state.offer_sent = true;
            state.generation
        };

        let offer = self.protocol.envelope(InteractionMessage::CapabilityOffer {
            subjects: self.catalog.provided_groups(),
        });
        debug!(%endpoint, message = %offer.id, "sending capability offer");

        let reply = tokio::time::timeout(
            self.timeout,
            self.protocol.send_message_and_await(endpoint, offer),
        )
        .await
        .unwrap_or_else(|_| {
            Err(TransportError::Timeout {
                endpoint: endpoint.clone(),
                timeout: self.timeout,
            })
        });

        match reply {
            Ok(envelope) => match envelope.body {
                InteractionMessage::CapabilityOfferResponse { decision, .. } => {
                    self.remote_decided(endpoint, generation, decision);
                }
                other => {
                    warn!(%endpoint, kind = other.kind(), "unexpected reply to capability offer");
                    self.abandon(endpoint, generation);
                }
            },
            Err(err) => {
                warn!(%endpoint, "capability offer failed: {err}");
                self.abandon(endpoint, generation);
            }
        }
    }

    /// The remote's offer arrived. Evaluate it, answer, and make sure our
    /// own offer goes out.
    pub async fn offer_received(
        &self,
        endpoint: &EndpointId,
        request_id: MessageId,
        subjects: Vec<SubjectGroup>,
    ) {
        if self.answer_offer(endpoint, request_id, subjects).await {
            self.initiate_handshake_with(endpoint).await;
        }
    }

    /// Evaluate and answer an offer without sending our own. Returns true
    /// if [`initiate_handshake_with`](Self::initiate_handshake_with) should
    /// follow.
    pub async fn answer_offer(
        &self,
        endpoint: &EndpointId,
        request_id: MessageId,
        subjects: Vec<SubjectGroup>,
    ) -> bool {
        enum Next {
            Evaluated(Decision),
            Repeat(Decision),
            Ignore,
        }

        let (decision, selection) = self.evaluate(endpoint, &subjects);
        let next = {
            let mut shared = self.shared.lock();
            if let Some(concluded) = shared.concluded.get(endpoint) {
                match concluded.local_decision {
                    Some(decision) => Next::Repeat(decision),
                    None => Next::Ignore,
                }
            } else {
                let generation = self.next_generation();
                let state = shared
                    .states
                    .entry(endpoint.clone())
                    .or_insert_with(|| HandshakeState::new(generation));
                if state.offer_received {
                    Next::Repeat(state.local_decision.unwrap_or(Decision::Neutral))
                } else {
                    state.offer_received = true;
                    state.local_decision = Some(decision);
                    state.selection = selection;
                    shared.remote_offers.insert(endpoint.clone(), subjects);
                    Next::Evaluated(decision)
                }
            }
        };

        let decision = match next {
            Next::Ignore => {
                debug!(%endpoint, "offer after abandoned handshake ignored");
                return false;
            }
            Next::Repeat(decision) => {
                debug!(%endpoint, ?decision, "repeated offer, answering with the earlier decision");
                self.reply(endpoint, request_id, decision).await;
                return false;
            }
            Next::Evaluated(decision) => decision,
        };

        info!(%endpoint, ?decision, "evaluated capability offer");
        self.reply(endpoint, request_id, decision).await;
        self.complete_if_ready(endpoint);
        true
    }

    /// Forget everything about `endpoint`. Returns whether a negotiation was
    /// cut short.
    pub fn endpoint_disconnected(&self, endpoint: &EndpointId) -> bool {
        let interrupted = {
            let mut shared = self.shared.lock();
            shared.remote_offers.remove(endpoint);
            shared.concluded.remove(endpoint);
            shared.states.remove(endpoint).is_some()
        };
        if interrupted {
            info!(%endpoint, "handshake abandoned by disconnect");
            let _ = self
                .outcomes
                .send(HandshakeOutcome::bare(endpoint.clone(), HandshakeStatus::Abandoned));
        }
        interrupted
    }

    fn next_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::Relaxed)
    }

    fn evaluate(&self, endpoint: &EndpointId, subjects: &[SubjectGroup]) -> (Decision, OfferMatch) {
        if !self.policy.admit(endpoint, subjects) {
            return (Decision::Denied, OfferMatch::default());
        }
        let selection = self.catalog.match_offer(subjects);
        if !selection.unresolved_subjects.is_empty() {
            debug!(
                %endpoint,
                unresolved = ?selection.unresolved_subjects,
                "required subjects without a match"
            );
        }
        let decision = if selection.is_desired() {
            Decision::Desired
        } else {
            Decision::Neutral
        };
        (decision, selection)
    }

    async fn reply(&self, endpoint: &EndpointId, request_id: MessageId, decision: Decision) {
        let response = self
            .protocol
            .envelope(InteractionMessage::CapabilityOfferResponse {
                in_response_to: request_id,
                decision,
            });
        if let Err(err) = self.protocol.send_message_to(endpoint, response).await {
            warn!(%endpoint, "failed to answer capability offer: {err}");
        }
    }

    fn remote_decided(&self, endpoint: &EndpointId, generation: u64, decision: Decision) {
        {
            let mut shared = self.shared.lock();
            match shared.states.get_mut(endpoint) {
                Some(state) if state.generation == generation => {
                    state.remote_decision = Some(decision);
                }
                _ => {
                    debug!(%endpoint, generation, "stale offer response ignored");
                    return;
                }
            }
        }
        debug!(%endpoint, ?decision, "remote decided");
        self.complete_if_ready(endpoint);
    }

    fn abandon(&self, endpoint: &EndpointId, generation: u64) {
        {
            let mut shared = self.shared.lock();
            match shared.states.get(endpoint) {
                Some(state) if state.generation == generation => {}
                _ => {
                    debug!(%endpoint, generation, "stale offer failure ignored");
                    return;
                }
            }
            shared.states.remove(endpoint);
            shared.remote_offers.remove(endpoint);
            shared.concluded.insert(
                endpoint.clone(),
                Concluded {
                    generation,
                    status: HandshakeStatus::Abandoned,
                    local_decision: None,
                },
            );
        }
        info!(%endpoint, "handshake abandoned");
        let _ = self
            .outcomes
            .send(HandshakeOutcome::bare(endpoint.clone(), HandshakeStatus::Abandoned));
    }

    fn complete_if_ready(&self, endpoint: &EndpointId) {
        let (state, status) = {
            let mut shared = self.shared.lock();
            if !shared.states.get(endpoint).is_some_and(HandshakeState::is_complete) {
                return;
            }
            let Some(state) = shared.states.remove(endpoint) else {
                return;
            };
            let decisions = [state.local_decision, state.remote_decision];
            let status = if decisions.contains(&Some(Decision::Denied)) {
                HandshakeStatus::Rejected
            } else if decisions.contains(&Some(Decision::Desired)) {
                HandshakeStatus::Approved
            } else {
                HandshakeStatus::Amicable
            };
            if status != HandshakeStatus::Approved {
                shared.remote_offers.remove(endpoint);
            }
            shared.concluded.insert(
                endpoint.clone(),
                Concluded {
                    generation: state.generation,
                    status,
                    local_decision: state.local_decision,
                },
            );
            (state, status)
        };

        let mut outcome = HandshakeOutcome::bare(endpoint.clone(), status);
        if status == HandshakeStatus::Approved {
            let session = state.generation;
            outcome.commands = self.commit(&*self.commands, endpoint, session, &state.selection);
            outcome.notifications =
                self.commit(&*self.notifications, endpoint, session, &state.selection);

            // A newer connection's stand-ins carry a newer session and survive this.
            let still_connected = self
                .shared
                .lock()
                .concluded
                .get(endpoint)
                .is_some_and(|c| c.generation == session);
            if !still_connected {
                debug!(%endpoint, session, "endpoint left while committing, rolling back");
                self.commands.sign_off(endpoint, session);
                self.notifications.sign_off(endpoint, session);
                return;
            }
        }

        info!(
            %endpoint,
            ?status,
            commands = outcome.commands.len(),
            notifications = outcome.notifications.len(),
            "handshake concluded"
        );
        let _ = self.outcomes.send(outcome);
    }

    /// Failures are logged and leave the other kind unaffected.
    fn commit(
        &self,
        hub: &dyn SignInTarget,
        endpoint: &EndpointId,
        session: u64,
        selection: &OfferMatch,
    ) -> Vec<CapabilityDescriptor> {
        let kind: CapabilityKind = hub.kind();
        let selected = selection.selected(kind);
        if selected.is_empty() {
            return Vec::new();
        }
        match hub.sign_in(endpoint, session, &selected) {
            Ok(installed) => installed,
            Err(err) => {
                warn!(%endpoint, ?kind, "failed to commit capabilities: {err}");
                Vec::new()
            }
        }
    }
}
