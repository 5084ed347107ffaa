//! WebSocket implementation of [`ProtocolLayer`].
//!
//! Every connection starts with a [`Frame::Hello`] in both directions; the
//! remote endpoint is announced as connected once its hello arrives. After
//! that each text frame carries one [`Envelope`].

use crate::wire::Frame;
use accord_core::{EndpointId, Envelope, MessageId};
use accord_interaction::{InboundEvent, ProtocolLayer, TransportError};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;

type Reply = oneshot::Sender<Result<Envelope, TransportError>>;

struct Connection {
    id: u64,
    /// Whether this side dialed.
    outbound: bool,
    frames: mpsc::UnboundedSender<String>,
}

#[derive(Default)]
struct Links {
    connections: HashMap<EndpointId, Connection>,
    pending: HashMap<MessageId, (EndpointId, Reply)>,
}

/// Drops the pending entry when the caller stops waiting, answered or not.
struct PendingRequest<'a> {
    links: &'a Mutex<Links>,
    id: MessageId,
}

impl Drop for PendingRequest<'_> {
    fn drop(&mut self) {
        self.links.lock().pending.remove(&self.id);
    }
}

/// WebSocket transport shared by every connection of one peer.
pub struct WsTransport {
    local: EndpointId,
    events: mpsc::UnboundedSender<InboundEvent>,
    links: Mutex<Links>,
    next_connection: AtomicU64,
}

impl WsTransport {
    /// Returns the transport and the event stream to feed into an
    /// `InteractionNode`.
    pub fn new(local: EndpointId) -> (Arc<Self>, mpsc::UnboundedReceiver<InboundEvent>) {
        let (events, receiver) = mpsc::unbounded_channel();
        let transport = Arc::new(Self {
            local,
            events,
            links: Mutex::new(Links::default()),
            next_connection: AtomicU64::new(1),
        });
        (transport, receiver)
    }

    pub fn connected(&self) -> Vec<EndpointId> {
        let mut endpoints: Vec<_> = self.links.lock().connections.keys().cloned().collect();
        endpoints.sort();
        endpoints
    }

    /// Accept connections on `addr` until the listener fails.
    pub async fn listen(self: Arc<Self>, addr: SocketAddr) -> anyhow::Result<()> {
        let listener = TcpListener::bind(addr).await?;
        tracing::info!("Listening on ws://{}", addr);

        loop {
            let (stream, peer_addr) = listener.accept().await?;
            let transport = self.clone();
            tokio::spawn(async move {
                match tokio_tungstenite::accept_async(stream).await {
                    Ok(ws) => {
                        if let Err(e) = transport.serve(ws, false).await {
                            tracing::warn!("Connection error from {}: {}", peer_addr, e);
                        }
                    }
                    Err(e) => {
                        tracing::warn!("WebSocket handshake with {} failed: {}", peer_addr, e)
                    }
                }
            });
        }
    }

    /// Dial `url`, retrying every `redial` until it answers, then serve the
    /// connection until it closes.
    pub async fn dial(self: Arc<Self>, url: String, redial: Duration) {
        let ws = loop {
            match tokio_tungstenite::connect_async(url.as_str()).await {
                Ok((ws, _)) => break ws,
                Err(e) => {
                    tracing::debug!("Dialing {} failed: {}; retrying", url, e);
                    tokio::time::sleep(redial).await;
                }
            }
        };
        tracing::info!("Connected to {}", url);
        if let Err(e) = self.serve(ws, true).await {
            tracing::warn!("Connection error with {}: {}", url, e);
        }
    }

    async fn serve<S>(self: Arc<Self>, ws: WebSocketStream<S>, outbound: bool) -> anyhow::Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (mut sink, mut stream) = ws.split();

        let hello = Frame::Hello {
            endpoint: self.local.clone(),
        };
        sink.send(Message::Text(hello.encode()?.into())).await?;

        let remote = loop {
            let msg = stream
                .next()
                .await
                .ok_or_else(|| anyhow::anyhow!("connection closed before hello"))??;
            if let Message::Text(text) = msg {
                match Frame::decode(&text)? {
                    Frame::Hello { endpoint } => break endpoint,
                    Frame::Envelope(_) => anyhow::bail!("envelope before hello"),
                }
            }
        };

        let (frames, mut outgoing) = mpsc::unbounded_channel::<String>();
        let id = self.next_connection.fetch_add(1, Ordering::Relaxed);
        if !self.register(&remote, Connection { id, outbound, frames }) {
            tracing::debug!("Dropping duplicate connection to {}", remote);
            return Ok(());
        }

        let writer = tokio::spawn(async move {
            while let Some(text) = outgoing.recv().await {
                if sink.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        while let Some(msg) = stream.next().await {
            let msg = match msg {
                Ok(msg) => msg,
                Err(e) => {
                    tracing::debug!("WebSocket error from {}: {}", remote, e);
                    break;
                }
            };
            match msg {
                Message::Text(text) => match Frame::decode(&text) {
                    Ok(Frame::Envelope(envelope)) => self.received(envelope),
                    Ok(Frame::Hello { .. }) => tracing::warn!("Repeated hello from {}", remote),
                    Err(e) => tracing::warn!("Invalid frame from {}: {}", remote, e),
                },
                Message::Close(_) => break,
                _ => {}
            }
        }

        writer.abort();
        self.unregister(&remote, id);
        Ok(())
    }

    /// Install the connection unless a preferred one exists. Two peers that
    /// dial each other keep the connection dialed by the smaller id.
    fn register(&self, remote: &EndpointId, connection: Connection) -> bool {
        let mut links = self.links.lock();
        if let Some(existing) = links.connections.get(remote) {
            let preferred_outbound = self.local < *remote;
            let keep_existing = existing.outbound == preferred_outbound;
            if keep_existing || connection.outbound != preferred_outbound {
                return false;
            }
        }
        let announce = !links.connections.contains_key(remote);
        links.connections.insert(remote.clone(), connection);
        drop(links);
        if announce {
            tracing::info!("Endpoint {} connected", remote);
            let _ = self.events.send(InboundEvent::Connected(remote.clone()));
        }
        true
    }

    fn unregister(&self, remote: &EndpointId, id: u64) {
        let failed: Vec<Reply> = {
            let mut links = self.links.lock();
            if links.connections.get(remote).is_none_or(|c| c.id != id) {
                return;
            }
            links.connections.remove(remote);
            let ids: Vec<MessageId> = links
                .pending
                .iter()
                .filter(|(_, (to, _))| to == remote)
                .map(|(id, _)| *id)
                .collect();
            ids.iter()
                .filter_map(|id| links.pending.remove(id))
                .map(|(_, reply)| reply)
                .collect()
        };
        for reply in failed {
            let _ = reply.send(Err(TransportError::Disconnected(remote.clone())));
        }
        tracing::info!("Endpoint {} disconnected", remote);
        let _ = self.events.send(InboundEvent::Disconnected(remote.clone()));
    }

    fn received(&self, envelope: Envelope) {
        let waiting = envelope
            .in_response_to()
            .and_then(|id| self.links.lock().pending.remove(&id));
        match waiting {
            Some((_, reply)) => {
                let _ = reply.send(Ok(envelope));
            }
            None => {
                let _ = self.events.send(InboundEvent::Message(envelope));
            }
        }
    }

    fn write(&self, endpoint: &EndpointId, envelope: Envelope) -> Result<(), TransportError> {
        let text = Frame::Envelope(envelope)
            .encode()
            .map_err(|e| TransportError::Encoding(e.to_string()))?;
        let links = self.links.lock();
        let connection = links
            .connections
            .get(endpoint)
            .ok_or_else(|| TransportError::EndpointUnreachable(endpoint.clone()))?;
        connection
            .frames
            .send(text)
            .map_err(|_| TransportError::Disconnected(endpoint.clone()))
    }
}

#[async_trait]
impl ProtocolLayer for WsTransport {
    fn local_endpoint(&self) -> &EndpointId {
        &self.local
    }

    async fn send_message_to(
        &self,
        endpoint: &EndpointId,
        envelope: Envelope,
    ) -> Result<(), TransportError> {
        self.write(endpoint, envelope)
    }

    async fn send_message_and_await(
        &self,
        endpoint: &EndpointId,
        envelope: Envelope,
    ) -> Result<Envelope, TransportError> {
        let id = envelope.id;
        let (reply, response) = oneshot::channel();
        self.links.lock().pending.insert(id, (endpoint.clone(), reply));
        let _pending = PendingRequest {
            links: &self.links,
            id,
        };

        self.write(endpoint, envelope)?;
        response
            .await
            .unwrap_or_else(|_| Err(TransportError::Disconnected(endpoint.clone())))
    }
}
