//! Reachability-aware messaging session between the companion and the
//! primary device.
//!
//! The platform side is abstracted behind [`LinkTransport`]; lifecycle
//! callbacks from the platform arrive as [`TransportEvent`]s and are applied
//! by a single event task, so link state is only mutated in one place.

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use flick_core::{CoreError, WireMessage, decode_frame, encode_frame};
use thiserror::Error;
use tokio::{
    sync::{mpsc, oneshot, watch},
    time::timeout,
};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, info, warn};

pub mod memory;

pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivationState {
    Inactive,
    Activating,
    Activated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkState {
    pub activation: ActivationState,
    pub reachable: bool,
}

impl Default for LinkState {
    fn default() -> Self {
        Self {
            activation: ActivationState::Inactive,
            reachable: false,
        }
    }
}

impl LinkState {
    pub fn can_send(&self) -> Result<(), LinkError> {
        if self.activation != ActivationState::Activated {
            return Err(LinkError::NotActivated);
        }
        if !self.reachable {
            return Err(LinkError::Unreachable);
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("link session is not activated")]
    NotActivated,
    #[error("peer is not reachable")]
    Unreachable,
    #[error("failed to encode message: {0}")]
    Encode(CoreError),
    #[error("link session is closed")]
    Closed,
    #[error("inbound stream already has a subscriber")]
    AlreadySubscribed,
}

/// Lifecycle callbacks raised by the platform session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    ActivationCompleted { activated: bool, reachable: bool },
    ReachabilityChanged(bool),
    /// The platform is switching peers; sends are refused until re-activation.
    BecameInactive,
    /// The platform tore the session down and expects a fresh activation.
    Deactivated,
    Received(Vec<u8>),
}

#[async_trait]
pub trait LinkTransport: Send + Sync + 'static {
    /// Starts platform activation. Completion is reported through
    /// [`TransportEvent::ActivationCompleted`].
    fn request_activation(&self);

    /// Hands a frame to the platform and resolves on its acknowledgement or
    /// error callback.
    async fn deliver(&self, frame: Vec<u8>) -> Result<(), String>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    Acknowledged,
    SendFailed(String),
}

/// Resolution handle for a submitted message.
#[derive(Debug)]
pub struct PendingSend {
    kind: &'static str,
    rx: oneshot::Receiver<SendOutcome>,
}

impl PendingSend {
    pub fn kind(&self) -> &'static str {
        self.kind
    }

    pub async fn outcome(self) -> SendOutcome {
        self.rx
            .await
            .unwrap_or_else(|_| SendOutcome::SendFailed("link session closed".to_owned()))
    }
}

struct OutboundFrame {
    kind: &'static str,
    frame: Vec<u8>,
    reply: oneshot::Sender<SendOutcome>,
}

pub struct LinkSession {
    transport: Arc<dyn LinkTransport>,
    state_tx: watch::Sender<LinkState>,
    outbound_tx: mpsc::UnboundedSender<OutboundFrame>,
    inbound_rx: Mutex<Option<mpsc::UnboundedReceiver<WireMessage>>>,
}

impl LinkSession {
    /// Creates the session and spawns its event and outbound tasks.
    ///
    /// Must be called from within a tokio runtime. The session lives for the
    /// rest of the process.
    pub fn start(
        transport: Arc<dyn LinkTransport>,
        events: mpsc::UnboundedReceiver<TransportEvent>,
        ack_timeout: Duration,
    ) -> Arc<Self> {
        let (state_tx, _) = watch::channel(LinkState::default());
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        let session = Arc::new(Self {
            transport,
            state_tx,
            outbound_tx,
            inbound_rx: Mutex::new(Some(inbound_rx)),
        });

        tokio::spawn(event_task(session.clone(), events, inbound_tx));
        tokio::spawn(outbound_task(session.clone(), outbound_rx, ack_timeout));
        session
    }

    /// Requests activation unless the session is already active or activating.
    pub fn activate(&self) {
        let mut requested = false;
        self.state_tx.send_if_modified(|state| {
            if state.activation != ActivationState::Inactive {
                return false;
            }
            state.activation = ActivationState::Activating;
            requested = true;
            true
        });

        if requested {
            info!("link activation requested");
            self.transport.request_activation();
        } else {
            debug!("link activation already in progress or complete");
        }
    }

    pub fn state(&self) -> LinkState {
        *self.state_tx.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<LinkState> {
        self.state_tx.subscribe()
    }

    /// Submits a message to the peer.
    ///
    /// Gate failures are returned immediately; otherwise the returned handle
    /// resolves once the transport acknowledges, fails, or the acknowledgement
    /// timeout elapses.
    pub fn send(&self, message: &WireMessage) -> Result<PendingSend, LinkError> {
        self.state().can_send()?;

        let frame = encode_frame(message).map_err(LinkError::Encode)?;
        let (reply, rx) = oneshot::channel();
        let kind = message.kind();
        self.outbound_tx
            .send(OutboundFrame { kind, frame, reply })
            .map_err(|_| LinkError::Closed)?;
        Ok(PendingSend { kind, rx })
    }

    /// Takes the inbound message stream. Only one subscriber is allowed.
    pub fn subscribe(&self) -> Result<UnboundedReceiverStream<WireMessage>, LinkError> {
        self.inbound_rx
            .lock()
            .ok()
            .and_then(|mut guard| guard.take())
            .map(UnboundedReceiverStream::new)
            .ok_or(LinkError::AlreadySubscribed)
    }

    fn apply_event(&self, event: TransportEvent, inbound_tx: &mpsc::UnboundedSender<WireMessage>) {
        match event {
            TransportEvent::ActivationCompleted {
                activated,
                reachable,
            } => {
                self.state_tx.send_modify(|state| {
                    if activated {
                        state.activation = ActivationState::Activated;
                        state.reachable = reachable;
                    } else {
                        state.activation = ActivationState::Inactive;
                        state.reachable = false;
                    }
                });
                if activated {
                    info!(reachable, "link activated");
                } else {
                    warn!("link activation failed");
                }
            }
            TransportEvent::ReachabilityChanged(reachable) => {
                self.state_tx.send_if_modified(|state| {
                    let changed = state.reachable != reachable;
                    state.reachable = reachable;
                    changed
                });
                info!(reachable, "link reachability changed");
            }
            TransportEvent::BecameInactive => {
                self.state_tx.send_modify(|state| {
                    state.activation = ActivationState::Activating;
                });
                info!("link became inactive");
            }
            TransportEvent::Deactivated => {
                self.state_tx.send_modify(|state| {
                    *state = LinkState::default();
                });
                info!("link deactivated, reactivating");
                self.activate();
            }
            TransportEvent::Received(frame) => match decode_frame(&frame) {
                Ok(message) => {
                    debug!(kind = message.kind(), "link message received");
                    let _ = inbound_tx.send(message);
                }
                Err(err) => warn!("dropping undecodable frame: {}", err),
            },
        }
    }
}

async fn event_task(
    session: Arc<LinkSession>,
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
    inbound_tx: mpsc::UnboundedSender<WireMessage>,
) {
    while let Some(event) = events.recv().await {
        session.apply_event(event, &inbound_tx);
    }
    debug!("transport event stream closed");
}

async fn outbound_task(
    session: Arc<LinkSession>,
    mut outbound_rx: mpsc::UnboundedReceiver<OutboundFrame>,
    ack_timeout: Duration,
) {
    while let Some(OutboundFrame { kind, frame, reply }) = outbound_rx.recv().await {
        // Reachability may have changed while the frame was queued.
        if let Err(err) = session.state().can_send() {
            debug!(kind, "queued send dropped: {}", err);
            let _ = reply.send(SendOutcome::SendFailed(err.to_string()));
            continue;
        }

        let outcome = match timeout(ack_timeout, session.transport.deliver(frame)).await {
            Ok(Ok(())) => SendOutcome::Acknowledged,
            Ok(Err(reason)) => SendOutcome::SendFailed(reason),
            Err(_) => SendOutcome::SendFailed(format!(
                "no acknowledgement within {:?}",
                ack_timeout
            )),
        };
        match &outcome {
            SendOutcome::Acknowledged => debug!(kind, "send acknowledged"),
            SendOutcome::SendFailed(reason) => warn!(kind, "send failed: {}", reason),
        }
        let _ = reply.send(outcome);
    }
}
