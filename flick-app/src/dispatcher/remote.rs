use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::backends::RemoteEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Connection state of the remote-control backend.
///
/// Each connect attempt gets a number so a guard timer armed for an old
/// attempt cannot tear down a newer one.
pub(crate) struct RemoteConnection {
    state: watch::Sender<ConnectionState>,
    attempt: u64,
}

impl RemoteConnection {
    pub(crate) fn new() -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self { state, attempt: 0 }
    }

    pub(crate) fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub(crate) fn watch(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// `disconnected -> connecting`. Returns the attempt number, or `None` if
    /// a connection is already up or in flight.
    pub(crate) fn begin_connect(&mut self) -> Option<u64> {
        if self.state() != ConnectionState::Disconnected {
            return None;
        }
        self.attempt += 1;
        self.set(ConnectionState::Connecting);
        info!(attempt = self.attempt, "remote connect started");
        Some(self.attempt)
    }

    /// Connect outcomes only count for the attempt in flight. A callback that
    /// arrives after the guard expired or after a requested disconnect is
    /// dropped.
    pub(crate) fn on_event(&mut self, event: &RemoteEvent) -> ConnectionState {
        let is_outcome = matches!(event, RemoteEvent::Connected | RemoteEvent::ConnectFailed(_));
        if is_outcome && self.state() != ConnectionState::Connecting {
            debug!(?event, state = ?self.state(), "ignoring stale remote callback");
            return self.state();
        }
        match event {
            RemoteEvent::Connected => {
                info!("remote connected");
                self.set(ConnectionState::Connected);
            }
            RemoteEvent::ConnectFailed(reason) => {
                warn!("remote connection failed: {}", reason);
                self.set(ConnectionState::Disconnected);
            }
            RemoteEvent::Disconnected(reason) => {
                info!(reason = reason.as_deref().unwrap_or("none"), "remote disconnected");
                self.set(ConnectionState::Disconnected);
            }
        }
        self.state()
    }

    /// Reverts a connect attempt that never got a platform callback.
    pub(crate) fn expire(&mut self, attempt: u64) -> bool {
        if attempt != self.attempt || self.state() != ConnectionState::Connecting {
            return false;
        }
        warn!(attempt, "remote connect timed out");
        self.set(ConnectionState::Disconnected);
        true
    }

    pub(crate) fn mark_disconnected(&mut self) {
        self.set(ConnectionState::Disconnected);
    }

    fn set(&self, next: ConnectionState) {
        self.state.send_if_modified(|state| {
            let changed = *state != next;
            *state = next;
            changed
        });
    }
}
