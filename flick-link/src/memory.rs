//! In-process transport connecting two link sessions.
//!
//! Used by the simulator and by tests. A [`MemoryLinkControl`] handle plays
//! the role of the platform: it toggles reachability, tears sessions down and
//! injects delivery failures or delays.

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

use crate::{LinkTransport, TransportEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Companion,
    Primary,
}

impl Side {
    fn index(self) -> usize {
        match self {
            Side::Companion => 0,
            Side::Primary => 1,
        }
    }

    fn peer(self) -> Side {
        match self {
            Side::Companion => Side::Primary,
            Side::Primary => Side::Companion,
        }
    }
}

#[derive(Debug)]
struct LinkInner {
    reachable: bool,
    activated: [bool; 2],
    fail_with: Option<String>,
    delivery_delay: Duration,
}

#[derive(Debug)]
struct Shared {
    inner: Mutex<LinkInner>,
    events: [mpsc::UnboundedSender<TransportEvent>; 2],
}

impl Shared {
    fn emit(&self, side: Side, event: TransportEvent) {
        let _ = self.events[side.index()].send(event);
    }
}

/// One device's end of an in-memory link.
#[derive(Debug, Clone)]
pub struct MemoryEndpoint {
    side: Side,
    shared: Arc<Shared>,
}

/// Platform-side control over an in-memory link.
#[derive(Debug, Clone)]
pub struct MemoryLinkControl {
    shared: Arc<Shared>,
}

pub struct MemoryPair {
    pub companion: MemoryEndpoint,
    pub companion_events: mpsc::UnboundedReceiver<TransportEvent>,
    pub primary: MemoryEndpoint,
    pub primary_events: mpsc::UnboundedReceiver<TransportEvent>,
    pub control: MemoryLinkControl,
}

/// Creates a connected pair of endpoints. The peers start out reachable.
pub fn pair() -> MemoryPair {
    let (companion_tx, companion_events) = mpsc::unbounded_channel();
    let (primary_tx, primary_events) = mpsc::unbounded_channel();
    let shared = Arc::new(Shared {
        inner: Mutex::new(LinkInner {
            reachable: true,
            activated: [false, false],
            fail_with: None,
            delivery_delay: Duration::ZERO,
        }),
        events: [companion_tx, primary_tx],
    });

    MemoryPair {
        companion: MemoryEndpoint {
            side: Side::Companion,
            shared: shared.clone(),
        },
        companion_events,
        primary: MemoryEndpoint {
            side: Side::Primary,
            shared: shared.clone(),
        },
        primary_events,
        control: MemoryLinkControl { shared },
    }
}

impl MemoryEndpoint {
    pub fn side(&self) -> Side {
        self.side
    }
}

#[async_trait]
impl LinkTransport for MemoryEndpoint {
    fn request_activation(&self) {
        let reachable = match self.shared.inner.lock() {
            Ok(mut inner) => {
                inner.activated[self.side.index()] = true;
                inner.reachable
            }
            Err(_) => {
                self.shared.emit(
                    self.side,
                    TransportEvent::ActivationCompleted {
                        activated: false,
                        reachable: false,
                    },
                );
                return;
            }
        };
        self.shared.emit(
            self.side,
            TransportEvent::ActivationCompleted {
                activated: true,
                reachable,
            },
        );
    }

    async fn deliver(&self, frame: Vec<u8>) -> Result<(), String> {
        let delay = self
            .shared
            .inner
            .lock()
            .map(|inner| inner.delivery_delay)
            .map_err(|_| "link state poisoned".to_owned())?;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let peer = self.side.peer();
        {
            let inner = self
                .shared
                .inner
                .lock()
                .map_err(|_| "link state poisoned".to_owned())?;
            if let Some(reason) = inner.fail_with.as_ref() {
                return Err(reason.clone());
            }
            if !inner.reachable || !inner.activated[peer.index()] {
                return Err("peer unreachable".to_owned());
            }
        }

        debug!(from = ?self.side, bytes = frame.len(), "memory link delivering frame");
        self.shared.emit(peer, TransportEvent::Received(frame));
        Ok(())
    }
}

impl MemoryLinkControl {
    /// Changes reachability and notifies every activated side.
    pub fn set_reachable(&self, reachable: bool) {
        let activated = match self.shared.inner.lock() {
            Ok(mut inner) => {
                inner.reachable = reachable;
                inner.activated
            }
            Err(_) => return,
        };
        for side in [Side::Companion, Side::Primary] {
            if activated[side.index()] {
                self.shared
                    .emit(side, TransportEvent::ReachabilityChanged(reachable));
            }
        }
    }

    /// Makes every subsequent delivery fail with `reason` (or succeed again).
    pub fn set_failure(&self, reason: Option<&str>) {
        if let Ok(mut inner) = self.shared.inner.lock() {
            inner.fail_with = reason.map(str::to_owned);
        }
    }

    pub fn set_delivery_delay(&self, delay: Duration) {
        if let Ok(mut inner) = self.shared.inner.lock() {
            inner.delivery_delay = delay;
        }
    }

    /// Tears down one side's session as the platform would.
    pub fn deactivate(&self, side: Side) {
        if let Ok(mut inner) = self.shared.inner.lock() {
            inner.activated[side.index()] = false;
        }
        self.shared.emit(side, TransportEvent::Deactivated);
    }

    pub fn make_inactive(&self, side: Side) {
        self.shared.emit(side, TransportEvent::BecameInactive);
    }

    /// Delivers raw bytes to `side` without framing them.
    pub fn inject_raw(&self, side: Side, bytes: Vec<u8>) {
        self.shared.emit(side, TransportEvent::Received(bytes));
    }
}
