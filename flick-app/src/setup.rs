//! Coarse onboarding phase shown by the primary device's UI.
//!
//! The phase only moves forward, driven by the two completion flags, which
//! are owned by different devices and may briefly disagree between
//! replicas. The one way back is an explicit [`SetupMachine::reset`].

use std::sync::Arc;

use flick_core::{PlaybackBackend, SettingsRecord};
use tokio::{
    sync::{broadcast::error::RecvError, watch},
    task::JoinHandle,
};
use tracing::{debug, info};

use crate::sync_bridge::SyncBridge;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SetupPhase {
    Welcome,
    PlaybackChoiceSelection,
    WaitingForCompanion,
    Main,
}

impl SetupPhase {
    pub fn initial(record: &SettingsRecord) -> Self {
        if record.setup_complete() {
            SetupPhase::Main
        } else if record.initial_setup_completed {
            SetupPhase::WaitingForCompanion
        } else {
            SetupPhase::Welcome
        }
    }
}

pub struct SetupMachine {
    bridge: Arc<SyncBridge>,
    phase: watch::Sender<SetupPhase>,
}

impl SetupMachine {
    pub fn new(bridge: Arc<SyncBridge>) -> Arc<Self> {
        let initial = SetupPhase::initial(&bridge.settings());
        info!(phase = ?initial, "setup phase initialized");
        let (phase, _) = watch::channel(initial);
        Arc::new(Self { bridge, phase })
    }

    pub fn phase(&self) -> SetupPhase {
        *self.phase.borrow()
    }

    pub fn watch(&self) -> watch::Receiver<SetupPhase> {
        self.phase.subscribe()
    }

    pub fn complete_welcome(&self) -> SetupPhase {
        self.advance_to(SetupPhase::PlaybackChoiceSelection)
    }

    /// Stores the chosen backend and marks this device's setup as done.
    pub fn complete_playback_choice(&self, backend: PlaybackBackend) -> SetupPhase {
        let record = self.bridge.update_local(|settings| {
            settings.playback_backend = backend;
            settings.initial_setup_completed = true;
        });
        info!(%backend, "playback choice completed");

        if record.tutorial_completed {
            self.advance_to(SetupPhase::Main)
        } else {
            self.advance_to(SetupPhase::WaitingForCompanion)
        }
    }

    /// Re-evaluates the forward condition against the current replica.
    pub fn reevaluate(&self) -> SetupPhase {
        let settings = self.bridge.settings();
        if settings.setup_complete() {
            self.advance_to(SetupPhase::Main)
        } else {
            debug!("settings changed, setup not complete on both devices yet");
            self.phase()
        }
    }

    /// Clears both completion flags and returns to the welcome phase.
    pub fn reset(&self) -> SetupPhase {
        self.bridge.update_local(|settings| {
            settings.tutorial_completed = false;
            settings.initial_setup_completed = false;
        });
        self.phase.send_replace(SetupPhase::Welcome);
        info!("setup reset to welcome, both flags cleared");
        SetupPhase::Welcome
    }

    /// Re-evaluates on every settings change, local or replicated.
    pub fn spawn_observer(self: &Arc<Self>) -> JoinHandle<()> {
        let machine = self.clone();
        let mut changes = self.bridge.subscribe();
        tokio::spawn(async move {
            loop {
                match changes.recv().await {
                    Ok(_) | Err(RecvError::Lagged(_)) => {
                        machine.reevaluate();
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }

    fn advance_to(&self, next: SetupPhase) -> SetupPhase {
        let mut from = next;
        let advanced = self.phase.send_if_modified(|phase| {
            from = *phase;
            if next > *phase {
                *phase = next;
                true
            } else {
                false
            }
        });
        if advanced {
            info!(from = ?from, to = ?next, "setup phase advanced");
        }
        self.phase()
    }
}
