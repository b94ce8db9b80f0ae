//! Gesture handling on the companion device.

use std::sync::Arc;

use flick_core::{Command, SettingsRecord, WireMessage};
use flick_link::{LinkSession, PendingSend};
use tracing::{debug, info, warn};

use crate::{backends::FeedbackSink, error::FlickError, sync_bridge::SyncBridge};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Gesture {
    FlickForward,
    FlickBackward,
    Tap,
}

/// Maps a gesture to the command it triggers under `settings`.
///
/// A reversed flick direction swaps next and previous. Taps only toggle
/// playback while gestures are enabled.
pub fn command_for_gesture(gesture: Gesture, settings: &SettingsRecord) -> Option<Command> {
    let reversed = settings.flick_direction_reversed;
    match gesture {
        Gesture::FlickForward if reversed => Some(Command::PreviousTrack),
        Gesture::FlickForward => Some(Command::NextTrack),
        Gesture::FlickBackward if reversed => Some(Command::NextTrack),
        Gesture::FlickBackward => Some(Command::PreviousTrack),
        Gesture::Tap if settings.gestures_enabled => Some(Command::PlayPause),
        Gesture::Tap => None,
    }
}

pub struct Companion {
    bridge: Arc<SyncBridge>,
    link: Arc<LinkSession>,
    feedback: Arc<dyn FeedbackSink>,
}

impl Companion {
    pub fn new(
        bridge: Arc<SyncBridge>,
        link: Arc<LinkSession>,
        feedback: Arc<dyn FeedbackSink>,
    ) -> Self {
        Self {
            bridge,
            link,
            feedback,
        }
    }

    pub fn bridge(&self) -> &Arc<SyncBridge> {
        &self.bridge
    }

    /// Relays the command for `gesture` to the primary device.
    ///
    /// Returns `Ok(None)` when the gesture maps to nothing. A closed send
    /// gate is reported once through the feedback sink and returned as
    /// [`FlickError::LinkUnavailable`].
    pub fn handle_gesture(&self, gesture: Gesture) -> Result<Option<PendingSend>, FlickError> {
        let Some(command) = command_for_gesture(gesture, &self.bridge.settings()) else {
            debug!(?gesture, "gesture ignored");
            return Ok(None);
        };

        match self.link.send(&WireMessage::Command(command)) {
            Ok(pending) => {
                info!(?gesture, %command, "command sent to primary");
                self.feedback.command_accepted();
                Ok(Some(pending))
            }
            Err(err) => {
                let error = FlickError::LinkUnavailable(err.to_string());
                warn!(%command, "{}", error);
                self.feedback.command_failed(&error);
                Err(error)
            }
        }
    }

    /// Marks the companion's half of setup as done.
    pub fn complete_tutorial(&self) -> SettingsRecord {
        info!("tutorial completed");
        self.bridge
            .update_local(|settings| settings.tutorial_completed = true)
    }

    pub fn replay_tutorial(&self) -> SettingsRecord {
        self.bridge
            .update_local(|settings| settings.tutorial_completed = false)
    }

    pub fn set_flick_direction_reversed(&self, reversed: bool) -> SettingsRecord {
        self.bridge
            .update_local(|settings| settings.flick_direction_reversed = reversed)
    }

    pub fn set_gestures_enabled(&self, enabled: bool) -> SettingsRecord {
        self.bridge
            .update_local(|settings| settings.gestures_enabled = enabled)
    }
}
