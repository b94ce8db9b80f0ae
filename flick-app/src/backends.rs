//! Contracts for the playback backends and the feedback sink.
//!
//! The backends' own protocols live outside this crate; the dispatcher only
//! needs connect/command/disconnect.

use std::sync::Arc;

use async_trait::async_trait;
use flick_core::AccessToken;
use tokio::sync::mpsc;
use url::Url;

use crate::error::FlickError;

/// System media-session control. Always available and synchronous.
pub trait NativeMediaPlayer: Send + Sync {
    fn skip_to_next(&self);
    fn skip_to_previous(&self);
    fn is_playing(&self) -> bool;
    fn play(&self);
    fn pause(&self);
}

/// Player surface of a connected remote-control session.
#[async_trait]
pub trait PlayerControl: Send + Sync {
    async fn skip_next(&self) -> Result<(), String>;
    async fn skip_previous(&self) -> Result<(), String>;
    async fn is_paused(&self) -> Result<bool, String>;
    async fn resume(&self) -> Result<(), String>;
    async fn pause(&self) -> Result<(), String>;
}

/// Connection lifecycle of the remote-control backend.
///
/// `connect` and `disconnect` only start the operation; results come back as
/// [`RemoteEvent`]s through the sender handed to the platform.
pub trait RemoteControlPlatform: Send + Sync {
    fn connect(&self, token: &AccessToken);
    fn disconnect(&self);
    /// `None` until a connection has handed out its player surface.
    fn player(&self) -> Option<Arc<dyn PlayerControl>>;
    /// Launches the backend's authorization flow. Returns `false` when the
    /// backend app is not available to run it.
    fn begin_authorization(&self) -> bool;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteEvent {
    Connected,
    ConnectFailed(String),
    Disconnected(Option<String>),
}

/// Handed to the platform so its connection callbacks reach the dispatcher.
#[derive(Debug, Clone)]
pub struct RemoteEventSender {
    tx: mpsc::UnboundedSender<RemoteEvent>,
}

impl RemoteEventSender {
    pub fn send(&self, event: RemoteEvent) {
        let _ = self.tx.send(event);
    }
}

pub fn remote_event_channel() -> (RemoteEventSender, mpsc::UnboundedReceiver<RemoteEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (RemoteEventSender { tx }, rx)
}

/// Opens URL-scheme targets on the primary device.
#[async_trait]
pub trait UrlOpener: Send + Sync {
    /// Resolves to `false` if the target could not be opened.
    async fn open(&self, url: &Url) -> bool;
}

/// Fire-and-forget user feedback (haptics).
pub trait FeedbackSink: Send + Sync {
    fn command_accepted(&self);
    fn command_failed(&self, error: &FlickError);
}

#[derive(Clone)]
pub struct Backends {
    pub native: Arc<dyn NativeMediaPlayer>,
    pub remote: Arc<dyn RemoteControlPlatform>,
    pub shortcuts: Arc<dyn UrlOpener>,
    pub feedback: Arc<dyn FeedbackSink>,
}
