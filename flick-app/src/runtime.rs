//! Per-device wiring: each device constructs its services once at startup
//! and passes handles explicitly.

use std::{path::Path, sync::Arc};

use flick_core::{SettingsRecord, WireMessage};
use flick_link::{LinkError, LinkSession, LinkTransport, TransportEvent};
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, info, warn};

use crate::{
    backends::{Backends, FeedbackSink, RemoteEvent},
    companion::Companion,
    config::AppConfig,
    dispatcher::{Dispatcher, DispatcherHandle},
    error::FlickError,
    settings_store::{SettingsStore, TokenStore},
    setup::SetupMachine,
    storage::{FileStorage, MemoryStorage, RecordStorage},
    sync_bridge::SyncBridge,
};

pub const SETTINGS_FILE_NAME: &str = "settings.json";
pub const TOKEN_FILE_NAME: &str = "remote_token.json";

/// Backing storage for one device's settings and token documents.
pub struct DeviceStorage {
    pub settings: Box<dyn RecordStorage>,
    pub tokens: Box<dyn RecordStorage>,
}

impl DeviceStorage {
    pub fn in_dir(dir: &Path) -> Self {
        if let Err(err) = std::fs::create_dir_all(dir) {
            warn!(
                "{}",
                FlickError::PersistenceUnavailable(format!(
                    "failed to create {}: {err}",
                    dir.display()
                ))
            );
        }
        Self {
            settings: Box::new(FileStorage::new(dir.join(SETTINGS_FILE_NAME))),
            tokens: Box::new(FileStorage::new(dir.join(TOKEN_FILE_NAME))),
        }
    }

    pub fn in_memory() -> Self {
        Self {
            settings: Box::new(MemoryStorage::new()),
            tokens: Box::new(MemoryStorage::new()),
        }
    }
}

/// Transport end and platform event stream for one device's link session.
pub struct LinkEndpoint {
    pub transport: Arc<dyn LinkTransport>,
    pub events: mpsc::UnboundedReceiver<TransportEvent>,
}

pub struct PrimaryDevice {
    pub link: Arc<LinkSession>,
    pub bridge: Arc<SyncBridge>,
    pub setup: Arc<SetupMachine>,
    pub dispatcher: DispatcherHandle,
    pub tokens: Arc<TokenStore>,
}

impl PrimaryDevice {
    /// Starts every primary-side service and activates the link.
    pub fn start(
        config: &AppConfig,
        storage: DeviceStorage,
        endpoint: LinkEndpoint,
        backends: Backends,
        remote_events: mpsc::UnboundedReceiver<RemoteEvent>,
    ) -> Result<Self, LinkError> {
        let settings = Arc::new(SettingsStore::open(storage.settings));
        let tokens = Arc::new(TokenStore::open(storage.tokens));

        let link = LinkSession::start(
            endpoint.transport,
            endpoint.events,
            config.send_ack_timeout(),
        );
        let inbound = link.subscribe()?;

        let bridge = Arc::new(SyncBridge::new(settings.clone(), link.clone()));
        let dispatcher = Dispatcher::spawn(
            config.dispatcher(),
            settings,
            tokens.clone(),
            backends,
            remote_events,
        );
        let setup = SetupMachine::new(bridge.clone());
        setup.spawn_observer();

        tokio::spawn(route_primary_inbound(
            inbound,
            bridge.clone(),
            dispatcher.clone(),
        ));
        link.activate();
        info!("primary device started");

        Ok(Self {
            link,
            bridge,
            setup,
            dispatcher,
            tokens,
        })
    }
}

pub struct CompanionDevice {
    pub link: Arc<LinkSession>,
    pub bridge: Arc<SyncBridge>,
    pub companion: Companion,
}

impl CompanionDevice {
    pub fn start(
        config: &AppConfig,
        storage: DeviceStorage,
        endpoint: LinkEndpoint,
        feedback: Arc<dyn FeedbackSink>,
    ) -> Result<Self, LinkError> {
        let settings = Arc::new(SettingsStore::open(storage.settings));
        let link = LinkSession::start(
            endpoint.transport,
            endpoint.events,
            config.send_ack_timeout(),
        );
        let inbound = link.subscribe()?;

        let bridge = Arc::new(SyncBridge::new(settings, link.clone()));
        let companion = Companion::new(bridge.clone(), link.clone(), feedback);

        tokio::spawn(route_companion_inbound(inbound, bridge.clone()));
        link.activate();
        info!("companion device started");

        Ok(Self {
            link,
            bridge,
            companion,
        })
    }
}

/// Storage writes may sleep between retries, so they run on the blocking
/// pool. Awaiting each one keeps inbound records applied in arrival order.
async fn apply_remote_off_loop(bridge: &Arc<SyncBridge>, record: SettingsRecord) {
    let bridge = bridge.clone();
    if let Err(err) = tokio::task::spawn_blocking(move || bridge.apply_remote(record)).await {
        warn!("applying inbound settings panicked: {}", err);
    }
}

async fn route_primary_inbound(
    mut inbound: UnboundedReceiverStream<WireMessage>,
    bridge: Arc<SyncBridge>,
    dispatcher: DispatcherHandle,
) {
    while let Some(message) = inbound.next().await {
        match message {
            WireMessage::Command(command) => {
                dispatcher.dispatch(command);
            }
            WireMessage::Settings(record) => apply_remote_off_loop(&bridge, record).await,
        }
    }
    debug!("primary inbound stream ended");
}

async fn route_companion_inbound(
    mut inbound: UnboundedReceiverStream<WireMessage>,
    bridge: Arc<SyncBridge>,
) {
    while let Some(message) = inbound.next().await {
        match message {
            WireMessage::Settings(record) => apply_remote_off_loop(&bridge, record).await,
            WireMessage::Command(command) => {
                warn!(%command, "companion ignores relayed commands");
            }
        }
    }
    debug!("companion inbound stream ended");
}
