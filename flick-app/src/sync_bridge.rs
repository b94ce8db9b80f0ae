use std::sync::{Arc, Mutex, PoisonError};

use flick_core::{SettingsRecord, WireMessage};
use flick_link::LinkSession;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::{error::FlickError, settings_store::SettingsStore};

const CHANGE_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOrigin {
    Local,
    Remote,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SettingsChange {
    pub record: SettingsRecord,
    pub origin: ChangeOrigin,
}

/// Replicates the settings record to the peer and fans out change
/// notifications on this device.
///
/// Local writes and inbound replicas share one write lock, so the store only
/// ever holds a whole local record or a whole remote record.
pub struct SyncBridge {
    store: Arc<SettingsStore>,
    link: Arc<LinkSession>,
    write_lock: Mutex<()>,
    changes: broadcast::Sender<SettingsChange>,
}

impl SyncBridge {
    pub fn new(store: Arc<SettingsStore>, link: Arc<LinkSession>) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            store,
            link,
            write_lock: Mutex::new(()),
            changes,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SettingsChange> {
        self.changes.subscribe()
    }

    pub fn settings(&self) -> SettingsRecord {
        self.store.read()
    }

    pub fn store(&self) -> &Arc<SettingsStore> {
        &self.store
    }

    /// Replaces the local record and pushes it to the peer.
    pub fn write_local(&self, record: SettingsRecord) -> SettingsRecord {
        self.update_local(|current| *current = record)
    }

    /// Modifies the local record and pushes the result to the peer.
    pub fn update_local<F>(&self, apply: F) -> SettingsRecord
    where
        F: FnOnce(&mut SettingsRecord),
    {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let (record, persisted) = self.store.update(apply);
        if let Err(err) = persisted {
            warn!("{}", FlickError::PersistenceUnavailable(err.to_string()));
        }
        self.notify(record, ChangeOrigin::Local);
        self.push(record);
        record
    }

    /// Rewrites the record to its defaults on both devices.
    pub fn reset_to_defaults(&self) -> SettingsRecord {
        info!("resetting settings to defaults");
        self.write_local(SettingsRecord::default())
    }

    /// Overwrites the local replica with a record received from the peer.
    pub fn apply_remote(&self, record: SettingsRecord) {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        if let Err(err) = self.store.write(record) {
            warn!("{}", FlickError::PersistenceUnavailable(err.to_string()));
        }
        debug!(?record, "applied replicated settings");
        self.notify(record, ChangeOrigin::Remote);
    }

    fn notify(&self, record: SettingsRecord, origin: ChangeOrigin) {
        // No subscribers is fine.
        let _ = self.changes.send(SettingsChange { record, origin });
    }

    /// Best effort: a failed push is dropped and only superseded by the next
    /// local write.
    fn push(&self, record: SettingsRecord) {
        match self.link.send(&WireMessage::Settings(record)) {
            Ok(_pending) => debug!("settings push submitted"),
            Err(err) => debug!("settings push skipped: {}", err),
        }
    }
}
