use std::sync::{Mutex, PoisonError};

use flick_core::{AccessToken, SETTINGS_KEY, SettingsRecord};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::{
    error::FlickError,
    storage::{RecordStorage, StoreError},
};

/// Device-local replica of the shared settings.
///
/// The replica is cached in memory and swapped whole, so a reader never sees
/// a half-applied record. Persisting happens outside the replica lock; reads
/// never wait on storage.
pub struct SettingsStore {
    storage: Box<dyn RecordStorage>,
    current: Mutex<SettingsRecord>,
    persist_lock: Mutex<()>,
}

impl SettingsStore {
    /// Loads the replica, falling back to defaults when the store is missing
    /// or unusable.
    pub fn open(storage: Box<dyn RecordStorage>) -> Self {
        let current = match load_record(storage.as_ref()) {
            Ok(Some(record)) => record,
            Ok(None) => {
                debug!("no stored settings, using defaults");
                SettingsRecord::default()
            }
            Err(err) => {
                warn!(
                    "{}; using default settings",
                    FlickError::PersistenceUnavailable(err.to_string())
                );
                SettingsRecord::default()
            }
        };

        Self {
            storage,
            current: Mutex::new(current),
            persist_lock: Mutex::new(()),
        }
    }

    pub fn read(&self) -> SettingsRecord {
        *self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replaces the whole record.
    ///
    /// The in-memory replica is updated even when persisting fails, so the
    /// device keeps working for the rest of the session.
    pub fn write(&self, record: SettingsRecord) -> Result<(), StoreError> {
        *self.current.lock().unwrap_or_else(PoisonError::into_inner) = record;
        self.persist_current()
    }

    /// Read-modify-write of the cached replica, then persist.
    pub fn update<F>(&self, apply: F) -> (SettingsRecord, Result<(), StoreError>)
    where
        F: FnOnce(&mut SettingsRecord),
    {
        let record = {
            let mut current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
            apply(&mut *current);
            *current
        };
        (record, self.persist_current())
    }

    /// Writes whatever the replica holds once the previous persist is done,
    /// so the stored document always ends on the latest record.
    fn persist_current(&self) -> Result<(), StoreError> {
        let _persist = self
            .persist_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        persist_record(self.storage.as_ref(), &self.read())
    }
}

fn load_record(storage: &dyn RecordStorage) -> Result<Option<SettingsRecord>, StoreError> {
    let Some(document) = storage.read()? else {
        return Ok(None);
    };
    let mut map: Map<String, Value> =
        serde_json::from_str(&document).map_err(StoreError::Parse)?;
    match map.remove(SETTINGS_KEY) {
        Some(value) => serde_json::from_value(value)
            .map(Some)
            .map_err(StoreError::Parse),
        None => Ok(None),
    }
}

fn persist_record(storage: &dyn RecordStorage, record: &SettingsRecord) -> Result<(), StoreError> {
    let mut map = Map::new();
    map.insert(
        SETTINGS_KEY.to_owned(),
        serde_json::to_value(record).map_err(StoreError::Serialize)?,
    );
    let document = serde_json::to_string_pretty(&map).map_err(StoreError::Serialize)?;
    storage.write(&document)
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TokenDocument {
    #[serde(default)]
    access_token: Option<AccessToken>,
}

/// Cached remote-control authorization token.
///
/// Independent of the connection state and kept across restarts.
pub struct TokenStore {
    storage: Box<dyn RecordStorage>,
    cached: Mutex<Option<AccessToken>>,
}

impl TokenStore {
    pub fn open(storage: Box<dyn RecordStorage>) -> Self {
        let cached = match storage.read() {
            Ok(Some(document)) => match serde_json::from_str::<TokenDocument>(&document) {
                Ok(doc) => doc.access_token,
                Err(err) => {
                    warn!("stored token unreadable, ignoring: {}", err);
                    None
                }
            },
            Ok(None) => None,
            Err(err) => {
                warn!("{}", FlickError::PersistenceUnavailable(err.to_string()));
                None
            }
        };

        Self {
            storage,
            cached: Mutex::new(cached),
        }
    }

    pub fn get(&self) -> Option<AccessToken> {
        self.cached
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn save(&self, token: AccessToken) -> Result<(), StoreError> {
        self.replace(Some(token))
    }

    pub fn clear(&self) -> Result<(), StoreError> {
        self.replace(None)
    }

    fn replace(&self, token: Option<AccessToken>) -> Result<(), StoreError> {
        let mut cached = self.cached.lock().unwrap_or_else(PoisonError::into_inner);
        *cached = token.clone();
        let document = serde_json::to_string_pretty(&TokenDocument {
            access_token: token,
        })
        .map_err(StoreError::Serialize)?;
        self.storage.write(&document)
    }
}
