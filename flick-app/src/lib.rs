//! Device-side services for relaying playback commands from a companion
//! device to a primary device and keeping their shared settings in sync.

pub mod backends;
pub mod companion;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod runtime;
pub mod settings_store;
pub mod setup;
pub mod storage;
pub mod sync_bridge;

pub use companion::{Companion, Gesture, command_for_gesture};
pub use config::{AppConfig, DeviceRole};
pub use dispatcher::{
    ConnectionState, DispatchReport, Dispatcher, DispatcherConfig, DispatcherHandle,
};
pub use error::FlickError;
pub use runtime::{CompanionDevice, DeviceStorage, LinkEndpoint, PrimaryDevice};
pub use settings_store::{SettingsStore, TokenStore};
pub use setup::{SetupMachine, SetupPhase};
pub use sync_bridge::{ChangeOrigin, SettingsChange, SyncBridge};
