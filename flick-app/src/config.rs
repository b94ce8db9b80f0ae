use std::{
    ffi::OsString,
    fmt,
    path::{Path, PathBuf},
    time::Duration,
};

use flick_core::{DEFAULT_REDIRECT_URI, DEFAULT_SHORTCUT_SCHEME};
use serde::{Deserialize, Serialize};
use tracing::warn;
use url::Url;

use crate::dispatcher::DispatcherConfig;

pub const CONFIG_FILE_NAME: &str = "config.json";
pub const DATA_DIR_ENV: &str = "FLICK_DATA_DIR";

const MAX_DELAY_MS: u64 = 60_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceRole {
    Companion,
    Primary,
}

impl DeviceRole {
    pub fn as_str(self) -> &'static str {
        match self {
            DeviceRole::Companion => "companion",
            DeviceRole::Primary => "primary",
        }
    }
}

impl fmt::Display for DeviceRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-device runtime settings read from `config.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub recheck_delay_ms: u64,
    pub connect_timeout_ms: u64,
    pub send_ack_timeout_ms: u64,
    pub redirect_uri: String,
    pub shortcut_scheme: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            recheck_delay_ms: 1_000,
            connect_timeout_ms: 5_000,
            send_ack_timeout_ms: 2_000,
            redirect_uri: DEFAULT_REDIRECT_URI.to_owned(),
            shortcut_scheme: DEFAULT_SHORTCUT_SCHEME.to_owned(),
        }
    }
}

impl AppConfig {
    /// Reads and validates `path`. A missing file is `Ok(None)`.
    pub fn load_from_path(path: &Path) -> Result<Option<Self>, String> {
        if !path.exists() {
            return Ok(None);
        }

        let data = std::fs::read_to_string(path)
            .map_err(|err| format!("failed to read config file {}: {err}", path.display()))?;
        let cfg: AppConfig = serde_json::from_str(&data)
            .map_err(|err| format!("failed to parse config file {}: {err}", path.display()))?;

        cfg.validate()?;
        Ok(Some(cfg))
    }

    /// Loads `config.json` from `data_dir`, falling back to defaults.
    pub fn load_or_default(data_dir: &Path) -> Self {
        let path = data_dir.join(CONFIG_FILE_NAME);
        match Self::load_from_path(&path) {
            Ok(Some(cfg)) => cfg,
            Ok(None) => Self::default(),
            Err(err) => {
                warn!("config invalid, using defaults: {}", err);
                Self::default()
            }
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        let mut errors: Vec<String> = Vec::new();

        for (name, value) in [
            ("recheck_delay_ms", self.recheck_delay_ms),
            ("connect_timeout_ms", self.connect_timeout_ms),
            ("send_ack_timeout_ms", self.send_ack_timeout_ms),
        ] {
            if value == 0 {
                errors.push(format!("{name} must be greater than zero."));
            } else if value > MAX_DELAY_MS {
                errors.push(format!(
                    "{name} is too large ({value} > {MAX_DELAY_MS} ms)."
                ));
            }
        }

        if let Err(err) = Url::parse(self.redirect_uri.trim()) {
            errors.push(format!("Redirect URI is invalid: {err}"));
        }

        match Url::parse(self.shortcut_scheme.trim()) {
            Ok(url) if url.cannot_be_a_base() => {
                errors.push(
                    "Shortcut scheme must include a host, e.g. shortcuts://run-shortcut."
                        .to_owned(),
                );
            }
            Ok(_) => {}
            Err(err) => errors.push(format!("Shortcut scheme is invalid: {err}")),
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(format!(
                "Please fix the following:\n\n- {}",
                errors.join("\n- ")
            ))
        }
    }

    pub fn recheck_delay(&self) -> Duration {
        Duration::from_millis(self.recheck_delay_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn send_ack_timeout(&self) -> Duration {
        Duration::from_millis(self.send_ack_timeout_ms)
    }

    pub fn dispatcher(&self) -> DispatcherConfig {
        DispatcherConfig {
            recheck_delay: self.recheck_delay(),
            connect_timeout: self.connect_timeout(),
            redirect_uri: self.redirect_uri.clone(),
            shortcut_scheme: self.shortcut_scheme.clone(),
        }
    }
}

/// Data directory for `role`: `<explicit>/<role>`, else
/// `$FLICK_DATA_DIR/<role>`, else `./.flick/<role>`.
pub fn resolve_data_dir(explicit: Option<&Path>, role: DeviceRole) -> PathBuf {
    data_dir_from(explicit, std::env::var_os(DATA_DIR_ENV), role)
}

fn data_dir_from(explicit: Option<&Path>, env: Option<OsString>, role: DeviceRole) -> PathBuf {
    let base = match (explicit, env) {
        (Some(dir), _) => dir.to_path_buf(),
        (None, Some(dir)) if !dir.is_empty() => PathBuf::from(dir),
        _ => PathBuf::from(".flick"),
    };
    base.join(role.as_str())
}
