use std::fmt;

use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

pub const PROTOCOL_VERSION: u8 = 1;
pub const MAX_FRAME_BYTES: usize = 64 * 1024;
pub const SETTINGS_KEY: &str = "sharedSettings";
pub const DEFAULT_REDIRECT_URI: &str = "flick://callback";
pub const DEFAULT_SHORTCUT_SCHEME: &str = "shortcuts://run-shortcut";
const ACCESS_TOKEN_PARAM: &str = "access_token";
const AUTH_ERROR_PARAM: &str = "error";
const SHORTCUT_NAME_PARAM: &str = "name";

/// Playback command relayed from the companion to the primary device.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum Command {
    NextTrack,
    PreviousTrack,
    PlayPause,
}

impl Command {
    pub const ALL: [Command; 3] = [Command::NextTrack, Command::PreviousTrack, Command::PlayPause];

    pub fn as_str(self) -> &'static str {
        match self {
            Command::NextTrack => "nextTrack",
            Command::PreviousTrack => "previousTrack",
            Command::PlayPause => "playPause",
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "camelCase")]
pub enum PlaybackBackend {
    #[default]
    NativeMedia,
    RemoteControl,
    Shortcuts,
}

impl fmt::Display for PlaybackBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PlaybackBackend::NativeMedia => "nativeMedia",
            PlaybackBackend::RemoteControl => "remoteControl",
            PlaybackBackend::Shortcuts => "shortcuts",
        };
        f.write_str(name)
    }
}

/// The settings shared between both devices.
///
/// Missing fields deserialize to their defaults so an older peer can still
/// replicate into a newer replica.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct SettingsRecord {
    pub gestures_enabled: bool,
    pub flick_direction_reversed: bool,
    pub tutorial_completed: bool,
    pub initial_setup_completed: bool,
    pub playback_backend: PlaybackBackend,
}

impl Default for SettingsRecord {
    fn default() -> Self {
        Self {
            gestures_enabled: true,
            flick_direction_reversed: false,
            tutorial_completed: false,
            initial_setup_completed: false,
            playback_backend: PlaybackBackend::NativeMedia,
        }
    }
}

impl SettingsRecord {
    pub fn setup_complete(&self) -> bool {
        self.tutorial_completed && self.initial_setup_completed
    }
}

/// Flat key-value payload carried over the link.
///
/// Serializes with a single discriminator key, e.g. `{"command":"playPause"}`
/// or `{"settings":{...}}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum WireMessage {
    Command(Command),
    Settings(SettingsRecord),
}

impl WireMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            WireMessage::Command(_) => "command",
            WireMessage::Settings(_) => "settings",
        }
    }
}

/// Cached authorization token for the remote-control backend.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct AccessToken(String);

impl AccessToken {
    pub fn new(token: impl Into<String>) -> Result<Self, CoreError> {
        let token = token.into();
        if token.trim().is_empty() {
            return Err(CoreError::MissingAccessToken);
        }
        Ok(Self(token))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AccessToken(<{} chars>)", self.0.len())
    }
}

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid frame length")]
    InvalidFrameLength,
    #[error("frame exceeds 64 KiB")]
    FrameTooLarge,
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u8),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("invalid url: {0}")]
    InvalidUrl(String),
    #[error("callback url does not match redirect uri {expected}")]
    RedirectMismatch { expected: String },
    #[error("authorization callback carried no access token")]
    MissingAccessToken,
    #[error("authorization denied: {0}")]
    AuthorizationDenied(String),
}

pub fn encode_message(message: &WireMessage) -> Result<Vec<u8>, CoreError> {
    serde_json::to_vec(message).map_err(|err| CoreError::Serialization(err.to_string()))
}

pub fn decode_message(payload: &[u8]) -> Result<WireMessage, CoreError> {
    serde_json::from_slice(payload).map_err(|err| CoreError::Serialization(err.to_string()))
}

/// Frames a message for byte-stream transports.
///
/// Layout: `u32 LE length` (of everything after it), `u8 protocol version`,
/// JSON payload.
pub fn encode_frame(message: &WireMessage) -> Result<Vec<u8>, CoreError> {
    let payload = encode_message(message)?;
    let frame_len = 1usize
        .checked_add(payload.len())
        .ok_or(CoreError::InvalidFrameLength)?;
    if frame_len + 4 > MAX_FRAME_BYTES {
        return Err(CoreError::FrameTooLarge);
    }
    let frame_len_u32 = u32::try_from(frame_len).map_err(|_| CoreError::InvalidFrameLength)?;

    let mut out = BytesMut::with_capacity(4 + frame_len);
    out.put_u32_le(frame_len_u32);
    out.put_u8(PROTOCOL_VERSION);
    out.extend_from_slice(&payload);
    Ok(out.to_vec())
}

pub fn decode_frame(frame: &[u8]) -> Result<WireMessage, CoreError> {
    if frame.len() > MAX_FRAME_BYTES {
        return Err(CoreError::FrameTooLarge);
    }
    if frame.len() < 5 {
        return Err(CoreError::InvalidFrameLength);
    }

    let mut cursor = frame;
    let expected_len = cursor.get_u32_le() as usize;
    if expected_len + 4 != frame.len() {
        return Err(CoreError::InvalidFrameLength);
    }

    match cursor.get_u8() {
        PROTOCOL_VERSION => decode_message(cursor),
        other => Err(CoreError::UnsupportedVersion(other)),
    }
}

/// Name of the user-installed shortcut that performs `command`.
pub fn shortcut_name(command: Command) -> &'static str {
    match command {
        Command::NextTrack => "FlickNext",
        Command::PreviousTrack => "FlickPrevious",
        Command::PlayPause => "FlickPlayPause",
    }
}

/// Builds the invocation target for `command`, e.g.
/// `shortcuts://run-shortcut?name=FlickNext`.
pub fn shortcut_url(scheme: &str, command: Command) -> Result<Url, CoreError> {
    let mut url = Url::parse(scheme).map_err(|err| CoreError::InvalidUrl(err.to_string()))?;
    let encoded_name = url::form_urlencoded::byte_serialize(shortcut_name(command).as_bytes())
        .collect::<String>()
        .replace('+', "%20");
    url.set_query(Some(&format!("{SHORTCUT_NAME_PARAM}={encoded_name}")));
    Ok(url)
}

/// Extracts the access token from an authorization deep link.
///
/// The token may arrive in the fragment (implicit grant) or in the query.
/// An `error` parameter takes precedence over any token.
pub fn parse_authorization_callback(
    callback: &str,
    redirect_uri: &str,
) -> Result<AccessToken, CoreError> {
    let url = Url::parse(callback).map_err(|err| CoreError::InvalidUrl(err.to_string()))?;
    let expected =
        Url::parse(redirect_uri).map_err(|err| CoreError::InvalidUrl(err.to_string()))?;
    if url.scheme() != expected.scheme()
        || url.host_str() != expected.host_str()
        || url.path().trim_end_matches('/') != expected.path().trim_end_matches('/')
    {
        return Err(CoreError::RedirectMismatch {
            expected: redirect_uri.to_owned(),
        });
    }

    let fragment_pairs: Vec<(String, String)> = url
        .fragment()
        .map(|fragment| url::form_urlencoded::parse(fragment.as_bytes()).into_owned().collect())
        .unwrap_or_else(Vec::new);
    let query_pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
    let pairs = fragment_pairs.iter().chain(query_pairs.iter());

    let mut token = None;
    for (key, value) in pairs {
        if key == AUTH_ERROR_PARAM {
            return Err(CoreError::AuthorizationDenied(value.clone()));
        }
        if key == ACCESS_TOKEN_PARAM && token.is_none() {
            token = Some(value.clone());
        }
    }

    token
        .ok_or(CoreError::MissingAccessToken)
        .and_then(AccessToken::new)
}
