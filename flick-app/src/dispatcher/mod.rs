//! Routes relayed commands to the playback backend selected in settings.
//!
//! A single task owns the remote-control connection state. Commands, timer
//! expiries and platform connection callbacks all arrive as messages to that
//! task, so every decision reads the state current at the time it runs.

use std::{sync::Arc, time::Duration};

use flick_core::{
    Command, DEFAULT_REDIRECT_URI, DEFAULT_SHORTCUT_SCHEME, PlaybackBackend,
    parse_authorization_callback, shortcut_url,
};
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, info, warn};

use crate::{
    backends::{Backends, FeedbackSink, PlayerControl, RemoteEvent},
    error::FlickError,
    settings_store::{SettingsStore, TokenStore},
};

mod remote;

pub use remote::ConnectionState;
use remote::RemoteConnection;

const REPORT_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Delay before a command waiting on a connection is re-checked.
    pub recheck_delay: Duration,
    /// A connect attempt with no platform callback by then is abandoned.
    pub connect_timeout: Duration,
    pub redirect_uri: String,
    pub shortcut_scheme: String,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            recheck_delay: Duration::from_secs(1),
            connect_timeout: Duration::from_secs(5),
            redirect_uri: DEFAULT_REDIRECT_URI.to_owned(),
            shortcut_scheme: DEFAULT_SHORTCUT_SCHEME.to_owned(),
        }
    }
}

/// Final outcome of one dispatched command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchReport {
    pub command: Command,
    pub backend: PlaybackBackend,
    pub outcome: Result<(), FlickError>,
}

#[derive(Debug)]
enum Input {
    Command {
        command: Command,
        backend: PlaybackBackend,
    },
    Recheck(Command),
    ConnectGuard(u64),
    AuthorizationCallback(String),
    RequestAuthorization,
    Disconnect,
}

/// Cloneable front door to the dispatcher task.
#[derive(Clone)]
pub struct DispatcherHandle {
    input: mpsc::UnboundedSender<Input>,
    settings: Arc<SettingsStore>,
    connection: watch::Receiver<ConnectionState>,
    reports: broadcast::Sender<DispatchReport>,
}

impl DispatcherHandle {
    /// Queues `command` for the backend selected right now.
    ///
    /// The backend is read from the local replica at call time; a later
    /// settings change does not reroute an already queued command.
    pub fn dispatch(&self, command: Command) -> PlaybackBackend {
        let backend = self.settings.read().playback_backend;
        debug!(%command, %backend, "command queued");
        let _ = self.input.send(Input::Command { command, backend });
        backend
    }

    /// Consumes an authorization deep link carrying a fresh token.
    pub fn handle_authorization_callback(&self, callback: &str) {
        let _ = self
            .input
            .send(Input::AuthorizationCallback(callback.to_owned()));
    }

    pub fn request_authorization(&self) {
        let _ = self.input.send(Input::RequestAuthorization);
    }

    /// Tears down the remote-control connection. The cached token is kept.
    pub fn disconnect(&self) {
        let _ = self.input.send(Input::Disconnect);
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.connection.borrow()
    }

    pub fn watch_connection(&self) -> watch::Receiver<ConnectionState> {
        self.connection.clone()
    }

    pub fn subscribe_reports(&self) -> broadcast::Receiver<DispatchReport> {
        self.reports.subscribe()
    }
}

/// Feedback and reporting for finished commands. Cheap to clone into the
/// continuation tasks that finish asynchronous backend calls.
#[derive(Clone)]
struct Outcomes {
    feedback: Arc<dyn FeedbackSink>,
    reports: broadcast::Sender<DispatchReport>,
}

impl Outcomes {
    fn executed(&self, command: Command, backend: PlaybackBackend) {
        debug!(%command, %backend, "command executed");
        let _ = self.reports.send(DispatchReport {
            command,
            backend,
            outcome: Ok(()),
        });
    }

    /// The backend took the command but the action itself errored. The
    /// report carries the error; no failure haptic fires.
    fn action_failed(&self, command: Command, backend: PlaybackBackend, reason: String) {
        warn!(%command, %backend, "player action reported an error: {}", reason);
        let _ = self.reports.send(DispatchReport {
            command,
            backend,
            outcome: Err(FlickError::InvocationFailed(reason)),
        });
    }

    fn failed(&self, command: Command, backend: PlaybackBackend, error: FlickError) {
        warn!(%command, %backend, "command failed: {}", error);
        self.feedback.command_failed(&error);
        let _ = self.reports.send(DispatchReport {
            command,
            backend,
            outcome: Err(error),
        });
    }
}

pub struct Dispatcher {
    config: DispatcherConfig,
    backends: Backends,
    tokens: Arc<TokenStore>,
    connection: RemoteConnection,
    input_tx: mpsc::UnboundedSender<Input>,
    outcomes: Outcomes,
}

impl Dispatcher {
    /// Spawns the dispatcher task. Must be called from within a tokio runtime.
    pub fn spawn(
        config: DispatcherConfig,
        settings: Arc<SettingsStore>,
        tokens: Arc<TokenStore>,
        backends: Backends,
        remote_events: mpsc::UnboundedReceiver<RemoteEvent>,
    ) -> DispatcherHandle {
        let (input_tx, input_rx) = mpsc::unbounded_channel();
        let (reports, _) = broadcast::channel(REPORT_CHANNEL_CAPACITY);
        let connection = RemoteConnection::new();

        let handle = DispatcherHandle {
            input: input_tx.clone(),
            settings,
            connection: connection.watch(),
            reports: reports.clone(),
        };

        let dispatcher = Self {
            config,
            outcomes: Outcomes {
                feedback: backends.feedback.clone(),
                reports,
            },
            backends,
            tokens,
            connection,
            input_tx,
        };
        tokio::spawn(dispatcher.run(input_rx, remote_events));
        handle
    }

    async fn run(
        mut self,
        mut input_rx: mpsc::UnboundedReceiver<Input>,
        mut remote_events: mpsc::UnboundedReceiver<RemoteEvent>,
    ) {
        loop {
            tokio::select! {
                Some(input) = input_rx.recv() => self.handle_input(input),
                Some(event) = remote_events.recv() => {
                    self.connection.on_event(&event);
                }
                else => break,
            }
        }
        debug!("dispatcher stopped");
    }

    fn handle_input(&mut self, input: Input) {
        match input {
            Input::Command { command, backend } => {
                info!(%command, %backend, "dispatching command");
                match backend {
                    PlaybackBackend::NativeMedia => self.execute_native(command),
                    PlaybackBackend::RemoteControl => self.dispatch_remote(command),
                    PlaybackBackend::Shortcuts => self.invoke_shortcut(command),
                }
            }
            Input::Recheck(command) => {
                if self.connection.state() == ConnectionState::Connected {
                    self.execute_remote(command);
                } else {
                    self.outcomes.failed(
                        command,
                        PlaybackBackend::RemoteControl,
                        FlickError::BackendNotReady,
                    );
                }
            }
            Input::ConnectGuard(attempt) => {
                if self.connection.expire(attempt) {
                    self.backends.remote.disconnect();
                }
            }
            Input::AuthorizationCallback(callback) => self.accept_callback(&callback),
            Input::RequestAuthorization => self.request_authorization(),
            Input::Disconnect => {
                info!("remote disconnect requested");
                self.backends.remote.disconnect();
                self.connection.mark_disconnected();
            }
        }
    }

    fn execute_native(&self, command: Command) {
        let player = &self.backends.native;
        match command {
            Command::NextTrack => player.skip_to_next(),
            Command::PreviousTrack => player.skip_to_previous(),
            Command::PlayPause => {
                if player.is_playing() {
                    player.pause();
                } else {
                    player.play();
                }
            }
        }
        self.outcomes.executed(command, PlaybackBackend::NativeMedia);
    }

    fn dispatch_remote(&mut self, command: Command) {
        match self.connection.state() {
            ConnectionState::Connected => self.execute_remote(command),
            ConnectionState::Connecting => {
                debug!(%command, "remote connecting, re-checking later");
                self.schedule(self.config.recheck_delay, Input::Recheck(command));
            }
            ConnectionState::Disconnected => match self.authorize() {
                Ok(()) => self.schedule(self.config.recheck_delay, Input::Recheck(command)),
                Err(err) => self
                    .outcomes
                    .failed(command, PlaybackBackend::RemoteControl, err),
            },
        }
    }

    fn execute_remote(&self, command: Command) {
        let Some(player) = self.backends.remote.player() else {
            self.outcomes.failed(
                command,
                PlaybackBackend::RemoteControl,
                FlickError::BackendNotReady,
            );
            return;
        };
        tokio::spawn(run_player_command(player, command, self.outcomes.clone()));
    }

    fn invoke_shortcut(&self, command: Command) {
        let url = match shortcut_url(&self.config.shortcut_scheme, command) {
            Ok(url) => url,
            Err(err) => {
                self.outcomes.failed(
                    command,
                    PlaybackBackend::Shortcuts,
                    FlickError::InvocationFailed(err.to_string()),
                );
                return;
            }
        };

        let opener = self.backends.shortcuts.clone();
        let outcomes = self.outcomes.clone();
        tokio::spawn(async move {
            if opener.open(&url).await {
                outcomes.executed(command, PlaybackBackend::Shortcuts);
            } else {
                outcomes.failed(
                    command,
                    PlaybackBackend::Shortcuts,
                    FlickError::InvocationFailed(format!("could not open {url}")),
                );
            }
        });
    }

    /// Starts a connect attempt with the cached token.
    fn authorize(&mut self) -> Result<(), FlickError> {
        let token = self.tokens.get().ok_or(FlickError::AuthorizationRequired)?;
        if let Some(attempt) = self.connection.begin_connect() {
            self.backends.remote.connect(&token);
            self.schedule(self.config.connect_timeout, Input::ConnectGuard(attempt));
        }
        Ok(())
    }

    fn accept_callback(&mut self, callback: &str) {
        let token = match parse_authorization_callback(callback, &self.config.redirect_uri) {
            Ok(token) => token,
            Err(err) => {
                warn!("ignoring authorization callback: {}", err);
                return;
            }
        };

        if let Err(err) = self.tokens.save(token) {
            warn!("{}", FlickError::PersistenceUnavailable(err.to_string()));
        }
        info!("authorization token stored");
        if let Err(err) = self.authorize() {
            warn!("connect after authorization failed: {}", err);
        }
    }

    fn request_authorization(&mut self) {
        if self.connection.state() != ConnectionState::Disconnected {
            debug!("remote already connected or connecting");
            return;
        }
        if self.authorize().is_ok() {
            return;
        }
        if self.backends.remote.begin_authorization() {
            info!("remote authorization flow launched");
        } else {
            warn!("remote app unavailable for authorization");
            self.outcomes
                .feedback
                .command_failed(&FlickError::AuthorizationRequired);
        }
    }

    fn schedule(&self, delay: Duration, input: Input) {
        let input_tx = self.input_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = input_tx.send(input);
        });
    }
}

/// Query, branch, act: play/pause needs the remote player state first since
/// none is cached locally.
async fn run_player_command(player: Arc<dyn PlayerControl>, command: Command, outcomes: Outcomes) {
    let backend = PlaybackBackend::RemoteControl;
    let result = match command {
        Command::NextTrack => player.skip_next().await,
        Command::PreviousTrack => player.skip_previous().await,
        Command::PlayPause => match player.is_paused().await {
            Ok(true) => player.resume().await,
            Ok(false) => player.pause().await,
            Err(reason) => {
                warn!("player state query failed: {}", reason);
                outcomes.failed(command, backend, FlickError::BackendNotReady);
                return;
            }
        },
    };

    match result {
        Ok(()) => outcomes.executed(command, backend),
        Err(reason) => outcomes.action_failed(command, backend, reason),
    }
}
