use std::{
    path::PathBuf,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use clap::{Parser, ValueEnum};
use flick_app::{
    AppConfig, CompanionDevice, DeviceRole, DeviceStorage, FlickError, Gesture, LinkEndpoint,
    PrimaryDevice, SetupPhase,
    backends::{
        Backends, FeedbackSink, NativeMediaPlayer, PlayerControl, RemoteControlPlatform,
        RemoteEvent, RemoteEventSender, UrlOpener, remote_event_channel,
    },
    config::resolve_data_dir,
};
use flick_core::{AccessToken, PlaybackBackend};
use flick_link::{ActivationState, LinkSession, SendOutcome, memory};
use tokio::sync::watch;
use tracing::{error, info, warn};
use url::Url;

const STEP_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(
    name = "flick-sim",
    about = "Runs a companion and a primary device over an in-memory link"
)]
struct SimArgs {
    /// Playback backend chosen during setup.
    #[arg(long, value_enum, default_value_t = SimBackend::Native)]
    backend: SimBackend,

    /// Base directory for both devices' data. Falls back to FLICK_DATA_DIR.
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Keep all state in memory instead of the data directory.
    #[arg(long)]
    in_memory: bool,

    /// Gestures performed on the companion, in order.
    #[arg(long, value_enum, value_delimiter = ',', default_value = "forward,tap,backward")]
    gestures: Vec<SimGesture>,

    /// Swap the flick directions on the companion.
    #[arg(long)]
    reversed: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum SimBackend {
    Native,
    Remote,
    Shortcuts,
}

impl From<SimBackend> for PlaybackBackend {
    fn from(backend: SimBackend) -> Self {
        match backend {
            SimBackend::Native => PlaybackBackend::NativeMedia,
            SimBackend::Remote => PlaybackBackend::RemoteControl,
            SimBackend::Shortcuts => PlaybackBackend::Shortcuts,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum SimGesture {
    Forward,
    Backward,
    Tap,
}

impl From<SimGesture> for Gesture {
    fn from(gesture: SimGesture) -> Self {
        match gesture {
            SimGesture::Forward => Gesture::FlickForward,
            SimGesture::Backward => Gesture::FlickBackward,
            SimGesture::Tap => Gesture::Tap,
        }
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = SimArgs::parse();
    if let Err(err) = run(args).await {
        error!("simulation failed: {}", err);
        std::process::exit(1);
    }
}

async fn run(args: SimArgs) -> Result<(), String> {
    let backend = PlaybackBackend::from(args.backend);
    let (companion_storage, companion_config) = device_storage(&args, DeviceRole::Companion);
    let (primary_storage, primary_config) = device_storage(&args, DeviceRole::Primary);

    let pair = memory::pair();
    let (remote_tx, remote_rx) = remote_event_channel();
    let backends = Backends {
        native: Arc::new(LoggingNativePlayer::default()),
        remote: Arc::new(LoggingRemotePlatform::new(remote_tx)),
        shortcuts: Arc::new(LoggingUrlOpener),
        feedback: Arc::new(LoggingFeedback {
            role: DeviceRole::Primary,
        }),
    };

    let primary = PrimaryDevice::start(
        &primary_config,
        primary_storage,
        LinkEndpoint {
            transport: Arc::new(pair.primary),
            events: pair.primary_events,
        },
        backends,
        remote_rx,
    )
    .map_err(|err| format!("primary failed to start: {err}"))?;

    let companion = CompanionDevice::start(
        &companion_config,
        companion_storage,
        LinkEndpoint {
            transport: Arc::new(pair.companion),
            events: pair.companion_events,
        },
        Arc::new(LoggingFeedback {
            role: DeviceRole::Companion,
        }),
    )
    .map_err(|err| format!("companion failed to start: {err}"))?;

    wait_activated(&primary.link).await?;
    wait_activated(&companion.link).await?;

    walk_setup(&primary, &companion, backend, args.reversed).await?;

    if backend == PlaybackBackend::RemoteControl && primary.tokens.get().is_none() {
        info!("authorizing remote-control backend");
        primary
            .dispatcher
            .handle_authorization_callback("flick://callback#access_token=sim-token");
    }

    let mut reports = primary.dispatcher.subscribe_reports();
    for gesture in args.gestures.into_iter().map(Gesture::from) {
        let pending = match companion.companion.handle_gesture(gesture) {
            Ok(Some(pending)) => pending,
            Ok(None) => continue,
            Err(err) => {
                warn!(?gesture, "gesture not relayed: {}", err);
                continue;
            }
        };
        if let SendOutcome::SendFailed(reason) = pending.outcome().await {
            warn!(?gesture, "relay failed: {}", reason);
            continue;
        }

        match tokio::time::timeout(STEP_TIMEOUT, reports.recv()).await {
            Ok(Ok(report)) => match report.outcome {
                Ok(()) => info!(
                    command = %report.command,
                    backend = %report.backend,
                    "executed"
                ),
                Err(err) => warn!(
                    command = %report.command,
                    backend = %report.backend,
                    "failed: {}",
                    err
                ),
            },
            Ok(Err(err)) => warn!("report stream error: {}", err),
            Err(_) => warn!(?gesture, "no dispatch report in time"),
        }
    }

    info!(
        phase = ?primary.setup.phase(),
        connection = ?primary.dispatcher.connection_state(),
        "simulation finished"
    );
    Ok(())
}

fn device_storage(args: &SimArgs, role: DeviceRole) -> (DeviceStorage, AppConfig) {
    if args.in_memory {
        return (DeviceStorage::in_memory(), AppConfig::default());
    }
    let dir = resolve_data_dir(args.data_dir.as_deref(), role);
    info!(%role, dir = %dir.display(), "using data directory");
    (DeviceStorage::in_dir(&dir), AppConfig::load_or_default(&dir))
}

async fn walk_setup(
    primary: &PrimaryDevice,
    companion: &CompanionDevice,
    backend: PlaybackBackend,
    reversed: bool,
) -> Result<(), String> {
    if primary.setup.phase() == SetupPhase::Main {
        info!("setup already complete");
        return Ok(());
    }

    primary.setup.complete_welcome();
    primary.setup.complete_playback_choice(backend);

    // The companion pushes its whole replica, so let the primary's choice
    // land there before the companion writes.
    let mut companion_settings = companion.bridge.subscribe();
    let replicated = tokio::time::timeout(STEP_TIMEOUT, async {
        while companion.bridge.settings().playback_backend != backend
            || !companion.bridge.settings().initial_setup_completed
        {
            if companion_settings.recv().await.is_err() {
                break;
            }
        }
    })
    .await;
    if replicated.is_err() {
        warn!("playback choice did not reach the companion in time");
    }

    if reversed {
        companion.companion.set_flick_direction_reversed(true);
    }
    companion.companion.complete_tutorial();

    let mut phase = primary.setup.watch();
    wait_for(&mut phase, |phase| *phase == SetupPhase::Main)
        .await
        .map_err(|_| "primary never reached the main phase".to_owned())
}

async fn wait_activated(link: &LinkSession) -> Result<(), String> {
    let mut state = link.watch_state();
    wait_for(&mut state, |state| state.activation == ActivationState::Activated)
        .await
        .map_err(|_| "link did not activate".to_owned())
}

async fn wait_for<T>(rx: &mut watch::Receiver<T>, done: impl FnMut(&T) -> bool) -> Result<(), ()> {
    match tokio::time::timeout(STEP_TIMEOUT, rx.wait_for(done)).await {
        Ok(Ok(_)) => Ok(()),
        _ => Err(()),
    }
}

#[derive(Default)]
struct LoggingNativePlayer {
    playing: AtomicBool,
}

impl NativeMediaPlayer for LoggingNativePlayer {
    fn skip_to_next(&self) {
        info!("native: skip to next");
    }

    fn skip_to_previous(&self) {
        info!("native: skip to previous");
    }

    fn is_playing(&self) -> bool {
        self.playing.load(Ordering::SeqCst)
    }

    fn play(&self) {
        self.playing.store(true, Ordering::SeqCst);
        info!("native: play");
    }

    fn pause(&self) {
        self.playing.store(false, Ordering::SeqCst);
        info!("native: pause");
    }
}

#[derive(Default)]
struct LoggingPlayer {
    paused: AtomicBool,
}

#[async_trait]
impl PlayerControl for LoggingPlayer {
    async fn skip_next(&self) -> Result<(), String> {
        info!("remote: skip next");
        Ok(())
    }

    async fn skip_previous(&self) -> Result<(), String> {
        info!("remote: skip previous");
        Ok(())
    }

    async fn is_paused(&self) -> Result<bool, String> {
        Ok(self.paused.load(Ordering::SeqCst))
    }

    async fn resume(&self) -> Result<(), String> {
        self.paused.store(false, Ordering::SeqCst);
        info!("remote: resume");
        Ok(())
    }

    async fn pause(&self) -> Result<(), String> {
        self.paused.store(true, Ordering::SeqCst);
        info!("remote: pause");
        Ok(())
    }
}

struct LoggingRemotePlatform {
    events: RemoteEventSender,
    player: Mutex<Option<Arc<dyn PlayerControl>>>,
}

impl LoggingRemotePlatform {
    fn new(events: RemoteEventSender) -> Self {
        Self {
            events,
            player: Mutex::new(None),
        }
    }
}

impl RemoteControlPlatform for LoggingRemotePlatform {
    fn connect(&self, _token: &AccessToken) {
        info!("remote: connecting");
        if let Ok(mut player) = self.player.lock() {
            *player = Some(Arc::new(LoggingPlayer::default()));
        }
        self.events.send(RemoteEvent::Connected);
    }

    fn disconnect(&self) {
        if let Ok(mut player) = self.player.lock() {
            *player = None;
        }
        self.events.send(RemoteEvent::Disconnected(None));
    }

    fn player(&self) -> Option<Arc<dyn PlayerControl>> {
        self.player.lock().ok().and_then(|player| player.clone())
    }

    fn begin_authorization(&self) -> bool {
        info!("remote: authorization flow would open here");
        true
    }
}

struct LoggingUrlOpener;

#[async_trait]
impl UrlOpener for LoggingUrlOpener {
    async fn open(&self, url: &Url) -> bool {
        info!(%url, "shortcuts: opening");
        true
    }
}

struct LoggingFeedback {
    role: DeviceRole,
}

impl FeedbackSink for LoggingFeedback {
    fn command_accepted(&self) {
        info!(role = %self.role, "haptic: success");
    }

    fn command_failed(&self, error: &FlickError) {
        warn!(role = %self.role, "haptic: failure ({})", error);
    }
}
