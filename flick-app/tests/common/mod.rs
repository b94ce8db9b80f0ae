#![allow(dead_code)]

use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use flick_app::{
    AppConfig, CompanionDevice, DeviceStorage, DispatchReport, Dispatcher, DispatcherConfig,
    DispatcherHandle, FlickError, LinkEndpoint, PrimaryDevice, SettingsStore, TokenStore,
    backends::{
        Backends, FeedbackSink, NativeMediaPlayer, PlayerControl, RemoteControlPlatform,
        RemoteEvent, RemoteEventSender, UrlOpener, remote_event_channel,
    },
    storage::MemoryStorage,
};
use flick_core::{AccessToken, PlaybackBackend, SettingsRecord};
use flick_link::{ActivationState, LinkSession, memory};
use tokio::{
    sync::{broadcast, watch},
    time::timeout,
};
use url::Url;

/// Shared log of everything the fakes were asked to do.
#[derive(Default)]
pub struct Recorder {
    actions: Mutex<Vec<String>>,
    failures: Mutex<Vec<FlickError>>,
    accepted: AtomicUsize,
}

impl Recorder {
    pub fn action(&self, name: impl Into<String>) {
        self.actions.lock().unwrap().push(name.into());
    }

    pub fn actions(&self) -> Vec<String> {
        self.actions.lock().unwrap().clone()
    }

    pub fn failures(&self) -> Vec<FlickError> {
        self.failures.lock().unwrap().clone()
    }

    pub fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }
}

pub struct RecordingFeedback(pub Arc<Recorder>);

impl FeedbackSink for RecordingFeedback {
    fn command_accepted(&self) {
        self.0.accepted.fetch_add(1, Ordering::SeqCst);
    }

    fn command_failed(&self, error: &FlickError) {
        self.0.failures.lock().unwrap().push(error.clone());
    }
}

pub struct RecordingNative {
    log: Arc<Recorder>,
    playing: AtomicBool,
}

impl NativeMediaPlayer for RecordingNative {
    fn skip_to_next(&self) {
        self.log.action("native:next");
    }

    fn skip_to_previous(&self) {
        self.log.action("native:previous");
    }

    fn is_playing(&self) -> bool {
        self.playing.load(Ordering::SeqCst)
    }

    fn play(&self) {
        self.playing.store(true, Ordering::SeqCst);
        self.log.action("native:play");
    }

    fn pause(&self) {
        self.playing.store(false, Ordering::SeqCst);
        self.log.action("native:pause");
    }
}

pub struct RecordingPlayer {
    log: Arc<Recorder>,
    paused: AtomicBool,
    fail_state_query: bool,
    fail_actions: bool,
}

impl RecordingPlayer {
    fn act(&self, name: &str) -> Result<(), String> {
        self.log.action(name);
        if self.fail_actions {
            return Err(format!("{name} rejected by player"));
        }
        Ok(())
    }
}

#[async_trait]
impl PlayerControl for RecordingPlayer {
    async fn skip_next(&self) -> Result<(), String> {
        self.act("remote:next")
    }

    async fn skip_previous(&self) -> Result<(), String> {
        self.act("remote:previous")
    }

    async fn is_paused(&self) -> Result<bool, String> {
        if self.fail_state_query {
            return Err("player state unavailable".to_owned());
        }
        Ok(self.paused.load(Ordering::SeqCst))
    }

    async fn resume(&self) -> Result<(), String> {
        self.paused.store(false, Ordering::SeqCst);
        self.act("remote:resume")
    }

    async fn pause(&self) -> Result<(), String> {
        self.paused.store(true, Ordering::SeqCst);
        self.act("remote:pause")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectBehavior {
    Succeed,
    SucceedWithoutPlayer,
    Fail(String),
    Silent,
    /// Reports `Connected` from a separate task after the delay.
    Delayed(Duration),
}

pub struct FakeRemote {
    log: Arc<Recorder>,
    events: RemoteEventSender,
    behavior: Mutex<ConnectBehavior>,
    player: Mutex<Option<Arc<dyn PlayerControl>>>,
    fail_state_query: AtomicBool,
    fail_actions: AtomicBool,
    auth_available: AtomicBool,
    pub connects: AtomicUsize,
    pub disconnects: AtomicUsize,
    pub auth_launches: AtomicUsize,
}

impl FakeRemote {
    pub fn set_behavior(&self, behavior: ConnectBehavior) {
        *self.behavior.lock().unwrap() = behavior;
    }

    pub fn set_auth_available(&self, available: bool) {
        self.auth_available.store(available, Ordering::SeqCst);
    }

    pub fn fail_state_query(&self) {
        self.fail_state_query.store(true, Ordering::SeqCst);
    }

    /// Player actions are recorded and then return an error.
    pub fn fail_actions(&self) {
        self.fail_actions.store(true, Ordering::SeqCst);
    }

    /// The remote app goes away on its own.
    pub fn drop_connection(&self) {
        *self.player.lock().unwrap() = None;
        self.events.send(RemoteEvent::Disconnected(Some("remote app closed".to_owned())));
    }

    fn install_player(&self) {
        *self.player.lock().unwrap() = Some(Arc::new(RecordingPlayer {
            log: self.log.clone(),
            paused: AtomicBool::new(false),
            fail_state_query: self.fail_state_query.load(Ordering::SeqCst),
            fail_actions: self.fail_actions.load(Ordering::SeqCst),
        }));
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn disconnects(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }
}

impl RemoteControlPlatform for FakeRemote {
    fn connect(&self, _token: &AccessToken) {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let behavior = self.behavior.lock().unwrap().clone();
        match behavior {
            ConnectBehavior::Succeed => {
                self.install_player();
                self.events.send(RemoteEvent::Connected);
            }
            ConnectBehavior::SucceedWithoutPlayer => self.events.send(RemoteEvent::Connected),
            ConnectBehavior::Fail(reason) => self.events.send(RemoteEvent::ConnectFailed(reason)),
            ConnectBehavior::Silent => {}
            ConnectBehavior::Delayed(delay) => {
                self.install_player();
                let events = self.events.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    events.send(RemoteEvent::Connected);
                });
            }
        }
    }

    fn disconnect(&self) {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        *self.player.lock().unwrap() = None;
    }

    fn player(&self) -> Option<Arc<dyn PlayerControl>> {
        self.player.lock().unwrap().clone()
    }

    fn begin_authorization(&self) -> bool {
        self.auth_launches.fetch_add(1, Ordering::SeqCst);
        self.auth_available.load(Ordering::SeqCst)
    }
}

pub struct FakeOpener {
    log: Arc<Recorder>,
    succeed: AtomicBool,
    opened: Mutex<Vec<String>>,
}

impl FakeOpener {
    pub fn set_succeed(&self, succeed: bool) {
        self.succeed.store(succeed, Ordering::SeqCst);
    }

    pub fn opened(&self) -> Vec<String> {
        self.opened.lock().unwrap().clone()
    }
}

#[async_trait]
impl UrlOpener for FakeOpener {
    async fn open(&self, url: &Url) -> bool {
        self.opened.lock().unwrap().push(url.to_string());
        if self.succeed.load(Ordering::SeqCst) {
            self.log.action(format!("shortcut:{url}"));
            true
        } else {
            false
        }
    }
}

pub struct Fakes {
    pub log: Arc<Recorder>,
    pub remote: Arc<FakeRemote>,
    pub opener: Arc<FakeOpener>,
    pub backends: Backends,
    pub remote_events: tokio::sync::mpsc::UnboundedReceiver<RemoteEvent>,
}

pub fn fakes() -> Fakes {
    let log = Arc::new(Recorder::default());
    let (events, remote_events) = remote_event_channel();
    let remote = Arc::new(FakeRemote {
        log: log.clone(),
        events,
        behavior: Mutex::new(ConnectBehavior::Succeed),
        player: Mutex::new(None),
        fail_state_query: AtomicBool::new(false),
        fail_actions: AtomicBool::new(false),
        auth_available: AtomicBool::new(true),
        connects: AtomicUsize::new(0),
        disconnects: AtomicUsize::new(0),
        auth_launches: AtomicUsize::new(0),
    });
    let opener = Arc::new(FakeOpener {
        log: log.clone(),
        succeed: AtomicBool::new(true),
        opened: Mutex::new(Vec::new()),
    });
    let backends = Backends {
        native: Arc::new(RecordingNative {
            log: log.clone(),
            playing: AtomicBool::new(false),
        }),
        remote: remote.clone(),
        shortcuts: opener.clone(),
        feedback: Arc::new(RecordingFeedback(log.clone())),
    };
    Fakes {
        log,
        remote,
        opener,
        backends,
        remote_events,
    }
}

pub struct DispatchHarness {
    pub dispatcher: DispatcherHandle,
    pub settings: Arc<SettingsStore>,
    pub tokens: Arc<TokenStore>,
    pub log: Arc<Recorder>,
    pub remote: Arc<FakeRemote>,
    pub opener: Arc<FakeOpener>,
    pub reports: broadcast::Receiver<DispatchReport>,
}

pub fn dispatcher(backend: PlaybackBackend, token: Option<&str>) -> DispatchHarness {
    let fakes = fakes();
    let settings = Arc::new(SettingsStore::open(Box::new(MemoryStorage::new())));
    settings
        .write(SettingsRecord {
            playback_backend: backend,
            ..SettingsRecord::default()
        })
        .unwrap();
    let tokens = Arc::new(TokenStore::open(Box::new(MemoryStorage::new())));
    if let Some(token) = token {
        tokens.save(AccessToken::new(token).unwrap()).unwrap();
    }

    let dispatcher = Dispatcher::spawn(
        DispatcherConfig::default(),
        settings.clone(),
        tokens.clone(),
        fakes.backends,
        fakes.remote_events,
    );
    let reports = dispatcher.subscribe_reports();
    DispatchHarness {
        dispatcher,
        settings,
        tokens,
        log: fakes.log,
        remote: fakes.remote,
        opener: fakes.opener,
        reports,
    }
}

pub async fn next_report(reports: &mut broadcast::Receiver<DispatchReport>) -> DispatchReport {
    timeout(Duration::from_secs(30), reports.recv())
        .await
        .expect("report within timeout")
        .expect("report channel open")
}

pub async fn wait_for<T>(rx: &mut watch::Receiver<T>, done: impl FnMut(&T) -> bool) {
    timeout(Duration::from_secs(10), rx.wait_for(done))
        .await
        .expect("condition within timeout")
        .expect("watch channel open");
}

pub struct Devices {
    pub primary: PrimaryDevice,
    pub companion: CompanionDevice,
    pub control: memory::MemoryLinkControl,
    pub log: Arc<Recorder>,
    pub companion_log: Arc<Recorder>,
}

pub fn start_devices_with(primary: DeviceStorage, companion: DeviceStorage) -> Devices {
    let pair = memory::pair();
    let fakes = fakes();
    let companion_log = Arc::new(Recorder::default());
    let config = AppConfig::default();

    let primary = PrimaryDevice::start(
        &config,
        primary,
        LinkEndpoint {
            transport: Arc::new(pair.primary),
            events: pair.primary_events,
        },
        fakes.backends,
        fakes.remote_events,
    )
    .expect("primary starts");
    let companion = CompanionDevice::start(
        &config,
        companion,
        LinkEndpoint {
            transport: Arc::new(pair.companion),
            events: pair.companion_events,
        },
        Arc::new(RecordingFeedback(companion_log.clone())),
    )
    .expect("companion starts");

    Devices {
        primary,
        companion,
        control: pair.control,
        log: fakes.log,
        companion_log,
    }
}

pub async fn start_devices() -> Devices {
    let devices = start_devices_with(DeviceStorage::in_memory(), DeviceStorage::in_memory());
    wait_activated(&devices.primary.link).await;
    wait_activated(&devices.companion.link).await;
    devices
}

pub async fn wait_activated(link: &LinkSession) {
    let mut state = link.watch_state();
    wait_for(&mut state, |state| {
        state.activation == ActivationState::Activated && state.reachable
    })
    .await;
}

/// Polls until `check` holds or the timeout elapses.
pub async fn eventually(mut check: impl FnMut() -> bool) {
    timeout(Duration::from_secs(5), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition within timeout");
}
