#![allow(dead_code)]

pub mod fakes;
pub mod gemini_mock;

use std::sync::Arc;
use std::time::Duration;

use shared::ai::AiGateway;
use shared::assistant_memory::{MemoryStore, SharedMemory};
use shared::camera::{Camera, CameraError};
use shared::config::AssistantConfig;
use shared::intent::IntentRouter;
use shared::local_state::{FileStateStore, LocalStateStore};
use shared::models::{AssistantStatus, InlineImage};
use shared::session::{AssistantSession, SessionDeps, SessionHandle};
use shared::sync::{InMemoryRemoteStore, SyncService};
use shared::users::IdentityStore;

use fakes::{Heard, RecordingPresenter, RecordingSynthesizer, ScriptedRecognizer, StubCameraDevice};

const WAIT_TIMEOUT: Duration = Duration::from_secs(5);
const POLL_INTERVAL: Duration = Duration::from_millis(10);

pub fn camera_frame() -> InlineImage {
    InlineImage::new("image/jpeg", vec![0xff, 0xd8, 0xff, 0xe0])
}

pub struct SessionSetup {
    pub user: Option<&'static str>,
    pub gateway: Arc<dyn AiGateway>,
    pub camera: Result<InlineImage, CameraError>,
    pub script: Vec<Heard>,
    pub synthesizer: RecordingSynthesizer,
}

impl SessionSetup {
    pub fn new(gateway: Arc<dyn AiGateway>) -> Self {
        Self {
            user: Some("abhay"),
            gateway,
            camera: Ok(camera_frame()),
            script: Vec::new(),
            synthesizer: RecordingSynthesizer::new(),
        }
    }

    pub fn anonymous(mut self) -> Self {
        self.user = None;
        self
    }

    pub fn hearing(mut self, script: Vec<Heard>) -> Self {
        self.script = script;
        self
    }

    pub fn camera(mut self, camera: Result<InlineImage, CameraError>) -> Self {
        self.camera = camera;
        self
    }

    pub fn synthesizer(mut self, synthesizer: RecordingSynthesizer) -> Self {
        self.synthesizer = synthesizer;
        self
    }

    /// Wires the session against fakes and starts it. Must run inside a
    /// tokio runtime.
    pub fn start(self) -> TestSession {
        let dir = tempfile::tempdir().expect("temp dir should be created");
        let state: Arc<dyn LocalStateStore> =
            Arc::new(FileStateStore::new(dir.path()).expect("state store should open"));
        let identity = IdentityStore::new(state.clone());
        let user = self.user.map(|name| {
            identity
                .login(name)
                .expect("predefined user should log in")
        });

        let mut store = MemoryStore::load(state.clone()).expect("memory should load");
        store.set_current_user(user);
        let memory = SharedMemory::new(store);

        let remote = Arc::new(InMemoryRemoteStore::default());
        let sync = Arc::new(
            SyncService::new(remote.clone(), memory.clone(), state, Duration::from_secs(30))
                .expect("sync service should build"),
        );

        let recognizer = Arc::new(ScriptedRecognizer::with_script(self.script));
        let synthesizer = Arc::new(self.synthesizer);
        let camera_device = Arc::new(StubCameraDevice::new(self.camera));
        let presenter = Arc::new(RecordingPresenter::default());

        let config = AssistantConfig {
            state_dir: dir.path().to_path_buf(),
            download_dir: dir.path().join("downloads"),
            settle_delay_ms: 20,
            recognition_retry_ms: 500,
            ..AssistantConfig::default()
        };

        let handle = AssistantSession::start(SessionDeps {
            config,
            recognizer: recognizer.clone(),
            synthesizer: synthesizer.clone(),
            gateway: self.gateway,
            camera: Arc::new(Camera::new(camera_device.clone())),
            presenter: presenter.clone(),
            memory: memory.clone(),
            sync,
            identity: identity.clone(),
            router: IntentRouter::default(),
        });

        TestSession {
            handle,
            recognizer,
            synthesizer,
            camera: camera_device,
            presenter,
            memory,
            remote,
            identity,
            _dir: dir,
        }
    }
}

pub struct TestSession {
    pub handle: SessionHandle,
    pub recognizer: Arc<ScriptedRecognizer>,
    pub synthesizer: Arc<RecordingSynthesizer>,
    pub camera: Arc<StubCameraDevice>,
    pub presenter: Arc<RecordingPresenter>,
    pub memory: SharedMemory,
    pub remote: Arc<InMemoryRemoteStore>,
    pub identity: IdentityStore,
    _dir: tempfile::TempDir,
}

impl TestSession {
    /// Waits for the reply to be spoken and the next listening attempt to
    /// begin.
    pub async fn wait_for_next_listen(&self, listens: usize) {
        wait_until("the session to listen again", || {
            self.recognizer.listens() >= listens
                && self.handle.status() == AssistantStatus::Listening
        })
        .await;
    }

    pub async fn wait_for_status(&self, status: AssistantStatus) {
        wait_until(status.as_str(), || self.handle.status() == status).await;
    }
}

pub async fn wait_until<F>(what: &str, mut check: F)
where
    F: FnMut() -> bool,
{
    let waited = tokio::time::timeout(WAIT_TIMEOUT, async {
        while !check() {
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    })
    .await;

    assert!(waited.is_ok(), "timed out waiting for {what}");
}
