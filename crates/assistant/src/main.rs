mod cli;
mod console;

use std::sync::Arc;

use shared::ai::{GeminiConfigError, GeminiGateway, GeminiGatewayConfig};
use shared::assistant_memory::{MemoryStore, SharedMemory};
use shared::camera::Camera;
use shared::config::{AssistantConfig, ConfigError, load_dotenv};
use shared::intent::IntentRouter;
use shared::local_state::{FileStateStore, LocalStateStore, StateStoreError};
use shared::session::{AssistantSession, SessionDeps, SessionError};
use shared::sync::{InMemoryRemoteStore, RedisRemoteStore, RemoteMemoryStore, SyncService};
use shared::users::{IdentityError, IdentityStore};
use thiserror::Error;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use cli::{CliError, CliOptions};
use console::{ConsolePresenter, ConsoleSynthesizer, FileCameraDevice, StdinRecognizer};

#[derive(Debug, Error)]
enum RuntimeError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Gemini(#[from] GeminiConfigError),
    #[error(transparent)]
    State(#[from] StateStoreError),
    #[error(transparent)]
    Identity(#[from] IdentityError),
    #[error(transparent)]
    Session(#[from] SessionError),
}

#[tokio::main]
async fn main() {
    let options = match CliOptions::parse(std::env::args().skip(1)) {
        Ok(options) => options,
        Err(CliError::HelpRequested) => {
            print_usage();
            return;
        }
        Err(err) => {
            eprintln!("{err}");
            print_usage();
            std::process::exit(2);
        }
    };

    if let Err(err) = load_dotenv() {
        eprintln!("{err}");
        std::process::exit(1);
    }
    init_tracing();

    let mut config = match AssistantConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            error!("failed to read assistant config: {err}");
            std::process::exit(1);
        }
    };
    if options.user.is_some() {
        config.login_name = options.user;
    }

    if let Err(err) = run(config).await {
        error!("assistant stopped with error: {err}");
        std::process::exit(1);
    }
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("nova=info,shared=info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    if std::env::var("NOVA_LOG_FORMAT").is_ok_and(|format| format.eq_ignore_ascii_case("json")) {
        builder
            .json()
            .flatten_event(true)
            .with_current_span(true)
            .init();
    } else {
        builder.init();
    }
}

async fn run(config: AssistantConfig) -> Result<(), RuntimeError> {
    let state: Arc<dyn LocalStateStore> = Arc::new(FileStateStore::new(config.state_dir.clone())?);
    let identity = IdentityStore::new(state.clone());
    let user = match config.login_name.as_deref() {
        Some(name) => Some(identity.login(name)?),
        None => identity.current_user()?,
    };
    match &user {
        Some(user) => info!(user_id = %user.id, "session user resolved"),
        None => info!("no user logged in, shared memory is disabled"),
    }

    let mut store = MemoryStore::load(state.clone())?;
    store.set_current_user(user);
    let memory = SharedMemory::new(store);

    let remote: Arc<dyn RemoteMemoryStore> = match config.redis_url.as_deref() {
        Some(url) => match RedisRemoteStore::connect(url).await {
            Ok(store) => Arc::new(store),
            Err(err) => {
                warn!(error = %err, "redis unavailable, shared memory stays on this device");
                Arc::new(InMemoryRemoteStore::default())
            }
        },
        None => Arc::new(InMemoryRemoteStore::default()),
    };
    let sync = Arc::new(SyncService::new(
        remote,
        memory.clone(),
        state,
        config.sync_interval(),
    )?);

    let gateway = Arc::new(GeminiGateway::new(GeminiGatewayConfig::from_env()?)?);
    let camera = Arc::new(Camera::new(Arc::new(FileCameraDevice::new(
        config.camera_image_path.clone(),
    ))));

    let input_closed = CancellationToken::new();
    let sync_cancel = CancellationToken::new();
    let sync_task = {
        let sync = sync.clone();
        let cancel = sync_cancel.clone();
        tokio::spawn(async move { sync.run(cancel).await })
    };

    let handle = AssistantSession::start(SessionDeps {
        recognizer: Arc::new(StdinRecognizer::new(input_closed.clone())),
        synthesizer: Arc::new(ConsoleSynthesizer::new(config.locale.clone())),
        gateway,
        camera,
        presenter: Arc::new(ConsolePresenter::new(config.download_dir.clone())),
        memory,
        sync,
        identity,
        router: IntentRouter::default(),
        config,
    });

    let mut status = handle.subscribe_status();
    let status_task = tokio::spawn(async move {
        while status.changed().await.is_ok() {
            let current = *status.borrow_and_update();
            info!(status = current.as_str(), "assistant status");
        }
    });

    tokio::select! {
        _ = signal::ctrl_c() => info!("shutdown signal received"),
        _ = input_closed.cancelled() => info!("input closed"),
    }

    handle.shutdown().await?;
    sync_cancel.cancel();
    if let Err(err) = sync_task.await {
        warn!(error = %err, "sync task failed to join");
    }
    status_task.abort();
    Ok(())
}

fn print_usage() {
    println!("Usage: nova [options]");
    println!();
    println!("Type what you would say to NOVA, one line per utterance.");
    println!();
    println!("Options:");
    println!("  --user, -u <name>  Log in as one of the predefined users (abhay, piram)");
    println!("  --help, -h         Show this help");
}
