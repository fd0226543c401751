use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::ai::AiGateway;
use crate::ai::prompts::MICROPHONE_UNAVAILABLE;
use crate::assistant_memory::SharedMemory;
use crate::camera::Camera;
use crate::config::AssistantConfig;
use crate::engine::{
    AssistantState, ConversationEngine, ErrorOutcome, RestartDelay, SpeechEndOutcome, TurnId,
    TurnReply,
};
use crate::intent::IntentRouter;
use crate::models::AssistantStatus;
use crate::speech::{
    RecognitionError, SpeechRecognizer, SpeechSynthesizer, SynthesisError, Utterance,
    select_voice,
};
use crate::sync::SyncService;
use crate::users::{IdentityError, IdentityStore};

pub mod presenter;
mod turn;

pub use presenter::TurnPresenter;

use turn::{TurnContext, process_turn};

const EVENT_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("assistant session has already stopped")]
    Stopped,
    #[error("assistant session task failed: {0}")]
    Join(String),
    #[error(transparent)]
    Identity(#[from] IdentityError),
}

/// Collaborators for one assistant session.
pub struct SessionDeps {
    pub config: AssistantConfig,
    pub recognizer: Arc<dyn SpeechRecognizer>,
    pub synthesizer: Arc<dyn SpeechSynthesizer>,
    pub gateway: Arc<dyn AiGateway>,
    pub camera: Arc<Camera>,
    pub presenter: Arc<dyn TurnPresenter>,
    pub memory: SharedMemory,
    pub sync: Arc<SyncService>,
    pub identity: IdentityStore,
    pub router: IntentRouter,
}

enum EngineEvent {
    ResumeListening,
    RecognitionFinished(Result<Option<String>, RecognitionError>),
    TurnProcessed { turn: TurnId, reply: TurnReply },
    SpeechFinished {
        turn: Option<TurnId>,
        result: Result<(), SynthesisError>,
    },
    RestartTimerFired,
    Snapshot(oneshot::Sender<AssistantState>),
}

pub struct AssistantSession {
    engine: ConversationEngine,
    recognizer: Arc<dyn SpeechRecognizer>,
    synthesizer: Arc<dyn SpeechSynthesizer>,
    presenter: Arc<dyn TurnPresenter>,
    turn_context: TurnContext,
    settle_delay: Duration,
    retry_delay: Duration,
    speech_rate: f32,
    speech_pitch: f32,
    events_tx: mpsc::Sender<EngineEvent>,
    events_rx: mpsc::Receiver<EngineEvent>,
    status_tx: watch::Sender<AssistantStatus>,
    tasks: JoinSet<()>,
    cancel: CancellationToken,
}

impl AssistantSession {
    /// Builds the session, selects a voice and spawns the event loop.
    /// Listening starts right away when a voice is available.
    pub fn start(deps: SessionDeps) -> SessionHandle {
        let SessionDeps {
            config,
            recognizer,
            synthesizer,
            gateway,
            camera,
            presenter,
            memory,
            sync,
            identity,
            router,
        } = deps;

        let mut engine = ConversationEngine::new(router);
        let current_user = memory.lock().current_user().map(|user| user.id.clone());
        engine.set_current_user(current_user);

        let voice = select_voice(&synthesizer.voices(), &config.preferred_voice);
        match &voice {
            Some(voice) => info!(voice = %voice.name, "speech voice selected"),
            None => warn!("no speech voice available, listening will not start"),
        }
        engine.set_voice(voice);

        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (status_tx, status_rx) = watch::channel(engine.status());
        let cancel = CancellationToken::new();

        let session = Self {
            engine,
            recognizer,
            synthesizer,
            presenter: presenter.clone(),
            turn_context: TurnContext {
                gateway,
                camera,
                presenter,
                memory: memory.clone(),
                sync,
                prior_turns: config.prior_turns,
            },
            settle_delay: config.settle_delay(),
            retry_delay: config.recognition_retry_delay(),
            speech_rate: config.speech_rate,
            speech_pitch: config.speech_pitch,
            events_tx: events_tx.clone(),
            events_rx,
            status_tx,
            tasks: JoinSet::new(),
            cancel: cancel.clone(),
        };

        SessionHandle {
            events: events_tx,
            status: status_rx,
            cancel,
            identity,
            memory,
            task: tokio::spawn(session.run()),
        }
    }

    async fn run(mut self) {
        self.start_listening();
        self.publish_status();

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                Some(event) = self.events_rx.recv() => {
                    self.handle(event);
                    self.publish_status();
                }
                Some(joined) = self.tasks.join_next(), if !self.tasks.is_empty() => {
                    if let Err(err) = joined
                        && err.is_panic()
                    {
                        error!(error = %err, "session task panicked");
                    }
                }
            }
        }

        self.teardown().await;
    }

    fn handle(&mut self, event: EngineEvent) {
        match event {
            EngineEvent::ResumeListening => {
                if self.engine.resume_listening() {
                    info!("listening resumed");
                    self.spawn_listen();
                }
            }
            EngineEvent::RecognitionFinished(Ok(Some(transcript))) => {
                self.on_transcript(transcript);
            }
            EngineEvent::RecognitionFinished(Ok(None)) => {
                if let Some(delay) = self.engine.on_recognition_ended() {
                    self.schedule_restart(delay);
                }
            }
            EngineEvent::RecognitionFinished(Err(err)) => match self.engine.on_error(&err) {
                ErrorOutcome::Restart(delay) => self.schedule_restart(delay),
                ErrorOutcome::Halted => self.speak_notice(MICROPHONE_UNAVAILABLE),
                ErrorOutcome::Ignored => {}
            },
            EngineEvent::TurnProcessed { turn, reply } => self.on_turn_processed(turn, reply),
            EngineEvent::SpeechFinished { turn, result } => {
                if let Err(err) = result {
                    warn!(error = %err, "speech synthesis failed");
                }
                self.on_speech_finished(turn);
            }
            EngineEvent::RestartTimerFired => {
                if self.engine.on_restart_timer() {
                    self.spawn_listen();
                }
            }
            EngineEvent::Snapshot(reply) => {
                let _ = reply.send(self.engine.state().clone());
            }
        }
    }

    fn on_transcript(&mut self, transcript: String) {
        let Some(turn) = self.engine.on_transcript_final(&transcript) else {
            // Blank or rejected transcripts end this listening attempt.
            if let Some(delay) = self.engine.on_recognition_ended() {
                self.schedule_restart(delay);
            }
            return;
        };
        let Some(intent) = self.engine.active_turn().map(|active| active.intent) else {
            return;
        };

        let ctx = self.turn_context.clone();
        let events = self.events_tx.clone();
        self.tasks.spawn(async move {
            let reply = process_turn(ctx, turn, transcript, intent).await;
            let _ = events
                .send(EngineEvent::TurnProcessed { turn, reply })
                .await;
        });
    }

    fn on_turn_processed(&mut self, turn: TurnId, reply: TurnReply) {
        let Some(accepted) = self.engine.on_ai_result(turn, reply) else {
            debug!(turn_id = %turn, "stale reply discarded");
            return;
        };

        if let Some(image) = &accepted.captured_image {
            self.presenter.show_captured_image(turn, image);
        }
        if let Some(image) = &accepted.generated_image {
            self.presenter.show_generated_image(turn, image);
        }
        let text = accepted.response.clone().unwrap_or_default();
        self.spawn_speak(text, Some(turn));
    }

    fn on_speech_finished(&mut self, turn: Option<TurnId>) {
        match self.engine.on_speech_end(turn) {
            SpeechEndOutcome::TurnCompleted(finished) => {
                if finished.captured_image.is_some() {
                    self.presenter.fade_out_captured_image(finished.id);
                }
                self.schedule_restart(RestartDelay::Settle);
            }
            SpeechEndOutcome::NoticeCompleted(Some(delay)) => {
                info!("listening resumes after notice");
                self.schedule_restart(delay);
            }
            SpeechEndOutcome::NoticeCompleted(None) | SpeechEndOutcome::Ignored => {}
        }
    }

    fn start_listening(&mut self) {
        if self.engine.on_recognition_start() {
            self.spawn_listen();
        }
    }

    fn spawn_listen(&mut self) {
        let recognizer = self.recognizer.clone();
        let events = self.events_tx.clone();
        self.tasks.spawn(async move {
            let result = recognizer.listen().await;
            let _ = events.send(EngineEvent::RecognitionFinished(result)).await;
        });
    }

    fn speak_notice(&mut self, text: &str) {
        if self.engine.begin_notice() {
            self.spawn_speak(text.to_string(), None);
        }
    }

    fn spawn_speak(&mut self, text: String, turn: Option<TurnId>) {
        let utterance = Utterance {
            text,
            voice: self.engine.state().selected_voice.clone(),
            rate: self.speech_rate,
            pitch: self.speech_pitch,
            turn,
        };
        let synthesizer = self.synthesizer.clone();
        let events = self.events_tx.clone();
        self.tasks.spawn(async move {
            let result = synthesizer.speak(utterance).await;
            let _ = events
                .send(EngineEvent::SpeechFinished { turn, result })
                .await;
        });
    }

    fn schedule_restart(&mut self, delay: RestartDelay) {
        if !self.engine.request_restart() {
            return;
        }

        let wait = match delay {
            RestartDelay::Settle => self.settle_delay,
            RestartDelay::Retry => self.retry_delay,
        };
        let events = self.events_tx.clone();
        self.tasks.spawn(async move {
            tokio::time::sleep(wait).await;
            let _ = events.send(EngineEvent::RestartTimerFired).await;
        });
    }

    fn publish_status(&self) {
        self.status_tx.send_if_modified(|status| {
            let next = self.engine.status();
            if *status == next {
                false
            } else {
                debug!(from = status.as_str(), to = next.as_str(), "status changed");
                *status = next;
                true
            }
        });
    }

    async fn teardown(&mut self) {
        if let Some(dropped) = self.engine.teardown() {
            info!(turn_id = %dropped.id, "in-flight turn discarded");
        }
        self.recognizer.abort();
        self.synthesizer.cancel();
        self.tasks.shutdown().await;
        self.events_rx.close();
        self.publish_status();
        info!("assistant session stopped");
    }
}

/// Control surface for a running session.
pub struct SessionHandle {
    events: mpsc::Sender<EngineEvent>,
    status: watch::Receiver<AssistantStatus>,
    cancel: CancellationToken,
    identity: IdentityStore,
    memory: SharedMemory,
    task: JoinHandle<()>,
}

impl SessionHandle {
    pub fn status(&self) -> AssistantStatus {
        *self.status.borrow()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<AssistantStatus> {
        self.status.clone()
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    pub async fn state_snapshot(&self) -> Result<AssistantState, SessionError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.events
            .send(EngineEvent::Snapshot(reply_tx))
            .await
            .map_err(|_| SessionError::Stopped)?;
        reply_rx.await.map_err(|_| SessionError::Stopped)
    }

    /// Clears a fatal recognition halt and starts listening again.
    pub async fn resume_listening(&self) -> Result<(), SessionError> {
        self.events
            .send(EngineEvent::ResumeListening)
            .await
            .map_err(|_| SessionError::Stopped)
    }

    /// Stops the session and waits for it to tear down. The persisted
    /// identity is kept.
    pub async fn shutdown(self) -> Result<(), SessionError> {
        self.cancel.cancel();
        self.task
            .await
            .map_err(|err| SessionError::Join(err.to_string()))
    }

    /// Stops the session, then forgets the logged in user.
    pub async fn logout(self) -> Result<(), SessionError> {
        let identity = self.identity.clone();
        let memory = self.memory.clone();
        self.shutdown().await?;

        memory.update(|memory| memory.set_current_user(None));
        identity.logout()?;
        Ok(())
    }
}
