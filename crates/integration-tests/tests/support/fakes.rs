#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use shared::ai::{AiGateway, AiGatewayError, AiGatewayFuture, AiRequest, AiResponse};
use shared::camera::{CameraDevice, CameraError, CameraFuture, CameraStream};
use shared::engine::TurnId;
use shared::models::InlineImage;
use shared::session::TurnPresenter;
use shared::speech::{
    RecognitionError, RecognitionErrorKind, RecognitionFuture, SpeechRecognizer,
    SpeechSynthesizer, SynthesisFuture, Utterance, Voice,
};
use tokio::sync::Notify;

pub const TEST_VOICE: &str = "Google UK English Female";

/// What the fake microphone "hears" on one listening attempt.
#[derive(Debug, Clone)]
pub enum Heard {
    Transcript(String),
    Silence,
    Failure(RecognitionErrorKind),
}

impl Heard {
    pub fn says(text: &str) -> Self {
        Self::Transcript(text.to_string())
    }

    fn into_result(self) -> Result<Option<String>, RecognitionError> {
        match self {
            Self::Transcript(text) => Ok(Some(text)),
            Self::Silence => Ok(None),
            Self::Failure(kind) => Err(RecognitionError::new(kind)),
        }
    }
}

/// Replays queued recognition results. With nothing queued a listen blocks
/// until something is queued or the recognizer is aborted.
#[derive(Default)]
pub struct ScriptedRecognizer {
    script: Mutex<VecDeque<Heard>>,
    queued: Notify,
    aborted: Notify,
    listens: AtomicUsize,
    aborts: AtomicUsize,
}

impl ScriptedRecognizer {
    pub fn with_script(script: Vec<Heard>) -> Self {
        Self {
            script: Mutex::new(VecDeque::from(script)),
            ..Self::default()
        }
    }

    pub fn queue(&self, heard: Heard) {
        self.script
            .lock()
            .expect("script lock should not be poisoned")
            .push_back(heard);
        self.queued.notify_one();
    }

    pub fn listens(&self) -> usize {
        self.listens.load(Ordering::SeqCst)
    }

    pub fn aborts(&self) -> usize {
        self.aborts.load(Ordering::SeqCst)
    }

    fn next(&self) -> Option<Heard> {
        self.script
            .lock()
            .expect("script lock should not be poisoned")
            .pop_front()
    }
}

impl SpeechRecognizer for ScriptedRecognizer {
    fn listen(&self) -> RecognitionFuture<'_> {
        self.listens.fetch_add(1, Ordering::SeqCst);
        Box::pin(async move {
            loop {
                let next = self.next();
                if let Some(heard) = next {
                    return heard.into_result();
                }

                tokio::select! {
                    _ = self.queued.notified() => {}
                    _ = self.aborted.notified() => {
                        return Err(RecognitionError::new(RecognitionErrorKind::Aborted));
                    }
                }
            }
        })
    }

    fn abort(&self) {
        self.aborts.fetch_add(1, Ordering::SeqCst);
        self.aborted.notify_waiters();
    }
}

/// Records every utterance instead of playing it. An optional delay keeps
/// each utterance "playing" for a while.
pub struct RecordingSynthesizer {
    voices: Vec<Voice>,
    spoken: Mutex<Vec<Utterance>>,
    cancels: AtomicUsize,
    delay: Option<Duration>,
}

impl RecordingSynthesizer {
    pub fn new() -> Self {
        Self::with_voices(vec![Voice {
            name: TEST_VOICE.to_string(),
            lang: "en-GB".to_string(),
            is_default: false,
        }])
    }

    pub fn with_voices(voices: Vec<Voice>) -> Self {
        Self {
            voices,
            spoken: Mutex::new(Vec::new()),
            cancels: AtomicUsize::new(0),
            delay: None,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn spoken(&self) -> Vec<String> {
        self.utterances()
            .into_iter()
            .map(|utterance| utterance.text)
            .collect()
    }

    pub fn utterances(&self) -> Vec<Utterance> {
        self.spoken
            .lock()
            .expect("spoken lock should not be poisoned")
            .clone()
    }

    pub fn cancels(&self) -> usize {
        self.cancels.load(Ordering::SeqCst)
    }
}

impl SpeechSynthesizer for RecordingSynthesizer {
    fn voices(&self) -> Vec<Voice> {
        self.voices.clone()
    }

    fn speak(&self, utterance: Utterance) -> SynthesisFuture<'_> {
        self.spoken
            .lock()
            .expect("spoken lock should not be poisoned")
            .push(utterance);
        let delay = self.delay;
        Box::pin(async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            Ok(())
        })
    }

    fn cancel(&self) {
        self.cancels.fetch_add(1, Ordering::SeqCst);
    }
}

/// Serves queued replies in order, then a generic one. Every request is kept
/// for inspection.
#[derive(Default)]
pub struct StubGateway {
    replies: Mutex<VecDeque<Result<AiResponse, AiGatewayError>>>,
    requests: Mutex<Vec<AiRequest>>,
    delay: Option<Duration>,
}

impl StubGateway {
    pub fn replying(replies: Vec<Result<AiResponse, AiGatewayError>>) -> Self {
        Self {
            replies: Mutex::new(VecDeque::from(replies)),
            ..Self::default()
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn requests(&self) -> Vec<AiRequest> {
        self.requests
            .lock()
            .expect("requests lock should not be poisoned")
            .clone()
    }
}

impl AiGateway for StubGateway {
    fn generate<'a>(&'a self, request: AiRequest) -> AiGatewayFuture<'a> {
        Box::pin(async move {
            self.requests
                .lock()
                .expect("requests lock should not be poisoned")
                .push(request);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }

            let reply = self
                .replies
                .lock()
                .expect("replies lock should not be poisoned")
                .pop_front();
            reply.unwrap_or_else(|| Ok(text_reply("Okay.")))
        })
    }
}

pub fn text_reply(text: &str) -> AiResponse {
    AiResponse {
        model: "stub-model".to_string(),
        text: text.to_string(),
        image: None,
    }
}

/// A camera whose every frame is the same image, or which never opens.
pub struct StubCameraDevice {
    frame: Result<InlineImage, CameraError>,
    opens: AtomicUsize,
}

impl StubCameraDevice {
    pub fn new(frame: Result<InlineImage, CameraError>) -> Self {
        Self {
            frame,
            opens: AtomicUsize::new(0),
        }
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

impl CameraDevice for StubCameraDevice {
    fn open(&self) -> CameraFuture<'_, Arc<dyn CameraStream>> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        let frame = self.frame.clone();
        Box::pin(async move {
            let frame = frame?;
            Ok(Arc::new(StillFrame(frame)) as Arc<dyn CameraStream>)
        })
    }
}

struct StillFrame(InlineImage);

impl CameraStream for StillFrame {
    fn capture_frame(&self) -> CameraFuture<'_, InlineImage> {
        let frame = self.0.clone();
        Box::pin(async move { Ok(frame) })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Shown {
    CapturedImage(TurnId),
    CapturedImageFaded(TurnId),
    IndicatorShown(TurnId),
    IndicatorHidden(TurnId),
    GeneratedImage(TurnId),
}

#[derive(Default)]
pub struct RecordingPresenter {
    shown: Mutex<Vec<Shown>>,
}

impl RecordingPresenter {
    pub fn shown(&self) -> Vec<Shown> {
        self.shown
            .lock()
            .expect("presenter lock should not be poisoned")
            .clone()
    }

    fn record(&self, event: Shown) {
        self.shown
            .lock()
            .expect("presenter lock should not be poisoned")
            .push(event);
    }
}

impl TurnPresenter for RecordingPresenter {
    fn show_captured_image(&self, turn: TurnId, _image: &InlineImage) {
        self.record(Shown::CapturedImage(turn));
    }

    fn fade_out_captured_image(&self, turn: TurnId) {
        self.record(Shown::CapturedImageFaded(turn));
    }

    fn show_processing_indicator(&self, turn: TurnId) {
        self.record(Shown::IndicatorShown(turn));
    }

    fn hide_processing_indicator(&self, turn: TurnId) {
        self.record(Shown::IndicatorHidden(turn));
    }

    fn show_generated_image(&self, turn: TurnId, _image: &InlineImage) {
        self.record(Shown::GeneratedImage(turn));
    }
}
