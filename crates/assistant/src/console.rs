use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use shared::camera::{CameraDevice, CameraError, CameraFuture, CameraStream};
use shared::engine::TurnId;
use shared::models::InlineImage;
use shared::session::TurnPresenter;
use shared::speech::{
    RecognitionError, RecognitionErrorKind, RecognitionFuture, SpeechRecognizer,
    SpeechSynthesizer, SynthesisError, SynthesisFuture, Utterance, Voice,
};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines, Stdin};
use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const CONSOLE_VOICE: &str = "console";

/// Treats each stdin line as a final transcript. End of input cancels
/// `eof` so the runtime can shut down.
pub struct StdinRecognizer {
    lines: Mutex<Lines<BufReader<Stdin>>>,
    abort: Notify,
    eof: CancellationToken,
}

impl StdinRecognizer {
    pub fn new(eof: CancellationToken) -> Self {
        Self {
            lines: Mutex::new(BufReader::new(tokio::io::stdin()).lines()),
            abort: Notify::new(),
            eof,
        }
    }
}

impl SpeechRecognizer for StdinRecognizer {
    fn listen(&self) -> RecognitionFuture<'_> {
        Box::pin(async move {
            let mut lines = self.lines.lock().await;
            tokio::select! {
                _ = self.abort.notified() => {
                    Err(RecognitionError::new(RecognitionErrorKind::Aborted))
                }
                line = lines.next_line() => match line {
                    Ok(Some(line)) => Ok(Some(line)),
                    Ok(None) => {
                        self.eof.cancel();
                        Ok(None)
                    }
                    Err(err) => Err(RecognitionError::new(RecognitionErrorKind::Other(
                        err.to_string(),
                    ))),
                },
            }
        })
    }

    fn abort(&self) {
        self.abort.notify_waiters();
    }
}

/// Prints replies to stdout instead of speaking them.
pub struct ConsoleSynthesizer {
    locale: String,
}

impl ConsoleSynthesizer {
    pub fn new(locale: impl Into<String>) -> Self {
        Self {
            locale: locale.into(),
        }
    }
}

impl SpeechSynthesizer for ConsoleSynthesizer {
    fn voices(&self) -> Vec<Voice> {
        vec![Voice {
            name: CONSOLE_VOICE.to_string(),
            lang: self.locale.clone(),
            is_default: true,
        }]
    }

    fn speak(&self, utterance: Utterance) -> SynthesisFuture<'_> {
        Box::pin(async move {
            let mut stdout = tokio::io::stdout();
            let line = format!("NOVA: {}\n", utterance.text);
            stdout
                .write_all(line.as_bytes())
                .await
                .map_err(|err| SynthesisError::Failed(err.to_string()))?;
            stdout
                .flush()
                .await
                .map_err(|err| SynthesisError::Failed(err.to_string()))
        })
    }

    fn cancel(&self) {}
}

/// A still image on disk standing in for the camera feed. Every capture
/// re-reads the file so replacing it changes the next frame.
pub struct FileCameraDevice {
    path: Option<PathBuf>,
}

impl FileCameraDevice {
    pub fn new(path: Option<PathBuf>) -> Self {
        Self { path }
    }
}

impl CameraDevice for FileCameraDevice {
    fn open(&self) -> CameraFuture<'_, Arc<dyn CameraStream>> {
        Box::pin(async move {
            let Some(path) = self.path.clone() else {
                return Err(CameraError::DeviceUnavailable(
                    "NOVA_CAMERA_IMAGE_PATH is not set".to_string(),
                ));
            };
            if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
                return Err(CameraError::DeviceUnavailable(format!(
                    "{} does not exist",
                    path.display()
                )));
            }

            Ok(Arc::new(FileCameraStream { path }) as Arc<dyn CameraStream>)
        })
    }
}

struct FileCameraStream {
    path: PathBuf,
}

impl CameraStream for FileCameraStream {
    fn capture_frame(&self) -> CameraFuture<'_, InlineImage> {
        Box::pin(async move {
            let data = tokio::fs::read(&self.path)
                .await
                .map_err(|err| CameraError::CaptureFailed(err.to_string()))?;
            Ok(InlineImage::new(mime_type_for(&self.path), data))
        })
    }
}

fn mime_type_for(path: &Path) -> &'static str {
    match path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase)
        .as_deref()
    {
        Some("png") => "image/png",
        Some("webp") => "image/webp",
        Some("gif") => "image/gif",
        _ => "image/jpeg",
    }
}

/// Describes visual events on stdout and downloads generated images.
pub struct ConsolePresenter {
    download_dir: PathBuf,
}

impl ConsolePresenter {
    pub fn new(download_dir: impl Into<PathBuf>) -> Self {
        Self {
            download_dir: download_dir.into(),
        }
    }

    fn download(&self, turn: TurnId, image: &InlineImage) -> std::io::Result<PathBuf> {
        fs::create_dir_all(&self.download_dir)?;
        let path = self.download_dir.join(format!(
            "nova-{}-{}.{}",
            turn.get(),
            Utc::now().format("%Y%m%d%H%M%S"),
            image.file_extension()
        ));
        fs::write(&path, &image.data)?;
        Ok(path)
    }
}

impl TurnPresenter for ConsolePresenter {
    fn show_captured_image(&self, _turn: TurnId, image: &InlineImage) {
        println!("[camera frame: {} bytes]", image.data.len());
    }

    fn fade_out_captured_image(&self, _turn: TurnId) {}

    fn show_processing_indicator(&self, _turn: TurnId) {
        println!("[generating image...]");
    }

    fn hide_processing_indicator(&self, _turn: TurnId) {}

    fn show_generated_image(&self, turn: TurnId, image: &InlineImage) {
        match self.download(turn, image) {
            Ok(path) => {
                info!(turn_id = %turn, path = %path.display(), "generated image saved");
                println!("[image saved to {}]", path.display());
            }
            Err(err) => warn!(turn_id = %turn, error = %err, "failed to save generated image"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::camera::Camera;

    #[tokio::test]
    async fn file_camera_reads_the_configured_image() {
        let dir = tempfile::tempdir().expect("temp dir should be created");
        let path = dir.path().join("frame.png");
        fs::write(&path, [1_u8, 2, 3]).expect("frame should be written");

        let camera = Camera::new(Arc::new(FileCameraDevice::new(Some(path))));
        let frame = camera.capture().await.expect("capture should succeed");

        assert_eq!(frame.mime_type, "image/png");
        assert_eq!(frame.data, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn missing_camera_image_is_unavailable() {
        let camera = Camera::new(Arc::new(FileCameraDevice::new(None)));
        assert!(matches!(
            camera.capture().await,
            Err(CameraError::DeviceUnavailable(_))
        ));
    }

    #[test]
    fn presenter_downloads_generated_images() {
        let dir = tempfile::tempdir().expect("temp dir should be created");
        let presenter = ConsolePresenter::new(dir.path().join("downloads"));

        let path = presenter
            .download(first_turn(), &InlineImage::new("image/png", vec![9, 9]))
            .expect("download should succeed");

        assert_eq!(path.extension().and_then(|ext| ext.to_str()), Some("png"));
        assert_eq!(fs::read(path).expect("file should exist"), vec![9, 9]);
    }

    fn first_turn() -> TurnId {
        let mut engine = shared::engine::ConversationEngine::default();
        engine.set_voice(ConsoleSynthesizer::new("en-US").voices().pop());
        assert!(engine.on_recognition_start());
        engine
            .on_transcript_final("draw a lighthouse")
            .expect("transcript should open a turn")
    }
}
