use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::OnceCell;
use tracing::info;

use crate::models::InlineImage;

pub type CameraFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, CameraError>> + Send + 'a>>;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CameraError {
    #[error("camera permission denied")]
    PermissionDenied,
    #[error("camera device unavailable: {0}")]
    DeviceUnavailable(String),
    #[error("camera capture failed: {0}")]
    CaptureFailed(String),
}

/// An opened camera stream. Capturing is a read-only snapshot of the current
/// frame.
pub trait CameraStream: Send + Sync {
    fn capture_frame(&self) -> CameraFuture<'_, InlineImage>;
}

pub trait CameraDevice: Send + Sync {
    fn open(&self) -> CameraFuture<'_, Arc<dyn CameraStream>>;
}

/// Lazily opens the device once and keeps the stream for the lifetime of the
/// process. A failed open is retried on the next capture.
pub struct Camera {
    device: Arc<dyn CameraDevice>,
    stream: OnceCell<Arc<dyn CameraStream>>,
}

impl Camera {
    pub fn new(device: Arc<dyn CameraDevice>) -> Self {
        Self {
            device,
            stream: OnceCell::new(),
        }
    }

    pub fn is_open(&self) -> bool {
        self.stream.initialized()
    }

    pub async fn capture(&self) -> Result<InlineImage, CameraError> {
        let stream = self
            .stream
            .get_or_try_init(|| async {
                let stream = self.device.open().await?;
                info!("camera stream acquired");
                Ok::<_, CameraError>(stream)
            })
            .await?;

        stream.capture_frame().await
    }
}
