//! Camera + extractor engine on a dedicated OS thread.
//!
//! Capture and inference are blocking, so they live on their own thread
//! behind an mpsc request channel; the async side talks to it through a
//! clone-safe [`EngineHandle`]. The camera and the loaded models are owned
//! by the thread: when the last handle is dropped the channel closes, the
//! request loop ends, and the device is released with it. No capture
//! session outlives the engine.

use presenca_core::extract::{ExtractError, Extractor, OnnxExtractor};
use presenca_core::liveness::LivenessFrame;
use presenca_core::types::{Detection, Embedding};
use presenca_hw::{Camera, CameraError};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

/// Frames with more than this share of near-black pixels are treated as
/// no-detection instead of being fed to the models.
const DARK_FRAME_PCT: f32 = 0.95;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("camera error: {0}")]
    Camera(#[from] CameraError),
    #[error("extractor error: {0}")]
    Extract(#[from] ExtractError),
    #[error("engine thread exited")]
    ChannelClosed,
}

enum EngineRequest {
    /// Landmark geometry for the liveness gate.
    Sense {
        reply: oneshot::Sender<Result<Detection<LivenessFrame>, EngineError>>,
    },
    /// Full embedding extraction.
    Extract {
        reply: oneshot::Sender<Result<Detection<Embedding>, EngineError>>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
}

impl EngineHandle {
    /// Capture one frame and return its landmark geometry.
    pub async fn sense(&self) -> Result<Detection<LivenessFrame>, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Sense { reply: reply_tx })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    /// Capture one frame and extract a face embedding from it.
    pub async fn extract(&self) -> Result<Detection<Embedding>, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Extract { reply: reply_tx })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }
}

impl crate::kiosk::ObserveSource for EngineHandle {
    type Error = EngineError;

    async fn sense(&mut self) -> Result<Detection<LivenessFrame>, EngineError> {
        EngineHandle::sense(self).await
    }

    async fn extract(&mut self) -> Result<Detection<Embedding>, EngineError> {
        EngineHandle::extract(self).await
    }
}

/// Spawn the engine on a dedicated OS thread.
///
/// Opens the camera, loads the three ONNX models, discards warmup frames,
/// then enters the request loop. Fails fast at startup if any resource is
/// unavailable, so the daemon can fall back to manual-only mode.
pub fn spawn_engine(
    camera_device: &str,
    detector_path: &str,
    landmark_path: &str,
    recognition_path: &str,
    warmup_frames: usize,
) -> Result<EngineHandle, EngineError> {
    let camera = Camera::open(camera_device)?;
    tracing::info!(
        device = camera_device,
        width = camera.width,
        height = camera.height,
        fourcc = ?camera.fourcc,
        "camera opened"
    );

    let mut extractor = OnnxExtractor::load(detector_path, landmark_path, recognition_path)?;
    tracing::info!("face pipeline loaded");

    // Discard warmup frames for camera AGC/AE stabilization.
    if warmup_frames > 0 {
        tracing::info!(count = warmup_frames, "discarding warmup frames");
        for _ in 0..warmup_frames {
            let _ = camera.capture_frame();
        }
    }

    let (tx, mut rx) = mpsc::channel::<EngineRequest>(4);

    std::thread::Builder::new()
        .name("presenca-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            while let Some(req) = rx.blocking_recv() {
                match req {
                    EngineRequest::Sense { reply } => {
                        let _ = reply.send(run_sense(&camera, &mut extractor));
                    }
                    EngineRequest::Extract { reply } => {
                        let _ = reply.send(run_extract(&camera, &mut extractor));
                    }
                }
            }
            tracing::info!("engine thread exiting");
        })
        .expect("failed to spawn engine thread");

    Ok(EngineHandle { tx })
}

fn run_sense(
    camera: &Camera,
    extractor: &mut OnnxExtractor,
) -> Result<Detection<LivenessFrame>, EngineError> {
    let frame = camera.capture_frame()?;
    if frame.is_dark(DARK_FRAME_PCT) {
        tracing::debug!(seq = frame.sequence, "dark frame; treating as no detection");
        return Ok(Detection::NotDetected);
    }
    Ok(extractor.landmarks(&frame.data, frame.width, frame.height)?)
}

fn run_extract(
    camera: &Camera,
    extractor: &mut OnnxExtractor,
) -> Result<Detection<Embedding>, EngineError> {
    let frame = camera.capture_frame()?;
    if frame.is_dark(DARK_FRAME_PCT) {
        tracing::debug!(seq = frame.sequence, "dark frame; treating as no detection");
        return Ok(Detection::NotDetected);
    }
    Ok(extractor.extract(&frame.data, frame.width, frame.height)?)
}
