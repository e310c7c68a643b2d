use facematch_core::{Detection, ExtractionError, Extractor};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("extraction failed: {0}")]
    Extraction(#[from] ExtractionError),
    #[error("could not spawn engine thread: {0}")]
    Spawn(std::io::Error),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// Messages sent from service handlers to the engine thread.
enum EngineRequest {
    Extract {
        image: Vec<u8>,
        min_confidence: f32,
        reply: oneshot::Sender<Result<Vec<Detection>, ExtractionError>>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
}

impl EngineHandle {
    /// Detect every face in `image` and embed each one.
    pub async fn extract(&self, image: Vec<u8>, min_confidence: f32) -> Result<Vec<Detection>, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Extract {
                image,
                min_confidence,
                reply: reply_tx,
            })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        Ok(reply_rx.await.map_err(|_| EngineError::ChannelClosed)??)
    }
}

/// Spawn the engine on a dedicated OS thread.
///
/// The extractor holds ONNX sessions that need `&mut` access, so all
/// inference is serialized through one request loop. The thread exits when
/// every handle has been dropped.
pub fn spawn_engine(mut extractor: Box<dyn Extractor>) -> Result<EngineHandle, EngineError> {
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(16);

    std::thread::Builder::new()
        .name("facematch-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            while let Some(req) = rx.blocking_recv() {
                match req {
                    EngineRequest::Extract {
                        image,
                        min_confidence,
                        reply,
                    } => {
                        let result = extractor.extract(&image, min_confidence);
                        if let Ok(faces) = &result {
                            tracing::debug!(bytes = image.len(), faces = faces.len(), "extract request served");
                        }
                        let _ = reply.send(result);
                    }
                }
            }
            tracing::info!("engine thread exiting");
        })
        .map_err(EngineError::Spawn)?;

    Ok(EngineHandle { tx })
}

/// Load the SCRFD + ArcFace extractor and start the engine.
///
/// Fails fast at startup if either model file is unavailable.
pub fn start_onnx_engine(scrfd_path: &str, arcface_path: &str) -> Result<EngineHandle, EngineError> {
    let extractor = facematch_core::OnnxExtractor::load(scrfd_path, arcface_path)?;
    tracing::info!(scrfd = scrfd_path, arcface = arcface_path, "face models loaded");
    spawn_engine(Box::new(extractor))
}
