use image::RgbImage;
use rollcall_core::{EncoderError, FaceEncoder, FaceMatcher, IndexCache, IndexError, Recognition};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("known-face index error: {0}")]
    Index(#[from] IndexError),
    #[error("face encoder error: {0}")]
    Encoder(#[from] EncoderError),
    #[error("failed to spawn engine thread: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// Messages sent from HTTP handlers to the engine thread.
enum EngineRequest {
    Recognize {
        frame: RgbImage,
        reply: oneshot::Sender<Result<Recognition, EngineError>>,
    },
    Invalidate,
    KnownFaces {
        reply: oneshot::Sender<Result<Vec<String>, EngineError>>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
}

impl EngineHandle {
    /// Refresh the index per policy, then match `frame` against it.
    pub async fn recognize(&self, frame: RgbImage) -> Result<Recognition, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Recognize {
                frame,
                reply: reply_tx,
            })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    /// Force a rebuild before the next lookup.
    pub async fn invalidate_index(&self) -> Result<(), EngineError> {
        self.tx
            .send(EngineRequest::Invalidate)
            .await
            .map_err(|_| EngineError::ChannelClosed)
    }

    /// Names currently in the (refreshed) index, in index order.
    pub async fn known_faces(&self) -> Result<Vec<String>, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::KnownFaces { reply: reply_tx })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }
}

/// Run the encoder, index cache and matcher on a dedicated OS thread.
///
/// ONNX sessions need `&mut` access, so every request is serialized
/// through one owner instead of sharing the encoder behind a lock.
pub fn spawn_engine<E>(
    mut encoder: E,
    mut cache: IndexCache,
    matcher: FaceMatcher,
) -> Result<EngineHandle, EngineError>
where
    E: FaceEncoder + Send + 'static,
{
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(16);

    tracing::info!(
        dir = %cache.dir().display(),
        policy = %cache.policy(),
        "known-face index configured"
    );

    std::thread::Builder::new()
        .name("rollcall-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            while let Some(req) = rx.blocking_recv() {
                match req {
                    EngineRequest::Recognize { frame, reply } => {
                        let result = run_recognize(&mut encoder, &mut cache, &matcher, &frame);
                        let _ = reply.send(result);
                    }
                    EngineRequest::Invalidate => {
                        tracing::debug!("known-face index invalidated");
                        cache.invalidate();
                    }
                    EngineRequest::KnownFaces { reply } => {
                        let result = cache
                            .refresh_index(&mut encoder)
                            .map(|index| index.names().into_iter().map(String::from).collect())
                            .map_err(EngineError::from);
                        let _ = reply.send(result);
                    }
                }
            }
            tracing::info!("engine thread exiting");
        })
        .map_err(EngineError::Spawn)?;

    Ok(EngineHandle { tx })
}

fn run_recognize<E: FaceEncoder>(
    encoder: &mut E,
    cache: &mut IndexCache,
    matcher: &FaceMatcher,
    frame: &RgbImage,
) -> Result<Recognition, EngineError> {
    let index = cache.refresh_index(encoder)?;
    tracing::debug!(known = index.len(), "matching frame against index");

    let recognition = matcher.recognize(encoder, frame, index)?;
    match &recognition {
        Recognition::Matched { name, score } => {
            tracing::info!(name = %name, score, "face recognized")
        }
        Recognition::NoMatch { faces } => tracing::info!(faces, "no known face matched"),
        Recognition::NoFace => tracing::info!("no face detected in frame"),
    }
    Ok(recognition)
}
