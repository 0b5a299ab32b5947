// Contract for the external processing engine.
//
// The media transformation work itself is not part of this crate; the front
// end only needs a health signal and a way to hand a request over.

use crate::errors::ServerError;
use crate::router::HandlerFuture;
use axum::body::Body;
use axum::http::{Request, StatusCode};

#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct EngineError(String);

impl EngineError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// The image/media transformation collaborator.
pub trait ProcessingEngine: Send + Sync {
    /// Synchronous liveness signal, cheap enough for frequent polling.
    fn health(&self) -> Result<(), EngineError>;

    /// Handle one processing request. Failures must be `ServerError`s so the
    /// fault-isolation wrapper can render them with the right policy.
    fn process(&self, req_id: String, req: Request<Body>) -> HandlerFuture;
}

/// Placeholder engine wired by the binary until a real engine is linked in.
/// Always healthy; recognizes no processing URLs.
pub struct NoopEngine;

impl ProcessingEngine for NoopEngine {
    fn health(&self) -> Result<(), EngineError> {
        Ok(())
    }

    fn process(&self, _req_id: String, req: Request<Body>) -> HandlerFuture {
        let path = req.uri().path().to_owned();
        Box::pin(async move {
            Err(ServerError::invalid_url(
                StatusCode::NOT_FOUND,
                format!("No processing engine is configured to serve {path}"),
            ))
        })
    }
}
