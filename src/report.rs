// Contract for the external error-reporting collaborator.

use crate::errors::ServerError;
use crate::router::RequestMeta;
use tracing::error;

/// Receives failures whose `should_report()` policy allows external
/// reporting. The request metadata is the attachable context.
pub trait ErrorReporter: Send + Sync {
    fn report(&self, err: &ServerError, meta: &RequestMeta);
}

/// Log-based stand-in for an external reporting service.
pub struct LogReporter;

impl ErrorReporter for LogReporter {
    fn report(&self, err: &ServerError, meta: &RequestMeta) {
        error!(
            request_id = %meta.id,
            method = %meta.method,
            uri = %meta.uri,
            error = %err,
            origin = %err.origin(),
            "reported error"
        );
    }
}
