// Contract for the metrics collaborator.
//
// The instrumentation wrapper opens one span per request and completes it
// with the resolved status on every exit path. Implementations must treat a
// dropped-but-uncompleted span as closed, so an unwind cannot leak one.

use crate::router::RequestMeta;
use axum::http::StatusCode;
use std::time::Instant;
use tracing::{info, warn};

pub trait Metrics: Send + Sync {
    /// When false, the instrumentation wrapper is the identity transform.
    fn enabled(&self) -> bool;

    fn start_request(&self, meta: &RequestMeta) -> Box<dyn RequestSpan>;
}

pub trait RequestSpan: Send {
    fn complete(self: Box<Self>, status: StatusCode);
}

/// Metrics disabled process-wide; `start_request` is never called because
/// the wrapper short-circuits on `enabled()`.
pub struct Disabled;

impl Metrics for Disabled {
    fn enabled(&self) -> bool {
        false
    }

    fn start_request(&self, _meta: &RequestMeta) -> Box<dyn RequestSpan> {
        Box::new(NoopSpan)
    }
}

struct NoopSpan;

impl RequestSpan for NoopSpan {
    fn complete(self: Box<Self>, _status: StatusCode) {}
}

/// Logs a per-request timing line; stand-in for an external metrics backend.
pub struct TimingLogger;

impl Metrics for TimingLogger {
    fn enabled(&self) -> bool {
        true
    }

    fn start_request(&self, meta: &RequestMeta) -> Box<dyn RequestSpan> {
        Box::new(TimingSpan {
            meta: meta.clone(),
            started: Instant::now(),
            completed: false,
        })
    }
}

struct TimingSpan {
    meta: RequestMeta,
    started: Instant,
    completed: bool,
}

impl RequestSpan for TimingSpan {
    fn complete(mut self: Box<Self>, status: StatusCode) {
        self.completed = true;
        info!(
            request_id = %self.meta.id,
            method = %self.meta.method,
            uri = %self.meta.uri,
            status = status.as_u16(),
            elapsed_ms = self.started.elapsed().as_millis() as u64,
            "request timing"
        );
    }
}

impl Drop for TimingSpan {
    fn drop(&mut self) {
        if !self.completed {
            warn!(
                request_id = %self.meta.id,
                elapsed_ms = self.started.elapsed().as_millis() as u64,
                "request span dropped before completion"
            );
        }
    }
}
