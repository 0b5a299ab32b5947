// Structured error taxonomy for the HTTP front end.
//
// Every failure that crosses the fault-isolation boundary is normalized into
// exactly one `ServerError` carrying the HTTP status to emit, a message that
// is safe to show to untrusted clients, and a flag deciding whether an
// external error reporter should be notified.

use axum::http::StatusCode;
use std::error::Error as StdError;
use std::fmt;
use std::panic::Location;

type BoxError = Box<dyn StdError + Send + Sync>;

/// A failure normalized for rendering as an HTTP response.
///
/// The underlying cause stays opaque to callers outside this subsystem; only
/// the status code, public message, and report policy drive control flow.
pub struct ServerError {
    cause: BoxError,
    status: StatusCode,
    public_message: Option<String>,
    should_report: bool,
    origin: &'static Location<'static>,
}

impl ServerError {
    /// Normalize any failure into the taxonomy.
    ///
    /// Idempotent: wrapping a value that already is a `ServerError` returns
    /// it unchanged, keeping its status, message, and report policy.
    #[track_caller]
    pub fn wrap<E>(cause: E) -> Self
    where
        E: Into<BoxError>,
    {
        let cause: BoxError = cause.into();
        match cause.downcast::<ServerError>() {
            Ok(already_wrapped) => *already_wrapped,
            Err(cause) => Self {
                cause,
                status: StatusCode::INTERNAL_SERVER_ERROR,
                public_message: None,
                should_report: true,
                origin: Location::caller(),
            },
        }
    }

    pub fn with_status(mut self, status: StatusCode) -> Self {
        self.status = status;
        self
    }

    pub fn with_public_message(mut self, message: impl Into<String>) -> Self {
        self.public_message = Some(message.into());
        self
    }

    /// Mark this error as an expected, client-caused condition that must not
    /// be forwarded to the error-reporting collaborator.
    pub fn without_reporting(mut self) -> Self {
        self.should_report = false;
        self
    }

    pub fn status_code(&self) -> StatusCode {
        self.status
    }

    /// Message safe to show to untrusted clients.
    pub fn public_message(&self) -> &str {
        self.public_message
            .as_deref()
            .unwrap_or("Internal Server Error")
    }

    pub fn should_report(&self) -> bool {
        self.should_report
    }

    /// Full diagnostic detail. Only ever sent to clients when the
    /// development-errors mode is enabled; otherwise logs-only.
    pub fn full_message(&self) -> String {
        self.cause.to_string()
    }

    /// Source location where the failure entered the taxonomy. Diagnostic
    /// rendering only, never a control decision.
    pub fn origin(&self) -> &'static Location<'static> {
        self.origin
    }

    pub fn cause(&self) -> &(dyn StdError + 'static) {
        self.cause.as_ref()
    }

    // Concrete kinds used by this core, each with fixed policy.

    /// Writing a response to the client failed. Reported.
    #[track_caller]
    pub fn response_write<E>(cause: E) -> Self
    where
        E: Into<BoxError>,
    {
        Self::wrap(ResponseWriteError(cause.into()))
            .with_public_message("Failed to write response")
    }

    /// The request URL cannot be served. Client-caused, not reported.
    #[track_caller]
    pub fn invalid_url(status: StatusCode, detail: impl Into<String>) -> Self {
        Self::wrap(InvalidUrlError(detail.into()))
            .with_status(status)
            .with_public_message("Invalid URL")
            .without_reporting()
    }

    /// The processing queue is saturated. Client-visible backpressure, not
    /// reported.
    #[track_caller]
    pub fn too_many_requests() -> Self {
        Self::wrap(TooManyRequestsError)
            .with_status(StatusCode::TOO_MANY_REQUESTS)
            .with_public_message("Too many requests")
            .without_reporting()
    }

    /// The request's bearer secret is missing or wrong. Not reported.
    #[track_caller]
    pub fn invalid_secret() -> Self {
        Self::wrap(InvalidSecretError)
            .with_status(StatusCode::FORBIDDEN)
            .with_public_message("Forbidden")
            .without_reporting()
    }
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.cause, f)
    }
}

impl fmt::Debug for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerError")
            .field("cause", &self.cause)
            .field("status", &self.status)
            .field("public_message", &self.public_message)
            .field("should_report", &self.should_report)
            .field("origin", &self.origin)
            .finish()
    }
}

impl StdError for ServerError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.cause.source()
    }
}

#[derive(Debug, thiserror::Error)]
#[error("Failed to write response: {0}")]
pub struct ResponseWriteError(BoxError);

#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct InvalidUrlError(String);

#[derive(Debug, thiserror::Error)]
#[error("Too many requests")]
pub struct TooManyRequestsError;

#[derive(Debug, thiserror::Error)]
#[error("Invalid secret")]
pub struct InvalidSecretError;
