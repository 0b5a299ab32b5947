// Middleware chain for the processing route.
//
// Each middleware is a pure `RouteHandler -> RouteHandler` transformation;
// order is significant and fixed at route-build time:
//
//     with_metrics(with_fault_isolation(with_cors(with_secret(handler))))
//
// Errors raised anywhere beneath the fault-isolation wrapper are normalized
// into the taxonomy and rendered exactly once, there.

use crate::errors::ServerError;
use crate::metrics::Metrics;
use crate::report::ErrorReporter;
use crate::router::{log_response, RequestMeta, RouteHandler};
use axum::http::header::{
    HeaderValue, ACCESS_CONTROL_ALLOW_METHODS, ACCESS_CONTROL_ALLOW_ORIGIN, AUTHORIZATION,
    CONTENT_TYPE,
};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use subtle::ConstantTimeEq;

/// Per-request measurement span around the inner handler. Identity when the
/// metrics collaborator is disabled. The span is completed exactly once with
/// the resolved status on every exit path.
pub fn with_metrics(metrics: Arc<dyn Metrics>, inner: RouteHandler) -> RouteHandler {
    if !metrics.enabled() {
        return inner;
    }

    Arc::new(move |req_id, req| {
        let metrics = metrics.clone();
        let inner = inner.clone();
        Box::pin(async move {
            let meta = RequestMeta::capture(&req_id, &req);
            let span = metrics.start_request(&meta);
            let result = inner(req_id, req).await;
            let status = match &result {
                Ok(response) => response.status(),
                Err(err) => err.status_code(),
            };
            span.complete(status);
            result
        })
    })
}

/// The outermost recovery boundary: tags the request with its id, intercepts
/// every failure raised beneath it exactly once, reports it when its policy
/// says so, logs it, and renders the one and only response.
///
/// A panic in the inner handler is an invariant violation; per the
/// fail-closed policy it is converted into a reported 500 so the fault
/// surfaces loudly in logs and monitoring while the process survives.
/// Connection aborts by the peer never reach this wrapper: they surface as
/// transport errors in the connection task, which handles them itself.
///
/// The boundary sits above the CORS wrapper, so responses it renders never
/// pass through it; it sets the CORS headers itself to keep them on every
/// response, error bodies included.
pub fn with_fault_isolation(
    reporter: Arc<dyn ErrorReporter>,
    development_errors: bool,
    allow_origin: Option<HeaderValue>,
    inner: RouteHandler,
) -> RouteHandler {
    Arc::new(move |req_id, req| {
        let reporter = reporter.clone();
        let allow_origin = allow_origin.clone();
        let inner = inner.clone();
        Box::pin(async move {
            let meta = RequestMeta::capture(&req_id, &req);

            let err = match AssertUnwindSafe(inner(req_id, req)).catch_unwind().await {
                Ok(Ok(response)) => return Ok(response),
                Ok(Err(err)) => ServerError::wrap(err),
                Err(panic) => ServerError::wrap(PanicError(panic_message(panic))),
            };

            if err.should_report() {
                reporter.report(&err, &meta);
            }
            log_response(&meta, err.status_code(), Some(&err));

            let mut response = render_error(&err, development_errors);
            if let Some(origin) = &allow_origin {
                apply_cors(response.headers_mut(), origin);
            }
            Ok(response)
        })
    })
}

/// Render a normalized failure as the response the client sees.
pub fn render_error(err: &ServerError, development_errors: bool) -> Response {
    let body = if development_errors {
        err.full_message()
    } else {
        err.public_message().to_owned()
    };
    (
        err.status_code(),
        [(CONTENT_TYPE, "text/plain")],
        body,
    )
        .into_response()
}

#[derive(Debug, thiserror::Error)]
#[error("Handler panicked: {0}")]
struct PanicError(String);

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}

fn apply_cors(headers: &mut HeaderMap, origin: &HeaderValue) {
    headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, origin.clone());
    headers.insert(
        ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("GET, OPTIONS"),
    );
}

/// Sets the CORS response headers when an allowed origin is configured;
/// identity transform otherwise. Taxonomy errors pass through untouched and
/// get their headers at the fault-isolation boundary.
pub fn with_cors(allow_origin: Option<HeaderValue>, inner: RouteHandler) -> RouteHandler {
    let Some(origin) = allow_origin else {
        return inner;
    };

    Arc::new(move |req_id, req| {
        let origin = origin.clone();
        let inner = inner.clone();
        Box::pin(async move {
            let mut response = inner(req_id, req).await?;
            apply_cors(response.headers_mut(), &origin);
            Ok(response)
        })
    })
}

/// Bearer-secret authentication; identity transform when no secret is
/// configured. The comparison runs in constant time so the check does not
/// leak where the first mismatching byte is.
pub fn with_secret(secret: Option<&str>, inner: RouteHandler) -> RouteHandler {
    let Some(secret) = secret else {
        return inner;
    };
    let expected: Arc<[u8]> = format!("Bearer {secret}").into_bytes().into();

    Arc::new(move |req_id, req| {
        let provided = req
            .headers()
            .get(AUTHORIZATION)
            .map(|value| value.as_bytes().to_vec())
            .unwrap_or_default();

        if bool::from(provided.ct_eq(&expected[..])) {
            inner(req_id, req)
        } else {
            Box::pin(async { Err(ServerError::invalid_secret()) })
        }
    })
}
