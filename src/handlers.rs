// Request handlers: landing page, processing delegation, the lightweight
// HEAD/OPTIONS responder, and the health probe.

use crate::engine::ProcessingEngine;
use crate::errors::ServerError;
use crate::router::{log_response, RequestMeta, RouteHandler};
use axum::http::header::{CACHE_CONTROL, CONTENT_TYPE};
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse};
use std::sync::Arc;

const IMGPROXY_IS_RUNNING: &str = "imgproxy is running";

const LANDING_PAGE: &str = "<!doctype html>\
<html>\
<head><title>Hey, I'm imgproxy!</title></head>\
<body><h1>Hey, I'm imgproxy!</h1>\
<p>This server transforms images on the fly. \
See the documentation for the processing URL format.</p></body>\
</html>";

/// Static landing page for the exact root route.
pub fn landing() -> RouteHandler {
    Arc::new(|_req_id, _req| Box::pin(async { Ok(Html(LANDING_PAGE).into_response()) }))
}

/// The business handler of the processing route: hands the request over to
/// the external engine. Failures surface as taxonomy errors and are caught
/// by the fault-isolation wrapper above.
pub fn processing(engine: Arc<dyn ProcessingEngine>) -> RouteHandler {
    Arc::new(move |req_id, req| engine.process(req_id, req))
}

/// Lightweight 200 responder for HEAD and OPTIONS. Always succeeds and is
/// access-logged.
pub fn head() -> RouteHandler {
    Arc::new(|req_id, req| {
        let meta = RequestMeta::capture(&req_id, &req);
        Box::pin(async move {
            log_response(&meta, StatusCode::OK, None);
            Ok(StatusCode::OK.into_response())
        })
    })
}

/// Liveness probe against the processing engine. The healthy path stays
/// quiet; a failing probe logs exactly one diagnostic line.
pub fn health(engine: Arc<dyn ProcessingEngine>) -> RouteHandler {
    Arc::new(move |req_id, req| {
        let engine = engine.clone();
        let meta = RequestMeta::capture(&req_id, &req);
        Box::pin(async move {
            let (status, message, err) = match engine.health() {
                Ok(()) => (StatusCode::OK, IMGPROXY_IS_RUNNING, None),
                Err(cause) => (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Error",
                    Some(ServerError::wrap(cause)),
                ),
            };

            // The body must never be empty.
            let body = if message.is_empty() { " " } else { message };

            if let Some(err) = &err {
                log_response(&meta, status, Some(err));
            }

            Ok((
                status,
                [(CONTENT_TYPE, "text/plain"), (CACHE_CONTROL, "no-cache")],
                body,
            )
                .into_response())
        })
    })
}
