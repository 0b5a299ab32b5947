// Route table and dispatcher.
//
// The table is built once at startup and read-only afterwards, so concurrent
// requests share it without locking. Dispatch is method + path lookup with a
// process-wide path prefix; malformed or unmapped requests are answered here
// and never enter the middleware chain.

use crate::errors::ServerError;
use axum::body::Body;
use axum::http::{header, Method, Request, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Boxed future every route handler returns.
pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<Response, ServerError>> + Send>>;

/// A route handler: request id + request in, response or taxonomy error out.
///
/// Middleware are plain `RouteHandler -> RouteHandler` transformations
/// composed by nesting at route-build time.
pub type RouteHandler = Arc<dyn Fn(String, Request<Body>) -> HandlerFuture + Send + Sync>;

/// Request-local metadata captured before the request body is consumed.
/// Used for access logging, error reporting, and metrics tagging.
#[derive(Debug, Clone)]
pub struct RequestMeta {
    pub id: String,
    pub method: Method,
    pub uri: Uri,
}

impl RequestMeta {
    pub fn capture(id: &str, req: &Request<Body>) -> Self {
        Self {
            id: id.to_owned(),
            method: req.method().clone(),
            uri: req.uri().clone(),
        }
    }
}

pub fn new_request_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// One entry of the route table.
struct RouteEntry {
    method: Method,
    path: String,
    /// Exact entries compare the whole path; non-exact entries prefix-match.
    exact: bool,
    handler: RouteHandler,
}

impl RouteEntry {
    fn matches(&self, method: &Method, path: &str) -> bool {
        if self.method != *method {
            return false;
        }
        if self.exact {
            path == self.path
        } else {
            path.starts_with(&self.path)
        }
    }
}

/// Method + path dispatcher, decoupled from the server lifecycle.
pub struct Dispatcher {
    prefix: String,
    health_path: String,
    routes: Vec<RouteEntry>,
    health: Option<RouteHandler>,
}

impl Dispatcher {
    pub fn new(prefix: impl Into<String>, health_path: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            health_path: health_path.into(),
            routes: Vec::new(),
            health: None,
        }
    }

    pub fn get(&mut self, path: &str, handler: RouteHandler, exact: bool) {
        self.add(Method::GET, path, handler, exact);
    }

    pub fn head(&mut self, path: &str, handler: RouteHandler, exact: bool) {
        self.add(Method::HEAD, path, handler, exact);
    }

    pub fn options(&mut self, path: &str, handler: RouteHandler, exact: bool) {
        self.add(Method::OPTIONS, path, handler, exact);
    }

    fn add(&mut self, method: Method, path: &str, handler: RouteHandler, exact: bool) {
        self.routes.push(RouteEntry {
            method,
            path: path.to_owned(),
            exact,
            handler,
        });
    }

    /// Install the liveness handler, served outside the path prefix and the
    /// main middleware chain.
    pub fn set_health(&mut self, handler: RouteHandler) {
        self.health = Some(handler);
    }

    /// Look up and run the handler for a request. Infallible at this level:
    /// unmapped requests become 404s, and a taxonomy error escaping a route
    /// that carries no fault-isolation wrapper is a programming error that
    /// is logged and answered with a bare 500.
    pub async fn dispatch(&self, req: Request<Body>) -> Response {
        let req_id = new_request_id();
        let meta = RequestMeta::capture(&req_id, &req);
        let path = req.uri().path().to_owned();

        if path == self.health_path {
            if let Some(health) = &self.health {
                return Self::run(health, req_id, req, &meta).await;
            }
        }

        let Some(rel) = path.strip_prefix(&self.prefix) else {
            return self.not_found(&meta);
        };

        // First matching entry wins; registration order is significant.
        for entry in &self.routes {
            if entry.matches(req.method(), rel) {
                return Self::run(&entry.handler, req_id, req, &meta).await;
            }
        }

        self.not_found(&meta)
    }

    async fn run(
        handler: &RouteHandler,
        req_id: String,
        req: Request<Body>,
        meta: &RequestMeta,
    ) -> Response {
        match handler(req_id, req).await {
            Ok(response) => response,
            Err(err) => {
                // Fallible routes are wrapped in fault isolation; an error
                // arriving here escaped the chain.
                error!(
                    request_id = %meta.id,
                    method = %meta.method,
                    uri = %meta.uri,
                    error = %err,
                    origin = %err.origin(),
                    "error escaped the middleware chain"
                );
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    [(header::CONTENT_TYPE, "text/plain")],
                    "Internal Server Error",
                )
                    .into_response()
            }
        }
    }

    fn not_found(&self, meta: &RequestMeta) -> Response {
        let err = ServerError::invalid_url(
            StatusCode::NOT_FOUND,
            format!("Route is not defined for {}", meta.uri.path()),
        );
        log_response(meta, err.status_code(), Some(&err));
        (
            err.status_code(),
            [(header::CONTENT_TYPE, "text/plain")],
            err.public_message().to_owned(),
        )
            .into_response()
    }
}

/// Structured access/error log line for a finished response. Severity is
/// keyed to the status class.
pub fn log_response(meta: &RequestMeta, status: StatusCode, err: Option<&ServerError>) {
    match err {
        Some(err) if status.is_server_error() => error!(
            request_id = %meta.id,
            method = %meta.method,
            uri = %meta.uri,
            status = status.as_u16(),
            error = %err,
            origin = %err.origin(),
            "completed request"
        ),
        Some(err) if status.is_client_error() => warn!(
            request_id = %meta.id,
            method = %meta.method,
            uri = %meta.uri,
            status = status.as_u16(),
            error = %err,
            "completed request"
        ),
        _ => info!(
            request_id = %meta.id,
            method = %meta.method,
            uri = %meta.uri,
            status = status.as_u16(),
            "completed request"
        ),
    }
}
