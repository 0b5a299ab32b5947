// Application assembly: builds the route table with its middleware chain
// and wraps it in the axum shell that the server lifecycle serves.

use crate::config::Config;
use crate::engine::ProcessingEngine;
use crate::errors::ServerError;
use crate::handlers;
use crate::metrics::Metrics;
use crate::middleware::{with_cors, with_fault_isolation, with_metrics, with_secret};
use crate::report::ErrorReporter;
use crate::router::Dispatcher;
use axum::extract::{Request, State};
use axum::http::header::HeaderValue;
use axum::response::Response;
use axum::Router;
use std::sync::Arc;
use tower_http::trace::{DefaultMakeSpan, TraceLayer};
use tracing::Level;

/// Build the route table. Registration order is significant: the exact
/// landing routes shadow the prefix-matching processing route for the bare
/// root, and the processing chain is fixed as
/// `with_metrics(with_fault_isolation(with_cors(with_secret(engine))))`.
pub fn build_dispatcher(
    config: &Config,
    engine: Arc<dyn ProcessingEngine>,
    metrics: Arc<dyn Metrics>,
    reporter: Arc<dyn ErrorReporter>,
) -> Result<Dispatcher, ServerError> {
    let allow_origin = config
        .allow_origin
        .as_deref()
        .map(HeaderValue::from_str)
        .transpose()
        .map_err(ServerError::wrap)?;

    let mut dispatcher = Dispatcher::new(config.path_prefix.as_str(), config.health_path.as_str());

    dispatcher.get("/", handlers::landing(), true);
    dispatcher.get("", handlers::landing(), true);

    dispatcher.get(
        "/",
        with_metrics(
            metrics,
            with_fault_isolation(
                reporter,
                config.development_errors,
                allow_origin.clone(),
                with_cors(
                    allow_origin.clone(),
                    with_secret(config.secret.as_deref(), handlers::processing(engine.clone())),
                ),
            ),
        ),
        false,
    );

    dispatcher.head("/", with_cors(allow_origin.clone(), handlers::head()), false);
    dispatcher.options("/", with_cors(allow_origin, handlers::head()), false);

    dispatcher.set_health(handlers::health(engine));

    Ok(dispatcher)
}

/// Wrap the dispatcher in the axum shell served per connection.
pub fn build_app(dispatcher: Arc<Dispatcher>) -> Router {
    Router::new()
        .fallback(dispatch)
        .layer(TraceLayer::new_for_http().make_span_with(DefaultMakeSpan::new().level(Level::DEBUG)))
        .with_state(dispatcher)
}

async fn dispatch(State(dispatcher): State<Arc<Dispatcher>>, req: Request) -> Response {
    dispatcher.dispatch(req).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::NoopEngine;
    use crate::metrics::Disabled;
    use crate::report::LogReporter;
    use axum::body::Body;
    use axum::http::header::{
        ACCESS_CONTROL_ALLOW_METHODS, ACCESS_CONTROL_ALLOW_ORIGIN, AUTHORIZATION,
    };
    use axum::http::{Method, StatusCode};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn app(config: &Config) -> Router {
        let dispatcher = build_dispatcher(
            config,
            Arc::new(NoopEngine),
            Arc::new(Disabled),
            Arc::new(LogReporter),
        )
        .unwrap();
        build_app(Arc::new(dispatcher))
    }

    fn request(method: Method, path: &str) -> axum::http::Request<Body> {
        axum::http::Request::builder()
            .method(method)
            .uri(path)
            .body(Body::empty())
            .unwrap()
    }

    async fn body_text(response: Response) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn landing_and_health_are_reachable() {
        let app = app(&Config::default());
        let response = app
            .clone()
            .oneshot(request(Method::GET, "/"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app.oneshot(request(Method::GET, "/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(response).await, "imgproxy is running");
    }

    #[tokio::test]
    async fn secret_guards_only_the_processing_route() {
        let config = Config {
            secret: Some("s3cr3t".to_owned()),
            ..Config::default()
        };
        let app = app(&config);

        // Processing is rejected without the secret...
        let response = app
            .clone()
            .oneshot(request(Method::GET, "/unsafe/img.png"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(body_text(response).await, "Forbidden");

        // ...admitted with it (the NoopEngine then answers 404)...
        let mut admitted = request(Method::GET, "/unsafe/img.png");
        admitted
            .headers_mut()
            .insert(AUTHORIZATION, HeaderValue::from_static("Bearer s3cr3t"));
        let response = app.clone().oneshot(admitted).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_text(response).await, "Invalid URL");

        // ...and HEAD/OPTIONS stay open regardless.
        for method in [Method::HEAD, Method::OPTIONS] {
            let response = app
                .clone()
                .oneshot(request(method, "/unsafe/img.png"))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }
    }

    #[tokio::test]
    async fn cors_headers_cover_the_preflight_responder() {
        let config = Config {
            allow_origin: Some("https://example.com".to_owned()),
            ..Config::default()
        };
        let app = app(&config);
        let response = app
            .oneshot(request(Method::OPTIONS, "/unsafe/img.png"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[ACCESS_CONTROL_ALLOW_METHODS], "GET, OPTIONS");
    }

    #[tokio::test]
    async fn rejected_requests_carry_cors_headers() {
        let config = Config {
            secret: Some("s3cr3t".to_owned()),
            allow_origin: Some("https://example.com".to_owned()),
            ..Config::default()
        };
        let app = app(&config);
        let response = app
            .oneshot(request(Method::GET, "/unsafe/img.png"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(
            response.headers()[ACCESS_CONTROL_ALLOW_ORIGIN],
            "https://example.com"
        );
        assert_eq!(response.headers()[ACCESS_CONTROL_ALLOW_METHODS], "GET, OPTIONS");
        assert_eq!(body_text(response).await, "Forbidden");
    }

    #[tokio::test]
    async fn development_errors_mode_exposes_diagnostics() {
        let config = Config {
            development_errors: true,
            ..Config::default()
        };
        let app = app(&config);
        let response = app
            .oneshot(request(Method::GET, "/unsafe/img.png"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = body_text(response).await;
        assert!(body.contains("No processing engine is configured"), "body: {body}");
    }

    #[tokio::test]
    async fn prefixed_requests_outside_the_prefix_are_404() {
        let config = Config {
            path_prefix: "/img".to_owned(),
            ..Config::default()
        };
        let app = app(&config);
        let response = app.oneshot(request(Method::GET, "/other")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
