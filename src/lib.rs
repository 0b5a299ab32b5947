// imgproxy-server: HTTP front end for an external image-processing engine.
//
// The crate owns the middleware composition and fault-isolation pipeline,
// the structured-error taxonomy, the route dispatcher, and the listener
// lifecycle. Everything else (media transformation, URL signing, storage,
// metrics backends, error-report sinks) is consumed through the narrow
// collaborator traits in `engine`, `metrics`, and `report`.

pub mod app;
pub mod config;
pub mod engine;
pub mod errors;
pub mod handlers;
pub mod listeners;
pub mod metrics;
pub mod middleware;
pub mod report;
pub mod router;
pub mod server;
pub mod shutdown;

pub use config::Config;
pub use errors::ServerError;
pub use server::Server;
pub use shutdown::Shutdown;
