// Process configuration.
//
// Captured once at startup (flags or IMGPROXY_* environment variables) and
// injected into every component at construction; nothing reads configuration
// from global state at request time.

use clap::Parser;

/// Command line arguments and environment configuration for imgproxy-server.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "HTTP front end for the imgproxy processing engine", long_about = None)]
pub struct Config {
    /// Network family to bind: "tcp" (dual-stack), "tcp4", or "tcp6".
    #[arg(long, env = "IMGPROXY_NETWORK", default_value = "tcp")]
    pub network: String,

    /// Address to bind as "host:port". An empty or "*" host listens on all
    /// interfaces.
    #[arg(long, env = "IMGPROXY_BIND", default_value = "127.0.0.1:8080")]
    pub bind: String,

    /// Path prefix every processing URL must start with.
    #[arg(long, env = "IMGPROXY_PATH_PREFIX", default_value = "")]
    pub path_prefix: String,

    /// Liveness probe path, served outside the path prefix.
    #[arg(long, env = "IMGPROXY_HEALTH_PATH", default_value = "/health")]
    pub health_path: String,

    /// Maximum number of concurrently accepted connections. Excess
    /// connections wait at accept instead of being rejected. 0 disables the
    /// cap.
    #[arg(long, env = "IMGPROXY_MAX_CLIENTS", default_value_t = 2048)]
    pub max_clients: usize,

    /// Seconds to wait for request headers before dropping the connection.
    #[arg(long, env = "IMGPROXY_READ_REQUEST_TIMEOUT", default_value_t = 10)]
    pub read_request_timeout: u64,

    /// Keep-alive idle timeout in seconds. 0 disables keep-alive entirely.
    #[arg(long, env = "IMGPROXY_KEEP_ALIVE_TIMEOUT", default_value_t = 10)]
    pub keep_alive_timeout: u64,

    /// Value for Access-Control-Allow-Origin. CORS headers are omitted when
    /// unset.
    #[arg(long, env = "IMGPROXY_ALLOW_ORIGIN")]
    pub allow_origin: Option<String>,

    /// Shared secret; when set, processing requests must carry
    /// "Authorization: Bearer <secret>".
    #[arg(long, env = "IMGPROXY_SECRET")]
    pub secret: Option<String>,

    /// Respond with full diagnostic messages instead of generic ones.
    /// Never enable this for untrusted clients.
    #[arg(long, env = "IMGPROXY_DEVELOPMENT_ERRORS_MODE", action = clap::ArgAction::SetTrue)]
    pub development_errors: bool,

    /// Log a per-request timing span for every processing request.
    #[arg(long, env = "IMGPROXY_REQUEST_TIMINGS", action = clap::ArgAction::SetTrue)]
    pub request_timings: bool,
}

impl Default for Config {
    fn default() -> Self {
        // Defaults mirror the clap attributes; used by tests and embedders.
        Self {
            network: "tcp".to_owned(),
            bind: "127.0.0.1:8080".to_owned(),
            path_prefix: String::new(),
            health_path: "/health".to_owned(),
            max_clients: 2048,
            read_request_timeout: 10,
            keep_alive_timeout: 10,
            allow_origin: None,
            secret: None,
            development_errors: false,
            request_timings: false,
        }
    }
}
