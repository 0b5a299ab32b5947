// Server lifecycle: Created → Listening → (Draining) → Stopped.
//
// The serve loop exclusively owns the listener. When a connection cap is
// configured, a semaphore permit is acquired before accept, so excess
// connections wait in the backlog instead of being rejected. Shutdown gives
// in-flight connections a bounded drain window, then abandons the rest.

use crate::config::Config;
use crate::errors::ServerError;
use crate::listeners;
use crate::shutdown::Shutdown;
use axum::Router;
use hyper::server::conn::http1;
use hyper_util::rt::{TokioIo, TokioTimer};
use hyper_util::server::graceful::GracefulShutdown;
use hyper_util::service::TowerToHyperService;
use std::error::Error as _;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Sleep};
use tracing::{debug, error, info, warn};

/// How long in-flight requests get to finish once shutdown starts.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Upper bound on the request head size.
const MAX_HEADER_BYTES: usize = 1 << 20;

struct ConnOptions {
    max_clients: usize,
    keep_alive: bool,
    read_window: Option<Duration>,
    idle_window: Option<Duration>,
}

impl ConnOptions {
    fn from_config(config: &Config) -> Self {
        // An idle timeout of zero disables keep-alive entirely.
        let keep_alive = config.keep_alive_timeout > 0;
        Self {
            max_clients: config.max_clients,
            keep_alive,
            read_window: (config.read_request_timeout > 0)
                .then(|| Duration::from_secs(config.read_request_timeout)),
            idle_window: keep_alive.then(|| Duration::from_secs(config.keep_alive_timeout)),
        }
    }
}

/// Connection stream with activity-based deadlines. Bytes arriving from the
/// peer arm the read window; bytes written to the peer arm the keep-alive
/// idle window. A keep-alive connection waiting for its next request is
/// therefore paced by the idle timeout, while incoming request bytes are
/// paced by the read timeout. An armed window elapsing surfaces as a
/// timed-out read, which tears the connection down.
struct TimedStream<S> {
    inner: S,
    read_window: Option<Duration>,
    idle_window: Option<Duration>,
    deadline: Option<Pin<Box<Sleep>>>,
}

impl<S> TimedStream<S> {
    fn new(inner: S, read_window: Option<Duration>, idle_window: Option<Duration>) -> Self {
        let mut stream = Self {
            inner,
            read_window,
            idle_window,
            deadline: None,
        };
        // The first request head must arrive within the read window.
        stream.arm(read_window);
        stream
    }

    fn arm(&mut self, window: Option<Duration>) {
        let Some(window) = window else {
            self.deadline = None;
            return;
        };
        match &mut self.deadline {
            Some(deadline) => deadline.as_mut().reset(Instant::now() + window),
            None => self.deadline = Some(Box::pin(tokio::time::sleep(window))),
        }
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncRead for TimedStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(result) => {
                this.arm(this.read_window);
                Poll::Ready(result)
            }
            Poll::Pending => {
                if let Some(deadline) = &mut this.deadline {
                    if deadline.as_mut().poll(cx).is_ready() {
                        return Poll::Ready(Err(io::Error::new(
                            io::ErrorKind::TimedOut,
                            "connection timed out",
                        )));
                    }
                }
                Poll::Pending
            }
        }
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncWrite for TimedStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let result = Pin::new(&mut this.inner).poll_write(cx, buf);
        if result.is_ready() {
            this.arm(this.idle_window);
        }
        result
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let result = Pin::new(&mut this.inner).poll_write_vectored(cx, bufs);
        if result.is_ready() {
            this.arm(this.idle_window);
        }
        result
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

/// A running server. Exclusively owns the listener and the serve loop;
/// consuming `stop` makes shutdown single-shot.
pub struct Server {
    local_addr: SocketAddr,
    bound: String,
    stop_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl Server {
    /// Bind the listener and start serving on a background task. The serve
    /// loop triggers `shutdown` when it exits for any reason, so the caller
    /// can coordinate the rest of the process.
    pub async fn start(config: &Config, app: Router, shutdown: &Shutdown) -> io::Result<Self> {
        let (bound, listener) = listeners::bind(&config.network, &config.bind).await?;
        let local_addr = listener.local_addr()?;
        let (stop_tx, stop_rx) = watch::channel(false);

        info!("Starting server at {bound}");

        let handle = tokio::spawn(serve_loop(
            listener,
            app,
            ConnOptions::from_config(config),
            stop_rx,
            shutdown.clone(),
        ));

        Ok(Self {
            local_addr,
            bound,
            stop_tx,
            handle,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn bound_addr(&self) -> &str {
        &self.bound
    }

    /// Graceful stop: the listener closes immediately and in-flight requests
    /// get at most the drain window to finish, bounding how long this call
    /// blocks.
    pub async fn stop(self) {
        let _ = self.stop_tx.send(true);
        if let Err(err) = self.handle.await {
            error!("serve loop task failed: {err}");
        }
    }
}

async fn serve_loop(
    listener: TcpListener,
    app: Router,
    opts: ConnOptions,
    mut stop_rx: watch::Receiver<bool>,
    shutdown: Shutdown,
) {
    let limiter = (opts.max_clients > 0).then(|| Arc::new(Semaphore::new(opts.max_clients)));
    let graceful = GracefulShutdown::new();

    let mut builder = http1::Builder::new();
    builder
        .timer(TokioTimer::new())
        .keep_alive(opts.keep_alive)
        // hyper's own header-read timer also runs while a keep-alive
        // connection sits idle between requests, which would collapse the
        // idle window into the read window. TimedStream enforces both
        // windows instead.
        .header_read_timeout(None::<Duration>)
        .max_buf_size(MAX_HEADER_BYTES);

    let accept_err = loop {
        tokio::select! {
            _ = stop_rx.changed() => break None,
            admitted = admit(&listener, limiter.as_ref()) => match admitted {
                Ok((stream, remote, permit)) => {
                    let service = TowerToHyperService::new(app.clone());
                    let stream = TimedStream::new(stream, opts.read_window, opts.idle_window);
                    let conn = builder.serve_connection(TokioIo::new(stream), service);
                    let conn = graceful.watch(conn);
                    tokio::spawn(async move {
                        debug!(%remote, "accepted connection");
                        if let Err(err) = conn.await {
                            if is_benign_disconnect(&err) {
                                // Peer resets belong to the transport layer;
                                // nothing to render.
                                debug!(%remote, "connection closed by peer: {err}");
                            } else {
                                let err = ServerError::response_write(err);
                                error!(%remote, error = %err, "failed to serve connection");
                            }
                        }
                        // Frees one admission slot.
                        drop(permit);
                    });
                }
                Err(err) => break Some(err),
            },
        }
    };

    match &accept_err {
        Some(err) => error!("server loop failed: {err}"),
        None => info!("Shutting down the server..."),
    }

    // Wake the rest of the process before draining so the caller can start
    // unwinding siblings in parallel.
    shutdown.trigger();

    drop(listener);
    tokio::select! {
        _ = graceful.shutdown() => debug!("all connections drained"),
        _ = tokio::time::sleep(SHUTDOWN_TIMEOUT) => {
            warn!("graceful drain timed out; dropping remaining connections");
        }
    }
}

/// Admission control: with a configured cap, a permit must be acquired
/// before accept, so the excess connection is delayed rather than rejected.
async fn admit(
    listener: &TcpListener,
    limiter: Option<&Arc<Semaphore>>,
) -> io::Result<(TcpStream, SocketAddr, Option<OwnedSemaphorePermit>)> {
    let permit = match limiter {
        // The semaphore is never closed, so acquisition cannot fail.
        Some(semaphore) => semaphore.clone().acquire_owned().await.ok(),
        None => None,
    };
    let (stream, remote) = listener.accept().await?;
    Ok((stream, remote, permit))
}

/// Errors that only mean the peer went away (or idled out) and must not be
/// logged as server failures.
fn is_benign_disconnect(err: &hyper::Error) -> bool {
    if err.is_incomplete_message() || err.is_timeout() {
        return true;
    }
    let mut source = err.source();
    while let Some(cause) = source {
        if let Some(io_err) = cause.downcast_ref::<io::Error>() {
            return matches!(
                io_err.kind(),
                io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::TimedOut
            );
        }
        source = cause.source();
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app;
    use crate::engine::NoopEngine;
    use crate::metrics::Disabled;
    use crate::report::LogReporter;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn conn_options_keep_the_timeout_knobs_apart() {
        let config = Config {
            read_request_timeout: 1,
            keep_alive_timeout: 60,
            ..Config::default()
        };
        let opts = ConnOptions::from_config(&config);
        assert!(opts.keep_alive);
        assert_eq!(opts.read_window, Some(Duration::from_secs(1)));
        assert_eq!(opts.idle_window, Some(Duration::from_secs(60)));

        let config = Config {
            keep_alive_timeout: 0,
            ..Config::default()
        };
        let opts = ConnOptions::from_config(&config);
        assert!(!opts.keep_alive);
        assert_eq!(opts.idle_window, None);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_connections_time_out_after_the_read_window() {
        let (client, server_side) = tokio::io::duplex(64);
        let mut stream = TimedStream::new(
            server_side,
            Some(Duration::from_secs(1)),
            Some(Duration::from_secs(60)),
        );
        let started = Instant::now();
        let mut buf = [0u8; 8];
        let err = stream
            .read(&mut buf)
            .await
            .expect_err("a silent peer must time out");
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
        assert_eq!(started.elapsed(), Duration::from_secs(1));
        drop(client);
    }

    #[tokio::test(start_paused = true)]
    async fn write_activity_arms_the_idle_window() {
        let (client, server_side) = tokio::io::duplex(64);
        let mut stream = TimedStream::new(
            server_side,
            Some(Duration::from_secs(1)),
            Some(Duration::from_secs(60)),
        );
        // A finished response moves the connection into the idle window.
        stream.write_all(b"HTTP/1.1 200 OK\r\n\r\n").await.unwrap();
        let started = Instant::now();
        let mut buf = [0u8; 8];
        let err = stream
            .read(&mut buf)
            .await
            .expect_err("an idle peer must eventually time out");
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
        assert_eq!(started.elapsed(), Duration::from_secs(60));
        drop(client);
    }

    #[tokio::test]
    async fn start_and_stop_round_trip() {
        let config = Config {
            bind: "127.0.0.1:0".to_owned(),
            max_clients: 4,
            ..Config::default()
        };
        let dispatcher = app::build_dispatcher(
            &config,
            Arc::new(NoopEngine),
            Arc::new(Disabled),
            Arc::new(LogReporter),
        )
        .unwrap();
        let shutdown = Shutdown::new();
        let server = Server::start(&config, app::build_app(Arc::new(dispatcher)), &shutdown)
            .await
            .unwrap();
        assert!(server.local_addr().port() > 0);
        server.stop().await;
    }
}
