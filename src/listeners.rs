// Listener creation honoring the configured network family.
//
// Wildcard binds go through socket2 so the socket can be made dual-stack and
// address-reusable before listening; named hosts are resolved and bound on
// the first address matching the family.

use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::SocketAddr;
use tokio::net::TcpListener;

const LISTEN_BACKLOG: i32 = 1024;

/// Bind a listener for `bind` ("host:port") on the given network family
/// ("tcp", "tcp4", or "tcp6"). Returns the bound address description along
/// with the listener.
pub async fn bind(network: &str, bind: &str) -> io::Result<(String, TcpListener)> {
    let (host, port) = split_host_port(bind)?;

    match host {
        "" | "*" => bind_wildcard(network, port),
        host => bind_host(network, host, port).await,
    }
}

fn split_host_port(bind: &str) -> io::Result<(&str, u16)> {
    let (host, port) = bind.rsplit_once(':').ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("bind address {bind:?} is not host:port"),
        )
    })?;
    let port = port.parse::<u16>().map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("bind address {bind:?} has an invalid port"),
        )
    })?;
    // Allow bracketed IPv6 hosts like "[::1]:8080".
    let host = host.strip_prefix('[').unwrap_or(host);
    let host = host.strip_suffix(']').unwrap_or(host);
    Ok((host, port))
}

fn bind_wildcard(network: &str, port: u16) -> io::Result<(String, TcpListener)> {
    match network {
        "tcp" => {
            // Prefer a dual-stack IPv6 socket; fall back to IPv4 only.
            match bind_wildcard_v6(port, false) {
                Ok(listener) => Ok(listener),
                Err(err) => {
                    tracing::warn!(
                        "Failed to bind dual-stack listener ({err}); falling back to IPv4"
                    );
                    bind_wildcard_v4(port)
                }
            }
        }
        "tcp4" => bind_wildcard_v4(port),
        "tcp6" => bind_wildcard_v6(port, true),
        other => Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("unsupported network family {other:?}"),
        )),
    }
}

fn bind_wildcard_v6(port: u16, only_v6: bool) -> io::Result<(String, TcpListener)> {
    let str_addr = format!("[::]:{port}");
    let addr: SocketAddr = str_addr
        .parse()
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "bad wildcard address"))?;

    let socket = Socket::new(Domain::IPV6, Type::STREAM, Some(Protocol::TCP))?;
    if let Err(err) = socket.set_only_v6(only_v6) {
        // Some systems refuse the toggle; keep whatever the default is.
        tracing::warn!("Failed to set IPV6_V6ONLY={only_v6}: {err}. Continuing anyway.");
    }
    into_listener(socket, addr).map(|listener| (str_addr, listener))
}

fn bind_wildcard_v4(port: u16) -> io::Result<(String, TcpListener)> {
    let str_addr = format!("0.0.0.0:{port}");
    let addr: SocketAddr = str_addr
        .parse()
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "bad wildcard address"))?;

    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
    into_listener(socket, addr).map(|listener| (str_addr, listener))
}

async fn bind_host(network: &str, host: &str, port: u16) -> io::Result<(String, TcpListener)> {
    let mut last_err = None;
    for addr in tokio::net::lookup_host((host, port)).await? {
        let family_ok = match network {
            "tcp" => true,
            "tcp4" => addr.is_ipv4(),
            "tcp6" => addr.is_ipv6(),
            other => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("unsupported network family {other:?}"),
                ));
            }
        };
        if !family_ok {
            continue;
        }

        let domain = if addr.is_ipv4() {
            Domain::IPV4
        } else {
            Domain::IPV6
        };
        let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
        match into_listener(socket, addr) {
            Ok(listener) => return Ok((addr.to_string(), listener)),
            Err(err) => last_err = Some(err),
        }
    }

    Err(last_err.unwrap_or_else(|| {
        io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            format!("no usable address for {host}:{port} on {network}"),
        )
    }))
}

fn into_listener(socket: Socket, addr: SocketAddr) -> io::Result<TcpListener> {
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;
    socket.set_nonblocking(true)?;

    let std_listener: std::net::TcpListener = socket.into();
    TcpListener::from_std(std_listener)
}
