//! TCP helpers for row transport sockets.

use std::io::{self, Read};
use std::net::{IpAddr, Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::error::TransportError;

/// Granularity of stop-flag checks while blocked on accept or connect.
const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Read timeout between stop-flag checks on an established stream.
const READ_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Message of the I/O error a [`StoppableStream`] returns once stopped.
pub const STOPPED_MESSAGE: &str = "row stream stopped";

/// Resolve a hostname and port to a list of socket addresses.
///
/// # Errors
///
/// Returns an `io::Error` if DNS resolution fails or yields no addresses.
pub fn resolve_socket_addrs(host: &str, port: u16) -> std::io::Result<Vec<SocketAddr>> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(vec![SocketAddr::new(ip, port)]);
    }

    let addrs: Vec<SocketAddr> = (host, port).to_socket_addrs()?.collect();
    if addrs.is_empty() {
        Err(std::io::Error::new(
            std::io::ErrorKind::AddrNotAvailable,
            format!("no address for {host}"),
        ))
    } else {
        Ok(addrs)
    }
}

/// Open a listener on `host:port`.
///
/// # Errors
///
/// Returns [`TransportError::Bind`] if no resolved address can be bound.
pub fn bind_listener(host: &str, port: u16) -> Result<TcpListener, TransportError> {
    let bind_err = |source| TransportError::Bind {
        host: host.to_string(),
        port,
        source,
    };
    let addrs = resolve_socket_addrs(host, port).map_err(bind_err)?;
    TcpListener::bind(addrs.as_slice()).map_err(bind_err)
}

/// Accept one connection, checking `stop` between polls.
///
/// # Errors
///
/// Returns [`TransportError::Stopped`] when `stop` is raised and
/// [`TransportError::AcceptTimeout`] when `timeout` elapses first.
pub fn accept_one(
    listener: &TcpListener,
    timeout: Option<Duration>,
    stop: &AtomicBool,
) -> Result<TcpStream, TransportError> {
    listener.set_nonblocking(true)?;
    let started = Instant::now();
    loop {
        if stop.load(Ordering::Acquire) {
            return Err(TransportError::Stopped);
        }
        match listener.accept() {
            Ok((stream, peer)) => {
                stream.set_nonblocking(false)?;
                tracing::debug!(peer = %peer, "transport writer accepted reader");
                return Ok(stream);
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                if let Some(limit) = timeout {
                    if started.elapsed() >= limit {
                        return Err(TransportError::AcceptTimeout {
                            addr: listener
                                .local_addr()
                                .map_or_else(|_| "?".to_string(), |a| a.to_string()),
                            waited_ms: started.elapsed().as_millis(),
                        });
                    }
                }
                thread::sleep(POLL_INTERVAL);
            }
            Err(e) => return Err(e.into()),
        }
    }
}

/// Connect to `host:port`, retrying every `interval` until `window` has
/// elapsed or `stop` is raised.
///
/// # Errors
///
/// Returns [`TransportError::Connect`] with the last failure once the window
/// is exhausted, or [`TransportError::Stopped`].
pub fn connect_with_retry(
    host: &str,
    port: u16,
    window: Duration,
    interval: Duration,
    stop: &AtomicBool,
) -> Result<TcpStream, TransportError> {
    let started = Instant::now();
    let mut attempts = 0u32;
    loop {
        if stop.load(Ordering::Acquire) {
            return Err(TransportError::Stopped);
        }
        attempts += 1;
        let attempt = resolve_socket_addrs(host, port)
            .and_then(|addrs| TcpStream::connect(addrs.as_slice()));
        match attempt {
            Ok(stream) => {
                tracing::debug!(host, port, attempts, "transport reader connected");
                return Ok(stream);
            }
            Err(source) => {
                if started.elapsed() + interval > window {
                    return Err(TransportError::Connect {
                        host: host.to_string(),
                        port,
                        attempts,
                        source,
                    });
                }
                tracing::trace!(host, port, attempts, error = %source, "connect failed, retrying");
                sleep_unless_stopped(interval, stop);
            }
        }
    }
}

fn sleep_unless_stopped(total: Duration, stop: &AtomicBool) {
    let deadline = Instant::now() + total;
    while !stop.load(Ordering::Acquire) {
        let now = Instant::now();
        if now >= deadline {
            return;
        }
        thread::sleep(POLL_INTERVAL.min(deadline - now));
    }
}

/// Shut down both directions and drop the socket. Errors are ignored; the
/// peer may already be gone.
pub fn force_close(stream: TcpStream) {
    let _ = stream.shutdown(Shutdown::Read);
    let _ = stream.shutdown(Shutdown::Write);
    drop(stream);
}

/// Read half of a transport socket that gives up once `stop` is raised.
///
/// A timed out `read` consumed nothing, so it is retried in place and the
/// layers above never see a partial read.
pub struct StoppableStream {
    stream: TcpStream,
    stop: Arc<AtomicBool>,
}

impl StoppableStream {
    /// # Errors
    ///
    /// Returns an error if the read timeout cannot be set.
    pub fn new(stream: TcpStream, stop: Arc<AtomicBool>) -> io::Result<Self> {
        stream.set_read_timeout(Some(READ_POLL_INTERVAL))?;
        Ok(Self { stream, stop })
    }

    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }
}

impl Read for StoppableStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            match self.stream.read(buf) {
                Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                    if self.is_stopped() {
                        return Err(io::Error::new(io::ErrorKind::ConnectionAborted, STOPPED_MESSAGE));
                    }
                }
                other => return other,
            }
        }
    }
}
