//! Datagram transports for the emitter.

use std::io;
use std::net::{IpAddr, SocketAddr, ToSocketAddrs, UdpSocket};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info};

use super::EmitError;
use crate::config::EmitterConfig;

/// Sends one payload per call. Implementations never retry.
pub trait Transport {
    /// Sends `payload`, giving up once `deadline` has passed.
    fn send(&mut self, payload: &[u8], deadline: Instant) -> Result<(), EmitError>;
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn send(&mut self, payload: &[u8], deadline: Instant) -> Result<(), EmitError> {
        (**self).send(payload, deadline)
    }
}

type Lookup = io::Result<Vec<SocketAddr>>;

/// Blocking name lookup, run on a helper thread.
type Resolver = fn(&str, u16) -> Lookup;

fn system_resolver(host: &str, port: u16) -> Lookup {
    (host, port).to_socket_addrs().map(|addrs| addrs.collect())
}

/// Fire-and-forget UDP transport.
///
/// The collector address is resolved on first use and cached; any send
/// failure drops both the cached address and the socket so the next send
/// starts over. At most one lookup runs at a time: a lookup that outlives the
/// deadline is picked up again by the next send instead of starting another.
pub struct UdpTransport {
    host: String,
    port: u16,
    timeout: Duration,
    resolver: Resolver,
    target: Option<SocketAddr>,
    pending: Option<Receiver<Lookup>>,
    socket: Option<UdpSocket>,
}

impl UdpTransport {
    pub fn new(config: &EmitterConfig) -> Self {
        Self {
            host: config.host.clone(),
            port: config.port,
            timeout: config.timeout,
            resolver: system_resolver,
            target: None,
            pending: None,
            socket: None,
        }
    }

    #[cfg(test)]
    pub(crate) fn with_resolver(config: &EmitterConfig, resolver: Resolver) -> Self {
        Self {
            resolver,
            ..Self::new(config)
        }
    }

    fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    fn timed_out(&self, target: String) -> EmitError {
        EmitError::Timeout {
            target,
            timeout: self.timeout,
        }
    }

    fn start_lookup(&self) -> Result<Receiver<Lookup>, EmitError> {
        let (tx, rx) = mpsc::channel();
        let resolver = self.resolver;
        let (host, port) = (self.host.clone(), self.port);
        thread::Builder::new()
            .name("atmo-resolve".to_string())
            .spawn(move || {
                let _ = tx.send(resolver(&host, port));
            })
            .map_err(|source| EmitError::Resolve {
                host: self.host.clone(),
                source,
            })?;
        Ok(rx)
    }

    /// Resolves the collector address, waiting no later than `deadline`.
    fn resolve(&mut self, deadline: Instant) -> Result<SocketAddr, EmitError> {
        if let Ok(ip) = self.host.parse::<IpAddr>() {
            return Ok(SocketAddr::new(ip, self.port));
        }

        // getaddrinfo has no timeout of its own; run it aside and stop waiting.
        let lookup = match self.pending.take() {
            Some(lookup) => lookup,
            None => self.start_lookup()?,
        };

        let answer = lookup.recv_timeout(deadline.saturating_duration_since(Instant::now()));
        match answer {
            Ok(Ok(addrs)) => {
                // Prefer IPv4, as the StatsD daemon usually binds 0.0.0.0.
                addrs
                    .iter()
                    .find(|a| a.is_ipv4())
                    .or_else(|| addrs.first())
                    .copied()
                    .ok_or_else(|| EmitError::NoAddress {
                        host: self.host.clone(),
                    })
            }
            Ok(Err(source)) => Err(EmitError::Resolve {
                host: self.host.clone(),
                source,
            }),
            Err(RecvTimeoutError::Timeout) => {
                debug!("Lookup of {} still pending", self.host);
                self.pending = Some(lookup);
                Err(self.timed_out(self.endpoint()))
            }
            Err(RecvTimeoutError::Disconnected) => Err(EmitError::Resolve {
                host: self.host.clone(),
                source: io::Error::other("lookup ended without an answer"),
            }),
        }
    }

    fn open_socket(target: &SocketAddr) -> io::Result<UdpSocket> {
        let local: SocketAddr = if target.is_ipv4() {
            (std::net::Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (std::net::Ipv6Addr::UNSPECIFIED, 0).into()
        };
        UdpSocket::bind(local)
    }

    fn reset(&mut self) {
        self.target = None;
        self.socket = None;
    }
}

impl Transport for UdpTransport {
    fn send(&mut self, payload: &[u8], deadline: Instant) -> Result<(), EmitError> {
        let target = match self.target {
            Some(target) => target,
            None => {
                let target = self.resolve(deadline)?;
                debug!("Resolved {} to {}", self.endpoint(), target);
                self.target = Some(target);
                target
            }
        };

        // The write only gets what is left after resolution.
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(self.timed_out(target.to_string()));
        }

        if self.socket.is_none() {
            match Self::open_socket(&target) {
                Ok(socket) => self.socket = Some(socket),
                Err(e) => {
                    self.reset();
                    return Err(EmitError::Socket(e));
                }
            }
        }

        let result = match &self.socket {
            Some(socket) => socket
                .set_write_timeout(Some(remaining))
                .and_then(|()| socket.send_to(payload, target)),
            None => Err(io::Error::from(io::ErrorKind::NotConnected)),
        };

        match result {
            Ok(_) => Ok(()),
            Err(e) => {
                self.reset();
                if matches!(
                    e.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                ) {
                    Err(self.timed_out(target.to_string()))
                } else {
                    Err(EmitError::Send {
                        target: target.to_string(),
                        source: e,
                    })
                }
            }
        }
    }
}

/// Logs payloads instead of sending them.
#[derive(Debug, Default)]
pub struct LogTransport {
    sent: usize,
}

impl LogTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of payloads logged so far.
    pub fn sent(&self) -> usize {
        self.sent
    }
}

impl Transport for LogTransport {
    fn send(&mut self, payload: &[u8], _deadline: Instant) -> Result<(), EmitError> {
        self.sent += 1;
        for line in String::from_utf8_lossy(payload).lines() {
            info!("dry-run: {}", line);
        }
        Ok(())
    }
}
