//! Listening port selection
//!
//! Binds the callback socket either to the configured port or to a random
//! free port. The socket is returned bound but not yet listening so the
//! caller decides when to start accepting.

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use rand::Rng;
use thiserror::Error;
use tokio::net::{TcpListener, TcpSocket};
use tracing::{debug, warn};

use autosync_core::{MAX_PORT_ATTEMPTS, MAX_RANDOM_PORT, MIN_RANDOM_PORT};

/// Maximum incoming calls queued
pub const LISTEN_BACKLOG: u32 = 5;

/// Port binding errors
#[derive(Error, Debug)]
pub enum BindError {
    #[error("failed to bind port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: io::Error,
    },

    #[error("no free port found after {attempts} attempts")]
    NoFreePort { attempts: usize },
}

/// A bound, not yet listening socket
#[derive(Debug)]
pub struct BoundSocket {
    socket: TcpSocket,
    port: u16,
}

impl BoundSocket {
    /// Port actually bound
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Start listening (must run inside a tokio runtime)
    pub fn listen(self) -> io::Result<TcpListener> {
        self.socket.listen(LISTEN_BACKLOG)
    }
}

/// Binds the callback socket
#[derive(Clone, Debug)]
pub struct PortBinder {
    bind_ip: IpAddr,
    attempts: usize,
}

impl PortBinder {
    /// Bind on all IPv4 interfaces with the default number of attempts
    pub fn new() -> Self {
        Self {
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            attempts: MAX_PORT_ATTEMPTS,
        }
    }

    /// Custom bind address (tests bind loopback only)
    pub fn with_address(bind_ip: IpAddr) -> Self {
        Self {
            bind_ip,
            ..Self::new()
        }
    }

    /// Bind `preferred` exactly, or a random free port when unset
    ///
    /// An explicit port is never retried: if the operator asked for it,
    /// any failure is reported as is.
    pub fn bind(&self, preferred: Option<u16>) -> Result<BoundSocket, BindError> {
        if let Some(port) = preferred {
            return self
                .try_bind(port)
                .map_err(|source| BindError::Bind { port, source });
        }

        let mut rng = rand::thread_rng();
        self.bind_any(std::iter::repeat_with(|| {
            rng.gen_range(MIN_RANDOM_PORT..=MAX_RANDOM_PORT)
        }))
    }

    /// Try candidates in order until one binds
    ///
    /// Ports in use are skipped; any other failure stops the search.
    pub fn bind_any<I>(&self, candidates: I) -> Result<BoundSocket, BindError>
    where
        I: IntoIterator<Item = u16>,
    {
        let mut tried = 0;
        for port in candidates.into_iter().take(self.attempts) {
            tried += 1;
            match self.try_bind(port) {
                Ok(bound) => return Ok(bound),
                Err(e) if e.kind() == io::ErrorKind::AddrInUse => {
                    warn!("Port {} is in use, trying next...", port);
                }
                Err(source) => return Err(BindError::Bind { port, source }),
            }
        }
        Err(BindError::NoFreePort { attempts: tried })
    }

    fn try_bind(&self, port: u16) -> io::Result<BoundSocket> {
        let socket = match self.bind_ip {
            IpAddr::V4(_) => TcpSocket::new_v4()?,
            IpAddr::V6(_) => TcpSocket::new_v6()?,
        };
        #[cfg(unix)]
        socket.set_reuseaddr(true)?;
        socket.bind(SocketAddr::new(self.bind_ip, port))?;
        let port = socket.local_addr()?.port();
        debug!("Bound callback socket to port {}", port);
        Ok(BoundSocket { socket, port })
    }
}

impl Default for PortBinder {
    fn default() -> Self {
        Self::new()
    }
}
