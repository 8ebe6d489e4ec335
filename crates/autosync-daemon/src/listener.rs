//! Callback HTTP listener
//!
//! Accepts one connection at a time, reads the request head once, answers
//! with a fixed `200 OK` and closes. Whatever arrives, the peer gets the
//! same reply; only the returned [`CallbackSignal`] tells the scheduler
//! whether to sync.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use autosync_core::{CallbackRequest, ProtocolError, CALLBACK_BUFFER_SIZE, CALLBACK_RESPONSE};

use crate::binder::BoundSocket;
use crate::validator::IpValidator;

/// Time allowed for a caller to send its request and take the reply
pub const READ_TIMEOUT: Duration = Duration::from_secs(10);

/// What a single inbound connection amounted to
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CallbackSignal {
    /// Trusted request on the marker path
    Trigger { source: IpAddr },
    /// Marker path, but from a source we do not trust
    Untrusted { source: String },
    /// Request for some other path
    PathMismatch { path: String },
    /// Not a request we understand
    Malformed(ProtocolError),
    /// The connection broke before a request was read
    Failed(String),
}

impl CallbackSignal {
    pub fn is_trigger(&self) -> bool {
        matches!(self, CallbackSignal::Trigger { .. })
    }
}

/// Listening callback socket
#[derive(Debug)]
pub struct CallbackListener {
    listener: TcpListener,
    local_port: u16,
}

impl CallbackListener {
    /// Start listening on a bound socket
    pub fn new(bound: BoundSocket) -> io::Result<Self> {
        let local_port = bound.port();
        let listener = bound.listen()?;
        info!("Listening on port {}", local_port);
        Ok(Self {
            listener,
            local_port,
        })
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    /// Wait up to `wait` for one connection and handle it
    ///
    /// Returns `Ok(None)` on timeout. Only failures of the listening
    /// socket itself are errors; a connection dropped before or after
    /// accept is folded into the signal.
    pub async fn next_signal(
        &self,
        wait: Duration,
        marker: &str,
        validator: &IpValidator,
    ) -> io::Result<Option<CallbackSignal>> {
        let (stream, peer) = match timeout(wait, self.listener.accept()).await {
            Ok(Ok(accepted)) => accepted,
            Ok(Err(e)) if is_connection_error(&e) => {
                warn!("Error accepting connection: {}", e);
                return Ok(Some(CallbackSignal::Failed(e.to_string())));
            }
            Ok(Err(e)) => return Err(e),
            Err(_) => return Ok(None),
        };
        Ok(Some(handle_connection(stream, peer, marker, validator).await))
    }
}

/// Accept failures caused by the peer rather than the listener
fn is_connection_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::Interrupted
            | io::ErrorKind::TimedOut
    )
}

/// Read, classify, answer, close
pub async fn handle_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    marker: &str,
    validator: &IpValidator,
) -> CallbackSignal {
    info!("Incoming call from {}...", peer.ip());

    let mut buf = vec![0u8; CALLBACK_BUFFER_SIZE];
    let signal = match timeout(READ_TIMEOUT, stream.read(&mut buf)).await {
        Ok(Ok(n)) => classify(&buf[..n], peer.ip(), marker, validator),
        Ok(Err(e)) => CallbackSignal::Failed(e.to_string()),
        Err(_) => CallbackSignal::Failed("read timed out".into()),
    };

    match &signal {
        CallbackSignal::Trigger { source } => info!("Valid callback from {}", source),
        CallbackSignal::Untrusted { source } => {
            warn!("Not a bunq IP, call ignored: {}", source)
        }
        CallbackSignal::PathMismatch { path } => warn!("Not a valid URL, call ignored: {}", path),
        CallbackSignal::Malformed(e) => warn!("Malformed request from {}: {}", peer.ip(), e),
        CallbackSignal::Failed(e) => warn!("Error reading from {}: {}", peer.ip(), e),
    }

    match timeout(READ_TIMEOUT, stream.write_all(CALLBACK_RESPONSE)).await {
        Ok(Ok(())) => {
            let _ = stream.shutdown().await;
        }
        Ok(Err(e)) => debug!("Error answering {}: {}", peer.ip(), e),
        Err(_) => debug!("Timed out answering {}", peer.ip()),
    }
    signal
}

fn classify(raw: &[u8], peer: IpAddr, marker: &str, validator: &IpValidator) -> CallbackSignal {
    let request = match CallbackRequest::parse(raw) {
        Ok(request) => request,
        Err(e) => return CallbackSignal::Malformed(e),
    };
    if !request.matches_marker(marker) {
        return CallbackSignal::PathMismatch { path: request.path };
    }
    if validator.is_skipped() {
        return CallbackSignal::Trigger { source: peer };
    }
    match IpValidator::source_of(peer, &request) {
        Some(source) if validator.is_trusted(source) => CallbackSignal::Trigger { source },
        Some(source) => CallbackSignal::Untrusted {
            source: source.to_string(),
        },
        None => CallbackSignal::Untrusted {
            source: request.forwarded_source().unwrap_or_default().to_string(),
        },
    }
}
