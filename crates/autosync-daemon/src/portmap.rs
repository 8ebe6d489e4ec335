//! UPnP port mapping for NAT traversal
//!
//! Keeps at most one TCP forwarding rule on the local Internet Gateway
//! Device so the bank can reach the callback listener from outside.
//!
//! The gateway protocol sits behind [`NatGateway`]; the production
//! implementation is [`IgdGateway`], which runs the blocking `igd-next`
//! calls on the blocking thread pool. [`PortMapper`] owns the mapping
//! lifecycle on top of it:
//! - `search` discovers the gateway (required before anything else)
//! - `add` forwards a specific external port
//! - `seek` forwards any free external port, starting with the internal one
//! - `remove` / `release` drop the rule again
//!
//! Every operation is best-effort: failures are returned for the caller to
//! log and fall back to timer-only operation.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};
use std::time::Duration;

use igd_next::{AddPortError, PortMappingProtocol, SearchOptions};
use rand::Rng;
use tracing::{debug, error, info};

use autosync_core::{MAX_PORT_ATTEMPTS, MAX_RANDOM_PORT, MIN_RANDOM_PORT};

/// Time allowed for gateway discovery
const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(3);

/// Lease requested from the gateway (0 = until removed)
const LEASE_DURATION_SECS: u32 = 0;

/// Port mapping errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortMapError {
    /// `search` has not found a gateway
    NoGateway,
    /// Gateway discovery failed
    Search(String),
    /// The external port is already mapped by someone else
    Conflict(u16),
    /// Gateway rejected or failed a request
    Request(String),
    /// `seek` ran out of candidate ports
    Exhausted { attempts: usize },
}

impl std::fmt::Display for PortMapError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PortMapError::NoGateway => write!(f, "no UPnP gateway found"),
            PortMapError::Search(e) => write!(f, "gateway search failed: {}", e),
            PortMapError::Conflict(port) => write!(f, "port {} is already mapped", port),
            PortMapError::Request(e) => write!(f, "gateway request failed: {}", e),
            PortMapError::Exhausted { attempts } => {
                write!(f, "no free external port after {} attempts", attempts)
            }
        }
    }
}

impl std::error::Error for PortMapError {}

/// A forwarding rule currently held on the gateway
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PortMapping {
    pub external_port: u16,
    pub internal_port: u16,
    pub marker: String,
}

/// Minimal gateway protocol
#[async_trait::async_trait]
pub trait NatGateway: Send + Sync {
    /// Look for a gateway on the local network
    async fn discover(&mut self) -> Result<(), PortMapError>;

    /// Whether `discover` succeeded
    fn is_discovered(&self) -> bool;

    /// Address the gateway presents to the internet
    async fn external_ip(&self) -> Result<IpAddr, PortMapError>;

    /// Forward `external_port` to `internal_port` on this host
    async fn add_port(
        &self,
        external_port: u16,
        internal_port: u16,
        description: &str,
    ) -> Result<(), PortMapError>;

    /// Drop the rule for `external_port`
    async fn remove_port(&self, external_port: u16) -> Result<(), PortMapError>;
}

/// UPnP IGD gateway backed by `igd-next`
#[derive(Default)]
pub struct IgdGateway {
    gateway: Option<igd_next::Gateway>,
    lan_ip: Option<IpAddr>,
}

impl IgdGateway {
    pub fn new() -> Self {
        Self::default()
    }

    fn gateway(&self) -> Result<(igd_next::Gateway, IpAddr), PortMapError> {
        match (&self.gateway, self.lan_ip) {
            (Some(gw), Some(ip)) => Ok((gw.clone(), ip)),
            _ => Err(PortMapError::NoGateway),
        }
    }
}

#[async_trait::async_trait]
impl NatGateway for IgdGateway {
    async fn discover(&mut self) -> Result<(), PortMapError> {
        let gateway = tokio::task::spawn_blocking(|| {
            igd_next::search_gateway(SearchOptions {
                timeout: Some(DISCOVERY_TIMEOUT),
                ..Default::default()
            })
        })
        .await
        .map_err(|e| PortMapError::Search(format!("task panicked: {}", e)))?
        .map_err(|e| PortMapError::Search(e.to_string()))?;

        let lan_ip = lan_address_towards(gateway.addr)
            .map_err(|e| PortMapError::Search(format!("no route to gateway: {}", e)))?;

        info!(gateway = %gateway.addr, lan_ip = %lan_ip, "UPnP gateway discovered");
        self.gateway = Some(gateway);
        self.lan_ip = Some(lan_ip);
        Ok(())
    }

    fn is_discovered(&self) -> bool {
        self.gateway.is_some()
    }

    async fn external_ip(&self) -> Result<IpAddr, PortMapError> {
        let (gw, _) = self.gateway()?;
        tokio::task::spawn_blocking(move || gw.get_external_ip())
            .await
            .map_err(|e| PortMapError::Request(format!("task panicked: {}", e)))?
            .map_err(|e| PortMapError::Request(e.to_string()))
    }

    async fn add_port(
        &self,
        external_port: u16,
        internal_port: u16,
        description: &str,
    ) -> Result<(), PortMapError> {
        let (gw, lan_ip) = self.gateway()?;
        let description = description.to_string();
        let local_addr = SocketAddr::new(lan_ip, internal_port);

        let result = tokio::task::spawn_blocking(move || {
            gw.add_port(
                PortMappingProtocol::TCP,
                external_port,
                local_addr,
                LEASE_DURATION_SECS,
                &description,
            )
        })
        .await
        .map_err(|e| PortMapError::Request(format!("task panicked: {}", e)))?;

        match result {
            Ok(()) => Ok(()),
            Err(AddPortError::PortInUse) => Err(PortMapError::Conflict(external_port)),
            Err(e) => Err(PortMapError::Request(e.to_string())),
        }
    }

    async fn remove_port(&self, external_port: u16) -> Result<(), PortMapError> {
        let (gw, _) = self.gateway()?;
        tokio::task::spawn_blocking(move || {
            gw.remove_port(PortMappingProtocol::TCP, external_port)
        })
        .await
        .map_err(|e| PortMapError::Request(format!("task panicked: {}", e)))?
        .map_err(|e| PortMapError::Request(e.to_string()))
    }
}

/// Local address the OS would use to reach `peer`
fn lan_address_towards(peer: SocketAddr) -> std::io::Result<IpAddr> {
    let unspecified = if peer.is_ipv4() {
        IpAddr::V4(Ipv4Addr::UNSPECIFIED)
    } else {
        IpAddr::V6(Ipv6Addr::UNSPECIFIED)
    };
    let socket = UdpSocket::bind(SocketAddr::new(unspecified, 0))?;
    socket.connect(peer)?;
    Ok(socket.local_addr()?.ip())
}

/// Owner of the single NAT port mapping
pub struct PortMapper {
    gateway: Box<dyn NatGateway>,
    active: Option<PortMapping>,
}

impl PortMapper {
    pub fn new(gateway: Box<dyn NatGateway>) -> Self {
        Self {
            gateway,
            active: None,
        }
    }

    /// Mapper talking UPnP to the local gateway
    pub fn igd() -> Self {
        Self::new(Box::new(IgdGateway::new()))
    }

    /// Discover the gateway; a no-op once found
    pub async fn search(&mut self) -> Result<(), PortMapError> {
        if self.gateway.is_discovered() {
            return Ok(());
        }
        info!("Searching for UPnP gateway...");
        self.gateway.discover().await.map_err(|e| {
            error!("Error searching for UPnP gateway: {}", e);
            e
        })
    }

    /// Gateway's external address, if a gateway is known
    pub async fn external_ip(&self) -> Option<IpAddr> {
        if !self.gateway.is_discovered() {
            return None;
        }
        match self.gateway.external_ip().await {
            Ok(ip) => {
                info!("Retrieved external IP {} from UPnP gateway", ip);
                Some(ip)
            }
            Err(e) => {
                debug!("Gateway did not report an external IP: {}", e);
                None
            }
        }
    }

    /// Forward exactly `external_port` to `internal_port`
    pub async fn add(
        &mut self,
        external_port: u16,
        internal_port: u16,
        marker: &str,
    ) -> Result<u16, PortMapError> {
        self.release().await;
        info!("Adding UPnP port mapping {} -> {}...", external_port, internal_port);

        self.gateway
            .add_port(external_port, internal_port, marker)
            .await
            .map_err(|e| {
                error!("Failed to map port: {}", e);
                e
            })?;
        self.remember(external_port, internal_port, marker);
        Ok(external_port)
    }

    /// Forward any free external port to `internal_port`
    ///
    /// The internal port is tried first, then random ports while the
    /// gateway reports conflicts.
    pub async fn seek(&mut self, internal_port: u16, marker: &str) -> Result<u16, PortMapError> {
        self.release().await;
        info!("Looking for a free external port...");

        let mut candidate = internal_port;
        for _ in 0..MAX_PORT_ATTEMPTS {
            match self.gateway.add_port(candidate, internal_port, marker).await {
                Ok(()) => {
                    info!("Successfully forwarded port {}", candidate);
                    self.remember(candidate, internal_port, marker);
                    return Ok(candidate);
                }
                Err(PortMapError::Conflict(port)) => {
                    info!("Port {} is already mapped, trying next port...", port);
                    candidate = rand::thread_rng().gen_range(MIN_RANDOM_PORT..=MAX_RANDOM_PORT);
                }
                Err(e) => {
                    error!("Failed to map port: {}", e);
                    return Err(e);
                }
            }
        }
        Err(PortMapError::Exhausted {
            attempts: MAX_PORT_ATTEMPTS,
        })
    }

    /// Drop the rule for `port`
    pub async fn remove(&mut self, port: u16) -> Result<(), PortMapError> {
        info!("Removing UPnP port {} mapping...", port);
        let result = self.gateway.remove_port(port).await;
        if self.active.as_ref().is_some_and(|m| m.external_port == port) {
            self.active = None;
        }
        result
    }

    /// Drop the active mapping, if any; failures are logged only
    pub async fn release(&mut self) {
        let Some(mapping) = self.active.clone() else {
            return;
        };
        if let Err(e) = self.remove(mapping.external_port).await {
            error!("Error removing UPnP port mapping: {}", e);
        }
    }

    /// Mapping currently held
    pub fn active(&self) -> Option<&PortMapping> {
        self.active.as_ref()
    }

    fn remember(&mut self, external_port: u16, internal_port: u16, marker: &str) {
        self.active = Some(PortMapping {
            external_port,
            internal_port,
            marker: marker.to_string(),
        });
    }
}
