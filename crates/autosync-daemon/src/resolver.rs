//! Reachability detection
//!
//! Works out which host name or address the bank should call back on:
//!
//! 1. an explicitly configured callback host (reverse proxy deployments)
//! 2. the local address, when it is public
//! 3. the public address, when the operator forwarded a fixed port by hand
//! 4. the public address behind an automatically mapped UPnP port
//!
//! Failing to find any public address is not an error for the daemon: the
//! cycle simply runs without a callback.

use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::time::Duration;

use thiserror::Error;
use tracing::{error, info};

use autosync_core::netrange::is_private_ip;
use autosync_core::Config;

use crate::portmap::PortMapper;

/// Services returning the caller's public address as plain text
pub const PUBLIC_IP_URLS: &[&str] = &[
    "http://ip.42.pl/raw",
    "https://api.ipify.org",
    "https://api.seeip.org",
];

/// Per-request timeout for public address lookups
const LOOKUP_TIMEOUT: Duration = Duration::from_secs(3);

/// Well-known address used to pick the outgoing interface (nothing is sent)
const ROUTE_PROBE: SocketAddr = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)), 80);

/// Reachability errors
#[derive(Error, Debug)]
pub enum ResolveError {
    #[error("cannot determine local IP: {0}")]
    LocalIp(#[from] std::io::Error),

    #[error("unable to determine public IP")]
    PublicIp,
}

/// How the bank reaches this host
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Reachability {
    /// Configured host name; TLS and routing handled by a proxy on 443
    ExplicitHost(String),
    /// The host itself has a public address
    PublicIp(IpAddr),
    /// Private address with a port forwarded by the operator
    ManualForward(IpAddr),
    /// Private address with a UPnP mapping managed by us
    AutoTraversal(IpAddr),
}

impl Reachability {
    /// Host part of the callback URL
    pub fn host(&self) -> String {
        match self {
            Reachability::ExplicitHost(host) => host.clone(),
            Reachability::PublicIp(ip)
            | Reachability::ManualForward(ip)
            | Reachability::AutoTraversal(ip) => ip.to_string(),
        }
    }

    /// Whether a port mapping has to be created
    pub fn needs_port_mapping(&self) -> bool {
        matches!(self, Reachability::AutoTraversal(_))
    }

    /// Whether the callback host came from configuration
    pub fn is_explicit(&self) -> bool {
        matches!(self, Reachability::ExplicitHost(_))
    }
}

/// Source of local and public address information
#[async_trait::async_trait]
pub trait NetworkProbe: Send + Sync {
    /// Address of the interface that routes to the internet
    fn local_ip(&self) -> Result<IpAddr, ResolveError>;

    /// Public address as seen by an external lookup service
    async fn public_ip_from_web(&self) -> Result<IpAddr, ResolveError>;
}

/// Probe using the OS routing table and HTTP lookup services
pub struct SystemProbe {
    client: reqwest::Client,
    urls: Vec<String>,
}

impl SystemProbe {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(LOOKUP_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            client,
            urls: PUBLIC_IP_URLS.iter().map(|u| u.to_string()).collect(),
        }
    }

    async fn lookup(&self, url: &str) -> Result<IpAddr, String> {
        let body = self
            .client
            .get(url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| e.to_string())?
            .text()
            .await
            .map_err(|e| e.to_string())?;
        body.trim()
            .parse()
            .map_err(|_| format!("not an IP address: {:?}", body.trim()))
    }
}

impl Default for SystemProbe {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl NetworkProbe for SystemProbe {
    fn local_ip(&self) -> Result<IpAddr, ResolveError> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
        socket.connect(ROUTE_PROBE)?;
        Ok(socket.local_addr()?.ip())
    }

    async fn public_ip_from_web(&self) -> Result<IpAddr, ResolveError> {
        for url in &self.urls {
            info!("Retrieving public IP from {}...", url);
            match self.lookup(url).await {
                Ok(ip) => {
                    info!("Got public IP: {}", ip);
                    return Ok(ip);
                }
                Err(e) => error!("Public API {} failed: {}", url, e),
            }
        }
        Err(ResolveError::PublicIp)
    }
}

/// Classifies the network environment
pub struct NetworkEnvironmentResolver {
    probe: Box<dyn NetworkProbe>,
}

impl NetworkEnvironmentResolver {
    pub fn new(probe: Box<dyn NetworkProbe>) -> Self {
        Self { probe }
    }

    /// Decide how the bank reaches us
    ///
    /// Only the automatic traversal branch touches the port mapper, and
    /// only to search for the gateway; the mapping itself is created once
    /// the listening port is known.
    pub async fn resolve(
        &self,
        config: &Config,
        mapper: &mut PortMapper,
    ) -> Result<Reachability, ResolveError> {
        if let Some(host) = &config.callback_host {
            return Ok(Reachability::ExplicitHost(host.clone()));
        }

        let local_ip = self.probe.local_ip()?;
        if !is_private_ip(local_ip) {
            info!("Host has a public IP...");
            return Ok(Reachability::PublicIp(local_ip));
        }

        if config.port.is_some() {
            info!(
                "Host has a private IP. A port is specified so we will not \
                 attempt to map a port. Remember to configure forward manually."
            );
            let ip = self.public_ip(local_ip, mapper).await?;
            return Ok(Reachability::ManualForward(ip));
        }

        info!("Host has a private IP, trying UPnP port mapping...");
        // A missing gateway is logged by the mapper; the public address
        // may still be found through the web lookup.
        let _ = mapper.search().await;
        let ip = self.public_ip(local_ip, mapper).await?;
        Ok(Reachability::AutoTraversal(ip))
    }

    /// Public address: local if public, else gateway, else web lookup
    pub async fn public_ip(
        &self,
        local_ip: IpAddr,
        mapper: &PortMapper,
    ) -> Result<IpAddr, ResolveError> {
        if !is_private_ip(local_ip) {
            return Ok(local_ip);
        }
        if let Some(ip) = mapper.external_ip().await {
            if !is_private_ip(ip) {
                return Ok(ip);
            }
            info!("Gateway reports private external IP {}, double NAT?", ip);
        }
        self.probe.public_ip_from_web().await
    }
}
