//! Callback source validation

use std::net::IpAddr;

use ipnetwork::IpNetwork;
use tracing::warn;

use autosync_core::netrange::{is_trusted_source, provider_networks};
use autosync_core::{CallbackRequest, Config, ConfigError};

/// Decides whether a callback may trigger a synchronization
#[derive(Clone, Debug)]
pub struct IpValidator {
    skip: bool,
    networks: Vec<IpNetwork>,
}

impl IpValidator {
    pub fn new(skip: bool, networks: Vec<IpNetwork>) -> Self {
        Self { skip, networks }
    }

    /// Bank ranges plus any configured `trusted_networks`
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        let mut networks = provider_networks();
        networks.extend(config.trusted_networks()?);
        Ok(Self::new(config.skip_ip_validation, networks))
    }

    /// Whether validation is disabled
    pub fn is_skipped(&self) -> bool {
        self.skip
    }

    /// Effective source: the proxy header if present, else the peer
    ///
    /// A header that does not hold an address yields `None`.
    pub fn source_of(peer: IpAddr, request: &CallbackRequest) -> Option<IpAddr> {
        match request.forwarded_source() {
            Some(value) => match value.parse() {
                Ok(ip) => Some(ip),
                Err(_) => {
                    warn!("Unparseable forwarded source {:?}", value);
                    None
                }
            },
            None => Some(peer),
        }
    }

    /// Whether `source` belongs to the bank (or validation is off)
    pub fn is_trusted(&self, source: IpAddr) -> bool {
        self.skip || is_trusted_source(source, &self.networks)
    }

    pub fn is_trusted_callback_source(&self, peer: IpAddr, request: &CallbackRequest) -> bool {
        if self.skip {
            return true;
        }
        Self::source_of(peer, request).is_some_and(|ip| self.is_trusted(ip))
    }
}
