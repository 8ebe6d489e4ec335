//! Callback registration
//!
//! Ties the resolver, binder, port mapper and bank API together: each
//! scheduler iteration calls [`CallbackRegistrar::setup`], and
//! [`CallbackRegistrar::teardown`] undoes everything on exit.

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::{error, info, warn};

use autosync_core::{callback_url, Config, HTTPS_PORT};

use crate::binder::PortBinder;
use crate::collaborators::CallbackApi;
use crate::error::DaemonError;
use crate::listener::CallbackListener;
use crate::portmap::PortMapper;
use crate::resolver::NetworkEnvironmentResolver;

/// A callback registered for this cycle
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CallbackRegistration {
    pub marker: String,
    pub url: String,
    pub host: String,
    /// Port in the URL
    pub port: u16,
    pub user_ids: Vec<String>,
}

/// Owns the listener, the port mapping and the registered callbacks
pub struct CallbackRegistrar {
    config: Arc<Config>,
    resolver: NetworkEnvironmentResolver,
    mapper: PortMapper,
    api: Box<dyn CallbackApi>,
    binder: PortBinder,
    listener: Option<CallbackListener>,
    registered_users: BTreeSet<String>,
}

impl CallbackRegistrar {
    pub fn new(
        config: Arc<Config>,
        resolver: NetworkEnvironmentResolver,
        mapper: PortMapper,
        api: Box<dyn CallbackApi>,
    ) -> Self {
        Self {
            config,
            resolver,
            mapper,
            api,
            binder: PortBinder::new(),
            listener: None,
            registered_users: BTreeSet::new(),
        }
    }

    /// Use a custom binder (tests bind loopback)
    pub fn with_binder(mut self, binder: PortBinder) -> Self {
        self.binder = binder;
        self
    }

    /// Listener, once bound
    pub fn listener(&self) -> Option<&CallbackListener> {
        self.listener.as_ref()
    }

    /// Make the bank call us back, if at all possible
    ///
    /// `Ok(None)` means this cycle runs without a callback: no public
    /// address or no port mapping. Binding failures and bank API errors
    /// are returned.
    pub async fn setup(
        &mut self,
        user_ids: &[String],
    ) -> Result<Option<CallbackRegistration>, DaemonError> {
        let config = Arc::clone(&self.config);
        let reach = match self.resolver.resolve(&config, &mut self.mapper).await {
            Ok(reach) => reach,
            Err(e) => {
                error!("No public IP found, not registering callback: {}", e);
                return Ok(None);
            }
        };
        let host = reach.host();

        if config.skip_ip_validation {
            info!(
                "IP validation is disabled. This should only be used behind a \
                 trusted reverse proxy"
            );
        }

        let local_port = self.ensure_listener()?;
        let marker = config.callback_marker.as_str();

        let port = if !reach.needs_port_mapping() {
            self.mapper.release().await;
            config.external_port.unwrap_or(local_port)
        } else if let Some(external_port) = config.external_port {
            info!("Forwarding specified port {}...", external_port);
            match self.mapper.add(external_port, local_port, marker).await {
                Ok(port) => port,
                Err(_) => {
                    error!("Failed to map port, not registering callback.");
                    return Ok(None);
                }
            }
        } else {
            match self.mapper.seek(local_port, marker).await {
                Ok(port) => port,
                Err(_) => {
                    error!("Failed to map port, not registering callback.");
                    return Ok(None);
                }
            }
        };

        let url_port = if reach.is_explicit() {
            info!(
                "Using explicit callback host {}, setting callback URL port to {}",
                host, HTTPS_PORT
            );
            HTTPS_PORT
        } else {
            port
        };
        if url_port != HTTPS_PORT {
            warn!(
                "Callbacks port is {}. Callbacks are broken for ports other than {}",
                url_port, HTTPS_PORT
            );
        }

        let url = callback_url(&host, url_port, marker);
        for user_id in user_ids {
            info!("Registering callback URL: {}", url);
            self.api
                .add_callback(user_id, marker, &url)
                .await
                .map_err(DaemonError::Callback)?;
            self.registered_users.insert(user_id.clone());
        }

        Ok(Some(CallbackRegistration {
            marker: marker.to_string(),
            url,
            host,
            port: url_port,
            user_ids: user_ids.to_vec(),
        }))
    }

    /// Remove callbacks, release the mapping, close the listener
    ///
    /// Every step runs regardless of earlier failures.
    pub async fn teardown(&mut self) {
        info!("Cleaning up...");
        let marker = self.config.callback_marker.clone();
        for user_id in std::mem::take(&mut self.registered_users) {
            if let Err(e) = self.api.remove_callback(&user_id, &marker).await {
                info!("Error removing callback: {}", e);
            }
        }
        self.mapper.release().await;
        self.listener = None;
    }

    fn ensure_listener(&mut self) -> Result<u16, DaemonError> {
        if let Some(listener) = &self.listener {
            return Ok(listener.local_port());
        }
        let bound = self.binder.bind(self.config.port)?;
        let listener = CallbackListener::new(bound)?;
        let port = listener.local_port();
        self.listener = Some(listener);
        Ok(port)
    }
}
