//! Failure alerts by mail
//!
//! Port 25 talks plain SMTP and upgrades with STARTTLS only when a
//! password is set; any other port uses implicit TLS.

use std::time::Duration;

use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use thiserror::Error;
use tracing::info;

use autosync_core::SmtpConfig;

/// SMTP connect/command timeout
const SMTP_TIMEOUT: Duration = Duration::from_secs(10);

/// Plain SMTP port
const SMTP_PLAIN_PORT: u16 = 25;

/// Alert delivery errors
#[derive(Error, Debug)]
pub enum AlertError {
    #[error("invalid address {address:?}: {reason}")]
    Address { address: String, reason: String },

    #[error("failed to build message: {0}")]
    Message(String),

    #[error("SMTP error: {0}")]
    Smtp(String),
}

/// Something that can tell the operator about repeated failures
#[async_trait::async_trait]
pub trait Alerter: Send + Sync {
    async fn send(&self, subject: &str, body: &str) -> Result<(), AlertError>;
}

/// Mail alerts through the configured SMTP server
pub struct SmtpAlerter {
    config: SmtpConfig,
}

impl SmtpAlerter {
    pub fn new(config: SmtpConfig) -> Self {
        Self { config }
    }

    fn build_message(
        &self,
        user: &str,
        subject: &str,
        body: &str,
    ) -> Result<Message, AlertError> {
        let from = self.config.from.clone().unwrap_or_else(default_sender);
        let to = self.config.to.clone().unwrap_or_else(|| user.to_string());

        let mut builder = Message::builder().from(mailbox(&from)?).subject(subject);
        for rcpt in to.split(',').map(str::trim).filter(|r| !r.is_empty()) {
            builder = builder.to(mailbox(rcpt)?);
        }
        builder
            .body(body.to_string())
            .map_err(|e| AlertError::Message(e.to_string()))
    }

    fn transport(&self, server: &str, user: &str) -> Result<SmtpTransport, AlertError> {
        let port = self.config.port;
        let password = self.config.password.as_deref().filter(|p| !p.is_empty());
        info!("Using port {}...", port);

        let builder = match (port, password) {
            (SMTP_PLAIN_PORT, None) => SmtpTransport::builder_dangerous(server),
            (SMTP_PLAIN_PORT, Some(_)) => SmtpTransport::starttls_relay(server)
                .map_err(|e| AlertError::Smtp(e.to_string()))?,
            _ => SmtpTransport::relay(server).map_err(|e| AlertError::Smtp(e.to_string()))?,
        };
        let builder = builder.port(port).timeout(Some(SMTP_TIMEOUT));

        let builder = match password {
            Some(password) => {
                builder.credentials(Credentials::new(user.to_string(), password.to_string()))
            }
            None => {
                info!("smtp password not set, not authenticating to server");
                builder
            }
        };
        Ok(builder.build())
    }
}

#[async_trait::async_trait]
impl Alerter for SmtpAlerter {
    async fn send(&self, subject: &str, body: &str) -> Result<(), AlertError> {
        let (Some(user), Some(server)) = (self.config.user.clone(), self.config.server.clone())
        else {
            info!("smtp user or server not set, not sending email");
            return Ok(());
        };
        info!("Sending exception email...");

        let message = self.build_message(&user, subject, body)?;
        let transport = self.transport(&server, &user)?;
        tokio::task::spawn_blocking(move || transport.send(&message))
            .await
            .map_err(|e| AlertError::Smtp(format!("task panicked: {}", e)))?
            .map_err(|e| AlertError::Smtp(e.to_string()))?;

        info!("Email sent successfully!");
        Ok(())
    }
}

fn mailbox(address: &str) -> Result<Mailbox, AlertError> {
    address.parse().map_err(|e: lettre::address::AddressError| AlertError::Address {
        address: address.to_string(),
        reason: e.to_string(),
    })
}

/// `autosync@<hostname>`
fn default_sender() -> String {
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string());
    format!("autosync@{}", host)
}
