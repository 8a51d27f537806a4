//! SMTP submission via lettre.

use lettre::transport::smtp::authentication::Credentials;
use lettre::{SmtpTransport, Transport};
use secrecy::{ExposeSecret, SecretString};
use tracing::info;

use super::MailSender;
use crate::config::{MailbotConfig, TlsMode};
use crate::error::TransportError;
use crate::mail::OutgoingMail;
use crate::reply::{self, Identity};

/// Sends composed mail through an authenticated SMTP relay.
pub struct SmtpSender {
    transport: SmtpTransport,
    identity: Identity,
}

impl SmtpSender {
    pub fn new(
        host: &str,
        port: u16,
        tls: TlsMode,
        username: &str,
        password: &SecretString,
        identity: Identity,
    ) -> Result<Self, TransportError> {
        let creds = Credentials::new(username.to_string(), password.expose_secret().to_string());
        let builder = match tls {
            TlsMode::Tls => SmtpTransport::relay(host),
            TlsMode::Starttls => SmtpTransport::starttls_relay(host),
        }
        .map_err(|e| TransportError::Smtp(format!("SMTP relay error: {e}")))?;

        Ok(Self {
            transport: builder.port(port).credentials(creds).build(),
            identity,
        })
    }

    /// Sender for the daemon configuration, using the bot identity it names.
    pub fn from_config(config: &MailbotConfig) -> Result<Self, TransportError> {
        let password = SecretString::from(config.smtp_password().to_string());
        Self::new(
            &config.smtp.host,
            config.smtp.port(),
            config.smtp.tls,
            config.smtp_username(),
            &password,
            Identity::new(&config.mailaddr, config.mailname.clone(), &config.adminaddr),
        )
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }
}

impl MailSender for SmtpSender {
    fn send(&self, mail: OutgoingMail) -> Result<(), TransportError> {
        let message = reply::compose(&mail, &self.identity)?;
        self.transport
            .send(&message)
            .map_err(|e| TransportError::Smtp(e.to_string()))?;
        info!(subject = %mail.subject, "Mail sent");
        Ok(())
    }
}
