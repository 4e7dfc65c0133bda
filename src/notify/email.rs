//! SMTP transport

use lettre::message::header::ContentType;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};

use super::Notifier;
use crate::error::{Error, Result};

/// Delivers notifications as plain-text e-mail over SMTP (STARTTLS,
/// PLAIN auth). The envelope sender is the SMTP username.
pub struct EmailNotifier {
    send_to: String,
    username: String,
    password: String,
    host: String,
    port: u16,
}

impl EmailNotifier {
    pub fn new(
        send_to: String,
        username: String,
        password: String,
        host: String,
        port: u16,
    ) -> Self {
        Self {
            send_to,
            username,
            password,
            host,
            port,
        }
    }
}

#[async_trait::async_trait]
impl Notifier for EmailNotifier {
    async fn send(&self, subject: &str, content: &str) -> Result<()> {
        let email = Message::builder()
            .from(self.username.parse().map_err(|e| {
                Error::Notify(format!("invalid sender address {:?}: {e}", self.username))
            })?)
            .to(self.send_to.parse().map_err(|e| {
                Error::Notify(format!("invalid recipient address {:?}: {e}", self.send_to))
            })?)
            .subject(subject)
            .header(ContentType::TEXT_PLAIN)
            .body(content.to_string())
            .map_err(|e| Error::Notify(format!("building email failed: {e}")))?;

        let mailer = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&self.host)
            .map_err(|e| Error::Notify(format!("smtp relay setup failed: {e}")))?
            .port(self.port)
            .credentials(Credentials::new(
                self.username.clone(),
                self.password.clone(),
            ))
            .build();

        mailer
            .send(email)
            .await
            .map_err(|e| Error::Notify(format!("smtp send failed: {e}")))?;

        Ok(())
    }
}
