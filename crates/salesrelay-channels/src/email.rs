//! Email handler: sends each summary as a plain-text report over SMTP
//! (async lettre, STARTTLS relay).

use async_trait::async_trait;
use lettre::message::Mailbox;
use lettre::message::header::ContentType;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};

use salesrelay_core::config::EmailConfig;
use salesrelay_core::error::{RelayError, Result};
use salesrelay_core::traits::SummaryHandler;
use salesrelay_core::types::SummaryMessage;

pub struct EmailHandler {
    config: EmailConfig,
    from: Mailbox,
    to: Vec<Mailbox>,
}

impl EmailHandler {
    /// Fails on a missing host, no recipients, or an unparsable address.
    pub fn new(config: EmailConfig) -> Result<Self> {
        if config.smtp_host.trim().is_empty() {
            return Err(RelayError::Config("email.smtp_host is not set".into()));
        }
        if config.to.is_empty() {
            return Err(RelayError::Config("email.to has no recipients".into()));
        }
        let from: Mailbox = config
            .from
            .parse()
            .map_err(|e| RelayError::Config(format!("invalid email.from '{}': {e}", config.from)))?;
        let to = config
            .to
            .iter()
            .map(|addr| {
                addr.parse::<Mailbox>()
                    .map_err(|e| RelayError::Config(format!("invalid recipient '{addr}': {e}")))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self { config, from, to })
    }

    pub fn compose_body(summary: &SummaryMessage) -> String {
        let mut body = format!("Total sales: {}\n", summary.total_amount);
        if summary.quantity_per_item.is_empty() {
            body.push_str("\nNo items sold.\n");
        } else {
            body.push_str("\nQuantity sold per item:\n");
            for item in &summary.quantity_per_item {
                body.push_str(&format!("  {}: {}\n", item.item_key, item.total_quantity));
            }
        }
        body
    }

    pub fn build_message(&self, summary: &SummaryMessage) -> Result<Message> {
        let mut builder = Message::builder()
            .from(self.from.clone())
            .subject(self.config.subject.as_str())
            .header(ContentType::TEXT_PLAIN);
        for mailbox in &self.to {
            builder = builder.to(mailbox.clone());
        }
        builder
            .body(Self::compose_body(summary))
            .map_err(|e| RelayError::HandlerFailure(format!("build email: {e}")))
    }
}

#[async_trait]
impl SummaryHandler for EmailHandler {
    fn name(&self) -> &str {
        "email"
    }

    async fn handle(&self, summary: &SummaryMessage) -> Result<()> {
        let email = self.build_message(summary)?;

        let mut transport = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&self.config.smtp_host)
            .map_err(|e| RelayError::HandlerFailure(format!("SMTP relay: {e}")))?
            .port(self.config.smtp_port);
        if !self.config.username.is_empty() {
            transport = transport.credentials(Credentials::new(
                self.config.username.clone(),
                self.config.password.clone(),
            ));
        }

        transport
            .build()
            .send(email)
            .await
            .map_err(|e| RelayError::HandlerFailure(format!("SMTP send: {e}")))?;

        tracing::info!("📤 Sales report emailed to {} recipient(s)", self.to.len());
        Ok(())
    }
}
