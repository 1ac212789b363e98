//! Log-only handler: records the summary and the email body it would send.

use async_trait::async_trait;

use salesrelay_core::error::Result;
use salesrelay_core::traits::SummaryHandler;
use salesrelay_core::types::SummaryMessage;

#[derive(Debug, Default)]
pub struct LogHandler;

impl LogHandler {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl SummaryHandler for LogHandler {
    fn name(&self) -> &str {
        "log"
    }

    async fn handle(&self, summary: &SummaryMessage) -> Result<()> {
        let body = serde_json::to_string(summary)?;
        tracing::info!("📨 Received an event from the queue: {body}");
        tracing::info!("📧 Email not sent (log handler), would send body: {body}");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;
    use std::io;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_log_handler_does_not_claim_delivery() {
        let captured = Captured::default();
        let subscriber = tracing_subscriber::fmt()
            .with_writer({
                let captured = captured.clone();
                move || captured.clone()
            })
            .with_ansi(false)
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let summary = SummaryMessage::new(Decimal::from(300), vec![]);
        LogHandler::new().handle(&summary).await.unwrap();

        let output = String::from_utf8(captured.0.lock().unwrap().clone()).unwrap();
        assert!(output.contains("Received an event from the queue"));
        assert!(output.contains("would send body"));
        assert!(!output.contains("Email is sent"));
    }

    #[tokio::test]
    async fn test_log_handler_accepts_summary() {
        let handler = LogHandler::new();
        let summary = SummaryMessage::new(Decimal::ZERO, vec![]);
        assert!(handler.handle(&summary).await.is_ok());
    }
}
