//! Downstream actions taken with a delivered summary.
//!
//! - `log`: record the summary in the service log
//! - `email`: send the summary to a distribution list over SMTP

pub mod email;
pub mod log;

use std::sync::Arc;

use salesrelay_core::config::SalesRelayConfig;
use salesrelay_core::error::{RelayError, Result};
use salesrelay_core::traits::SummaryHandler;

pub use email::EmailHandler;
pub use log::LogHandler;

/// Build the handler named by `consumer.handler`.
pub fn create_handler(config: &SalesRelayConfig) -> Result<Arc<dyn SummaryHandler>> {
    match config.consumer.handler.as_str() {
        "log" => Ok(Arc::new(LogHandler::new())),
        "email" => Ok(Arc::new(EmailHandler::new(config.email.clone())?)),
        other => Err(RelayError::Config(format!(
            "unknown handler '{other}' (expected \"log\" or \"email\")"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_handler_by_name() {
        let mut config = SalesRelayConfig::default();
        assert_eq!(create_handler(&config).unwrap().name(), "log");

        config.consumer.handler = "pager".into();
        assert!(matches!(create_handler(&config), Err(RelayError::Config(_))));
    }

    #[test]
    fn test_email_handler_requires_recipients() {
        let mut config = SalesRelayConfig::default();
        config.consumer.handler = "email".into();
        assert!(create_handler(&config).is_err());
    }
}
