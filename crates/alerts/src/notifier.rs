//! Alert delivery to Telegram chats.

use crate::telegram::format_alert_message;
use async_trait::async_trait;
use ceremony_engine::{Alert, AlertSink, DeliveryError};
use std::time::Duration;
use teloxide::prelude::*;
use teloxide::requests::Request;
use teloxide::types::ParseMode;
use tracing::{debug, warn};

/// Configuration for the notifier.
#[derive(Debug, Clone)]
pub struct NotifierConfig {
    /// Upper bound on a single message send.
    pub delivery_timeout: Duration,
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            delivery_timeout: Duration::from_secs(10),
        }
    }
}

/// Sends each alert as an HTML message to the user's private chat.
pub struct TelegramAlertSink {
    bot: Bot,
    config: NotifierConfig,
}

impl TelegramAlertSink {
    pub fn new(bot: Bot, config: NotifierConfig) -> Self {
        Self { bot, config }
    }
}

#[async_trait]
impl AlertSink for TelegramAlertSink {
    async fn deliver(&self, alert: &Alert) -> Result<(), DeliveryError> {
        let text = format_alert_message(alert);
        let send = self
            .bot
            .send_message(ChatId(alert.user_id.get()), text)
            .parse_mode(ParseMode::Html)
            .send();

        match tokio::time::timeout(self.config.delivery_timeout, send).await {
            Ok(Ok(_)) => {
                debug!(user_id = %alert.user_id, token = %alert.token(), "Alert sent");
                Ok(())
            }
            Ok(Err(e)) => {
                warn!(user_id = %alert.user_id, error = %e, "Telegram rejected alert");
                Err(DeliveryError::Rejected(e.to_string()))
            }
            Err(_) => Err(DeliveryError::Timeout(self.config.delivery_timeout)),
        }
    }
}
