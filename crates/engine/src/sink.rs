//! Alert delivery seam.

use crate::DeliveryError;
use async_trait::async_trait;
use ceremony_core::{Observation, Token, UserId};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tokio::sync::mpsc;

/// One alert-worthy change for one token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Alert {
    pub user_id: UserId,
    /// Observation stored before this poll, if any.
    pub previous: Option<Observation>,
    pub current: Observation,
}

impl Alert {
    #[inline]
    pub fn token(&self) -> &Token {
        self.current.token()
    }
}

/// Delivers alerts to the user-facing channel.
///
/// Implementations must bound their own latency so a stalled channel
/// cannot hold a polling tick indefinitely.
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn deliver(&self, alert: &Alert) -> Result<(), DeliveryError>;
}

/// Sink that records alerts in memory, for testing.
#[derive(Default)]
pub struct RecordingSink {
    alerts: Mutex<Vec<Alert>>,
    fail: AtomicBool,
    notify: Option<mpsc::UnboundedSender<Alert>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sink that also forwards every delivered alert to a channel.
    pub fn with_channel() -> (Self, mpsc::UnboundedReceiver<Alert>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sink = Self {
            notify: Some(tx),
            ..Default::default()
        };
        (sink, rx)
    }

    /// Make subsequent deliveries fail (alerts are still recorded as attempted).
    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn alerts(&self) -> Vec<Alert> {
        self.alerts.lock().map(|a| a.clone()).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.alerts.lock().map(|a| a.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl AlertSink for RecordingSink {
    async fn deliver(&self, alert: &Alert) -> Result<(), DeliveryError> {
        if let Ok(mut alerts) = self.alerts.lock() {
            alerts.push(alert.clone());
        }
        if let Some(tx) = &self.notify {
            let _ = tx.send(alert.clone());
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(DeliveryError::Rejected("Recording sink set to fail".to_string()));
        }
        Ok(())
    }
}
