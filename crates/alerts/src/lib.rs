//! Telegram front end and durable storage for the ceremony monitor.
//!
//! This crate provides:
//! - SQLite-backed token, observation and monitoring-flag storage
//! - Telegram bot command handling
//! - Alert formatting and delivery to users' chats

pub mod db;
pub mod notifier;
pub mod telegram;

pub use db::{Database, DbError};
pub use notifier::{NotifierConfig, TelegramAlertSink};
pub use telegram::{format_alert_message, Command, TelegramBot, TelegramError};
