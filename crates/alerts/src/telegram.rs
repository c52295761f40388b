//! Telegram bot handlers.

use ceremony_core::{parse_token_list, Observation, Token, UserId};
use ceremony_engine::{
    add_tokens, list_tokens, remove_token, Alert, MonitorError, MonitorRegistry, MonitorStore,
    RemoveOutcome, StartOutcome, StopOutcome, StoreError,
};
use std::sync::Arc;
use teloxide::prelude::*;
use teloxide::types::ParseMode;
use teloxide::utils::command::BotCommands;
use teloxide::utils::html::escape;
use thiserror::Error;
use tracing::{error, info, warn};

#[derive(Error, Debug)]
pub enum TelegramError {
    #[error("Telegram API error: {0}")]
    Api(#[from] teloxide::RequestError),
    #[error("Storage error: {0}")]
    Store(#[from] StoreError),
    #[error("Monitor error: {0}")]
    Monitor(#[from] MonitorError),
}

/// Bot commands.
#[derive(BotCommands, Clone, Debug, PartialEq)]
#[command(rename_rule = "lowercase", description = "Available commands:")]
pub enum Command {
    #[command(description = "Show the welcome message")]
    Start,
    #[command(description = "Show help")]
    Help,
    #[command(description = "List your registered tokens")]
    Tokens,
    #[command(description = "Add tokens, separated by spaces or new lines. Usage: /add TOKEN ...")]
    Add(String),
    #[command(description = "Remove a token by number or last characters. Usage: /remove 2")]
    Remove(String),
    #[command(description = "Check status now. Usage: /status or /status 2")]
    Status(String),
    #[command(description = "Start monitoring your tokens")]
    Monitor,
    #[command(description = "Stop monitoring")]
    Stop,
    #[command(description = "About this bot")]
    About,
}

const GENERIC_FAILURE: &str = "⚠️ Something went wrong, please try again later.";

/// Telegram bot wrapper.
pub struct TelegramBot {
    bot: Bot,
    registry: Arc<MonitorRegistry>,
    store: Arc<dyn MonitorStore>,
}

impl TelegramBot {
    pub fn new(bot: Bot, registry: Arc<MonitorRegistry>, store: Arc<dyn MonitorStore>) -> Self {
        Self {
            bot,
            registry,
            store,
        }
    }

    /// Get the underlying bot for sending messages.
    pub fn bot(&self) -> &Bot {
        &self.bot
    }

    /// Run the bot command handler until Ctrl+C.
    pub async fn run(self: Arc<Self>) {
        let bot = self.bot.clone();

        if let Err(e) = bot.set_my_commands(Command::bot_commands()).await {
            warn!(error = %e, "Failed to register bot commands");
        }

        let handler = Update::filter_message().filter_command::<Command>().endpoint(
            move |bot: Bot, msg: Message, cmd: Command| {
                let this = Arc::clone(&self);
                async move { this.handle_command(bot, msg, cmd).await }
            },
        );

        info!("Telegram dispatcher started");
        Dispatcher::builder(bot, handler)
            .enable_ctrlc_handler()
            .build()
            .dispatch()
            .await;
        info!("Telegram dispatcher stopped");
    }

    async fn handle_command(
        &self,
        bot: Bot,
        msg: Message,
        cmd: Command,
    ) -> Result<(), TelegramError> {
        // Users talk to the bot in private chats, so the chat id is the user id.
        let user = UserId(msg.chat.id.0);

        let text = match self.reply(user, cmd).await {
            Ok(text) => text,
            Err(e) => {
                error!(user_id = %user, error = %e, "Command failed");
                GENERIC_FAILURE.to_string()
            }
        };

        bot.send_message(msg.chat.id, text)
            .parse_mode(ParseMode::Html)
            .await?;
        Ok(())
    }

    /// Build the HTML reply for a command, performing its side effects.
    pub async fn reply(&self, user: UserId, cmd: Command) -> Result<String, TelegramError> {
        let store = self.store.as_ref();

        let text = match cmd {
            Command::Start => format!(
                "🔍 <b>Silent Protocol Monitoring Bot</b>\n\n\
                 Add your ceremony tokens with /add, then use /monitor to get a \
                 message whenever a token's status or queue position changes.\n\n{}",
                escape(&Command::descriptions().to_string())
            ),

            Command::Help => escape(&Command::descriptions().to_string()),

            Command::Tokens => {
                let listed = list_tokens(store, user).await?;
                if listed.is_empty() {
                    "⚠️ No tokens registered. Add some with /add".to_string()
                } else {
                    let lines: Vec<String> = listed
                        .iter()
                        .map(|(i, masked)| format!("{}. <code>{}</code>", i, escape(masked)))
                        .collect();
                    format!("<b>Your tokens</b>\n\n{}", lines.join("\n"))
                }
            }

            Command::Add(text) => {
                let tokens = parse_token_list(&text);
                if tokens.is_empty() {
                    "❌ No valid tokens found.\nUsage: /add TOKEN [TOKEN ...]".to_string()
                } else {
                    let added = add_tokens(store, user, &tokens).await?;
                    info!(user_id = %user, added = added.added, total = added.total, "Tokens added");
                    format!(
                        "✅ Added {} new token(s). You now have {}.",
                        added.added, added.total
                    )
                }
            }

            Command::Remove(selector) => {
                if selector.trim().is_empty() {
                    "Usage: /remove NUMBER or /remove LAST_CHARACTERS\nSee /tokens for numbers."
                        .to_string()
                } else {
                    match remove_token(store, user, &selector).await? {
                        RemoveOutcome::Removed(token) => {
                            info!(user_id = %user, token = %token, "Token removed");
                            format!("🗑 Removed <code>{}</code>", escape(&token.masked()))
                        }
                        RemoveOutcome::NotFound => "❌ No such token. See /tokens".to_string(),
                        RemoveOutcome::Ambiguous => {
                            "❌ More than one token matches. Use its number from /tokens"
                                .to_string()
                        }
                    }
                }
            }

            Command::Status(arg) => self.status_reply(user, arg.trim()).await?,

            Command::Monitor => {
                let tokens = store.load_tokens(user).await?;
                if tokens.is_empty() {
                    "⚠️ No tokens registered. Add some with /add first".to_string()
                } else {
                    let count = tokens.len();
                    match self.registry.start(user, tokens).await? {
                        StartOutcome::Started => format!(
                            "▶️ Monitoring started for {} token(s).\n\
                             You will get a message when a status or position changes.",
                            count
                        ),
                        StartOutcome::AlreadyRunning => {
                            "ℹ️ Monitoring is already running.".to_string()
                        }
                    }
                }
            }

            Command::Stop => match self.registry.stop(user).await? {
                StopOutcome::Stopped => "⏹ Monitoring stopped.".to_string(),
                StopOutcome::NotRunning => "ℹ️ Monitoring is not running.".to_string(),
            },

            Command::About => "🤖 <b>Silent Protocol Monitor Bot</b>\n\n\
                               Tracks your ceremony participation status and queue position."
                .to_string(),
        };

        Ok(text)
    }

    async fn status_reply(&self, user: UserId, arg: &str) -> Result<String, TelegramError> {
        let tokens = self.store.load_tokens(user).await?;
        if tokens.is_empty() {
            return Ok("⚠️ No tokens registered. Add some with /add".to_string());
        }

        let selected: Vec<(usize, &Token)> = if arg.is_empty() {
            tokens.iter().enumerate().map(|(i, t)| (i + 1, t)).collect()
        } else {
            match arg.parse::<usize>() {
                Ok(index) if index >= 1 && index <= tokens.len() => {
                    vec![(index, &tokens[index - 1])]
                }
                _ => return Ok("Usage: /status or /status NUMBER. See /tokens".to_string()),
            }
        };

        let mut lines = Vec::with_capacity(selected.len());
        for (index, token) in selected {
            let observation = self.registry.check_now(user, token).await?;
            lines.push(format_status(index, &observation));
        }

        Ok(format!("<b>Current status</b>\n\n{}", lines.join("\n\n")))
    }
}

fn format_position(position: Option<u64>) -> String {
    position.map_or_else(|| "Unknown".to_string(), |p| p.to_string())
}

fn format_position_change(previous: Option<u64>, current: Option<u64>) -> String {
    match (previous, current) {
        (Some(old), Some(new)) if old != new => format!("{} → {}", old, new),
        (_, Some(new)) => new.to_string(),
        (Some(old), None) => format!("Unknown (last {})", old),
        (None, None) => "Unknown".to_string(),
    }
}

/// Format one token's current status.
pub fn format_status(index: usize, observation: &Observation) -> String {
    format!(
        "{}. <code>{}</code>\n    Status: {}\n    Position: {}",
        index,
        escape(&observation.token().masked()),
        observation.status().label(),
        format_position(observation.position())
    )
}

/// Format a change as an alert message.
pub fn format_alert_message(alert: &Alert) -> String {
    let current = &alert.current;
    let previous = alert.previous.as_ref();

    let mut msg = format!(
        "🔔 <b>Ceremony status update</b>\n\n\
         <b>Token:</b> <code>{}</code>\n\
         <b>Status:</b> {}",
        escape(&alert.token().masked()),
        current.status().label()
    );

    if let Some(prev) = previous.filter(|p| p.status() != current.status()) {
        msg.push_str(&format!(" (was {})", prev.status().label()));
    }

    msg.push_str(&format!(
        "\n<b>Position:</b> {}",
        format_position_change(previous.and_then(Observation::position), current.position())
    ));

    msg.push_str(&format!(
        "\n\n⏰ {}",
        current.observed_at().format("%Y-%m-%d %H:%M:%S UTC")
    ));

    msg
}

#[cfg(test)]
mod tests {
    use super::*;
    use ceremony_core::{RawStatus, StatusKind};
    use ceremony_engine::{
        MemoryStore, MonitorConfig, MonitorContext, RecordingSink, RetryConfig, RetryingProbe,
        ScriptedStatusClient,
    };
    use chrono::{TimeZone, Utc};
    use pretty_assertions::assert_eq;

    const USER: UserId = UserId(777);

    fn token(raw: &str) -> Token {
        Token::new(raw).unwrap()
    }

    fn at() -> chrono::DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 30, 5).unwrap()
    }

    struct Fixture {
        client: Arc<ScriptedStatusClient>,
        store: Arc<MemoryStore>,
        bot: TelegramBot,
    }

    fn fixture() -> Fixture {
        let client = Arc::new(ScriptedStatusClient::new());
        let store = Arc::new(MemoryStore::new());
        let ctx = MonitorContext {
            probe: Arc::new(RetryingProbe::new(client.clone(), RetryConfig::default())),
            sink: Arc::new(RecordingSink::new()),
            store: store.clone(),
        };
        let registry = Arc::new(MonitorRegistry::new(ctx, MonitorConfig::default()));
        let bot = TelegramBot::new(Bot::new("123456:TEST"), registry, store.clone());
        Fixture { client, store, bot }
    }

    #[test]
    fn test_alert_message_with_position_change() {
        let t = token("secret-abc123");
        let alert = Alert {
            user_id: USER,
            previous: Some(Observation::new(t.clone(), StatusKind::Active, Some(1603), at())),
            current: Observation::new(t, StatusKind::Active, Some(1600), at()),
        };

        let msg = format_alert_message(&alert);
        assert_eq!(
            msg,
            "🔔 <b>Ceremony status update</b>\n\n\
             <b>Token:</b> <code>...abc123</code>\n\
             <b>Status:</b> Active\n\
             <b>Position:</b> 1603 → 1600\n\n\
             ⏰ 2026-03-01 12:30:05 UTC"
        );
        assert!(!msg.contains("secret"));
    }

    #[test]
    fn test_alert_message_status_change_and_first_observation() {
        let t = token("secret-abc123");
        let alert = Alert {
            user_id: USER,
            previous: Some(Observation::new(t.clone(), StatusKind::Active, Some(12), at())),
            current: Observation::new(t.clone(), StatusKind::ServiceDown, None, at()),
        };
        let msg = format_alert_message(&alert);
        assert!(msg.contains("<b>Status:</b> Service down (was Active)"));
        assert!(msg.contains("<b>Position:</b> Unknown (last 12)"));

        let first = Alert {
            user_id: USER,
            previous: None,
            current: Observation::new(t, StatusKind::Active, Some(5), at()),
        };
        assert!(format_alert_message(&first).contains("<b>Position:</b> 5\n"));
    }

    #[test]
    fn test_masked_token_is_escaped() {
        let obs = Observation::new(token("xx<b>&zz"), StatusKind::Unknown, None, at());
        assert_eq!(
            format_status(1, &obs),
            "1. <code>...&lt;b&gt;&amp;zz</code>\n    Status: Unknown\n    Position: Unknown"
        );
    }

    #[test]
    fn test_command_parsing() {
        assert_eq!(
            Command::parse("/add aaa-111111 bbb-222222", "ceremony_bot").unwrap(),
            Command::Add("aaa-111111 bbb-222222".to_string())
        );
        assert_eq!(
            Command::parse("/status", "ceremony_bot").unwrap(),
            Command::Status(String::new())
        );
        assert_eq!(Command::parse("/monitor", "ceremony_bot").unwrap(), Command::Monitor);
        assert!(Command::parse("/premium 50", "ceremony_bot").is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_token_management_flow() {
        let fx = fixture();

        let reply = fx.bot.reply(USER, Command::Tokens).await.unwrap();
        assert!(reply.contains("No tokens registered"));

        let reply = fx
            .bot
            .reply(USER, Command::Add("token-aaaaaa\ntoken-bbbbbb".into()))
            .await
            .unwrap();
        assert_eq!(reply, "✅ Added 2 new token(s). You now have 2.");

        let reply = fx.bot.reply(USER, Command::Tokens).await.unwrap();
        assert_eq!(
            reply,
            "<b>Your tokens</b>\n\n1. <code>...aaaaaa</code>\n2. <code>...bbbbbb</code>"
        );

        let reply = fx.bot.reply(USER, Command::Remove("1".into())).await.unwrap();
        assert_eq!(reply, "🗑 Removed <code>...aaaaaa</code>");
        assert_eq!(fx.store.load_tokens(USER).await.unwrap(), vec![token("token-bbbbbb")]);

        let reply = fx.bot.reply(USER, Command::Remove("7".into())).await.unwrap();
        assert!(reply.contains("No such token"));

        let reply = fx.bot.reply(USER, Command::Add("   ".into())).await.unwrap();
        assert!(reply.contains("No valid tokens"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_monitor_and_stop_flow() {
        let fx = fixture();

        let reply = fx.bot.reply(USER, Command::Monitor).await.unwrap();
        assert!(reply.contains("Add some with /add first"));

        fx.bot
            .reply(USER, Command::Add("token-aaaaaa".into()))
            .await
            .unwrap();
        fx.client.push(&token("token-aaaaaa"), Ok(RawStatus::active(10)));

        let reply = fx.bot.reply(USER, Command::Monitor).await.unwrap();
        assert!(reply.starts_with("▶️ Monitoring started for 1 token(s)"));
        let reply = fx.bot.reply(USER, Command::Monitor).await.unwrap();
        assert_eq!(reply, "ℹ️ Monitoring is already running.");

        let reply = fx.bot.reply(USER, Command::Stop).await.unwrap();
        assert_eq!(reply, "⏹ Monitoring stopped.");
        let reply = fx.bot.reply(USER, Command::Stop).await.unwrap();
        assert_eq!(reply, "ℹ️ Monitoring is not running.");
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_checks_without_writing() {
        let fx = fixture();
        fx.bot
            .reply(USER, Command::Add("token-aaaaaa token-bbbbbb".into()))
            .await
            .unwrap();
        fx.client.push(&token("token-bbbbbb"), Ok(RawStatus::active(42)));

        let reply = fx.bot.reply(USER, Command::Status("2".into())).await.unwrap();
        assert_eq!(
            reply,
            "<b>Current status</b>\n\n2. <code>...bbbbbb</code>\n    Status: Active\n    Position: 42"
        );
        assert_eq!(fx.store.observation_writes(), 0);

        let reply = fx.bot.reply(USER, Command::Status("9".into())).await.unwrap();
        assert!(reply.starts_with("Usage: /status"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_storage_failure_surfaces() {
        let fx = fixture();
        fx.store.set_failing(true);
        let result = fx.bot.reply(USER, Command::Tokens).await;
        assert!(matches!(result, Err(TelegramError::Store(_))));
    }
}
