//! Per-user polling loop.
//!
//! A `UserMonitor` is moved into its own task and owns all of its state:
//! the token list and the last observation per token. Nothing else
//! mutates it, so no locking is needed here.

use crate::detector::{has_changed, position_delta};
use crate::{Alert, AlertSink, MonitorStore, RetryingProbe, StoreResult};
use ceremony_core::{Observation, Token, UserId};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Collaborators shared by every monitor.
#[derive(Clone)]
pub struct MonitorContext {
    pub probe: Arc<RetryingProbe>,
    pub sink: Arc<dyn AlertSink>,
    pub store: Arc<dyn MonitorStore>,
}

/// What happened to one token during a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    Unchanged,
    Alerted,
    /// Changed, but the channel refused the alert. State was still updated.
    DeliveryFailed,
    /// Stop was requested; nothing was written.
    Cancelled,
}

/// Counters for one tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickSummary {
    pub polled: usize,
    pub alerts: usize,
    pub delivery_failures: usize,
}

pub struct UserMonitor {
    user_id: UserId,
    tokens: Vec<Token>,
    last: HashMap<Token, Observation>,
    ctx: MonitorContext,
    interval: Duration,
    cancel: CancellationToken,
}

impl UserMonitor {
    pub fn new(
        user_id: UserId,
        tokens: Vec<Token>,
        last: HashMap<Token, Observation>,
        ctx: MonitorContext,
        interval: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            user_id,
            tokens,
            last,
            ctx,
            interval: interval.max(Duration::from_millis(1)),
            cancel,
        }
    }

    /// Read the stored last observations for a token set.
    pub async fn load_baselines(
        store: &dyn MonitorStore,
        user_id: UserId,
        tokens: &[Token],
    ) -> StoreResult<HashMap<Token, Observation>> {
        let mut last = HashMap::with_capacity(tokens.len());
        for token in tokens {
            if let Some(observation) = store.load_last_observation(user_id, token).await? {
                last.insert(token.clone(), observation);
            }
        }
        Ok(last)
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    pub fn last_observation(&self, token: &Token) -> Option<&Observation> {
        self.last.get(token)
    }

    /// Run until cancelled. The first tick fires immediately, later ones
    /// every `interval` from there. A slow tick pushes the next one back
    /// rather than overlapping it.
    pub async fn run(mut self) {
        info!(
            user_id = %self.user_id,
            tokens = self.tokens.len(),
            interval_secs = self.interval.as_secs(),
            "Monitor started"
        );

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let summary = self.tick().await;
                    debug!(
                        user_id = %self.user_id,
                        polled = summary.polled,
                        alerts = summary.alerts,
                        delivery_failures = summary.delivery_failures,
                        "Tick complete"
                    );
                }
            }
        }

        info!(user_id = %self.user_id, "Monitor stopped");
    }

    /// Poll every token once, in order.
    pub async fn tick(&mut self) -> TickSummary {
        self.refresh_tokens().await;

        let mut summary = TickSummary::default();
        let tokens = self.tokens.clone();
        for token in &tokens {
            match self.poll_token(token).await {
                PollOutcome::Cancelled => break,
                PollOutcome::Unchanged => {}
                PollOutcome::Alerted => summary.alerts += 1,
                PollOutcome::DeliveryFailed => summary.delivery_failures += 1,
            }
            summary.polled += 1;
        }
        summary
    }

    /// Reload the token set. Stored observations of tokens that left the
    /// set are deleted here, since this monitor is their only writer.
    async fn refresh_tokens(&mut self) {
        let tokens = match self.ctx.store.load_tokens(self.user_id).await {
            Ok(tokens) => tokens,
            Err(e) => {
                warn!(user_id = %self.user_id, error = %e, "Token reload failed, keeping previous set");
                return;
            }
        };

        for dropped in self.tokens.iter().filter(|t| !tokens.contains(t)) {
            if self.cancel.is_cancelled() {
                break;
            }
            if let Err(e) = self
                .ctx
                .store
                .delete_last_observation(self.user_id, dropped)
                .await
            {
                warn!(user_id = %self.user_id, token = %dropped, error = %e, "Failed to forget removed token");
            }
        }

        self.last.retain(|token, _| tokens.contains(token));
        self.tokens = tokens;
    }

    async fn poll_token(&mut self, token: &Token) -> PollOutcome {
        let previous = self.last.get(token).cloned();
        let last_position = previous.as_ref().and_then(Observation::position);

        // Dropping the probe future on stop aborts its backoff sleep and
        // any in-flight request.
        let current = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return PollOutcome::Cancelled,
            observation = self.ctx.probe.observe_from(token, last_position) => observation,
        };

        if self.cancel.is_cancelled() {
            return PollOutcome::Cancelled;
        }

        let changed = has_changed(previous.as_ref(), &current);
        self.last.insert(token.clone(), current.clone());

        if let Err(e) = self
            .ctx
            .store
            .save_last_observation(self.user_id, &current)
            .await
        {
            error!(user_id = %self.user_id, token = %token, error = %e, "Failed to persist observation");
        }

        if !changed {
            return PollOutcome::Unchanged;
        }

        if self.cancel.is_cancelled() {
            return PollOutcome::Cancelled;
        }

        let alert = Alert {
            user_id: self.user_id,
            previous,
            current,
        };
        match self.ctx.sink.deliver(&alert).await {
            Ok(()) => {
                info!(
                    user_id = %self.user_id,
                    token = %token,
                    status = %alert.current.status(),
                    position = ?alert.current.position(),
                    moved = ?position_delta(alert.previous.as_ref(), &alert.current),
                    "Alert sent"
                );
                PollOutcome::Alerted
            }
            Err(e) => {
                error!(user_id = %self.user_id, token = %token, error = %e, "Failed to send alert");
                PollOutcome::DeliveryFailed
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        remove_token, MemoryStore, RecordingSink, RetryConfig, ScriptedStatusClient, TransportError,
    };
    use ceremony_core::{RawStatus, StatusKind};
    use pretty_assertions::assert_eq;

    const USER: UserId = UserId(7);

    struct Fixture {
        client: Arc<ScriptedStatusClient>,
        sink: Arc<RecordingSink>,
        store: Arc<MemoryStore>,
        cancel: CancellationToken,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                client: Arc::new(ScriptedStatusClient::new()),
                sink: Arc::new(RecordingSink::new()),
                store: Arc::new(MemoryStore::new()),
                cancel: CancellationToken::new(),
            }
        }

        async fn monitor(&self, tokens: &[Token]) -> UserMonitor {
            self.store.save_tokens(USER, tokens).await.unwrap();
            let ctx = MonitorContext {
                probe: Arc::new(RetryingProbe::new(
                    self.client.clone(),
                    RetryConfig {
                        base_delay: Duration::from_millis(10),
                        ..Default::default()
                    },
                )),
                sink: self.sink.clone(),
                store: self.store.clone(),
            };
            UserMonitor::new(
                USER,
                tokens.to_vec(),
                HashMap::new(),
                ctx,
                Duration::from_secs(300),
                self.cancel.clone(),
            )
        }
    }

    fn token(raw: &str) -> Token {
        Token::new(raw).unwrap()
    }

    fn unreachable() -> Result<RawStatus, TransportError> {
        Err(TransportError::Unreachable("refused".into()))
    }

    #[tokio::test(start_paused = true)]
    async fn test_baseline_then_unchanged_then_moved() {
        let fx = Fixture::new();
        let t = token("abc123xyz");
        fx.client.push_all(
            &t,
            [
                Ok(RawStatus::active(1603)),
                Ok(RawStatus::active(1603)),
                Ok(RawStatus::active(1600)),
            ],
        );
        let mut monitor = fx.monitor(&[t.clone()]).await;

        assert_eq!(monitor.tick().await.alerts, 1);
        assert_eq!(monitor.tick().await.alerts, 0);
        assert_eq!(monitor.tick().await.alerts, 1);

        let alerts = fx.sink.alerts();
        assert_eq!(alerts.len(), 2);
        assert_eq!(alerts[0].previous, None);
        assert_eq!(alerts[1].previous.as_ref().and_then(Observation::position), Some(1603));
        assert_eq!(alerts[1].current.position(), Some(1600));
        assert_eq!(monitor.last_observation(&t).and_then(Observation::position), Some(1600));
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_unknown_suppressed_but_stored() {
        let fx = Fixture::new();
        let t = token("abc123xyz");
        fx.client.push_all(
            &t,
            [
                Err(TransportError::Malformed("bad".into())),
                unreachable(),
                unreachable(),
            ],
        );
        let mut monitor = fx.monitor(&[t.clone()]).await;

        let summary = monitor.tick().await;
        assert_eq!(summary.alerts, 0);
        assert!(fx.sink.is_empty());

        let stored = fx.store.load_last_observation(USER, &t).await.unwrap().unwrap();
        assert_eq!(stored.status(), StatusKind::Unknown);
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_service_down_alerts() {
        let fx = Fixture::new();
        let t = token("abc123xyz");
        fx.client.push_all(&t, [unreachable(), unreachable(), unreachable()]);
        let mut monitor = fx.monitor(&[t.clone()]).await;

        assert_eq!(monitor.tick().await.alerts, 1);
        let alerts = fx.sink.alerts();
        assert_eq!(alerts[0].current.status(), StatusKind::ServiceDown);
        assert_eq!(
            fx.store.load_last_observation(USER, &t).await.unwrap().map(|o| o.status()),
            Some(StatusKind::ServiceDown)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_delivery_failure_still_updates_state() {
        let fx = Fixture::new();
        let t = token("abc123xyz");
        fx.client.push_all(&t, [Ok(RawStatus::active(10)), Ok(RawStatus::active(10))]);
        fx.sink.set_failing(true);
        let mut monitor = fx.monitor(&[t.clone()]).await;

        let summary = monitor.tick().await;
        assert_eq!(summary.delivery_failures, 1);
        assert_eq!(monitor.last_observation(&t).and_then(Observation::position), Some(10));

        // Same position next time: the failed alert is not retried.
        fx.sink.set_failing(false);
        assert_eq!(monitor.tick().await, TickSummary { polled: 1, alerts: 0, delivery_failures: 0 });
    }

    #[tokio::test(start_paused = true)]
    async fn test_persistence_failure_does_not_stop_tick() {
        let fx = Fixture::new();
        let a = token("token-aaaaaa");
        let b = token("token-bbbbbb");
        fx.client.push(&a, Ok(RawStatus::active(1)));
        fx.client.push(&b, Ok(RawStatus::active(2)));
        let mut monitor = fx.monitor(&[a.clone(), b.clone()]).await;
        fx.store.set_failing(true);

        let summary = monitor.tick().await;
        assert_eq!(summary.polled, 2);
        assert_eq!(summary.alerts, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tokens_reloaded_each_tick() {
        let fx = Fixture::new();
        let a = token("token-aaaaaa");
        let b = token("token-bbbbbb");
        fx.client.push_all(&a, [Ok(RawStatus::active(1)), Ok(RawStatus::active(1))]);
        fx.client.push(&b, Ok(RawStatus::active(9)));
        let mut monitor = fx.monitor(&[a.clone()]).await;

        assert_eq!(monitor.tick().await.polled, 1);

        fx.store.save_tokens(USER, &[b.clone()]).await.unwrap();
        let summary = monitor.tick().await;
        assert_eq!(summary.polled, 1);
        assert_eq!(summary.alerts, 1);
        assert!(monitor.last_observation(&a).is_none());
        assert_eq!(fx.client.remaining(&a), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_removed_token_observation_deleted_on_reload() {
        let fx = Fixture::new();
        let a = token("token-aaaaaa");
        let b = token("token-bbbbbb");
        fx.client.push(&a, Ok(RawStatus::active(4)));
        fx.client.push_all(&b, [Ok(RawStatus::active(8)), Ok(RawStatus::active(8))]);
        let mut monitor = fx.monitor(&[a.clone(), b.clone()]).await;

        monitor.tick().await;
        assert!(fx.store.load_last_observation(USER, &a).await.unwrap().is_some());

        remove_token(fx.store.as_ref(), USER, "...aaaaaa").await.unwrap();
        // Removal alone leaves the row to the monitor.
        assert!(fx.store.load_last_observation(USER, &a).await.unwrap().is_some());

        assert_eq!(monitor.tick().await.polled, 1);
        assert!(fx.store.load_last_observation(USER, &a).await.unwrap().is_none());
        assert_eq!(
            fx.store.load_last_observation(USER, &b).await.unwrap().and_then(|o| o.position()),
            Some(8)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_monitor_writes_nothing() {
        let fx = Fixture::new();
        let t = token("abc123xyz");
        fx.client.push(&t, Ok(RawStatus::active(5)));
        let mut monitor = fx.monitor(&[t.clone()]).await;

        fx.cancel.cancel();
        let summary = monitor.tick().await;

        assert_eq!(summary.polled, 0);
        assert_eq!(fx.store.observation_writes(), 0);
        assert!(fx.sink.is_empty());
        assert!(monitor.last_observation(&t).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_load_baselines() {
        let fx = Fixture::new();
        let a = token("token-aaaaaa");
        let b = token("token-bbbbbb");
        fx.store
            .save_last_observation(USER, &Observation::active(a.clone(), 3))
            .await
            .unwrap();

        let last = UserMonitor::load_baselines(fx.store.as_ref(), USER, &[a.clone(), b.clone()])
            .await
            .unwrap();
        assert_eq!(last.len(), 1);
        assert_eq!(last.get(&a).and_then(Observation::position), Some(3));
    }
}
