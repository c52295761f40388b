//! Process-wide registry of running monitors.
//!
//! The registry is the only place monitors are created or destroyed. It
//! adds and removes whole map entries and never touches monitor internals.
//! Start and stop for the same user are serialised by a per-user lock, so
//! the running state and the stored monitoring flag always agree.

use crate::{
    add_tokens, Heartbeat, MonitorContext, MonitorResult, StoreResult, UserMonitor,
};
use ceremony_core::{Observation, Token, UserId};
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Timing configuration for monitors and the registry scheduler.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Time between a user's ticks.
    pub tick_interval: Duration,
    /// Time between registry supervisor passes.
    pub supervisor_interval: Duration,
    /// Heartbeat age beyond which the registry reports unhealthy.
    pub health_max_age: Duration,
    /// How long `stop` waits for a monitor task before aborting it.
    pub stop_grace: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(300),
            supervisor_interval: Duration::from_secs(60),
            health_max_age: Duration::from_secs(180),
            stop_grace: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started,
    /// A monitor was already running for this user; nothing changed.
    AlreadyRunning,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    Stopped,
    NotRunning,
}

struct MonitorHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl MonitorHandle {
    fn is_alive(&self) -> bool {
        !self.task.is_finished()
    }
}

pub struct MonitorRegistry {
    ctx: MonitorContext,
    config: MonitorConfig,
    monitors: Mutex<HashMap<UserId, MonitorHandle>>,
    lifecycle: DashMap<UserId, Arc<Mutex<()>>>,
    heartbeat: Heartbeat,
}

impl MonitorRegistry {
    pub fn new(ctx: MonitorContext, config: MonitorConfig) -> Self {
        Self {
            ctx,
            config,
            monitors: Mutex::new(HashMap::new()),
            lifecycle: DashMap::new(),
            heartbeat: Heartbeat::new(),
        }
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    pub fn heartbeat(&self) -> &Heartbeat {
        &self.heartbeat
    }

    /// Start monitoring a user. Idempotent: a second start while one is
    /// running returns `AlreadyRunning` and spawns nothing.
    ///
    /// `tokens` are added to the user's stored set first, so the monitor's
    /// per-tick reload keeps them. The monitor then watches the whole
    /// stored set.
    ///
    /// Fails only on persistence errors (saving tokens, loading baselines
    /// or recording the monitoring flag); in that case no monitor is
    /// started.
    pub async fn start(&self, user_id: UserId, tokens: Vec<Token>) -> MonitorResult<StartOutcome> {
        let lifecycle = self.lifecycle(user_id);
        let _guard = lifecycle.lock().await;

        if self.is_running(user_id).await {
            debug!(user_id = %user_id, "Monitor already running");
            return Ok(StartOutcome::AlreadyRunning);
        }

        let store = self.ctx.store.as_ref();
        add_tokens(store, user_id, &tokens).await?;
        let tokens = store.load_tokens(user_id).await?;
        let last = UserMonitor::load_baselines(store, user_id, &tokens).await?;
        store.set_monitoring(user_id, true).await?;

        let cancel = CancellationToken::new();
        let monitor = UserMonitor::new(
            user_id,
            tokens,
            last,
            self.ctx.clone(),
            self.config.tick_interval,
            cancel.clone(),
        );
        let task = tokio::spawn(monitor.run());

        let mut monitors = self.monitors.lock().await;
        // Replaces a dead handle, if any.
        monitors.insert(user_id, MonitorHandle { cancel, task });
        info!(user_id = %user_id, active = monitors.len(), "Monitoring started");

        Ok(StartOutcome::Started)
    }

    /// Stop a user's monitor and wait (up to the grace period) for its
    /// task to end. Once this returns, the monitor writes nothing more.
    ///
    /// A failure to clear the monitoring flag is returned, but the monitor
    /// is stopped regardless.
    pub async fn stop(&self, user_id: UserId) -> MonitorResult<StopOutcome> {
        let lifecycle = self.lifecycle(user_id);
        let _guard = lifecycle.lock().await;

        let handle = self.monitors.lock().await.remove(&user_id);
        let Some(handle) = handle else {
            return Ok(StopOutcome::NotRunning);
        };

        let cleared = self.ctx.store.set_monitoring(user_id, false).await;
        self.halt(user_id, handle).await;
        cleared?;
        info!(user_id = %user_id, "Monitoring stopped");

        Ok(StopOutcome::Stopped)
    }

    /// Per-user lock serialising `start` and `stop` for one user. Held
    /// across store I/O; the monitor map lock never is.
    fn lifecycle(&self, user_id: UserId) -> Arc<Mutex<()>> {
        self.lifecycle.entry(user_id).or_default().clone()
    }

    async fn halt(&self, user_id: UserId, handle: MonitorHandle) {
        handle.cancel.cancel();
        let mut task = handle.task;
        match tokio::time::timeout(self.config.stop_grace, &mut task).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) if e.is_panic() => {
                error!(user_id = %user_id, "Monitor task had panicked");
            }
            Ok(Err(_)) => {}
            Err(_) => {
                warn!(user_id = %user_id, grace = ?self.config.stop_grace, "Monitor did not stop in time, aborting");
                task.abort();
            }
        }
    }

    pub async fn is_running(&self, user_id: UserId) -> bool {
        self.monitors
            .lock()
            .await
            .get(&user_id)
            .is_some_and(MonitorHandle::is_alive)
    }

    /// Number of live monitors.
    pub async fn active_count(&self) -> usize {
        self.monitors
            .lock()
            .await
            .values()
            .filter(|h| h.is_alive())
            .count()
    }

    /// True while the registry scheduler keeps beating.
    pub fn is_healthy(&self) -> bool {
        self.heartbeat.is_fresh(self.config.health_max_age)
    }

    /// On-demand status check outside the schedule. Never writes state.
    pub async fn check_now(&self, user_id: UserId, token: &Token) -> StoreResult<Observation> {
        let last = self
            .ctx
            .store
            .load_last_observation(user_id, token)
            .await?;
        let last_position = last.as_ref().and_then(Observation::position);
        Ok(self.ctx.probe.observe_from(token, last_position).await)
    }

    /// Restart monitors for every user flagged as monitoring.
    /// Returns how many were started.
    pub async fn resume_all(&self) -> MonitorResult<usize> {
        let users = self.ctx.store.monitored_users().await?;
        let mut started = 0;

        for user_id in users {
            let tokens = match self.ctx.store.load_tokens(user_id).await {
                Ok(tokens) => tokens,
                Err(e) => {
                    error!(user_id = %user_id, error = %e, "Failed to load tokens for resume");
                    continue;
                }
            };
            match self.start(user_id, tokens).await {
                Ok(StartOutcome::Started) => started += 1,
                Ok(StartOutcome::AlreadyRunning) => {}
                Err(e) => error!(user_id = %user_id, error = %e, "Failed to resume monitor"),
            }
        }

        if started > 0 {
            info!(resumed = started, "Resumed monitors");
        }
        Ok(started)
    }

    /// Drop entries whose task ended on its own (a panic). Returns how many.
    pub async fn reap_finished(&self) -> usize {
        let finished: Vec<(UserId, MonitorHandle)> = {
            let mut monitors = self.monitors.lock().await;
            let dead: Vec<UserId> = monitors
                .iter()
                .filter(|(_, h)| !h.is_alive())
                .map(|(id, _)| *id)
                .collect();
            dead.into_iter()
                .filter_map(|id| monitors.remove(&id).map(|h| (id, h)))
                .collect()
        };

        let count = finished.len();
        for (user_id, handle) in finished {
            match handle.task.await {
                Err(e) if e.is_panic() => {
                    error!(user_id = %user_id, "Monitor task panicked, removed from registry");
                }
                _ => warn!(user_id = %user_id, "Monitor task exited unexpectedly"),
            }
        }
        count
    }

    /// Spawn the registry's scheduler: reap dead monitors, then beat.
    pub fn spawn_supervisor(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            info!(
                interval_secs = registry.config.supervisor_interval.as_secs(),
                "Registry supervisor started"
            );
            let mut ticker = tokio::time::interval(registry.config.supervisor_interval);

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        registry.reap_finished().await;
                        registry.heartbeat.beat();
                    }
                }
            }

            info!("Registry supervisor stopped");
        })
    }

    /// Stop every monitor, keeping their monitoring flags so they resume
    /// on the next start. Returns how many were stopped.
    pub async fn shutdown(&self) -> usize {
        let handles: Vec<(UserId, MonitorHandle)> =
            self.monitors.lock().await.drain().collect();
        let count = handles.len();
        for (user_id, handle) in handles {
            self.halt(user_id, handle).await;
        }
        count
    }
}
