//! Persistence seam and token-set helpers.

use crate::{StoreError, StoreResult};
use async_trait::async_trait;
use ceremony_core::{Observation, Token, UserId};
use dashmap::{DashMap, DashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Durable storage the engine relies on.
#[async_trait]
pub trait MonitorStore: Send + Sync {
    /// Registered tokens for a user, in registration order.
    async fn load_tokens(&self, user: UserId) -> StoreResult<Vec<Token>>;

    /// Replace a user's token set.
    async fn save_tokens(&self, user: UserId, tokens: &[Token]) -> StoreResult<()>;

    async fn load_last_observation(
        &self,
        user: UserId,
        token: &Token,
    ) -> StoreResult<Option<Observation>>;

    async fn save_last_observation(
        &self,
        user: UserId,
        observation: &Observation,
    ) -> StoreResult<()>;

    async fn delete_last_observation(&self, user: UserId, token: &Token) -> StoreResult<()>;

    /// Record whether a user wants monitoring to run.
    async fn set_monitoring(&self, user: UserId, enabled: bool) -> StoreResult<()>;

    /// Users whose monitors should be resumed at startup.
    async fn monitored_users(&self) -> StoreResult<Vec<UserId>>;
}

/// In-memory store. Used by tests and when no database is configured.
#[derive(Default)]
pub struct MemoryStore {
    tokens: DashMap<UserId, Vec<Token>>,
    observations: DashMap<(UserId, Token), Observation>,
    monitoring: DashSet<UserId>,
    failing: AtomicBool,
    observation_writes: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent operation fail with a backend error.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Number of successful `save_last_observation` calls.
    pub fn observation_writes(&self) -> usize {
        self.observation_writes.load(Ordering::SeqCst)
    }

    fn check(&self) -> StoreResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            Err(StoreError::Backend("Memory store set to fail".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl MonitorStore for MemoryStore {
    async fn load_tokens(&self, user: UserId) -> StoreResult<Vec<Token>> {
        self.check()?;
        Ok(self.tokens.get(&user).map(|t| t.clone()).unwrap_or_default())
    }

    async fn save_tokens(&self, user: UserId, tokens: &[Token]) -> StoreResult<()> {
        self.check()?;
        self.tokens.insert(user, tokens.to_vec());
        Ok(())
    }

    async fn load_last_observation(
        &self,
        user: UserId,
        token: &Token,
    ) -> StoreResult<Option<Observation>> {
        self.check()?;
        Ok(self
            .observations
            .get(&(user, token.clone()))
            .map(|o| o.clone()))
    }

    async fn save_last_observation(
        &self,
        user: UserId,
        observation: &Observation,
    ) -> StoreResult<()> {
        self.check()?;
        self.observations
            .insert((user, observation.token().clone()), observation.clone());
        self.observation_writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn delete_last_observation(&self, user: UserId, token: &Token) -> StoreResult<()> {
        self.check()?;
        self.observations.remove(&(user, token.clone()));
        Ok(())
    }

    async fn set_monitoring(&self, user: UserId, enabled: bool) -> StoreResult<()> {
        self.check()?;
        if enabled {
            self.monitoring.insert(user);
        } else {
            self.monitoring.remove(&user);
        }
        Ok(())
    }

    async fn monitored_users(&self) -> StoreResult<Vec<UserId>> {
        self.check()?;
        let mut users: Vec<UserId> = self.monitoring.iter().map(|u| *u).collect();
        users.sort();
        Ok(users)
    }
}

/// Result of adding tokens to a user's set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddedTokens {
    /// Tokens that were not registered before.
    pub added: usize,
    /// Size of the set afterwards.
    pub total: usize,
}

/// Add tokens to a user's set, skipping ones already registered.
pub async fn add_tokens(
    store: &dyn MonitorStore,
    user: UserId,
    new_tokens: &[Token],
) -> StoreResult<AddedTokens> {
    let mut tokens = store.load_tokens(user).await?;
    let before = tokens.len();
    for token in new_tokens {
        if !tokens.contains(token) {
            tokens.push(token.clone());
        }
    }
    let added = tokens.len() - before;
    if added > 0 {
        store.save_tokens(user, &tokens).await?;
    }
    Ok(AddedTokens {
        added,
        total: tokens.len(),
    })
}

/// Outcome of a removal request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoveOutcome {
    Removed(Token),
    NotFound,
    /// The suffix matched more than one token.
    Ambiguous,
}

/// Remove a token by 1-based index or by its visible suffix.
///
/// Only the token set changes. The token's stored last observation is
/// deleted by the user's monitor when it next reloads its tokens.
pub async fn remove_token(
    store: &dyn MonitorStore,
    user: UserId,
    selector: &str,
) -> StoreResult<RemoveOutcome> {
    let mut tokens = store.load_tokens(user).await?;
    let selector = selector.trim();

    let position = if let Ok(index) = selector.parse::<usize>() {
        (index >= 1 && index <= tokens.len()).then(|| index - 1)
    } else {
        let matches: Vec<usize> = tokens
            .iter()
            .enumerate()
            .filter(|(_, t)| t.matches_suffix(selector))
            .map(|(i, _)| i)
            .collect();
        match matches.as_slice() {
            [single] => Some(*single),
            [] => None,
            _ => return Ok(RemoveOutcome::Ambiguous),
        }
    };

    let Some(position) = position else {
        return Ok(RemoveOutcome::NotFound);
    };

    let removed = tokens.remove(position);
    store.save_tokens(user, &tokens).await?;
    Ok(RemoveOutcome::Removed(removed))
}

/// A user's tokens as `(1-based index, masked token)` pairs, in the order
/// `remove_token` indexes them.
pub async fn list_tokens(store: &dyn MonitorStore, user: UserId) -> StoreResult<Vec<(usize, String)>> {
    let tokens = store.load_tokens(user).await?;
    Ok(tokens
        .iter()
        .enumerate()
        .map(|(i, t)| (i + 1, t.masked()))
        .collect())
}
