//! SQLite storage for tokens, last observations and monitoring flags.

use async_trait::async_trait;
use ceremony_core::{Observation, StatusKind, Token, UserId};
use ceremony_engine::{MonitorStore, StoreError, StoreResult};
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("Corrupt row: {0}")]
    Corrupt(String),
}

impl From<DbError> for StoreError {
    fn from(e: DbError) -> Self {
        match e {
            DbError::Sqlx(e) => StoreError::Backend(e.to_string()),
            DbError::Corrupt(msg) => StoreError::Corrupt(msg),
        }
    }
}

/// Database connection.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Connect to SQLite database at the given path.
    pub async fn connect(database_url: &str) -> Result<Self, DbError> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

        // Every connection to an in-memory database sees its own empty database.
        let max_connections = if database_url.contains(":memory:") { 1 } else { 5 };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;

        let db = Self { pool };
        db.run_migrations().await?;
        Ok(db)
    }

    /// Run database migrations.
    async fn run_migrations(&self) -> Result<(), DbError> {
        // seq keeps insertion order, which is the order users index tokens by.
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS user_tokens (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL,
                token TEXT NOT NULL,
                added_at DATETIME DEFAULT CURRENT_TIMESTAMP,
                UNIQUE(user_id, token)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS last_observations (
                user_id INTEGER NOT NULL,
                token TEXT NOT NULL,
                status TEXT NOT NULL,
                position INTEGER,
                observed_at TEXT NOT NULL,
                PRIMARY KEY (user_id, token)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS monitored_users (
                user_id INTEGER PRIMARY KEY,
                since DATETIME DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Tokens for a user, oldest first.
    pub async fn user_tokens(&self, user: UserId) -> Result<Vec<Token>, DbError> {
        let rows = sqlx::query_scalar::<_, String>(
            "SELECT token FROM user_tokens WHERE user_id = ? ORDER BY seq",
        )
        .bind(user.get())
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|raw| {
                Token::new(raw)
                    .ok_or_else(|| DbError::Corrupt(format!("empty token for user {}", user)))
            })
            .collect()
    }

    /// Replace a user's token set, keeping the given order.
    pub async fn replace_user_tokens(&self, user: UserId, tokens: &[Token]) -> Result<(), DbError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM user_tokens WHERE user_id = ?")
            .bind(user.get())
            .execute(&mut *tx)
            .await?;

        for token in tokens {
            sqlx::query("INSERT OR IGNORE INTO user_tokens (user_id, token) VALUES (?, ?)")
                .bind(user.get())
                .bind(token.expose())
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        debug!(user_id = %user, count = tokens.len(), "Saved tokens");
        Ok(())
    }

    pub async fn last_observation(
        &self,
        user: UserId,
        token: &Token,
    ) -> Result<Option<Observation>, DbError> {
        let row = sqlx::query_as::<_, (String, Option<i64>, String)>(
            "SELECT status, position, observed_at FROM last_observations WHERE user_id = ? AND token = ?",
        )
        .bind(user.get())
        .bind(token.expose())
        .fetch_optional(&self.pool)
        .await?;

        let Some((status, position, observed_at)) = row else {
            return Ok(None);
        };

        let status = StatusKind::parse(&status)
            .ok_or_else(|| DbError::Corrupt(format!("unknown status '{}'", status)))?;
        let position = position
            .map(u64::try_from)
            .transpose()
            .map_err(|_| DbError::Corrupt("negative position".to_string()))?;
        let observed_at = DateTime::parse_from_rfc3339(&observed_at)
            .map_err(|e| DbError::Corrupt(format!("bad timestamp: {}", e)))?
            .with_timezone(&Utc);

        Ok(Some(Observation::new(
            token.clone(),
            status,
            position,
            observed_at,
        )))
    }

    pub async fn upsert_observation(
        &self,
        user: UserId,
        observation: &Observation,
    ) -> Result<(), DbError> {
        let position = observation
            .position()
            .map(i64::try_from)
            .transpose()
            .map_err(|_| DbError::Corrupt("position out of range".to_string()))?;

        sqlx::query(
            r#"
            INSERT INTO last_observations (user_id, token, status, position, observed_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(user_id, token)
            DO UPDATE SET status = excluded.status, position = excluded.position, observed_at = excluded.observed_at
            "#,
        )
        .bind(user.get())
        .bind(observation.token().expose())
        .bind(observation.status().as_str())
        .bind(position)
        .bind(observation.observed_at().to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn delete_observation(&self, user: UserId, token: &Token) -> Result<(), DbError> {
        sqlx::query("DELETE FROM last_observations WHERE user_id = ? AND token = ?")
            .bind(user.get())
            .bind(token.expose())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_monitoring_flag(&self, user: UserId, enabled: bool) -> Result<(), DbError> {
        let sql = if enabled {
            "INSERT OR IGNORE INTO monitored_users (user_id) VALUES (?)"
        } else {
            "DELETE FROM monitored_users WHERE user_id = ?"
        };
        sqlx::query(sql).bind(user.get()).execute(&self.pool).await?;
        Ok(())
    }

    /// Users flagged as monitoring, ascending.
    pub async fn monitored_user_ids(&self) -> Result<Vec<UserId>, DbError> {
        let ids = sqlx::query_scalar::<_, i64>("SELECT user_id FROM monitored_users ORDER BY user_id")
            .fetch_all(&self.pool)
            .await?;
        Ok(ids.into_iter().map(UserId::from).collect())
    }
}

#[async_trait]
impl MonitorStore for Database {
    async fn load_tokens(&self, user: UserId) -> StoreResult<Vec<Token>> {
        Ok(self.user_tokens(user).await?)
    }

    async fn save_tokens(&self, user: UserId, tokens: &[Token]) -> StoreResult<()> {
        Ok(self.replace_user_tokens(user, tokens).await?)
    }

    async fn load_last_observation(
        &self,
        user: UserId,
        token: &Token,
    ) -> StoreResult<Option<Observation>> {
        Ok(self.last_observation(user, token).await?)
    }

    async fn save_last_observation(
        &self,
        user: UserId,
        observation: &Observation,
    ) -> StoreResult<()> {
        Ok(self.upsert_observation(user, observation).await?)
    }

    async fn delete_last_observation(&self, user: UserId, token: &Token) -> StoreResult<()> {
        Ok(self.delete_observation(user, token).await?)
    }

    async fn set_monitoring(&self, user: UserId, enabled: bool) -> StoreResult<()> {
        Ok(self.set_monitoring_flag(user, enabled).await?)
    }

    async fn monitored_users(&self) -> StoreResult<Vec<UserId>> {
        Ok(self.monitored_user_ids().await?)
    }
}
