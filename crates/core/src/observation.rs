//! Classified point-in-time observations.

use crate::{StatusKind, Token};
use chrono::{DateTime, Utc};

/// One classified snapshot of a token's status and queue position.
///
/// Constructed only through [`Observation::new`] (or its shorthands),
/// which normalizes the payload:
/// - `Active` without a position becomes `Unknown`;
/// - `ServiceDown` and `Unknown` never carry a position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Observation {
    token: Token,
    status: StatusKind,
    position: Option<u64>,
    observed_at: DateTime<Utc>,
}

impl Observation {
    pub fn new(
        token: Token,
        status: StatusKind,
        position: Option<u64>,
        observed_at: DateTime<Utc>,
    ) -> Self {
        let (status, position) = match (status, position) {
            (StatusKind::Active, None) => (StatusKind::Unknown, None),
            (StatusKind::ServiceDown | StatusKind::Unknown, _) => (status, None),
            other => other,
        };
        Self {
            token,
            status,
            position,
            observed_at,
        }
    }

    /// Observation stamped with the current time.
    pub fn now(token: Token, status: StatusKind, position: Option<u64>) -> Self {
        Self::new(token, status, position, Utc::now())
    }

    pub fn active(token: Token, position: u64) -> Self {
        Self::now(token, StatusKind::Active, Some(position))
    }

    pub fn service_down(token: Token) -> Self {
        Self::now(token, StatusKind::ServiceDown, None)
    }

    pub fn unknown(token: Token) -> Self {
        Self::now(token, StatusKind::Unknown, None)
    }

    #[inline]
    pub fn token(&self) -> &Token {
        &self.token
    }

    #[inline]
    pub fn status(&self) -> StatusKind {
        self.status
    }

    #[inline]
    pub fn position(&self) -> Option<u64> {
        self.position
    }

    #[inline]
    pub fn observed_at(&self) -> DateTime<Utc> {
        self.observed_at
    }

    /// Check if this observation carries nothing actionable.
    #[inline]
    pub fn is_unknown(&self) -> bool {
        self.status == StatusKind::Unknown
    }
}
