//! Status classification types.

use compact_str::CompactString;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Classified status of one observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum StatusKind {
    /// Participant slot is active and has a queue position.
    Active = 0,
    /// The service itself reported a temporary or degraded condition.
    TemporaryIssue = 1,
    /// The service could not be reached on any attempt.
    ServiceDown = 2,
    /// Nothing actionable could be determined.
    Unknown = 3,
}

impl StatusKind {
    pub fn from_id(id: u8) -> Option<Self> {
        match id {
            0 => Some(StatusKind::Active),
            1 => Some(StatusKind::TemporaryIssue),
            2 => Some(StatusKind::ServiceDown),
            3 => Some(StatusKind::Unknown),
            _ => None,
        }
    }

    #[inline]
    pub fn id(self) -> u8 {
        self as u8
    }

    /// Human readable label.
    pub fn label(self) -> &'static str {
        match self {
            StatusKind::Active => "Active",
            StatusKind::TemporaryIssue => "Temporary issue",
            StatusKind::ServiceDown => "Service down",
            StatusKind::Unknown => "Unknown",
        }
    }

    /// Storage name, stable across releases.
    pub fn as_str(self) -> &'static str {
        match self {
            StatusKind::Active => "active",
            StatusKind::TemporaryIssue => "temporary_issue",
            StatusKind::ServiceDown => "service_down",
            StatusKind::Unknown => "unknown",
        }
    }

    /// Inverse of [`StatusKind::as_str`].
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "active" => Some(StatusKind::Active),
            "temporary_issue" => Some(StatusKind::TemporaryIssue),
            "service_down" => Some(StatusKind::ServiceDown),
            "unknown" => Some(StatusKind::Unknown),
            _ => None,
        }
    }
}

impl fmt::Display for StatusKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Status as reported by the ceremony service, before retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ServiceStatus {
    Active,
    Temporary,
    /// Well-formed response carrying an unrecognized status code.
    Unknown,
}

impl ServiceStatus {
    /// Classify a raw status code (case-insensitive).
    pub fn from_code(code: &str) -> Self {
        match code.trim().to_ascii_lowercase().as_str() {
            "ok" | "active" | "online" | "alive" | "pong" | "running" => ServiceStatus::Active,
            "busy"
            | "degraded"
            | "maintenance"
            | "overloaded"
            | "rate_limited"
            | "temporary"
            | "temporary_issue"
            | "temporarily_unavailable" => ServiceStatus::Temporary,
            _ => ServiceStatus::Unknown,
        }
    }
}

/// One well-formed answer from the status service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawStatus {
    pub kind: ServiceStatus,
    /// Raw status code as sent by the service.
    pub code: CompactString,
    /// Queue position ("behind"), when reported.
    pub position: Option<u64>,
}

impl RawStatus {
    /// Build from a raw service code.
    pub fn from_code(code: &str, position: Option<u64>) -> Self {
        Self {
            kind: ServiceStatus::from_code(code),
            code: CompactString::new(code.trim()),
            position,
        }
    }

    pub fn active(position: u64) -> Self {
        Self::from_code("active", Some(position))
    }

    pub fn temporary(code: &str) -> Self {
        Self {
            kind: ServiceStatus::Temporary,
            code: CompactString::new(code),
            position: None,
        }
    }
}
