//! audit/models.rs
//! The audit record and the query filter value.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::scanner::definitions::RiskLevel;

/// Scan decision persisted with every audited request/response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Action {
    #[serde(rename = "ALLOW")]
    Allow,
    #[serde(rename = "BLOCK")]
    Block,
    #[serde(rename = "ALLOW_SUPPRESSED")]
    AllowSuppressed,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Allow => "ALLOW",
            Action::Block => "BLOCK",
            Action::AllowSuppressed => "ALLOW_SUPPRESSED",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Action {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ALLOW" => Ok(Action::Allow),
            "BLOCK" => Ok(Action::Block),
            "ALLOW_SUPPRESSED" => Ok(Action::AllowSuppressed),
            other => Err(format!("unknown action: {other}")),
        }
    }
}

/// Which side of the proxy the decision was made on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    #[serde(rename = "REQUEST")]
    Request,
    #[serde(rename = "RESPONSE")]
    Response,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Request => "REQUEST",
            Direction::Response => "RESPONSE",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Direction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "REQUEST" => Ok(Direction::Request),
            "RESPONSE" => Ok(Direction::Response),
            other => Err(format!("unknown direction: {other}")),
        }
    }
}

pub const AUDIT_SCHEMA_VERSION: i64 = 1;

/// One persisted decision record.
///
/// `redacted_excerpt` must never contain raw credentials, SSNs, card
/// numbers, or full PII; it is produced exclusively by the redaction
/// helper. `suppression_hint` is deliberately absent: it belongs to the
/// HTTP block response only.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuditRecord {
    /// ULID; uniquely indexed, duplicate writes are silently absorbed.
    pub scan_id: String,
    pub timestamp: DateTime<Utc>,
    pub user_id: String,
    pub action: Action,
    pub direction: Direction,
    pub schema_version: i64,

    // Populated when action ≠ ALLOW.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub risk_level: Option<RiskLevel>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redacted_excerpt: Option<String>,

    // Optional context.
    #[serde(rename = "test", default)]
    pub is_test: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens_delivered: Option<u64>,
    #[serde(default)]
    pub truncated: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_length: Option<u64>,
    /// Entity-type names from the advisory scan; never raw matches.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub advisory_entities: Option<Vec<String>>,
    /// Set when `action = ALLOW_SUPPRESSED`: the allowlist rule that fired.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowlist_rule_id: Option<String>,
}

impl AuditRecord {
    /// A record with the required fields set and everything else empty.
    pub fn new(
        scan_id: impl Into<String>,
        user_id: impl Into<String>,
        action: Action,
        direction: Direction,
    ) -> Self {
        Self {
            scan_id: scan_id.into(),
            timestamp: Utc::now(),
            user_id: user_id.into(),
            action,
            direction,
            schema_version: AUDIT_SCHEMA_VERSION,
            rule_id: None,
            risk_level: None,
            redacted_excerpt: None,
            is_test: false,
            tokens_delivered: None,
            truncated: false,
            original_length: None,
            advisory_entities: None,
            allowlist_rule_id: None,
        }
    }

    /// Timestamp serialization used by every backend (RFC 3339, UTC `Z`,
    /// microseconds), consistent so string comparison orders by time.
    pub fn timestamp_iso(&self) -> String {
        self.timestamp.to_rfc3339_opts(SecondsFormat::Micros, true)
    }
}

/// Query filters for `query` and `count`.
///
/// `action_in` supersedes `action` when both are set. An empty filter set
/// returns everything newest-first, up to `limit`.
#[derive(Debug, Clone, Default)]
pub struct EventFilters {
    pub action: Option<Action>,
    pub direction: Option<Direction>,
    pub user_id: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub is_test: Option<bool>,
    pub risk_level: Option<RiskLevel>,
    /// Multi-value action filter; takes precedence over `action`.
    pub action_in: Option<Vec<Action>>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

impl EventFilters {
    pub const DEFAULT_LIMIT: u32 = 50;

    pub fn limit(&self) -> u32 {
        self.limit.unwrap_or(Self::DEFAULT_LIMIT)
    }

    pub fn offset(&self) -> u32 {
        self.offset.unwrap_or(0)
    }

    /// Convenience: filter to a single scan id's record via user-visible
    /// fields (used by tests and round-trip checks).
    pub fn for_user(user_id: impl Into<String>) -> Self {
        Self { user_id: Some(user_id.into()), ..Self::default() }
    }
}
