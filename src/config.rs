//! Environment-driven gateway configuration.
//!
//! Process bootstrap (CLI, config files, logging setup) belongs to the
//! embedding binary; this crate only reads the `ONGARDE_*` environment
//! variables enumerated below and exposes typed settings with safe defaults.

use std::path::PathBuf;

use crate::auth::gate::AuthSettings;

pub const ENV_AUTH_REQUIRED: &str = "ONGARDE_AUTH_REQUIRED";
pub const ENV_DASHBOARD_LOCALHOST_ONLY: &str = "ONGARDE_DASHBOARD_LOCALHOST_ONLY";
pub const ENV_AUDIT_DB_PATH: &str = "ONGARDE_AUDIT_DB_PATH";
pub const ENV_KEYS_DB_PATH: &str = "ONGARDE_KEYS_DB_PATH";
pub const ENV_REMOTE_AUDIT_URL: &str = "ONGARDE_REMOTE_AUDIT_URL";
pub const ENV_REMOTE_AUDIT_KEY: &str = "ONGARDE_REMOTE_AUDIT_KEY";
pub const ENV_ALLOWLIST_RULE_IDS: &str = "ONGARDE_ALLOWLIST_RULE_IDS";

/// Audit retention window, in days.
pub const DEFAULT_RETENTION_DAYS: i64 = 90;

#[derive(Debug, Clone)]
pub struct DashboardSettings {
    /// `false` disables the loopback-origin check. Default `true`; never
    /// disable in production.
    pub localhost_only: bool,
}

impl Default for DashboardSettings {
    fn default() -> Self {
        Self { localhost_only: true }
    }
}

#[derive(Debug, Clone)]
pub struct AuditSettings {
    pub db_path: PathBuf,
    /// Both `remote_url` and `remote_key` set selects the remote variant.
    pub remote_url: Option<String>,
    pub remote_key: Option<String>,
    pub retention_days: i64,
}

impl Default for AuditSettings {
    fn default() -> Self {
        Self {
            db_path: ongarde_home().join("audit.db"),
            remote_url: None,
            remote_key: None,
            retention_days: DEFAULT_RETENTION_DAYS,
        }
    }
}

#[derive(Debug, Clone)]
pub struct KeySettings {
    pub db_path: PathBuf,
}

impl Default for KeySettings {
    fn default() -> Self {
        Self { db_path: ongarde_home().join("keys.db") }
    }
}

#[derive(Debug, Clone, Default)]
pub struct GatewayConfig {
    pub auth: AuthSettings,
    pub dashboard: DashboardSettings,
    pub audit: AuditSettings,
    pub keys: KeySettings,
    /// Rule ids whose blocks are suppressed to ALLOW_SUPPRESSED.
    pub allowlist: Vec<String>,
}

impl GatewayConfig {
    /// Build the configuration from the process environment, falling back
    /// to defaults for anything unset.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Some(v) = env_string(ENV_AUTH_REQUIRED) {
            cfg.auth.required = !v.eq_ignore_ascii_case("false");
        }
        if let Some(v) = env_string(ENV_DASHBOARD_LOCALHOST_ONLY) {
            cfg.dashboard.localhost_only = !v.eq_ignore_ascii_case("false");
        }
        if let Some(v) = env_string(ENV_AUDIT_DB_PATH) {
            cfg.audit.db_path = PathBuf::from(v);
        }
        if let Some(v) = env_string(ENV_KEYS_DB_PATH) {
            cfg.keys.db_path = PathBuf::from(v);
        }
        cfg.audit.remote_url = env_string(ENV_REMOTE_AUDIT_URL);
        cfg.audit.remote_key = env_string(ENV_REMOTE_AUDIT_KEY);

        if let Some(v) = env_string(ENV_ALLOWLIST_RULE_IDS) {
            cfg.allowlist = v
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }

        cfg
    }
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn ongarde_home() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".ongarde")
}
