//! The request-pipeline façade.
//!
//! [`AppContext`] owns every process-wide handle (pattern registry, key
//! store, audit store + writer, rate limiter) so nothing mutable floats free
//! at module scope. The embedding HTTP layer calls:
//!
//! - [`AppContext::authenticate`] — before anything else; 401 on failure.
//! - [`AppContext::scan_request`] — cap + scan + allowlist + audit for a
//!   request body.
//! - [`AppContext::new_stream_scanner`] / [`AppContext::record_stream_block`]
//!   — window scanning of a streaming response.
//! - the key-management wrappers, which add rate limiting and audit events
//!   on top of the key store.

use std::sync::Arc;

use crossbeam_channel::Sender;
use serde_json::{json, Value};

use crate::advisory::{RegexAdvisoryEngine, AdvisoryEngine};
use crate::audit::{
    create_audit_store, spawn_retention_task, Action, AuditRecord, AuditStore, AuditWriter,
    Direction, EventFilters,
};
use crate::auth::gate::{authenticate, AuthError};
use crate::auth::keys::{KeyStore, KeyStoreError, MaskedKey};
use crate::auth::limiter::RateLimiter;
use crate::config::{DashboardSettings, GatewayConfig};
use crate::scanner::definitions::{
    PatternRegistry, RiskLevel, RULE_SCANNER_ERROR, RULE_SCANNER_TIMEOUT,
};
use crate::scanner::engine::{
    apply_input_cap, make_redacted_excerpt, make_suppression_hint, scan, ScanContext,
    EXCERPT_MAX_LEN,
};
use crate::scanner::streaming::{StreamBlock, StreamingScanner};
use crate::utils::generate_scan_id;
use anyhow::{Context, Result};
use thiserror::Error;

/// Response header carrying the scan id on every proxied request.
pub const SCAN_ID_HEADER: &str = "X-OnGarde-Scan-ID";

// ─── Block decision ─────────────────────────────────────────────────────────

/// Everything the HTTP layer needs to synthesize a block response.
#[derive(Debug, Clone)]
pub struct BlockDecision {
    pub scan_id: String,
    pub rule_id: String,
    pub risk_level: RiskLevel,
    pub redacted_excerpt: Option<String>,
    pub suppression_hint: Option<String>,
    pub is_test: bool,
}

impl BlockDecision {
    /// HTTP status per the block taxonomy: security-grade matches are
    /// forbidden outright, advisory-grade matches are a bad request.
    pub fn http_status(&self) -> u16 {
        match self.risk_level {
            RiskLevel::Critical | RiskLevel::High => 403,
            RiskLevel::Medium | RiskLevel::Low => 400,
        }
    }

    /// JSON body of the synthesized block response.
    pub fn response_body(&self) -> Value {
        json!({
            "error": {
                "message": format!("Request blocked by OnGarde ({})", self.rule_id),
                "code": "blocked",
            },
            "scan_id": self.scan_id,
            "rule_id": self.rule_id,
            "risk_level": self.risk_level.as_str(),
            "redacted_excerpt": self.redacted_excerpt,
            "suppression_hint": self.suppression_hint,
        })
    }
}

/// Terminator frame appended to an aborted streaming response, carrying the
/// block metadata as a final server-sent event.
pub fn sse_terminator(block: &StreamBlock) -> String {
    let payload = json!({
        "scan_id": block.scan_id,
        "rule_id": block.rule_id,
        "risk_level": block.risk_level.as_str(),
        "tokens_delivered": block.tokens_delivered,
        "truncated": true,
    });
    format!("event: ongarde_block\ndata: {payload}\n\n")
}

/// Outcome of scanning one request body.
#[derive(Debug, Clone)]
pub enum RequestDecision {
    /// Forward to the upstream. ALLOW is not audited in v1.
    Allow { scan_id: String },
    /// A block was suppressed by the allowlist; forward, but audit it.
    AllowSuppressed { scan_id: String, allowlist_rule_id: String },
    /// Refuse the upstream call.
    Block(BlockDecision),
}

#[derive(Debug, Error)]
pub enum KeyManagementError {
    /// Key-management call rate exceeded. HTTP 429.
    #[error("Too many key management requests; retry later")]
    RateLimited,

    #[error(transparent)]
    Store(#[from] KeyStoreError),
}

// ─── AppContext ─────────────────────────────────────────────────────────────

pub struct AppContext {
    config: GatewayConfig,
    registry: Arc<PatternRegistry>,
    keys: KeyStore,
    audit_store: Arc<dyn AuditStore>,
    audit: AuditWriter,
    limiter: RateLimiter,
    retention_shutdown: Option<Sender<()>>,
    retention_handle: Option<std::thread::JoinHandle<()>>,
}

impl AppContext {
    /// Wire up every subsystem. Fails on pattern-compile errors and on the
    /// schema-version guard of either store; the embedding binary maps that
    /// to a non-zero exit.
    pub fn init(config: GatewayConfig) -> Result<Self> {
        let registry = Arc::new(PatternRegistry::compile().context("compiling pattern registry")?);
        let keys = KeyStore::open(&config.keys.db_path).context("opening key store")?;
        let audit_store = create_audit_store(&config.audit).context("opening audit store")?;
        let audit = AuditWriter::spawn(Arc::clone(&audit_store));

        let (shutdown_tx, shutdown_rx) = crossbeam_channel::bounded(1);
        let retention_handle = spawn_retention_task(
            Arc::clone(&audit_store),
            config.audit.retention_days,
            shutdown_rx,
        );

        Ok(Self {
            config,
            registry,
            keys,
            audit_store,
            audit,
            limiter: RateLimiter::default(),
            retention_shutdown: Some(shutdown_tx),
            retention_handle: Some(retention_handle),
        })
    }

    /// Stop background tasks, drain pending audit writes, release the store.
    pub fn shutdown(mut self) {
        if let Some(tx) = self.retention_shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.retention_handle.take() {
            let _ = handle.join();
        }
        self.audit.shutdown();
        self.audit_store.close();
    }

    pub fn registry(&self) -> &Arc<PatternRegistry> {
        &self.registry
    }

    pub fn key_store(&self) -> &KeyStore {
        &self.keys
    }

    pub fn audit_store(&self) -> &Arc<dyn AuditStore> {
        &self.audit_store
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    // ── Auth ───────────────────────────────────────────────────────────────

    /// Authenticate the request headers. Runs before any scan; an `Err`
    /// terminates the request with 401.
    pub fn authenticate(
        &self,
        x_ongarde_key: Option<&str>,
        authorization: Option<&str>,
    ) -> Result<String, AuthError> {
        authenticate(x_ongarde_key, authorization, &self.keys, &self.config.auth)
    }

    // ── Request scanning ───────────────────────────────────────────────────

    /// Cap and scan a request body, then decide: allow, suppressed allow, or
    /// block. Audit records for non-ALLOW decisions are fire-and-forget.
    pub fn scan_request(&self, user_id: &str, body: &str) -> RequestDecision {
        let scan_id = generate_scan_id();
        let mut ctx = ScanContext::default();
        let capped = apply_input_cap(body, &mut ctx);
        let outcome = scan(&self.registry, capped);

        if !outcome.is_block {
            // ALLOW is not audited in v1.
            return RequestDecision::Allow { scan_id };
        }

        let rule_id = outcome.rule_id.unwrap_or(RULE_SCANNER_ERROR).to_string();
        let risk_level = outcome.risk_level.unwrap_or(RiskLevel::Critical);
        let redacted_excerpt = make_redacted_excerpt(capped, &outcome, EXCERPT_MAX_LEN);

        // Allowlist suppression applies to policy rules only, never to the
        // fail-safe blocks.
        let suppressible =
            rule_id != RULE_SCANNER_ERROR && rule_id != RULE_SCANNER_TIMEOUT;
        if suppressible && self.config.allowlist.iter().any(|r| r == &rule_id) {
            let mut record = AuditRecord::new(
                scan_id.clone(),
                user_id,
                Action::AllowSuppressed,
                Direction::Request,
            );
            record.rule_id = Some(rule_id.clone());
            record.risk_level = Some(risk_level);
            record.redacted_excerpt = redacted_excerpt;
            record.is_test = outcome.is_test;
            record.truncated = ctx.truncated;
            record.original_length = ctx.original_length.map(|l| l as u64);
            record.allowlist_rule_id = Some(rule_id.clone());
            self.audit.enqueue(record);

            return RequestDecision::AllowSuppressed { scan_id, allowlist_rule_id: rule_id };
        }

        let suppression_hint = if suppressible {
            Some(make_suppression_hint(
                &rule_id,
                outcome.matched_slug.unwrap_or("unknown"),
            ))
        } else {
            None
        };

        let mut record =
            AuditRecord::new(scan_id.clone(), user_id, Action::Block, Direction::Request);
        record.rule_id = Some(rule_id.clone());
        record.risk_level = Some(risk_level);
        record.redacted_excerpt = redacted_excerpt.clone();
        record.is_test = outcome.is_test;
        record.truncated = ctx.truncated;
        record.original_length = ctx.original_length.map(|l| l as u64);
        self.audit.enqueue(record);

        RequestDecision::Block(BlockDecision {
            scan_id,
            rule_id,
            risk_level,
            redacted_excerpt,
            suppression_hint,
            is_test: outcome.is_test,
        })
    }

    // ── Streaming ──────────────────────────────────────────────────────────

    /// Fresh per-stream scanner sharing the process-wide registry.
    pub fn new_stream_scanner(&self, scan_id: impl Into<String>) -> StreamingScanner {
        StreamingScanner::new(Arc::clone(&self.registry), scan_id)
    }

    /// Default advisory engine over the same registry.
    pub fn advisory_engine(&self) -> Arc<dyn AdvisoryEngine> {
        Arc::new(RegexAdvisoryEngine::new(Arc::clone(&self.registry)))
    }

    /// Audit a streaming block (fire-and-forget). Called by the forwarder
    /// right before it appends the terminator frame and closes the stream.
    pub fn record_stream_block(
        &self,
        user_id: &str,
        block: &StreamBlock,
        advisory_entities: Vec<String>,
    ) {
        let mut record = AuditRecord::new(
            block.scan_id.clone(),
            user_id,
            Action::Block,
            Direction::Response,
        );
        record.rule_id = Some(block.rule_id.clone());
        record.risk_level = Some(block.risk_level);
        record.redacted_excerpt = block.redacted_excerpt.clone();
        record.is_test = block.is_test;
        record.tokens_delivered = Some(block.tokens_delivered);
        record.truncated = true;
        if !advisory_entities.is_empty() {
            record.advisory_entities = Some(advisory_entities);
        }
        self.audit.enqueue(record);
    }

    // ── Key management (dashboard API) ─────────────────────────────────────

    pub fn create_key(&self, user_id: &str) -> Result<(String, String), KeyManagementError> {
        self.check_rate()?;
        let created = self.keys.create_key(user_id)?;
        self.audit_key_event(user_id, "KEY_CREATED");
        Ok(created)
    }

    pub fn rotate_key_by_plaintext(
        &self,
        user_id: &str,
        old_key: &str,
    ) -> Result<(String, String), KeyManagementError> {
        self.check_rate()?;
        let rotated = self.keys.rotate_by_plaintext(user_id, old_key)?;
        self.audit_key_event(user_id, "KEY_ROTATED");
        Ok(rotated)
    }

    pub fn rotate_key_by_id(
        &self,
        user_id: &str,
        key_id: &str,
    ) -> Result<(String, String), KeyManagementError> {
        self.check_rate()?;
        let rotated = self.keys.rotate_by_id(user_id, key_id)?;
        self.audit_key_event(user_id, "KEY_ROTATED");
        Ok(rotated)
    }

    pub fn revoke_key(&self, user_id: &str, key_id: &str) -> Result<bool, KeyManagementError> {
        self.check_rate()?;
        let revoked = self.keys.revoke(user_id, key_id)?;
        if revoked {
            self.audit_key_event(user_id, "KEY_REVOKED");
        }
        Ok(revoked)
    }

    pub fn list_keys(&self, user_id: &str) -> Result<Vec<MaskedKey>, KeyManagementError> {
        self.check_rate()?;
        Ok(self.keys.list(user_id)?)
    }

    /// Recent non-allow events for the dashboard list.
    pub fn recent_events(&self, filters: &EventFilters) -> Vec<AuditRecord> {
        self.audit_store.query(filters)
    }

    fn check_rate(&self) -> Result<(), KeyManagementError> {
        if self.limiter.allow() {
            Ok(())
        } else {
            Err(KeyManagementError::RateLimited)
        }
    }

    /// Key lifecycle events ride the audit trail as ALLOW records whose
    /// rule_id names the event.
    fn audit_key_event(&self, user_id: &str, event: &str) {
        let mut record = AuditRecord::new(
            generate_scan_id(),
            user_id,
            Action::Allow,
            Direction::Request,
        );
        record.rule_id = Some(event.to_string());
        self.audit.enqueue(record);
    }
}

// ─── Dashboard origin check ─────────────────────────────────────────────────

const LOOPBACK_HOSTS: [&str; 3] = ["127.0.0.1", "::1", "localhost"];

/// Whether a dashboard request's source host passes the loopback
/// restriction. The middleware around this returns HTTP 403 on `false`.
pub fn is_loopback_origin(client_host: Option<&str>, settings: &DashboardSettings) -> bool {
    if !settings.localhost_only {
        return true;
    }
    match client_host {
        Some(host) => LOOPBACK_HOSTS.contains(&host),
        None => false,
    }
}
