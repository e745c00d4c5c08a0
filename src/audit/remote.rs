//! audit/remote.rs
//! Remote audit backend over a PostgREST-style row API.
//!
//! Every operation is bounded by a hard 5-second client timeout, and every
//! failure (network, decode, timeout, bad status) degrades to the method's
//! safe default. The proxy keeps serving no matter what this store does.
//! A store whose client failed to build stays degraded until process exit.

use std::time::Duration;

use chrono::{Duration as ChronoDuration, SecondsFormat, Utc};
use reqwest::blocking::{Client, RequestBuilder};
use reqwest::header::{HeaderMap, HeaderValue};

use crate::audit::models::{AuditRecord, EventFilters};
use crate::audit::store::AuditStore;

/// Hard timeout for every remote call.
const REMOTE_TIMEOUT: Duration = Duration::from_secs(5);

const TABLE_NAME: &str = "audit_events";

pub struct RemoteAuditStore {
    /// `None` = degraded: every call short-circuits to its safe default.
    client: Option<Client>,
    endpoint: String,
}

impl RemoteAuditStore {
    /// Build the remote store. Never fails: an unusable client only degrades
    /// the store to a no-op, it does not stop startup.
    pub fn new(base_url: &str, api_key: &str) -> Self {
        let endpoint = format!("{}/rest/v1/{}", base_url.trim_end_matches('/'), TABLE_NAME);

        let mut headers = HeaderMap::new();
        let client = match HeaderValue::from_str(api_key) {
            Ok(mut key_value) => {
                key_value.set_sensitive(true);
                headers.insert("apikey", key_value);
                match HeaderValue::from_str(&format!("Bearer {api_key}")) {
                    Ok(mut bearer) => {
                        bearer.set_sensitive(true);
                        headers.insert(reqwest::header::AUTHORIZATION, bearer);
                        Client::builder()
                            .timeout(REMOTE_TIMEOUT)
                            .default_headers(headers)
                            .build()
                            .map_err(|err| {
                                tracing::error!(error = %err, "remote audit client build failed");
                            })
                            .ok()
                    }
                    Err(_) => None,
                }
            }
            Err(_) => None,
        };

        if client.is_none() {
            tracing::warn!("remote audit store degraded to no-op");
        } else {
            // Never log the key, only the host.
            tracing::info!(endpoint = %endpoint, "remote audit store initialized");
        }
        Self { client, endpoint }
    }

    fn apply_filters(&self, mut req: RequestBuilder, filters: &EventFilters) -> RequestBuilder {
        // action_in supersedes action; PostgREST `in` operator.
        if let Some(actions) = &filters.action_in {
            let list = actions
                .iter()
                .map(|a| a.as_str())
                .collect::<Vec<_>>()
                .join(",");
            req = req.query(&[("action", format!("in.({list})"))]);
        } else if let Some(action) = filters.action {
            req = req.query(&[("action", format!("eq.{}", action.as_str()))]);
        }

        if let Some(direction) = filters.direction {
            req = req.query(&[("direction", format!("eq.{}", direction.as_str()))]);
        }
        if let Some(user_id) = &filters.user_id {
            req = req.query(&[("user_id", format!("eq.{user_id}"))]);
        }
        if let Some(since) = filters.since {
            let iso = since.to_rfc3339_opts(SecondsFormat::Micros, true);
            req = req.query(&[("timestamp", format!("gte.{iso}"))]);
        }
        if let Some(until) = filters.until {
            let iso = until.to_rfc3339_opts(SecondsFormat::Micros, true);
            req = req.query(&[("timestamp", format!("lte.{iso}"))]);
        }
        if let Some(is_test) = filters.is_test {
            req = req.query(&[("test", format!("eq.{is_test}"))]);
        }
        if let Some(risk) = filters.risk_level {
            req = req.query(&[("risk_level", format!("eq.{}", risk.as_str()))]);
        }
        req
    }
}

impl AuditStore for RemoteAuditStore {
    fn log(&self, record: &AuditRecord) {
        let Some(client) = &self.client else { return };

        let sent = client
            .post(&self.endpoint)
            // Duplicate scan_ids are absorbed, mirroring INSERT OR IGNORE.
            .header("Prefer", "resolution=ignore-duplicates")
            .json(record)
            .send();
        match sent {
            Ok(resp) if resp.status().is_success() => {}
            Ok(resp) => {
                tracing::error!(
                    scan_id = %record.scan_id,
                    status = %resp.status(),
                    "remote audit log rejected"
                );
            }
            Err(err) => {
                tracing::error!(scan_id = %record.scan_id, error = %err, "remote audit log failed");
            }
        }
    }

    fn query(&self, filters: &EventFilters) -> Vec<AuditRecord> {
        let Some(client) = &self.client else { return Vec::new() };

        let req = client
            .get(&self.endpoint)
            .query(&[("select", "*"), ("order", "timestamp.desc")])
            .query(&[("limit", filters.limit()), ("offset", filters.offset())]);
        let req = self.apply_filters(req, filters);

        match req.send().and_then(|resp| resp.error_for_status()) {
            Ok(resp) => match resp.json::<Vec<AuditRecord>>() {
                Ok(records) => records,
                Err(err) => {
                    tracing::error!(error = %err, "remote audit query decode failed");
                    Vec::new()
                }
            },
            Err(err) => {
                tracing::error!(error = %err, "remote audit query failed");
                Vec::new()
            }
        }
    }

    fn count(&self, filters: &EventFilters) -> u64 {
        let Some(client) = &self.client else { return 0 };

        let req = client
            .get(&self.endpoint)
            .query(&[("select", "scan_id"), ("limit", "1")])
            .header("Prefer", "count=exact");
        let req = self.apply_filters(req, filters);

        let resp = match req.send().and_then(|r| r.error_for_status()) {
            Ok(resp) => resp,
            Err(err) => {
                tracing::error!(error = %err, "remote audit count failed");
                return 0;
            }
        };

        // PostgREST reports the exact total after the `/` in Content-Range.
        resp.headers()
            .get("content-range")
            .and_then(|value| value.to_str().ok())
            .and_then(|range| range.rsplit('/').next())
            .and_then(|total| total.parse::<u64>().ok())
            .unwrap_or(0)
    }

    fn health_check(&self) -> bool {
        let Some(client) = &self.client else { return false };
        client
            .get(&self.endpoint)
            .query(&[("select", "scan_id"), ("limit", "1")])
            .send()
            .map(|resp| resp.status().is_success())
            .unwrap_or(false)
    }

    fn prune_older_than(&self, retention_days: i64) -> u64 {
        let Some(client) = &self.client else { return 0 };

        let cutoff = Utc::now() - ChronoDuration::days(retention_days);
        let iso = cutoff.to_rfc3339_opts(SecondsFormat::Micros, true);

        let sent = client
            .delete(&self.endpoint)
            .query(&[("timestamp", format!("lt.{iso}"))])
            .header("Prefer", "return=representation")
            .send()
            .and_then(|resp| resp.error_for_status());
        match sent {
            Ok(resp) => {
                let deleted = resp
                    .json::<Vec<serde_json::Value>>()
                    .map(|rows| rows.len() as u64)
                    .unwrap_or(0);
                if deleted > 0 {
                    tracing::info!(deleted_count = deleted, retention_days, "remote prune complete");
                }
                deleted
            }
            Err(err) => {
                tracing::error!(error = %err, "remote prune failed");
                0
            }
        }
    }

    fn close(&self) {
        tracing::debug!("remote audit store closed");
    }
}
