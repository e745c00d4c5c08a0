//! scanner/definitions.rs
//! Pattern registry: every security pattern the fast-path scanner applies.
//!
//! All patterns are compiled once in [`PatternRegistry::compile`] and never
//! mutated afterwards; callers only ever see `&PatternRegistry`. The `regex`
//! crate is an RE2-class engine with a linear-time execution guarantee, so a
//! pattern that compiles here cannot be driven into catastrophic backtracking.
//! A pattern the engine rejects fails registry construction outright; that
//! is the ReDoS gate.
//!
//! Group order is load-bearing: the scan primitive tries the exact test key,
//! then credentials, dangerous commands, prompt injection, and finally the
//! PII fast path. First match wins.

use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// ─── Risk levels ────────────────────────────────────────────────────────────

/// Risk classification for a pattern match. Ordered: `Low < Critical`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum RiskLevel {
    #[serde(rename = "LOW")]
    Low,
    #[serde(rename = "MEDIUM")]
    Medium,
    #[serde(rename = "HIGH")]
    High,
    #[serde(rename = "CRITICAL")]
    Critical,
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Critical => "CRITICAL",
            RiskLevel::High => "HIGH",
            RiskLevel::Medium => "MEDIUM",
            RiskLevel::Low => "LOW",
        }
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RiskLevel {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "CRITICAL" => Ok(RiskLevel::Critical),
            "HIGH" => Ok(RiskLevel::High),
            "MEDIUM" => Ok(RiskLevel::Medium),
            "LOW" => Ok(RiskLevel::Low),
            other => Err(format!("unknown risk level: {other}")),
        }
    }
}

// ─── Rule identifiers ───────────────────────────────────────────────────────

pub const RULE_CREDENTIAL: &str = "CREDENTIAL_DETECTED";
pub const RULE_DANGEROUS_COMMAND: &str = "DANGEROUS_COMMAND_DETECTED";
pub const RULE_PROMPT_INJECTION: &str = "PROMPT_INJECTION_DETECTED";
/// Fail-safe rule id: the scanner itself misbehaved, block regardless.
pub const RULE_SCANNER_ERROR: &str = "SCANNER_ERROR";
/// Reserved for a future watchdog path; treated like SCANNER_ERROR downstream.
pub const RULE_SCANNER_TIMEOUT: &str = "SCANNER_TIMEOUT";

/// The well-known OnGarde test credential. Matching it blocks with
/// `is_test = true` so integration smoke tests never burn real quota.
pub const TEST_CREDENTIAL: &str = "sk-ongarde-test-fake-key-12345";

// ─── PatternEntry ───────────────────────────────────────────────────────────

/// A single compiled security pattern with its metadata.
///
/// Entries are immutable once the registry is built; no `&mut` accessor
/// exists and all fields are read via getters.
#[derive(Debug)]
pub struct PatternEntry {
    pattern: Regex,
    rule_id: &'static str,
    risk_level: RiskLevel,
    slug: &'static str,
    is_test_key: bool,
}

impl PatternEntry {
    fn compile(
        source: &str,
        rule_id: &'static str,
        risk_level: RiskLevel,
        slug: &'static str,
        is_test_key: bool,
    ) -> Result<Self> {
        let pattern = Regex::new(source)
            .with_context(|| format!("compiling pattern {slug:?} (rule {rule_id})"))?;
        Ok(Self { pattern, rule_id, risk_level, slug, is_test_key })
    }

    pub fn pattern(&self) -> &Regex {
        &self.pattern
    }

    pub fn rule_id(&self) -> &'static str {
        self.rule_id
    }

    pub fn risk_level(&self) -> RiskLevel {
        self.risk_level
    }

    pub fn slug(&self) -> &'static str {
        self.slug
    }

    pub fn is_test_key(&self) -> bool {
        self.is_test_key
    }
}

// ─── Pattern tables ─────────────────────────────────────────────────────────
//
// Sources with a fixed, documented token shape are anchored to that shape;
// context-keyword patterns (e.g. aws-secret-access-key) require the keyword
// so that bare high-entropy strings do not false-positive.

/// All credential patterns are CRITICAL by definition.
const CREDENTIAL_TABLE: &[(&str, &str)] = &[
    (r"sk-ant-api\d{2}-[A-Za-z0-9_\-]{80,120}", "anthropic-api-key"),
    (r"sk-proj-[A-Za-z0-9_\-]{40,}", "openai-project-key"),
    (r"sk-[A-Za-z0-9]{48}", "openai-api-key"),
    (r"ong-[0-9A-HJKMNP-TV-Z]{26}", "ongarde-api-key"),
    (r"\b(?:AKIA|ASIA|ABIA|ACCA)[A-Z0-9]{16}\b", "aws-access-key-id"),
    (
        r#"(?i)aws_?secret_?access_?key\s*[:=]\s*["']?[A-Za-z0-9/+=]{40}"#,
        "aws-secret-access-key",
    ),
    (r"\bgh[pousr]_[A-Za-z0-9]{36,255}\b", "github-pat"),
    (r"\bgithub_pat_[A-Za-z0-9]{22}_[A-Za-z0-9]{59}\b", "github-fine-grained-pat"),
    (r"\bglpat-[A-Za-z0-9_\-]{20,}", "gitlab-pat"),
    (r"(?i)\bbearer\s+[A-Za-z0-9_\-./+=]{40,}", "bearer-token"),
    (r"\b(?:sk|rk)_live_[A-Za-z0-9]{24,99}\b", "stripe-secret-key"),
    (r"\bhf_[A-Za-z0-9]{30,}\b", "huggingface-token"),
    (r"\bxox[baprs]-\d{10,13}-\d{10,13}-[A-Za-z0-9]{24,}", "slack-token"),
    (
        r"hooks\.slack\.com/services/T[A-Za-z0-9]{8,}/B[A-Za-z0-9]{8,}/[A-Za-z0-9]{24}",
        "slack-webhook-url",
    ),
    (r"\bAC[a-fA-F0-9]{32}\b", "twilio-account-sid"),
    (r"\bAIza[A-Za-z0-9_\-]{35}\b", "google-api-key"),
    (r"\bSG\.[A-Za-z0-9_\-]{22}\.[A-Za-z0-9_\-]{43}\b", "sendgrid-api-key"),
    (r"\bnpm_[A-Za-z0-9]{36}\b", "npm-token"),
    (r"\bpypi-[A-Za-z0-9_\-]{50,}", "pypi-token"),
    (r"\bdop_v1_[a-f0-9]{64}\b", "digitalocean-pat"),
    (r"\bdapi[a-f0-9]{32}\b", "databricks-pat"),
    (
        r"\beyJ[A-Za-z0-9_\-]{10,}\.eyJ[A-Za-z0-9_\-]{10,}\.[A-Za-z0-9_\-]{10,}\b",
        "jwt-token",
    ),
    (
        r"-----BEGIN (?:RSA |EC |DSA |OPENSSH |PGP )?PRIVATE KEY(?: BLOCK)?-----",
        "private-key-pem",
    ),
];

const DANGEROUS_COMMAND_TABLE: &[(&str, &str, RiskLevel)] = &[
    // Shell destructors.
    (r"\brm\s+-rf\b", "rm-rf", RiskLevel::Critical),
    (r"\brm\s+-fr\b", "rm-fr", RiskLevel::Critical),
    (r"\brm\s+--recursive\s+--force\b", "rm-recursive-force", RiskLevel::Critical),
    (r"\bsudo\s+\S+", "sudo-usage", RiskLevel::Critical),
    (r"\bdd\s+if=\S+\s+of=/dev/\S+", "dd-disk-copy", RiskLevel::Critical),
    (r"\bmkfs(?:\.\w+)?\s+/dev/\S+", "mkfs-format", RiskLevel::Critical),
    (r"\bchmod\s+(?:-[a-zA-Z]+\s+)*0?777\b", "chmod-world-writable", RiskLevel::Critical),
    (
        r"curl\s+[^|\n]*\|\s*(?:sudo\s+)?(?:ba|z)?sh\b",
        "curl-pipe-execute",
        RiskLevel::Critical,
    ),
    (
        r"wget\s+[^|\n]*\|\s*(?:sudo\s+)?(?:ba|z)?sh\b",
        "wget-pipe-execute",
        RiskLevel::Critical,
    ),
    (r":\(\)\s*\{\s*:\|:&\s*\}\s*;?\s*:", "fork-bomb", RiskLevel::Critical),
    (r">\s*/dev/sd[a-z]\b", "direct-disk-write", RiskLevel::Critical),
    (r"\bshred\s+\S*/dev/\S+", "shred-device", RiskLevel::Critical),
    (
        r"base64\s+(?:-d|--decode)[^|\n]*\|\s*(?:ba)?sh\b",
        "base64-decode-execute",
        RiskLevel::Critical,
    ),
    (r"\bcrontab\s+-r\b", "crontab-remove", RiskLevel::Critical),
    // Privilege / system tampering.
    (r"\bchown\s+-R\b", "chown-recursive", RiskLevel::High),
    (r"\bkill(?:all)?\s+-9\b", "kill-force", RiskLevel::High),
    (r"\biptables\s+(?:-[A-Za-z]+\s+)*-F\b", "iptables-flush", RiskLevel::High),
    (r"\bsystemctl\s+(?:stop|disable)\s+\S+", "systemctl-stop", RiskLevel::High),
    (r"\bhistory\s+-c\b", "history-clear", RiskLevel::High),
    (r"\bnc\b[^\n]*-e\s*/bin/(?:ba)?sh\b", "netcat-reverse-shell", RiskLevel::High),
    (r"\bpython[23]?\s+-c\s+['\x22]import\s+os", "python-os-exec", RiskLevel::High),
    (
        r"\b(?:printenv|env)\s*\|\s*(?:curl|nc|wget)\b",
        "env-exfiltration",
        RiskLevel::High,
    ),
    (r"\bcat\s+\S*\.ssh/id_[a-z0-9]+", "ssh-key-read", RiskLevel::High),
    (r"\bcat\s+/etc/(?:passwd|shadow)\b", "passwd-file-read", RiskLevel::High),
    (r"\bgit\s+push\b[^\n|;]*--force\b", "git-force-push", RiskLevel::High),
    (r"\bgit\s+reset\s+--hard\b", "git-reset-hard", RiskLevel::High),
    (r"\bdocker\s+(?:rm|rmi)\s+-f\b", "docker-force-remove", RiskLevel::High),
    // SQL destructors.
    (
        r"(?i)\bDROP\s+TABLE\s+(?:IF\s+EXISTS\s+)?\S+",
        "sql-drop-table",
        RiskLevel::Critical,
    ),
    (r"(?i)\bDROP\s+(?:DATABASE|SCHEMA)\s+\S+", "sql-drop-database", RiskLevel::Critical),
    (r"(?i)\bTRUNCATE\s+(?:TABLE\s+)?\S+", "sql-truncate", RiskLevel::Critical),
    (r"(?i)\bDELETE\s+FROM\s+\S+\s*;", "sql-delete-no-where", RiskLevel::Critical),
    (r"(?im)\bDELETE\s+FROM\s+\S+\s*$", "sql-delete-no-where-eol", RiskLevel::Critical),
    (r"(?i)\bGRANT\s+ALL\s+(?:PRIVILEGES\s+)?ON\b", "sql-grant-all", RiskLevel::High),
];

const PROMPT_INJECTION_TABLE: &[(&str, &str, RiskLevel)] = &[
    (
        r"(?i)ignore\s+(?:all\s+)?(?:previous|prior|above|earlier)\s+(?:instructions|prompts|rules|directives)",
        "ignore-previous-instructions",
        RiskLevel::High,
    ),
    (
        r"(?i)disregard\s+(?:all\s+)?(?:previous|prior|above|your)\s+(?:instructions|rules|guidelines)",
        "disregard-instructions",
        RiskLevel::High,
    ),
    (
        r"(?i)forget\s+(?:all\s+)?(?:previous|prior|your)\s+(?:instructions|training|rules)",
        "forget-instructions",
        RiskLevel::High,
    ),
    (
        r"(?i)(?:reveal|show|tell\s+me|print|repeat|output)\s+(?:your\s+|the\s+)?system\s+prompt",
        "reveal-system-prompt",
        RiskLevel::High,
    ),
    (
        r"(?i)what\s+(?:is|are)\s+your\s+(?:system\s+prompt|initial\s+instructions)",
        "system-prompt-probe",
        RiskLevel::Medium,
    ),
    (
        r"(?i)repeat\s+(?:the\s+)?(?:text|words|everything)\s+above",
        "prompt-leak-repeat-above",
        RiskLevel::High,
    ),
    (r"(?i)(?:new|updated)\s+instructions\s*:", "new-instructions-override", RiskLevel::Medium),
    (r"(?i)you\s+are\s+now\s+(?:a|an|in)\b", "you-are-now", RiskLevel::Medium),
    (
        r"(?i)pretend\s+(?:that\s+)?you\s+(?:have\s+no|don'?t\s+have)\s+(?:restrictions|limitations|rules)",
        "pretend-no-restrictions",
        RiskLevel::High,
    ),
    (r"(?i)\bDAN\s+mode\b", "dan-mode", RiskLevel::High),
    (r"(?i)\bdo\s+anything\s+now\b", "do-anything-now", RiskLevel::High),
    (
        r"(?i)developer\s+mode\s+(?:enabled|activated|on)\b",
        "developer-mode",
        RiskLevel::High,
    ),
    (r"(?i)\bjailbreak(?:ed|ing)?\b", "jailbreak-keyword", RiskLevel::Medium),
    (
        r"(?i)act\s+as\s+(?:an?\s+)?(?:unrestricted|unfiltered|uncensored)",
        "act-as-unrestricted",
        RiskLevel::High,
    ),
    (
        r"(?i)bypass\s+(?:your\s+)?(?:safety|content|security)\s+(?:filters?|guidelines|checks)",
        "bypass-safety",
        RiskLevel::High,
    ),
    (
        r"(?i)(?:disable|turn\s+off|remove)\s+(?:your\s+)?(?:safety|content)\s+(?:filters?|guardrails)",
        "disable-safety",
        RiskLevel::High,
    ),
    (
        r"(?i)(?:from\s+now\s+on|for\s+the\s+rest\s+of\s+this\s+conversation)\s+you\s+(?:are|will|must)",
        "conversation-override",
        RiskLevel::Medium,
    ),
    (
        r"(?i)decode\s+(?:this\s+)?base64\s+and\s+(?:execute|run|follow)",
        "base64-injection",
        RiskLevel::High,
    ),
    (
        r"(?i)hypothetically[,\s]+(?:if\s+)?you\s+(?:could|had\s+no)",
        "hypothetical-jailbreak",
        RiskLevel::Medium,
    ),
    (
        r"(?i)respond\s+as\s+if\s+you\s+were\s+not\s+an?\s+AI",
        "not-an-ai-roleplay",
        RiskLevel::Medium,
    ),
    (
        r"(?i)stay\s+in\s+character\s+no\s+matter\s+what",
        "stay-in-character",
        RiskLevel::Medium,
    ),
    (r"(?i)\badmin(?:istrator)?\s+override\b", "admin-override", RiskLevel::High),
];

/// PII fast path: high-confidence shapes only; everything fuzzier belongs to
/// the advisory engine. All HIGH.
const PII_FAST_PATH_TABLE: &[(&str, &str, &str)] = &[
    (r"\b\d{3}-\d{2}-\d{4}\b", "PII_DETECTED_US_SSN", "us-ssn"),
    (
        r"\b(?:4\d{3}|5[1-5]\d{2}|3[47]\d{2}|6(?:011|5\d{2}))[ \-]?\d{4}[ \-]?\d{4}[ \-]?\d{3,4}\b",
        "PII_DETECTED_CREDIT_CARD",
        "credit-card",
    ),
    (
        r"\b[A-Za-z0-9._%+\-]+@[A-Za-z0-9.\-]+\.[A-Za-z]{2,}\b",
        "PII_DETECTED_EMAIL",
        "email-address",
    ),
    (
        r"\b(?:\+?1[\-. ]?)?(?:\(\d{3}\)|\d{3})[\-. ]\d{3}[\-. ]\d{4}\b",
        "PII_DETECTED_PHONE_US",
        "us-phone",
    ),
    (
        r"\b0x[a-fA-F0-9]{40}\b|\b[13][a-km-zA-HJ-NP-Z1-9]{25,34}\b",
        "PII_DETECTED_CRYPTO",
        "crypto-address",
    ),
];

// ─── PatternRegistry ────────────────────────────────────────────────────────

/// Immutable registry of all scanner patterns, grouped in priority order.
///
/// Build exactly once at process start with [`PatternRegistry::compile`] and
/// share by reference (`Arc<PatternRegistry>` in the app context). Compile
/// failure of any single pattern fails construction.
#[derive(Debug)]
pub struct PatternRegistry {
    test_key: PatternEntry,
    credentials: Vec<PatternEntry>,
    dangerous_commands: Vec<PatternEntry>,
    prompt_injection: Vec<PatternEntry>,
    pii_fast_path: Vec<PatternEntry>,
}

impl PatternRegistry {
    /// Compile every pattern table into a registry.
    ///
    /// # Errors
    /// Returns the first compilation error, naming the offending slug. The
    /// caller is expected to treat this as a startup failure.
    pub fn compile() -> Result<Self> {
        let test_key = PatternEntry::compile(
            &regex::escape(TEST_CREDENTIAL),
            RULE_CREDENTIAL,
            RiskLevel::Critical,
            "ongarde-test-key",
            true,
        )?;

        let credentials = CREDENTIAL_TABLE
            .iter()
            .map(|&(src, slug)| {
                PatternEntry::compile(src, RULE_CREDENTIAL, RiskLevel::Critical, slug, false)
            })
            .collect::<Result<Vec<_>>>()?;

        let dangerous_commands = DANGEROUS_COMMAND_TABLE
            .iter()
            .map(|&(src, slug, risk)| {
                PatternEntry::compile(src, RULE_DANGEROUS_COMMAND, risk, slug, false)
            })
            .collect::<Result<Vec<_>>>()?;

        let prompt_injection = PROMPT_INJECTION_TABLE
            .iter()
            .map(|&(src, slug, risk)| {
                PatternEntry::compile(src, RULE_PROMPT_INJECTION, risk, slug, false)
            })
            .collect::<Result<Vec<_>>>()?;

        let pii_fast_path = PII_FAST_PATH_TABLE
            .iter()
            .map(|&(src, rule_id, slug)| {
                PatternEntry::compile(src, rule_id, RiskLevel::High, slug, false)
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self { test_key, credentials, dangerous_commands, prompt_injection, pii_fast_path })
    }

    /// The exact test-key entry, tried before every other group.
    pub fn test_key(&self) -> &PatternEntry {
        &self.test_key
    }

    pub fn credentials(&self) -> &[PatternEntry] {
        &self.credentials
    }

    pub fn dangerous_commands(&self) -> &[PatternEntry] {
        &self.dangerous_commands
    }

    pub fn prompt_injection(&self) -> &[PatternEntry] {
        &self.prompt_injection
    }

    pub fn pii_fast_path(&self) -> &[PatternEntry] {
        &self.pii_fast_path
    }

    /// Every entry in scan priority order (test key first).
    pub fn all_patterns(&self) -> impl Iterator<Item = &PatternEntry> {
        std::iter::once(&self.test_key)
            .chain(self.credentials.iter())
            .chain(self.dangerous_commands.iter())
            .chain(self.prompt_injection.iter())
            .chain(self.pii_fast_path.iter())
    }

    pub fn len(&self) -> usize {
        1 + self.credentials.len()
            + self.dangerous_commands.len()
            + self.prompt_injection.len()
            + self.pii_fast_path.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
