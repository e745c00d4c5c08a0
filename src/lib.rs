//! OnGarde core: the inline scan engine behind an LLM security gateway.
//!
//! This crate owns everything between "a request body or response chunk
//! arrived" and "it was allowed, suppressed, or blocked":
//!
//! - [`scanner`] — pre-compiled linear-time pattern registry, the synchronous
//!   scan primitive with fail-safe semantics, redaction helpers, and the
//!   per-stream window scanner.
//! - [`auth`] — hash-only API key store (bcrypt, prefix index, bounded
//!   validation cache) and the request auth gate that runs before any scan.
//! - [`audit`] — pluggable decision-record store (embedded SQLite or remote
//!   row store) with fire-and-forget writes and retention pruning.
//! - [`gateway`] — the `AppContext` façade wiring the pieces together for a
//!   request pipeline; block response payload builders.
//!
//! HTTP reception, upstream forwarding, and SSE parsing live in the embedding
//! binary; this crate is deliberately transport-agnostic.

pub mod advisory;
pub mod audit;
pub mod auth;
pub mod config;
pub mod gateway;
pub mod scanner;
pub mod utils;

pub use config::GatewayConfig;
pub use gateway::{AppContext, BlockDecision, RequestDecision};
pub use scanner::definitions::{PatternRegistry, RiskLevel};
pub use scanner::engine::{apply_input_cap, scan, ScanContext, ScanOutcome, INPUT_HARD_CAP};
pub use scanner::streaming::{StreamBlock, StreamingScanner, OVERLAP_SIZE, WINDOW_SIZE};
