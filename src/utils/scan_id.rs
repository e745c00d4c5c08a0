//! utils/scan_id.rs
//! Scan identifiers: 26-character ULIDs, monotonic within a millisecond.
//!
//! Every proxied request gets exactly one scan id. It is the value of the
//! `X-OnGarde-Scan-ID` response header, the `scan_id` column of audit events,
//! and the correlation key in log lines, so it must sort by creation time.

use once_cell::sync::Lazy;
use std::sync::Mutex;
use ulid::{Generator, Ulid};

// One process-wide generator so ids created in the same millisecond still
// strictly increase (monotonic random increment per the ULID spec).
static GENERATOR: Lazy<Mutex<Generator>> = Lazy::new(|| Mutex::new(Generator::new()));

/// Generate a new scan id as a 26-character uppercase Crockford-Base32 string.
///
/// # Returns
/// A ULID string, e.g. `"01KJ0JRVHYA7KX32VPN5ZSCTMV"`. Lexicographic order
/// matches creation order, including within a single millisecond.
pub fn generate_scan_id() -> String {
    let ulid = match GENERATOR.lock() {
        Ok(mut r#gen) => r#gen.generate().unwrap_or_else(|_| Ulid::new()),
        // A poisoned lock only means another thread panicked mid-generate;
        // a fresh non-monotonic ULID is still unique.
        Err(_) => Ulid::new(),
    };
    ulid.to_string()
}
