//! General utilities shared across the application.

use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{SecondsFormat, Utc};

// ─────────────────────────────────────────────────────────────────────────────
// Time Utilities
// ─────────────────────────────────────────────────────────────────────────────

/// Returns the current Unix timestamp in milliseconds.
///
/// Returns 0 if the system clock is before the Unix epoch (shouldn't happen in practice).
#[must_use]
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Returns the current wall-clock time as an ISO-8601 string (UTC,
/// millisecond precision). This is the `ts` format on the control channel.
#[must_use]
pub fn now_iso8601() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

// ─────────────────────────────────────────────────────────────────────────────
// Filename Sanitization
// ─────────────────────────────────────────────────────────────────────────────

/// Strips directory components from a client-supplied filename.
///
/// Keeps only the final path component (both `/` and `\` are treated as
/// separators) and rejects names that reduce to nothing, `.` or `..`.
#[must_use]
pub fn sanitize_filename(name: &str) -> Option<String> {
    let base = name
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or("")
        .trim()
        .replace('\0', "");
    match base.as_str() {
        "" | "." | ".." => None,
        _ => Some(base),
    }
}
