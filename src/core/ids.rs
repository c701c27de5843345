//! Identifier and timestamp helpers shared by the store, backend and controller.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;

static FALLBACK_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Generate a random 128-bit identifier rendered as lowercase hex.
///
/// Falls back to a timestamp/counter mix if the OS entropy source is
/// unavailable, so id generation never fails.
pub fn new_id() -> String {
    let mut bytes = [0u8; 16];
    if getrandom::fill(&mut bytes).is_err() {
        let now = Utc::now().timestamp_nanos_opt().unwrap_or_default() as u64;
        let count = FALLBACK_COUNTER.fetch_add(1, Ordering::Relaxed);
        bytes[..8].copy_from_slice(&now.to_be_bytes());
        bytes[8..].copy_from_slice(&count.to_be_bytes());
    }

    let mut id = String::with_capacity(32);
    for byte in bytes {
        id.push_str(&format!("{byte:02x}"));
    }
    id
}

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Whether `id` is safe to use as a file stem.
pub fn is_safe_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}
