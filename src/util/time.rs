//! Helpers for timestamps
use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the UNIX epoch
pub fn now_msec() -> u64 {
	SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.expect("Fix your clock :o")
		.as_millis() as u64
}

/// Render a millisecond timestamp as RFC3339 with millisecond precision
pub fn msec_to_rfc3339(msecs: u64) -> String {
	use chrono::prelude::*;

	let secs = msecs as i64 / 1000;
	let nanos = (msecs as i64 % 1000) as u32 * 1_000_000;
	match Utc.timestamp_opt(secs, nanos) {
		chrono::LocalResult::Single(ts) => ts.to_rfc3339_opts(SecondsFormat::Millis, true),
		_ => "<invalid timestamp>".to_string(),
	}
}
