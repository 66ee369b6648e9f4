//! Utility functions

/// Hex-encode a byte slice (lowercase).
pub fn to_hex(bytes: &[u8]) -> String {
	let mut out = String::with_capacity(bytes.len() * 2);
	for b in bytes {
		use std::fmt::Write;
		let _ = write!(out, "{:02x}", b);
	}
	out
}

/// Current time as an ISO-8601 UTC string with millisecond precision,
/// e.g. `2026-08-01T12:00:00.000Z`.
pub fn iso_now() -> String {
	chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}


// vim: ts=4
