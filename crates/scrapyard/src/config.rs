//! Engine configuration.

/// Bumped when the `sites` schema changes shape; part of the default
/// database name so incompatible schemas land in fresh databases.
pub const SCHEMA_VERSION: u32 = 2;

/// Construction-time configuration. The token is any printable string;
/// when absent the caller must supply one before `connect`.
#[derive(Debug, Clone)]
pub struct Config {
	/// Name of the embedded catalog database.
	pub db_name: String,
	/// WebSocket signaling endpoint, e.g. `wss://host/signal`.
	pub signaling_url: String,
	/// ICE servers for peer connections; empty means public STUN defaults.
	pub ice_servers: Vec<String>,
	/// Room token appended to the signaling URL.
	pub token: Option<String>,
}

impl Default for Config {
	fn default() -> Self {
		Self {
			db_name: format!("scrap_yard_v{SCHEMA_VERSION}"),
			signaling_url: String::new(),
			ice_servers: Vec::new(),
			token: None,
		}
	}
}

// vim: ts=4
