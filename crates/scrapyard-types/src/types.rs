//! Core data types shared across the workspace.

use serde::{Deserialize, Serialize};

/// Unix timestamp in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp(pub i64);

impl Timestamp {
	pub fn now() -> Self {
		Self(chrono::Utc::now().timestamp())
	}
}

impl std::fmt::Display for Timestamp {
	fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
		write!(f, "{}", self.0)
	}
}

/// Three-state patch field: distinguishes "leave unchanged" from "set to null".
#[derive(Debug, Clone, Default, PartialEq)]
pub enum Patch<T> {
	#[default]
	Undefined,
	Null,
	Value(T),
}

impl<T> Patch<T> {
	pub fn is_undefined(&self) -> bool {
		matches!(self, Patch::Undefined)
	}

	pub fn into_option(self) -> Option<Option<T>> {
		match self {
			Patch::Undefined => None,
			Patch::Null => Some(None),
			Patch::Value(v) => Some(Some(v)),
		}
	}
}

impl<T> From<T> for Patch<T> {
	fn from(v: T) -> Self {
		Patch::Value(v)
	}
}

/// A replicated catalog row. Field names match the `sites` table columns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Site {
	pub id: String,
	#[serde(default)]
	pub name: String,
	#[serde(default)]
	pub description: String,
	#[serde(default)]
	pub url: String,
	#[serde(default)]
	pub thumbnail: String,
	pub owner_id: String,
	#[serde(default)]
	pub content_hash: Option<String>,
	#[serde(default)]
	pub file_count: i64,
	#[serde(default)]
	pub file_size: i64,
	pub added_at: String,
	pub updated_at: String,
}

/// Fields supplied when creating a catalog row. The engine assigns the id,
/// the owner, and both timestamps.
#[derive(Debug, Clone, Default)]
pub struct NewSite {
	pub name: String,
	pub description: String,
	pub url: String,
	pub thumbnail: String,
	pub content_hash: Option<String>,
	pub file_count: i64,
	pub file_size: i64,
}

/// Patch for mutable catalog columns. `owner_id`, `id` and `added_at` are
/// immutable after creation; `updated_at` is stamped by the engine.
#[derive(Debug, Clone, Default)]
pub struct SiteUpdate {
	pub name: Patch<String>,
	pub description: Patch<String>,
	pub url: Patch<String>,
	pub thumbnail: Patch<String>,
	pub content_hash: Patch<String>,
	pub file_count: Patch<i64>,
	pub file_size: Patch<i64>,
}

// vim: ts=4
