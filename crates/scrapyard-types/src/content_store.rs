//! Contract for the local content store: a keyed blob store indexed by
//! `(site_id, path)` with a secondary index by `site_id`.
//!
//! Blobs are local-only and never enter the CRDT. Paths are forward-slash
//! separated, relative to the site root, case-sensitive, and never begin
//! with `/`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::SyResult;
use crate::types::Timestamp;

/// Blob metadata as reported in file listings (and on the transfer wire,
/// hence the camelCase field names).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileMeta {
	pub path: String,
	pub size: u64,
	pub content_type: String,
}

/// A stored blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
	pub path: String,
	pub content_type: String,
	pub data: Vec<u8>,
	pub size: u64,
	pub cached_at: Timestamp,
}

#[async_trait]
pub trait ContentStore: Send + Sync {
	/// Store a blob; overwrites any existing blob at the same key and
	/// stamps `cached_at`.
	async fn put(&self, site_id: &str, path: &str, data: &[u8], content_type: &str)
		-> SyResult<()>;

	/// Fetch a blob, or `None` if the key is absent.
	async fn get(&self, site_id: &str, path: &str) -> SyResult<Option<FileRecord>>;

	/// All blobs for a site, in stable path order.
	async fn list(&self, site_id: &str) -> SyResult<Vec<FileMeta>>;

	/// Remove all blobs for a site. Idempotent.
	async fn delete_site(&self, site_id: &str) -> SyResult<()>;

	/// Duplicate every blob of `from_id` under `to_id`.
	async fn copy_site(&self, from_id: &str, to_id: &str) -> SyResult<()>;

	/// Aggregate byte count for one site.
	async fn size(&self, site_id: &str) -> SyResult<u64>;

	/// Aggregate byte count across all sites.
	async fn total_size(&self) -> SyResult<u64>;
}

// vim: ts=4
