//! Contract for the CRDT-tracked relational store (the replicated catalog
//! backend).
//!
//! The store is an embedded SQL database where selected tables are tracked as
//! replicated register-maps: every write to a tracked table produces change
//! records that other replicas fold in with `apply_changes`. Consumers treat
//! change records as opaque apart from their version fields.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

use crate::error::SyResult;

/// One replicated column write, as it travels between replicas.
///
/// `pk` and `site_id` are base64-encoded byte strings on the wire; the store
/// decodes them on entry and encodes them when surfacing changes. `val` is a
/// JSON primitive or null. `cl` is the causal length of the row (odd = alive,
/// even = deleted); `seq` orders records sharing a `db_version`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
	pub table: String,
	pub pk: String,
	pub cid: String,
	pub val: Value,
	pub col_version: i64,
	pub db_version: i64,
	pub site_id: String,
	pub cl: i64,
	pub seq: i64,
}

/// Column id used for row-deletion sentinel records.
pub const DELETE_SENTINEL: &str = "__crdt_del";

/// Emitted once per local row mutation on a tracked table. Internal CRDT
/// bookkeeping tables never produce events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowChange {
	pub table: String,
	pub pk: String,
}

/// A result row: column name to JSON value.
pub type Row = serde_json::Map<String, Value>;

#[async_trait]
pub trait CrdtStore: Send + Sync {
	/// The replica's stable identifier: 128 random bits, hex-encoded,
	/// persisted across sessions.
	fn node_id(&self) -> &str;

	/// Execute a statement; returns the number of affected rows.
	async fn exec(&self, sql: &str, params: &[Value]) -> SyResult<u64>;

	/// Run a query returning row objects keyed by column name.
	async fn query(&self, sql: &str, params: &[Value]) -> SyResult<Vec<Row>>;

	/// Declare a table as a replicated register-map. Idempotent; after this
	/// call every write to the table is tracked.
	async fn enable_crdt(&self, table: &str) -> SyResult<()>;

	/// Monotone per-replica version, advancing on every tracked write.
	async fn version(&self) -> SyResult<i64>;

	/// Ordered change records with `db_version > version`.
	async fn changes_since(&self, version: i64) -> SyResult<Vec<ChangeRecord>>;

	/// Idempotently fold a batch of records from another replica. The batch
	/// commits atomically: either all records apply or none do.
	async fn apply_changes(&self, records: &[ChangeRecord]) -> SyResult<()>;

	/// Subscribe to local row mutations. Receivers unsubscribe by drop.
	fn subscribe(&self) -> broadcast::Receiver<RowChange>;
}

// vim: ts=4
