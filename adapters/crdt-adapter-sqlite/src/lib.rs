//! SQLite-backed CRDT relational store.
//!
//! Wraps a per-node SQLite database with per-table CRDT tracking: tables
//! declared via [`CrdtStore::enable_crdt`] become replicated register-maps
//! with per-column last-writer-wins semantics and row tombstones. Local
//! writes are tracked by triggers (see [`schema`]); remote batches fold in
//! through [`merge`] with the triggers suppressed.
//!
//! All writes are serialized behind a single async mutex; reads go straight
//! to the pool.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use serde_json::Value;
use sqlx::{
	sqlite::{Sqlite, SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow},
	Column, Row as _, SqlitePool, TypeInfo, ValueRef,
};
use std::collections::HashMap;
use std::path::Path;
use tokio::sync::{broadcast, Mutex, RwLock};
use uuid::Uuid;

use scrapyard::crdt_store::{ChangeRecord, CrdtStore, Row, RowChange};
use scrapyard::prelude::*;
use scrapyard::utils::to_hex;

mod merge;
mod schema;

use schema::TrackedTable;

pub(crate) fn store_err(err: sqlx::Error) -> Error {
	warn!("db error: {}", err);
	Error::StoreFailure(err.to_string())
}

/// Decode one result column into a JSON value. Blobs surface base64-encoded.
pub(crate) fn column_value(row: &SqliteRow, idx: usize) -> SyResult<Value> {
	let (is_null, type_name) = {
		let raw = row.try_get_raw(idx).map_err(store_err)?;
		(raw.is_null(), raw.type_info().name().to_string())
	};
	if is_null {
		return Ok(Value::Null);
	}
	let val = match type_name.as_str() {
		"INTEGER" => Value::from(row.try_get::<i64, _>(idx).map_err(store_err)?),
		"REAL" => Value::from(row.try_get::<f64, _>(idx).map_err(store_err)?),
		"BLOB" => Value::from(STANDARD.encode(row.try_get::<Vec<u8>, _>(idx).map_err(store_err)?)),
		_ => Value::from(row.try_get::<String, _>(idx).map_err(store_err)?),
	};
	Ok(val)
}

/// Bind a JSON parameter to a query. Arrays/objects are bound as JSON text.
pub(crate) fn bind_param<'q>(
	query: sqlx::query::Query<'q, Sqlite, sqlx::sqlite::SqliteArguments<'q>>,
	param: &'q Value,
) -> sqlx::query::Query<'q, Sqlite, sqlx::sqlite::SqliteArguments<'q>> {
	match param {
		Value::Null => query.bind(None::<String>),
		Value::Bool(b) => query.bind(*b),
		Value::Number(n) => {
			if let Some(i) = n.as_i64() {
				query.bind(i)
			} else {
				query.bind(n.as_f64().unwrap_or(0.0))
			}
		}
		Value::String(s) => query.bind(s.as_str()),
		other => query.bind(other.to_string()),
	}
}

pub struct CrdtStoreSqlite {
	pool: SqlitePool,
	node_id: Vec<u8>,
	node_id_hex: String,
	registry: RwLock<HashMap<String, TrackedTable>>,
	write_lock: Mutex<()>,
	updates: broadcast::Sender<RowChange>,
}

impl std::fmt::Debug for CrdtStoreSqlite {
	fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
		f.debug_struct("CrdtStoreSqlite").field("node_id", &self.node_id_hex).finish()
	}
}

impl CrdtStoreSqlite {
	/// Open (or create) the database `{dir}/{db_name}.sqlite` and load any
	/// previously registered tracked tables. The node id is generated on
	/// first open and persisted.
	pub async fn open(dir: impl AsRef<Path>, db_name: &str) -> SyResult<Self> {
		let dir = dir.as_ref();
		tokio::fs::create_dir_all(dir).await?;
		let path = dir.join(format!("{db_name}.sqlite"));

		let opts = SqliteConnectOptions::new()
			.filename(&path)
			.create_if_missing(true)
			.journal_mode(SqliteJournalMode::Wal);
		let pool = SqlitePoolOptions::new()
			.max_connections(4)
			.connect_with(opts)
			.await
			.map_err(store_err)?;

		schema::init_db(&pool).await.map_err(store_err)?;

		let node_id: Vec<u8> = match sqlx::query_scalar("SELECT node_id FROM crdt_node")
			.fetch_optional(&pool)
			.await
			.map_err(store_err)?
		{
			Some(id) => id,
			None => {
				let id = Uuid::new_v4().into_bytes().to_vec();
				sqlx::query("INSERT INTO crdt_node (node_id) VALUES (?)")
					.bind(&id)
					.execute(&pool)
					.await
					.map_err(store_err)?;
				id
			}
		};
		let node_id_hex = to_hex(&node_id);
		debug!("opened crdt store {:?} as node {}", path, node_id_hex);

		let mut registry = HashMap::new();
		for (table, info) in schema::load_registry(&pool).await.map_err(store_err)? {
			schema::install_tracking(&pool, &table, &info).await?;
			registry.insert(table, info);
		}

		let (updates, _) = broadcast::channel(256);
		Ok(Self {
			pool,
			node_id,
			node_id_hex,
			registry: RwLock::new(registry),
			write_lock: Mutex::new(()),
			updates,
		})
	}

	pub fn node_id_bytes(&self) -> &[u8] {
		&self.node_id
	}

	async fn current_version(&self) -> SyResult<i64> {
		sqlx::query_scalar("SELECT version FROM crdt_db_version")
			.fetch_one(&self.pool)
			.await
			.map_err(store_err)
	}

	/// Emit one RowChange per tracked row touched after `since`.
	async fn notify_changes(&self, since: i64) {
		if self.updates.receiver_count() == 0 {
			return;
		}
		let registry = self.registry.read().await;
		for (table, info) in registry.iter() {
			let clock = info.clock(table);
			let pks: Result<Vec<String>, _> =
				sqlx::query_scalar(&format!("SELECT DISTINCT pk FROM {clock} WHERE db_version > ?"))
					.bind(since)
					.fetch_all(&self.pool)
					.await;
			match pks {
				Ok(pks) => {
					for pk in pks {
						let _ = self.updates.send(RowChange { table: table.clone(), pk });
					}
				}
				Err(err) => debug!("update-hook scan failed for {}: {}", table, err),
			}
		}
	}
}

#[async_trait]
impl CrdtStore for CrdtStoreSqlite {
	fn node_id(&self) -> &str {
		&self.node_id_hex
	}

	async fn exec(&self, sql: &str, params: &[Value]) -> SyResult<u64> {
		let _guard = self.write_lock.lock().await;
		let before = self.current_version().await?;

		let mut query = sqlx::query(sql);
		for param in params {
			query = bind_param(query, param);
		}
		let result = query.execute(&self.pool).await.map_err(store_err)?;

		let after = self.current_version().await?;
		if after > before {
			self.notify_changes(before).await;
		}
		Ok(result.rows_affected())
	}

	async fn query(&self, sql: &str, params: &[Value]) -> SyResult<Vec<Row>> {
		let mut query = sqlx::query(sql);
		for param in params {
			query = bind_param(query, param);
		}
		let rows = query.fetch_all(&self.pool).await.map_err(store_err)?;

		let mut out = Vec::with_capacity(rows.len());
		for row in &rows {
			let mut obj = serde_json::Map::new();
			for (idx, col) in row.columns().iter().enumerate() {
				obj.insert(col.name().to_string(), column_value(row, idx)?);
			}
			out.push(obj);
		}
		Ok(out)
	}

	async fn enable_crdt(&self, table: &str) -> SyResult<()> {
		let _guard = self.write_lock.lock().await;
		let info = schema::inspect_table(&self.pool, table).await?;
		schema::install_tracking(&self.pool, table, &info).await?;
		self.registry.write().await.insert(table.to_string(), info);
		info!("crdt tracking enabled for table {}", table);
		Ok(())
	}

	async fn version(&self) -> SyResult<i64> {
		self.current_version().await
	}

	async fn changes_since(&self, version: i64) -> SyResult<Vec<ChangeRecord>> {
		let registry = self.registry.read().await;
		merge::changes_since(&self.pool, &registry, version).await
	}

	async fn apply_changes(&self, records: &[ChangeRecord]) -> SyResult<()> {
		if records.is_empty() {
			return Ok(());
		}
		let _guard = self.write_lock.lock().await;
		let before = self.current_version().await?;
		{
			let registry = self.registry.read().await;
			merge::apply_changes(&self.pool, &registry, records).await?;
		}
		self.notify_changes(before).await;
		Ok(())
	}

	fn subscribe(&self) -> broadcast::Receiver<RowChange> {
		self.updates.subscribe()
	}
}

// vim: ts=4
