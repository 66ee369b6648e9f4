//! Database schema initialization and CRDT tracking DDL.
//!
//! Bookkeeping tables are prefixed `crdt_`; each tracked table `t` gets a
//! companion clock table `t__crdt_clock` holding one row per (pk, column)
//! with the column version, the db version of the last write, the
//! originating replica, and the row's causal length. Triggers on the base
//! table keep the clock current for local writes; the `crdt_flags.applying`
//! bit suppresses them while remote batches are folded in.

use sqlx::{Row, SqlitePool};

use scrapyard::crdt_store::DELETE_SENTINEL;
use scrapyard::prelude::*;

/// Column layout of a tracked table, loaded from `crdt_tables`.
#[derive(Debug, Clone)]
pub(crate) struct TrackedTable {
	pub pk_col: String,
	pub cols: Vec<String>,
}

impl TrackedTable {
	pub fn clock(&self, table: &str) -> String {
		format!("{table}__crdt_clock")
	}

	pub fn has_col(&self, col: &str) -> bool {
		self.cols.iter().any(|c| c == col)
	}
}

/// Identifiers are interpolated into DDL and trigger bodies; only plain
/// SQL identifiers are accepted.
pub(crate) fn check_ident(name: &str) -> SyResult<()> {
	let ok = !name.is_empty()
		&& name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
		&& !name.chars().next().is_some_and(|c| c.is_ascii_digit());
	if ok {
		Ok(())
	} else {
		Err(Error::StoreFailure(format!("invalid identifier: {name:?}")))
	}
}

pub(crate) async fn init_db(db: &SqlitePool) -> Result<(), sqlx::Error> {
	let mut tx = db.begin().await?;

	sqlx::query(
		"CREATE TABLE IF NOT EXISTS crdt_node (
			node_id blob NOT NULL
	)",
	)
	.execute(&mut *tx)
	.await?;

	sqlx::query(
		"CREATE TABLE IF NOT EXISTS crdt_db_version (
			version integer NOT NULL
	)",
	)
	.execute(&mut *tx)
	.await?;
	sqlx::query(
		"INSERT INTO crdt_db_version (version)
			SELECT 0 WHERE NOT EXISTS (SELECT 1 FROM crdt_db_version)",
	)
	.execute(&mut *tx)
	.await?;

	sqlx::query(
		"CREATE TABLE IF NOT EXISTS crdt_flags (
			applying integer NOT NULL
	)",
	)
	.execute(&mut *tx)
	.await?;
	sqlx::query(
		"INSERT INTO crdt_flags (applying)
			SELECT 0 WHERE NOT EXISTS (SELECT 1 FROM crdt_flags)",
	)
	.execute(&mut *tx)
	.await?;

	sqlx::query(
		"CREATE TABLE IF NOT EXISTS crdt_tables (
			tbl text NOT NULL,
			pk_col text NOT NULL,
			cols text NOT NULL,
			PRIMARY KEY(tbl)
	)",
	)
	.execute(&mut *tx)
	.await?;

	tx.commit().await
}

/// Read the tracked-table registry persisted in `crdt_tables`.
pub(crate) async fn load_registry(
	db: &SqlitePool,
) -> Result<Vec<(String, TrackedTable)>, sqlx::Error> {
	let rows = sqlx::query("SELECT tbl, pk_col, cols FROM crdt_tables ORDER BY tbl")
		.fetch_all(db)
		.await?;
	Ok(rows
		.into_iter()
		.map(|row| {
			let tbl: String = row.get(0);
			let pk_col: String = row.get(1);
			let cols: String = row.get(2);
			let cols = cols.split(',').map(str::to_owned).collect();
			(tbl, TrackedTable { pk_col, cols })
		})
		.collect())
}

/// Inspect a table's columns via `pragma_table_info`. Returns the single
/// primary-key column and the remaining (tracked) columns.
pub(crate) async fn inspect_table(db: &SqlitePool, table: &str) -> SyResult<TrackedTable> {
	let rows = sqlx::query("SELECT name, pk FROM pragma_table_info(?) ORDER BY cid")
		.bind(table)
		.fetch_all(db)
		.await
		.map_err(|err| Error::StoreFailure(err.to_string()))?;
	if rows.is_empty() {
		return Err(Error::StoreFailure(format!("no such table: {table}")));
	}

	let mut pk_col = None;
	let mut cols = Vec::new();
	for row in rows {
		let name: String = row.get(0);
		let pk: i64 = row.get(1);
		if pk == 1 && pk_col.is_none() {
			pk_col = Some(name);
		} else if pk > 0 {
			return Err(Error::StoreFailure(format!(
				"table {table} has a composite primary key; CRDT tracking needs a single pk column"
			)));
		} else {
			cols.push(name);
		}
	}
	let pk_col = pk_col
		.ok_or_else(|| Error::StoreFailure(format!("table {table} has no primary key")))?;

	Ok(TrackedTable { pk_col, cols })
}

/// Create the clock table and local-write triggers for a tracked table.
/// Idempotent; safe to run on every open.
pub(crate) async fn install_tracking(
	db: &SqlitePool,
	table: &str,
	info: &TrackedTable,
) -> SyResult<()> {
	check_ident(table)?;
	check_ident(&info.pk_col)?;
	for col in &info.cols {
		check_ident(col)?;
	}

	let clock = info.clock(table);
	let pk = &info.pk_col;

	let mut tx = db.begin().await.map_err(|err| Error::StoreFailure(err.to_string()))?;

	sqlx::query(&format!(
		"CREATE TABLE IF NOT EXISTS {clock} (
			pk text NOT NULL,
			cid text NOT NULL,
			col_version integer NOT NULL,
			db_version integer NOT NULL,
			site_id blob NOT NULL,
			cl integer NOT NULL DEFAULT 1,
			seq integer NOT NULL DEFAULT 0,
			PRIMARY KEY(pk, cid)
	)"
	))
	.execute(&mut *tx)
	.await
	.map_err(|err| Error::StoreFailure(err.to_string()))?;
	sqlx::query(&format!(
		"CREATE INDEX IF NOT EXISTS idx_{clock}_dbv ON {clock}(db_version)"
	))
	.execute(&mut *tx)
	.await
	.map_err(|err| Error::StoreFailure(err.to_string()))?;

	// Insert: one db-version bump for the row, one clock row per column.
	// The row's causal length resurrects over any tombstone left behind by
	// an earlier local delete of the same key.
	let mut body = String::from("\tUPDATE crdt_db_version SET version = version + 1;\n");
	for (seq, col) in info.cols.iter().enumerate() {
		body.push_str(&format!(
			"\tINSERT INTO {clock} (pk, cid, col_version, db_version, site_id, cl, seq)\n\
			\tVALUES (\n\
			\t\tNEW.{pk}, '{col}',\n\
			\t\tCOALESCE((SELECT col_version FROM {clock} WHERE pk = NEW.{pk} AND cid = '{col}'), 0) + 1,\n\
			\t\t(SELECT version FROM crdt_db_version),\n\
			\t\t(SELECT node_id FROM crdt_node),\n\
			\t\tCOALESCE((SELECT cl FROM {clock} WHERE pk = NEW.{pk} AND cid = '{sentinel}'), 0) + 1,\n\
			\t\t{seq}\n\
			\t)\n\
			\tON CONFLICT(pk, cid) DO UPDATE SET\n\
			\t\tcol_version = excluded.col_version, db_version = excluded.db_version,\n\
			\t\tsite_id = excluded.site_id, cl = excluded.cl, seq = excluded.seq;\n",
			sentinel = DELETE_SENTINEL,
		));
	}
	body.push_str(&format!(
		"\tDELETE FROM {clock} WHERE pk = NEW.{pk} AND cid = '{}';\n",
		DELETE_SENTINEL
	));
	sqlx::query(&format!(
		"CREATE TRIGGER IF NOT EXISTS {table}__crdt_insert AFTER INSERT ON {table}\n\
		WHEN (SELECT applying FROM crdt_flags) = 0\n\
		BEGIN\n{body}END"
	))
	.execute(&mut *tx)
	.await
	.map_err(|err| Error::StoreFailure(err.to_string()))?;

	// Update: one trigger per column so untouched columns keep their clock.
	for col in &info.cols {
		sqlx::query(&format!(
			"CREATE TRIGGER IF NOT EXISTS {table}__crdt_update_{col} AFTER UPDATE OF {col} ON {table}\n\
			WHEN (SELECT applying FROM crdt_flags) = 0\n\
			BEGIN\n\
			\tUPDATE crdt_db_version SET version = version + 1;\n\
			\tINSERT INTO {clock} (pk, cid, col_version, db_version, site_id, cl, seq)\n\
			\tVALUES (\n\
			\t\tNEW.{pk}, '{col}',\n\
			\t\tCOALESCE((SELECT col_version FROM {clock} WHERE pk = NEW.{pk} AND cid = '{col}'), 0) + 1,\n\
			\t\t(SELECT version FROM crdt_db_version),\n\
			\t\t(SELECT node_id FROM crdt_node),\n\
			\t\tCOALESCE((SELECT MAX(cl) FROM {clock} WHERE pk = NEW.{pk} AND cid != '{sentinel}'), 1),\n\
			\t\t0\n\
			\t)\n\
			\tON CONFLICT(pk, cid) DO UPDATE SET\n\
			\t\tcol_version = excluded.col_version, db_version = excluded.db_version,\n\
			\t\tsite_id = excluded.site_id, cl = excluded.cl, seq = excluded.seq;\n\
			END",
			sentinel = DELETE_SENTINEL,
		))
		.execute(&mut *tx)
		.await
		.map_err(|err| Error::StoreFailure(err.to_string()))?;
	}

	// Delete: drop the column clocks and leave a tombstone with an even
	// causal length so stale column writes cannot resurrect the row.
	sqlx::query(&format!(
		"CREATE TRIGGER IF NOT EXISTS {table}__crdt_delete AFTER DELETE ON {table}\n\
		WHEN (SELECT applying FROM crdt_flags) = 0\n\
		BEGIN\n\
		\tUPDATE crdt_db_version SET version = version + 1;\n\
		\tINSERT INTO {clock} (pk, cid, col_version, db_version, site_id, cl, seq)\n\
		\tVALUES (\n\
		\t\tOLD.{pk}, '{sentinel}',\n\
		\t\t1,\n\
		\t\t(SELECT version FROM crdt_db_version),\n\
		\t\t(SELECT node_id FROM crdt_node),\n\
		\t\tCOALESCE((SELECT MAX(cl) FROM {clock} WHERE pk = OLD.{pk}), 1) + 1,\n\
		\t\t0\n\
		\t)\n\
		\tON CONFLICT(pk, cid) DO UPDATE SET\n\
		\t\tcol_version = excluded.col_version, db_version = excluded.db_version,\n\
		\t\tsite_id = excluded.site_id, cl = excluded.cl, seq = excluded.seq;\n\
		\tDELETE FROM {clock} WHERE pk = OLD.{pk} AND cid != '{sentinel}';\n\
		END",
		sentinel = DELETE_SENTINEL,
	))
	.execute(&mut *tx)
	.await
	.map_err(|err| Error::StoreFailure(err.to_string()))?;

	sqlx::query(
		"INSERT INTO crdt_tables (tbl, pk_col, cols) VALUES (?, ?, ?)
			ON CONFLICT(tbl) DO UPDATE SET pk_col = excluded.pk_col, cols = excluded.cols",
	)
	.bind(table)
	.bind(pk)
	.bind(info.cols.join(","))
	.execute(&mut *tx)
	.await
	.map_err(|err| Error::StoreFailure(err.to_string()))?;

	tx.commit().await.map_err(|err| Error::StoreFailure(err.to_string()))
}

// vim: ts=4
