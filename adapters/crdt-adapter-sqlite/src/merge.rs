//! Change-set extraction and remote-batch folding.
//!
//! A change record carries the *current* value of one column together with
//! its column version, the db version of the write, the originating replica
//! id, and the row's causal length. Merging is per-column last-writer-wins:
//! higher column version wins, ties break on the larger replica id. Row
//! deletion travels as a sentinel record whose even causal length shadows
//! every column write of an earlier row generation.

use base64::{engine::general_purpose::STANDARD, Engine};
use sqlx::{Row as _, SqlitePool};
use std::collections::HashMap;

use scrapyard::crdt_store::{ChangeRecord, DELETE_SENTINEL};
use scrapyard::prelude::*;

use crate::schema::TrackedTable;
use crate::{bind_param, column_value, store_err};

pub(crate) async fn changes_since(
	db: &SqlitePool,
	registry: &HashMap<String, TrackedTable>,
	version: i64,
) -> SyResult<Vec<ChangeRecord>> {
	let mut out = Vec::new();

	for (table, info) in registry {
		let clock = info.clock(table);
		let pk = &info.pk_col;

		let mut parts = Vec::with_capacity(info.cols.len() + 1);
		for col in &info.cols {
			parts.push(format!(
				"SELECT c.pk AS pk, c.cid AS cid, t.{col} AS val, c.col_version, c.db_version, \
				c.site_id, c.cl, c.seq \
				FROM {clock} c LEFT JOIN {table} t ON t.{pk} = c.pk \
				WHERE c.db_version > ? AND c.cid = '{col}'"
			));
		}
		parts.push(format!(
			"SELECT c.pk AS pk, c.cid AS cid, NULL AS val, c.col_version, c.db_version, \
			c.site_id, c.cl, c.seq \
			FROM {clock} c WHERE c.db_version > ? AND c.cid = '{DELETE_SENTINEL}'"
		));
		let sql = parts.join(" UNION ALL ");

		let mut query = sqlx::query(&sql);
		for _ in 0..parts.len() {
			query = query.bind(version);
		}
		let rows = query.fetch_all(db).await.map_err(store_err)?;

		for row in &rows {
			let pk: String = row.try_get(0).map_err(store_err)?;
			let site_id: Vec<u8> = row.try_get(5).map_err(store_err)?;
			out.push(ChangeRecord {
				table: table.clone(),
				pk: STANDARD.encode(pk.as_bytes()),
				cid: row.try_get(1).map_err(store_err)?,
				val: column_value(row, 2)?,
				col_version: row.try_get(3).map_err(store_err)?,
				db_version: row.try_get(4).map_err(store_err)?,
				site_id: STANDARD.encode(&site_id),
				cl: row.try_get(6).map_err(store_err)?,
				seq: row.try_get(7).map_err(store_err)?,
			});
		}
	}

	out.sort_by_key(|rec| (rec.db_version, rec.seq));
	Ok(out)
}

/// Fold a remote batch in a single transaction. Local-write triggers are
/// suppressed via the `crdt_flags.applying` bit for the duration; the bit
/// is only ever visible inside this transaction.
pub(crate) async fn apply_changes(
	db: &SqlitePool,
	registry: &HashMap<String, TrackedTable>,
	records: &[ChangeRecord],
) -> SyResult<()> {
	let mut tx = db.begin().await.map_err(store_err)?;

	sqlx::query("UPDATE crdt_flags SET applying = 1")
		.execute(&mut *tx)
		.await
		.map_err(store_err)?;
	sqlx::query("UPDATE crdt_db_version SET version = version + 1")
		.execute(&mut *tx)
		.await
		.map_err(store_err)?;
	let local_version: i64 = sqlx::query_scalar("SELECT version FROM crdt_db_version")
		.fetch_one(&mut *tx)
		.await
		.map_err(store_err)?;

	for (seq, rec) in records.iter().enumerate() {
		let Some(info) = registry.get(&rec.table) else {
			warn!("change for untracked table {} dropped", rec.table);
			continue;
		};
		let clock = info.clock(&rec.table);

		let pk_bytes = STANDARD.decode(&rec.pk).map_err(|_| Error::Parse)?;
		let pk = String::from_utf8(pk_bytes).map_err(|_| Error::Parse)?;
		let site_id = STANDARD.decode(&rec.site_id).map_err(|_| Error::Parse)?;

		let tombstone_cl: Option<i64> =
			sqlx::query_scalar(&format!("SELECT cl FROM {clock} WHERE pk = ? AND cid = ?"))
				.bind(&pk)
				.bind(DELETE_SENTINEL)
				.fetch_optional(&mut *tx)
				.await
				.map_err(store_err)?;

		if rec.cid == DELETE_SENTINEL {
			if tombstone_cl.is_some_and(|cl| cl >= rec.cl) {
				continue;
			}
			let alive_cl: Option<i64> = sqlx::query_scalar(&format!(
				"SELECT MAX(cl) FROM {clock} WHERE pk = ? AND cid != ?"
			))
			.bind(&pk)
			.bind(DELETE_SENTINEL)
			.fetch_one(&mut *tx)
			.await
			.map_err(store_err)?;
			if alive_cl.unwrap_or(0) > rec.cl {
				// The row was re-created in a later generation; the delete
				// is stale.
				continue;
			}

			sqlx::query(&format!("DELETE FROM {} WHERE {} = ?", rec.table, info.pk_col))
				.bind(&pk)
				.execute(&mut *tx)
				.await
				.map_err(store_err)?;
			sqlx::query(&format!("DELETE FROM {clock} WHERE pk = ? AND cid != ?"))
				.bind(&pk)
				.bind(DELETE_SENTINEL)
				.execute(&mut *tx)
				.await
				.map_err(store_err)?;
			upsert_clock(&mut tx, &clock, &pk, DELETE_SENTINEL, rec.col_version, local_version, &site_id, rec.cl, seq as i64)
				.await?;
			continue;
		}

		if !info.has_col(&rec.cid) {
			warn!("change for unknown column {}.{} dropped", rec.table, rec.cid);
			continue;
		}

		if let Some(cl) = tombstone_cl {
			if cl >= rec.cl {
				// Row is deleted in this or a later generation.
				continue;
			}
			// Resurrection: the record belongs to a newer row generation.
			sqlx::query(&format!("DELETE FROM {clock} WHERE pk = ? AND cid = ?"))
				.bind(&pk)
				.bind(DELETE_SENTINEL)
				.execute(&mut *tx)
				.await
				.map_err(store_err)?;
		}

		let local: Option<(i64, Vec<u8>)> = sqlx::query_as(&format!(
			"SELECT col_version, site_id FROM {clock} WHERE pk = ? AND cid = ?"
		))
		.bind(&pk)
		.bind(&rec.cid)
		.fetch_optional(&mut *tx)
		.await
		.map_err(store_err)?;

		let wins = match &local {
			None => true,
			Some((col_version, their_site)) => {
				rec.col_version > *col_version
					|| (rec.col_version == *col_version && site_id > *their_site)
			}
		};
		if !wins {
			continue;
		}

		let upsert_sql = format!(
			"INSERT INTO {table} ({pk_col}, {cid}) VALUES (?, ?) \
			ON CONFLICT({pk_col}) DO UPDATE SET {cid} = excluded.{cid}",
			table = rec.table,
			pk_col = info.pk_col,
			cid = rec.cid,
		);
		let update = sqlx::query(&upsert_sql).bind(&pk);
		bind_param(update, &rec.val).execute(&mut *tx).await.map_err(store_err)?;

		upsert_clock(&mut tx, &clock, &pk, &rec.cid, rec.col_version, local_version, &site_id, rec.cl.max(1), seq as i64)
			.await?;
	}

	sqlx::query("UPDATE crdt_flags SET applying = 0")
		.execute(&mut *tx)
		.await
		.map_err(store_err)?;
	tx.commit().await.map_err(store_err)
}

#[allow(clippy::too_many_arguments)]
async fn upsert_clock(
	tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
	clock: &str,
	pk: &str,
	cid: &str,
	col_version: i64,
	db_version: i64,
	site_id: &[u8],
	cl: i64,
	seq: i64,
) -> SyResult<()> {
	sqlx::query(&format!(
		"INSERT INTO {clock} (pk, cid, col_version, db_version, site_id, cl, seq) \
		VALUES (?, ?, ?, ?, ?, ?, ?) \
		ON CONFLICT(pk, cid) DO UPDATE SET \
			col_version = excluded.col_version, db_version = excluded.db_version, \
			site_id = excluded.site_id, cl = excluded.cl, seq = excluded.seq"
	))
	.bind(pk)
	.bind(cid)
	.bind(col_version)
	.bind(db_version)
	.bind(site_id)
	.bind(cl)
	.bind(seq)
	.execute(&mut **tx)
	.await
	.map_err(store_err)?;
	Ok(())
}

// vim: ts=4
