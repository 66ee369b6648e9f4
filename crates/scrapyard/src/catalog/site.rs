//! The `sites` table: schema and row mapping.
//!
//! Every column a remote replica can write carries a default so partial
//! column batches can materialize a row before the rest of it arrives.

use serde_json::Value;

use scrapyard_types::crdt_store::Row;

use crate::prelude::*;

pub(crate) const SITES_TABLE: &str = "sites";

pub(crate) const SITES_DDL: &str = "CREATE TABLE IF NOT EXISTS sites (
	id text NOT NULL,
	name text NOT NULL DEFAULT '',
	description text NOT NULL DEFAULT '',
	url text NOT NULL DEFAULT '',
	thumbnail text NOT NULL DEFAULT '',
	owner_id text NOT NULL DEFAULT '',
	content_hash text,
	file_count integer NOT NULL DEFAULT 0,
	file_size integer NOT NULL DEFAULT 0,
	added_at text NOT NULL DEFAULT '',
	updated_at text NOT NULL DEFAULT '',
	PRIMARY KEY(id)
)";

pub(crate) fn site_from_row(row: Row) -> SyResult<Site> {
	Ok(serde_json::from_value(Value::Object(row))?)
}

pub(crate) fn sites_from_rows(rows: Vec<Row>) -> SyResult<Vec<Site>> {
	rows.into_iter().map(site_from_row).collect()
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;

	#[test]
	fn site_parses_from_query_row() {
		let row = json!({
			"id": "abc",
			"name": "Alpha",
			"description": "",
			"url": "",
			"thumbnail": "",
			"owner_id": "cafe",
			"content_hash": null,
			"file_count": 3,
			"file_size": 130_000,
			"added_at": "2026-08-01T00:00:00.000Z",
			"updated_at": "2026-08-01T00:00:00.000Z"
		});
		let Value::Object(row) = row else { unreachable!() };
		let site = site_from_row(row).expect("parse");
		assert_eq!(site.name, "Alpha");
		assert_eq!(site.content_hash, None);
		assert_eq!(site.file_size, 130_000);
	}
}

// vim: ts=4
