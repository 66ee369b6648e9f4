//! Replica merge semantics: convergence, idempotence, per-column
//! last-writer-wins, and tombstone behavior.

use scrapyard_crdt_adapter_sqlite::CrdtStoreSqlite;
use scrapyard::crdt_store::CrdtStore;
use serde_json::{json, Value};
use tempfile::TempDir;

async fn open_store(dir: &TempDir, name: &str) -> CrdtStoreSqlite {
	CrdtStoreSqlite::open(dir.path(), name).await.expect("Failed to open store")
}

async fn init_sites(store: &CrdtStoreSqlite) {
	store
		.exec(
			"CREATE TABLE IF NOT EXISTS sites (
				id text NOT NULL,
				name text DEFAULT '',
				description text DEFAULT '',
				PRIMARY KEY(id)
			)",
			&[],
		)
		.await
		.expect("Failed to create table");
	store.enable_crdt("sites").await.expect("Failed to enable crdt");
}

/// Push every change one replica has to the other, both directions.
async fn exchange(a: &CrdtStoreSqlite, b: &CrdtStoreSqlite) {
	let from_a = a.changes_since(0).await.expect("changes from a");
	b.apply_changes(&from_a).await.expect("apply to b");
	let from_b = b.changes_since(0).await.expect("changes from b");
	a.apply_changes(&from_b).await.expect("apply to a");
}

async fn snapshot(store: &CrdtStoreSqlite) -> Vec<scrapyard::crdt_store::Row> {
	store
		.query("SELECT id, name, description FROM sites ORDER BY id", &[])
		.await
		.expect("snapshot")
}

#[tokio::test]
async fn replicas_converge_after_exchange() {
	let dir_a = TempDir::new().expect("tempdir");
	let dir_b = TempDir::new().expect("tempdir");
	let a = open_store(&dir_a, "catalog").await;
	let b = open_store(&dir_b, "catalog").await;
	init_sites(&a).await;
	init_sites(&b).await;

	a.exec("INSERT INTO sites (id, name) VALUES (?, ?)", &[json!("s-alpha"), json!("Alpha")])
		.await
		.expect("insert a");
	b.exec("INSERT INTO sites (id, name) VALUES (?, ?)", &[json!("s-beta"), json!("Beta")])
		.await
		.expect("insert b");

	exchange(&a, &b).await;
	// A second round must not disturb anything.
	exchange(&b, &a).await;

	let rows_a = snapshot(&a).await;
	let rows_b = snapshot(&b).await;
	assert_eq!(rows_a.len(), 2);
	assert_eq!(rows_a, rows_b);
}

#[tokio::test]
async fn apply_is_idempotent() {
	let dir_a = TempDir::new().expect("tempdir");
	let dir_b = TempDir::new().expect("tempdir");
	let a = open_store(&dir_a, "catalog").await;
	let b = open_store(&dir_b, "catalog").await;
	init_sites(&a).await;
	init_sites(&b).await;

	a.exec(
		"INSERT INTO sites (id, name, description) VALUES (?, ?, ?)",
		&[json!("s1"), json!("Alpha"), json!("first")],
	)
	.await
	.expect("insert");

	let batch = a.changes_since(0).await.expect("changes");
	b.apply_changes(&batch).await.expect("first apply");
	let once = snapshot(&b).await;
	b.apply_changes(&batch).await.expect("second apply");
	let twice = snapshot(&b).await;

	assert_eq!(once, twice);
}

#[tokio::test]
async fn concurrent_updates_merge_per_column() {
	let dir_a = TempDir::new().expect("tempdir");
	let dir_b = TempDir::new().expect("tempdir");
	let a = open_store(&dir_a, "catalog").await;
	let b = open_store(&dir_b, "catalog").await;
	init_sites(&a).await;
	init_sites(&b).await;

	a.exec(
		"INSERT INTO sites (id, name, description) VALUES (?, ?, ?)",
		&[json!("s1"), json!("Alpha"), json!("first")],
	)
	.await
	.expect("insert");
	exchange(&a, &b).await;

	// Disjoint columns touched concurrently: both edits must survive.
	a.exec("UPDATE sites SET name = ? WHERE id = ?", &[json!("Alpha!"), json!("s1")])
		.await
		.expect("update a");
	b.exec("UPDATE sites SET description = ? WHERE id = ?", &[json!("second"), json!("s1")])
		.await
		.expect("update b");
	exchange(&a, &b).await;

	let rows_a = snapshot(&a).await;
	let rows_b = snapshot(&b).await;
	assert_eq!(rows_a, rows_b);
	assert_eq!(rows_a[0].get("name"), Some(&json!("Alpha!")));
	assert_eq!(rows_a[0].get("description"), Some(&json!("second")));
}

#[tokio::test]
async fn concurrent_same_column_updates_converge() {
	let dir_a = TempDir::new().expect("tempdir");
	let dir_b = TempDir::new().expect("tempdir");
	let a = open_store(&dir_a, "catalog").await;
	let b = open_store(&dir_b, "catalog").await;
	init_sites(&a).await;
	init_sites(&b).await;

	a.exec("INSERT INTO sites (id, name) VALUES (?, ?)", &[json!("s1"), json!("Alpha")])
		.await
		.expect("insert");
	exchange(&a, &b).await;

	a.exec("UPDATE sites SET name = ? WHERE id = ?", &[json!("from-a"), json!("s1")])
		.await
		.expect("update a");
	b.exec("UPDATE sites SET name = ? WHERE id = ?", &[json!("from-b"), json!("s1")])
		.await
		.expect("update b");
	exchange(&a, &b).await;
	exchange(&b, &a).await;

	let name_a = snapshot(&a).await[0].get("name").cloned();
	let name_b = snapshot(&b).await[0].get("name").cloned();
	assert_eq!(name_a, name_b, "same-column conflict must resolve identically");
	assert!(
		name_a == Some(json!("from-a")) || name_a == Some(json!("from-b")),
		"winner must be one of the written values"
	);
}

#[tokio::test]
async fn delete_tombstone_propagates_and_shadows_stale_updates() {
	let dir_a = TempDir::new().expect("tempdir");
	let dir_b = TempDir::new().expect("tempdir");
	let a = open_store(&dir_a, "catalog").await;
	let b = open_store(&dir_b, "catalog").await;
	init_sites(&a).await;
	init_sites(&b).await;

	a.exec("INSERT INTO sites (id, name) VALUES (?, ?)", &[json!("s1"), json!("Alpha")])
		.await
		.expect("insert");
	exchange(&a, &b).await;

	// B edits while A deletes; the delete is a newer row generation and
	// must win on both sides.
	b.exec("UPDATE sites SET name = ? WHERE id = ?", &[json!("stale"), json!("s1")])
		.await
		.expect("update b");
	a.exec("DELETE FROM sites WHERE id = ?", &[json!("s1")]).await.expect("delete a");

	exchange(&a, &b).await;
	exchange(&b, &a).await;

	assert!(snapshot(&a).await.is_empty());
	assert!(snapshot(&b).await.is_empty());
}

#[tokio::test]
async fn changes_relay_through_an_intermediate_replica() {
	let dirs: Vec<TempDir> = (0..3).map(|_| TempDir::new().expect("tempdir")).collect();
	let a = open_store(&dirs[0], "catalog").await;
	let b = open_store(&dirs[1], "catalog").await;
	let c = open_store(&dirs[2], "catalog").await;
	for store in [&a, &b, &c] {
		init_sites(store).await;
	}

	a.exec("INSERT INTO sites (id, name) VALUES (?, ?)", &[json!("s1"), json!("Alpha")])
		.await
		.expect("insert");

	// A -> B, then B -> C without C ever talking to A.
	let from_a = a.changes_since(0).await.expect("changes a");
	b.apply_changes(&from_a).await.expect("apply b");
	let from_b = b.changes_since(0).await.expect("changes b");
	c.apply_changes(&from_b).await.expect("apply c");

	let rows = snapshot(&c).await;
	assert_eq!(rows.len(), 1);
	assert_eq!(rows[0].get("name"), Some(&json!("Alpha")));

	// The relayed record must still carry A's replica id.
	let rec = from_b
		.iter()
		.find(|rec| rec.cid == "name")
		.expect("relayed name change");
	let origin: Value = json!(rec.site_id.clone());
	let direct = from_a.iter().find(|r| r.cid == "name").expect("original");
	assert_eq!(origin, json!(direct.site_id.clone()));
}
