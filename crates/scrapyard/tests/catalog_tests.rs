//! Catalog engine tests: the site API, ownership, adoption, and
//! replica-to-replica convergence through the store layer.

use std::sync::Arc;
use tempfile::TempDir;

use scrapyard::{Catalog, Config};
use scrapyard_blob_adapter_fs::ContentStoreFs;
use scrapyard_crdt_adapter_sqlite::CrdtStoreSqlite;
use scrapyard_types::crdt_store::CrdtStore;
use scrapyard_types::types::{NewSite, Patch, SiteUpdate};

async fn create_catalog() -> (Catalog, Arc<CrdtStoreSqlite>, TempDir) {
	let dir = TempDir::new().expect("tempdir");
	let store = Arc::new(
		CrdtStoreSqlite::open(dir.path().join("db"), "scrap_yard_test")
			.await
			.expect("open store"),
	);
	let content = Arc::new(
		ContentStoreFs::new(dir.path().join("blobs")).await.expect("open content store"),
	);
	let catalog = Catalog::init(Config::default(), store.clone(), content)
		.await
		.expect("init catalog");
	(catalog, store, dir)
}

/// Exchange all catalog changes between two replicas, both directions.
async fn exchange(a: &Arc<CrdtStoreSqlite>, b: &Arc<CrdtStoreSqlite>) {
	let from_a = a.changes_since(0).await.expect("changes from a");
	b.apply_changes(&from_a).await.expect("apply to b");
	let from_b = b.changes_since(0).await.expect("changes from b");
	a.apply_changes(&from_b).await.expect("apply to a");
}

#[tokio::test]
async fn add_assigns_identity_and_ownership() {
	let (catalog, _store, _dir) = create_catalog().await;

	let site = catalog
		.add(NewSite { name: "Alpha".into(), description: "α".into(), ..Default::default() })
		.await
		.expect("add");

	assert_eq!(site.id.len(), 36, "site id should be a string-encoded UUID");
	assert_eq!(site.owner_id, catalog.node_id());
	assert!(site.added_at.ends_with('Z'));
	assert_eq!(site.added_at, site.updated_at);

	let mine = catalog.my_sites().await.expect("my sites");
	assert_eq!(mine.len(), 1);
	assert_eq!(mine[0].name, "Alpha");

	// Own sites are never "available" to fetch.
	assert!(catalog.available_sites().await.expect("available").is_empty());
}

#[tokio::test]
async fn update_patches_columns_and_missing_id_is_null() {
	let (catalog, _store, _dir) = create_catalog().await;

	let site = catalog
		.add(NewSite { name: "Alpha".into(), ..Default::default() })
		.await
		.expect("add");

	let updated = catalog
		.update(
			&site.id,
			SiteUpdate {
				name: Patch::Value("Alpha 2".into()),
				description: Patch::Value("renamed".into()),
				..Default::default()
			},
		)
		.await
		.expect("update")
		.expect("row");
	assert_eq!(updated.name, "Alpha 2");
	assert_eq!(updated.description, "renamed");
	assert_eq!(updated.added_at, site.added_at, "added_at is immutable");

	let missing = catalog
		.update("no-such-id", SiteUpdate { name: Patch::Value("x".into()), ..Default::default() })
		.await
		.expect("update should not error");
	assert!(missing.is_none());
}

#[tokio::test]
async fn remove_is_idempotent() {
	let (catalog, _store, _dir) = create_catalog().await;

	let site = catalog
		.add(NewSite { name: "Alpha".into(), ..Default::default() })
		.await
		.expect("add");

	catalog.remove(&site.id).await.expect("remove");
	assert!(catalog.get(&site.id).await.expect("get").is_none());
	catalog.remove(&site.id).await.expect("remove again");
}

#[tokio::test]
async fn file_stats_and_hash_dedup() {
	let (catalog, _store, _dir) = create_catalog().await;

	let site = catalog
		.add(NewSite {
			name: "Alpha".into(),
			content_hash: Some("cafebabe".into()),
			..Default::default()
		})
		.await
		.expect("add");

	catalog.update_file_stats(&site.id, 3, 130_000).await.expect("stats");
	let site = catalog.get(&site.id).await.expect("get").expect("row");
	assert_eq!(site.file_count, 3);
	assert_eq!(site.file_size, 130_000);

	let found = catalog.find_mine_by_hash("cafebabe").await.expect("find");
	assert_eq!(found.map(|s| s.id), Some(site.id));
	assert!(catalog.find_mine_by_hash("deadbeef").await.expect("find").is_none());
}

#[tokio::test]
async fn two_replicas_see_each_others_sites() {
	let (catalog_a, store_a, _dir_a) = create_catalog().await;
	let (catalog_b, store_b, _dir_b) = create_catalog().await;

	catalog_a
		.add(NewSite { name: "Alpha".into(), description: "α".into(), ..Default::default() })
		.await
		.expect("add alpha");
	catalog_b
		.add(NewSite { name: "Beta".into(), ..Default::default() })
		.await
		.expect("add beta");

	exchange(&store_a, &store_b).await;

	let mut names_a: Vec<String> =
		catalog_a.all_sites().await.expect("all").into_iter().map(|s| s.name).collect();
	let mut names_b: Vec<String> =
		catalog_b.all_sites().await.expect("all").into_iter().map(|s| s.name).collect();
	names_a.sort();
	names_b.sort();
	assert_eq!(names_a, vec!["Alpha", "Beta"]);
	assert_eq!(names_a, names_b);

	let mine_a = catalog_a.my_sites().await.expect("mine");
	assert_eq!(mine_a.len(), 1);
	assert_eq!(mine_a[0].name, "Alpha");
	let mine_b = catalog_b.my_sites().await.expect("mine");
	assert_eq!(mine_b.len(), 1);
	assert_eq!(mine_b[0].name, "Beta");
}

#[tokio::test]
async fn offline_replica_catches_up_after_join() {
	let (catalog_a, store_a, _dir_a) = create_catalog().await;
	let (catalog_b, store_b, _dir_b) = create_catalog().await;

	// No file stats yet: the owner has not finished ingesting.
	let gamma = catalog_a
		.add(NewSite { name: "Gamma".into(), ..Default::default() })
		.await
		.expect("add");

	// B joins later: the initial sync-request/sync-response exchange is
	// changes-since over the store.
	let changes = store_a.changes_since(0).await.expect("changes");
	store_b.apply_changes(&changes).await.expect("apply");

	let available = catalog_b.available_sites().await.expect("available");
	assert_eq!(available.len(), 1);
	assert_eq!(available[0].id, gamma.id);
	assert_eq!(available[0].owner_id, catalog_a.node_id());
	assert_eq!(available[0].file_count, 0, "a site without stats is still listed");
}

#[tokio::test]
async fn adoption_creates_an_owned_copy() {
	let (catalog_a, store_a, _dir_a) = create_catalog().await;
	let (catalog_b, store_b, _dir_b) = create_catalog().await;

	let original = catalog_a
		.add(NewSite {
			name: "Gamma".into(),
			description: "original".into(),
			url: "https://example.org".into(),
			thumbnail: "thumb.png".into(),
			file_count: 3,
			file_size: 130_000,
			..Default::default()
		})
		.await
		.expect("add");
	exchange(&store_a, &store_b).await;

	let (adopted, original_id) = catalog_b.adopt(&original.id).await.expect("adopt");
	assert_eq!(original_id, original.id);
	assert_ne!(adopted.id, original.id);
	assert_eq!(adopted.owner_id, catalog_b.node_id());
	assert_eq!(adopted.name, "Gamma");
	assert_eq!(adopted.description, "original");
	assert_eq!(adopted.url, "https://example.org");
	assert_eq!(adopted.thumbnail, "thumb.png");

	// The foreign original is still listed as available.
	let available = catalog_b.available_sites().await.expect("available");
	assert_eq!(available.len(), 1);
	assert_eq!(available[0].id, original.id);

	assert!(matches!(
		catalog_b.adopt("missing-id").await,
		Err(scrapyard_types::error::Error::NotFound)
	));
}

#[tokio::test]
async fn removal_propagates_between_replicas() {
	let (catalog_a, store_a, _dir_a) = create_catalog().await;
	let (catalog_b, store_b, _dir_b) = create_catalog().await;

	let site = catalog_a
		.add(NewSite { name: "Doomed".into(), ..Default::default() })
		.await
		.expect("add");
	exchange(&store_a, &store_b).await;
	assert!(catalog_b.get(&site.id).await.expect("get").is_some());

	catalog_a.remove(&site.id).await.expect("remove");
	exchange(&store_a, &store_b).await;

	assert!(catalog_a.get(&site.id).await.expect("get").is_none());
	assert!(catalog_b.get(&site.id).await.expect("get").is_none());

	// A later add by B is unaffected.
	let beta = catalog_b
		.add(NewSite { name: "Fresh".into(), ..Default::default() })
		.await
		.expect("add");
	exchange(&store_a, &store_b).await;
	assert!(catalog_a.get(&beta.id).await.expect("get").is_some());
}

#[tokio::test]
async fn connect_requires_configuration() {
	let (catalog, _store, _dir) = create_catalog().await;
	assert!(matches!(
		catalog.connect().await,
		Err(scrapyard_types::error::Error::ConfigurationMissing("signalingUrl"))
	));

	let dir = TempDir::new().expect("tempdir");
	let store = Arc::new(
		CrdtStoreSqlite::open(dir.path().join("db"), "scrap_yard_test")
			.await
			.expect("open store"),
	);
	let content =
		Arc::new(ContentStoreFs::new(dir.path().join("blobs")).await.expect("open content"));
	let config = Config {
		signaling_url: "ws://127.0.0.1:9".into(),
		token: None,
		..Default::default()
	};
	let catalog = Catalog::init(config, store, content).await.expect("init");
	assert!(matches!(
		catalog.connect().await,
		Err(scrapyard_types::error::Error::ConfigurationMissing("token"))
	));
}
