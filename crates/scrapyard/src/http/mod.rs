//! Local HTTP interceptor: serves `/local/{siteId}/...` from the content
//! store, applying index-file fallbacks so cached bundles behave like a
//! plain static web server.

use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use std::sync::Arc;

use scrapyard_types::content_store::{ContentStore, FileRecord};

use crate::prelude::*;

type Store = Arc<dyn ContentStore>;

/// Build the interceptor router. The embedding application mounts and
/// serves it.
pub fn router(store: Store) -> Router {
	Router::new()
		.route("/local/{site_id}", get(serve_root))
		.route("/local/{site_id}/", get(serve_root))
		.route("/local/{site_id}/{*path}", get(serve_path))
		.with_state(store)
}

async fn serve_root(State(store): State<Store>, Path(site_id): Path<String>) -> Response {
	respond(&store, &site_id, "").await
}

async fn serve_path(
	State(store): State<Store>,
	Path((site_id, path)): Path<(String, String)>,
) -> Response {
	respond(&store, &site_id, &path).await
}

async fn respond(store: &Store, site_id: &str, rest: &str) -> Response {
	if !path_is_safe(rest) {
		return not_found(store, site_id, rest).await;
	}

	match resolve(store, site_id, rest).await {
		Ok(Some(record)) => {
			debug!("serving /local/{}/{} ({})", site_id, record.path, record.content_type);
			(
				StatusCode::OK,
				[
					(header::CONTENT_TYPE, record.content_type),
					(header::HeaderName::from_static("x-origin"), "cached".to_string()),
				],
				record.data,
			)
				.into_response()
		}
		Ok(None) => not_found(store, site_id, rest).await,
		Err(err) => {
			warn!("serving /local/{}/{} failed: {}", site_id, rest, err);
			(StatusCode::INTERNAL_SERVER_ERROR, "internal error\n").into_response()
		}
	}
}

/// Fallback chain: exact path, `.html` suffix, directory index, then any
/// top-level html file for the site root.
async fn resolve(store: &Store, site_id: &str, rest: &str) -> SyResult<Option<FileRecord>> {
	let mut fp = if rest.is_empty() { "index.html".to_string() } else { rest.to_string() };
	if fp.ends_with('/') {
		fp.push_str("index.html");
	}

	if let Some(record) = store.get(site_id, &fp).await? {
		return Ok(Some(record));
	}

	// A directory-looking path (no dot extension) may really be a page or
	// a directory with its own index.
	let last_segment = fp.rsplit('/').next().unwrap_or(&fp);
	if !last_segment.contains('.') {
		if let Some(record) = store.get(site_id, &format!("{fp}.html")).await? {
			return Ok(Some(record));
		}
		if let Some(record) = store.get(site_id, &format!("{fp}/index.html")).await? {
			return Ok(Some(record));
		}
	}

	// Site root with no canonical index: fall back to any top-level html.
	if rest.is_empty() || rest == "/" {
		let files = store.list(site_id).await?;
		let top_level = |path: &str| !path.contains('/');
		let candidate = files
			.iter()
			.find(|f| top_level(&f.path) && f.path.eq_ignore_ascii_case("index.html"))
			.or_else(|| {
				files.iter().find(|f| top_level(&f.path) && f.path.ends_with(".html"))
			});
		if let Some(meta) = candidate {
			return store.get(site_id, &meta.path).await;
		}
	}

	Ok(None)
}

async fn not_found(store: &Store, site_id: &str, rest: &str) -> Response {
	let listing = match store.list(site_id).await {
		Ok(files) if !files.is_empty() => {
			let mut body = String::from("Available files:\n");
			for file in files {
				body.push_str("  ");
				body.push_str(&file.path);
				body.push('\n');
			}
			body
		}
		_ => String::from("No files cached for this site.\n"),
	};
	let body = format!("Not found: /local/{site_id}/{rest}\n\n{listing}");
	(StatusCode::NOT_FOUND, body).into_response()
}

fn path_is_safe(path: &str) -> bool {
	!path.contains('\0')
		&& !path.contains('\\')
		&& path.split('/').all(|seg| seg != ".." && seg != ".")
}


// vim: ts=4
