//! Filesystem-backed local content store.
//!
//! Each site gets a subtree under the base directory:
//!
//! ```text
//! {base}/{site_id}/data/{path}        blob bytes
//! {base}/{site_id}/meta/{path}.json   { contentType, size, cachedAt }
//! ```
//!
//! The data tree mirrors the site's own layout, so a cached bundle on disk
//! looks like the site it came from. Listings walk the meta tree.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

use scrapyard::content_store::{ContentStore, FileMeta, FileRecord};
use scrapyard::prelude::*;

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BlobMeta {
	content_type: String,
	size: u64,
	cached_at: i64,
}

/// Reject ids that could escape the site directory.
fn check_site_id(site_id: &str) -> SyResult<()> {
	let ok = !site_id.is_empty()
		&& site_id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
	if ok {
		Ok(())
	} else {
		Err(Error::StoreFailure(format!("invalid site id: {site_id:?}")))
	}
}

/// Site-relative paths are forward-slash separated, never absolute, and
/// never traverse upward.
fn check_path(path: &str) -> SyResult<()> {
	let ok = !path.is_empty()
		&& !path.starts_with('/')
		&& !path.contains('\\')
		&& !path.contains('\0')
		&& path.split('/').all(|seg| !seg.is_empty() && seg != "." && seg != "..");
	if ok {
		Ok(())
	} else {
		Err(Error::StoreFailure(format!("invalid blob path: {path:?}")))
	}
}

#[derive(Debug)]
pub struct ContentStoreFs {
	base_dir: PathBuf,
}

impl ContentStoreFs {
	pub async fn new(base_dir: impl AsRef<Path>) -> SyResult<Self> {
		let base_dir = base_dir.as_ref().to_path_buf();
		tokio::fs::create_dir_all(&base_dir).await?;
		Ok(Self { base_dir })
	}

	fn data_path(&self, site_id: &str, path: &str) -> PathBuf {
		self.base_dir.join(site_id).join("data").join(path)
	}

	fn meta_path(&self, site_id: &str, path: &str) -> PathBuf {
		self.base_dir.join(site_id).join("meta").join(format!("{path}.json"))
	}

	/// Sibling of the data file; the store is single-writer per path, so a
	/// deterministic name cannot collide.
	fn tmp_path(&self, site_id: &str, path: &str) -> PathBuf {
		self.base_dir.join(site_id).join("data").join(format!("{path}.tmp~"))
	}

	/// Walk the meta tree of a site, yielding site-relative blob paths in
	/// sorted order.
	async fn walk_meta(&self, site_id: &str) -> SyResult<Vec<String>> {
		let root = self.base_dir.join(site_id).join("meta");
		let mut stack = vec![root.clone()];
		let mut paths = Vec::new();

		while let Some(dir) = stack.pop() {
			let mut entries = match tokio::fs::read_dir(&dir).await {
				Ok(entries) => entries,
				Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
				Err(err) => return Err(err.into()),
			};
			while let Some(entry) = entries.next_entry().await? {
				let path = entry.path();
				if entry.file_type().await?.is_dir() {
					stack.push(path);
				} else if path.extension().is_some_and(|ext| ext == "json") {
					let rel = path
						.strip_prefix(&root)
						.map_err(|_| Error::StoreFailure("meta path outside root".into()))?;
					let rel = rel.to_string_lossy().replace(std::path::MAIN_SEPARATOR, "/");
					if let Some(stripped) = rel.strip_suffix(".json") {
						paths.push(stripped.to_string());
					}
				}
			}
		}

		paths.sort();
		Ok(paths)
	}

	async fn read_meta(&self, site_id: &str, path: &str) -> SyResult<Option<BlobMeta>> {
		match tokio::fs::read(self.meta_path(site_id, path)).await {
			Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
			Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
			Err(err) => Err(err.into()),
		}
	}
}

#[async_trait]
impl ContentStore for ContentStoreFs {
	async fn put(&self, site_id: &str, path: &str, data: &[u8], content_type: &str)
		-> SyResult<()> {
		check_site_id(site_id)?;
		check_path(path)?;

		let data_path = self.data_path(site_id, path);
		let meta_path = self.meta_path(site_id, path);
		if let Some(parent) = data_path.parent() {
			tokio::fs::create_dir_all(parent).await?;
		}
		if let Some(parent) = meta_path.parent() {
			tokio::fs::create_dir_all(parent).await?;
		}

		// Write beside the target and rename into place, so a crashed or
		// failed write never leaves a truncated blob under the real key.
		let tmp_path = self.tmp_path(site_id, path);
		let written: SyResult<()> = async {
			let mut file = tokio::fs::File::create(&tmp_path).await?;
			file.write_all(data).await?;
			file.flush().await?;
			tokio::fs::rename(&tmp_path, &data_path).await?;
			Ok(())
		}
		.await;
		if written.is_err() {
			debug!("blob write failed, removing tmpfile {:?}", tmp_path);
			let _ = tokio::fs::remove_file(&tmp_path).await;
			return written;
		}

		let meta = BlobMeta {
			content_type: content_type.to_string(),
			size: data.len() as u64,
			cached_at: Timestamp::now().0,
		};
		tokio::fs::write(&meta_path, serde_json::to_vec(&meta)?).await?;

		debug!("stored blob {}/{} ({} bytes)", site_id, path, data.len());
		Ok(())
	}

	async fn get(&self, site_id: &str, path: &str) -> SyResult<Option<FileRecord>> {
		check_site_id(site_id)?;
		check_path(path)?;

		let Some(meta) = self.read_meta(site_id, path).await? else {
			return Ok(None);
		};
		let data = match tokio::fs::read(self.data_path(site_id, path)).await {
			Ok(data) => data,
			Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
			Err(err) => return Err(err.into()),
		};

		Ok(Some(FileRecord {
			path: path.to_string(),
			content_type: meta.content_type,
			size: data.len() as u64,
			data,
			cached_at: Timestamp(meta.cached_at),
		}))
	}

	async fn list(&self, site_id: &str) -> SyResult<Vec<FileMeta>> {
		check_site_id(site_id)?;

		let mut out = Vec::new();
		for path in self.walk_meta(site_id).await? {
			if let Some(meta) = self.read_meta(site_id, &path).await? {
				out.push(FileMeta { path, size: meta.size, content_type: meta.content_type });
			}
		}
		Ok(out)
	}

	async fn delete_site(&self, site_id: &str) -> SyResult<()> {
		check_site_id(site_id)?;
		match tokio::fs::remove_dir_all(self.base_dir.join(site_id)).await {
			Ok(()) => Ok(()),
			Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
			Err(err) => Err(err.into()),
		}
	}

	async fn copy_site(&self, from_id: &str, to_id: &str) -> SyResult<()> {
		check_site_id(from_id)?;
		check_site_id(to_id)?;

		for path in self.walk_meta(from_id).await? {
			if let Some(record) = self.get(from_id, &path).await? {
				self.put(to_id, &path, &record.data, &record.content_type).await?;
			}
		}
		Ok(())
	}

	async fn size(&self, site_id: &str) -> SyResult<u64> {
		check_site_id(site_id)?;
		let mut total = 0;
		for path in self.walk_meta(site_id).await? {
			if let Some(meta) = self.read_meta(site_id, &path).await? {
				total += meta.size;
			}
		}
		Ok(total)
	}

	async fn total_size(&self) -> SyResult<u64> {
		let mut total = 0;
		let mut entries = tokio::fs::read_dir(&self.base_dir).await?;
		while let Some(entry) = entries.next_entry().await? {
			if entry.file_type().await?.is_dir() {
				let site_id = entry.file_name().to_string_lossy().to_string();
				if check_site_id(&site_id).is_ok() {
					total += self.size(&site_id).await?;
				}
			}
		}
		Ok(total)
	}
}

// vim: ts=4
