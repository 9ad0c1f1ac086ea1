//! Root discovery
//!
//! Walks registered roots and keeps the file table current. The scanner
//! never blocks on downstream stages: its only output is file rows and
//! checksum queue entries, both plain store writes.

use crate::store::entities::root;
use crate::store::{ActivityKind, Change, NewActivity, ObservedFile, Store, StoreError};
use serde_json::json;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub mod excludes;
pub mod watcher;

pub use excludes::ExcludeSet;
pub use watcher::Watchers;

#[derive(Debug, thiserror::Error)]
pub enum ScanError {
	#[error(transparent)]
	Store(#[from] StoreError),

	#[error("root path does not exist: {0}")]
	MissingRoot(PathBuf),
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ScanSummary {
	pub files_seen: u64,
	pub files_new: u64,
	pub files_changed: u64,
	pub errors: u64,
}

pub struct Scanner {
	store: Arc<Store>,
	cancel: CancellationToken,
}

impl Scanner {
	pub fn new(store: Arc<Store>, cancel: CancellationToken) -> Self {
		Self { store, cancel }
	}

	pub fn store(&self) -> &Arc<Store> {
		&self.store
	}

	pub async fn load_excludes(&self) -> Result<ExcludeSet, StoreError> {
		let patterns = self
			.store
			.list_excludes()
			.await?
			.into_iter()
			.map(|e| e.pattern);
		Ok(ExcludeSet::new(patterns))
	}

	pub async fn scan_root_id(&self, root_id: i32) -> Result<ScanSummary, ScanError> {
		let root = self.store.get_root(root_id).await?;
		self.scan(&root).await
	}

	/// Full walk of one root, honoring exclude patterns.
	pub async fn scan(&self, root: &root::Model) -> Result<ScanSummary, ScanError> {
		let root_path = PathBuf::from(&root.path);
		if !root_path.is_dir() {
			return Err(ScanError::MissingRoot(root_path));
		}

		self.store
			.append_activity(
				NewActivity::new(ActivityKind::ScanStarted)
					.root(root.id)
					.path(&root.path),
			)
			.await?;

		let summary = self.walk(root, &root_path).await?;

		self.store
			.append_activity(
				NewActivity::new(ActivityKind::ScanComplete)
					.root(root.id)
					.path(&root.path)
					.details(json!({
						"files_seen": summary.files_seen,
						"files_new": summary.files_new,
						"files_changed": summary.files_changed,
						"errors": summary.errors,
					})),
			)
			.await?;
		info!(
			"Scan of {} finished: {} seen, {} new, {} changed, {} errors",
			root.path, summary.files_seen, summary.files_new, summary.files_changed, summary.errors
		);
		Ok(summary)
	}

	/// Depth-first walk from `start` (the root path itself, or a subtree
	/// that a watcher saw appear). Symlinks are recorded, never followed.
	pub(crate) async fn walk(
		&self,
		root: &root::Model,
		start: &Path,
	) -> Result<ScanSummary, ScanError> {
		let excludes = self.load_excludes().await?;
		let root_path = Path::new(&root.path);
		let mut summary = ScanSummary::default();
		let mut stack = vec![start.to_path_buf()];

		while let Some(dir) = stack.pop() {
			if self.cancel.is_cancelled() {
				break;
			}

			let mut entries = match tokio::fs::read_dir(&dir).await {
				Ok(entries) => entries,
				Err(e) => {
					warn!("Cannot read {}: {}", dir.display(), e);
					summary.errors += 1;
					continue;
				}
			};

			loop {
				let entry = match entries.next_entry().await {
					Ok(Some(entry)) => entry,
					Ok(None) => break,
					Err(e) => {
						warn!("Cannot read entry in {}: {}", dir.display(), e);
						summary.errors += 1;
						break;
					}
				};
				let path = entry.path();
				let relative = path.strip_prefix(root_path).unwrap_or(&path);
				if excludes.matches(relative) {
					debug!("Excluded {}", path.display());
					continue;
				}

				// DirEntry metadata does not traverse symlinks.
				let meta = match entry.metadata().await {
					Ok(meta) => meta,
					Err(e) => {
						warn!("Cannot stat {}: {}", path.display(), e);
						summary.errors += 1;
						continue;
					}
				};

				if meta.is_dir() {
					if root.recursive {
						stack.push(path);
					}
					continue;
				}

				match self.observe(root, &path, &meta).await {
					Ok(change) => {
						summary.files_seen += 1;
						match change {
							Change::New => summary.files_new += 1,
							Change::Changed => summary.files_changed += 1,
							Change::Unchanged => {}
						}
					}
					Err(e) => {
						warn!("Failed to record {}: {}", path.display(), e);
						summary.errors += 1;
					}
				}
			}
		}
		Ok(summary)
	}

	/// Upsert one on-disk path into the store.
	pub(crate) async fn observe(
		&self,
		root: &root::Model,
		path: &Path,
		meta: &std::fs::Metadata,
	) -> Result<Change, StoreError> {
		let is_symlink = meta.file_type().is_symlink();
		let link_target = if is_symlink {
			tokio::fs::read_link(path)
				.await
				.ok()
				.map(|t| t.to_string_lossy().to_string())
		} else {
			None
		};

		let observation = self
			.store
			.record_observation(ObservedFile {
				path: path.to_string_lossy().to_string(),
				root_id: root.id,
				size: meta.len() as i64,
				mtime_ns: mtime_ns(meta),
				mode: meta.mode() as i32,
				uid: meta.uid() as i64,
				gid: meta.gid() as i64,
				is_symlink,
				link_target,
			})
			.await?;
		Ok(observation.change)
	}

	/// Scan every enabled root sequentially; used on startup and on
	/// explicit request.
	pub async fn scan_all(&self) -> Result<(), ScanError> {
		for root in self.store.list_roots().await? {
			if self.cancel.is_cancelled() {
				break;
			}
			if !root.enabled {
				continue;
			}
			if let Err(e) = self.scan(&root).await {
				warn!("Scan of {} failed: {}", root.path, e);
				self.store
					.append_activity(
						NewActivity::new(ActivityKind::Error)
							.root(root.id)
							.message(e.to_string()),
					)
					.await?;
			}
		}
		Ok(())
	}
}

pub(crate) fn mtime_ns(meta: &std::fs::Metadata) -> i64 {
	meta.mtime()
		.saturating_mul(1_000_000_000)
		.saturating_add(meta.mtime_nsec())
}
