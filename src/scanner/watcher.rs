//! Filesystem watching
//!
//! One recursive notify watcher per enabled root. Events are debounced per
//! path so an editor save produces a single work item; on debounce fire the
//! same upsert/enqueue transaction as a scan runs. Platform overflow
//! triggers a full rescan of the affected root.

use super::{ExcludeSet, Scanner};
use crate::store::entities::root;
use crate::store::{ActivityKind, FileFilter, NewActivity, Store};
use notify::event::Flag;
use notify::{EventKind, RecursiveMode, Watcher as _};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const TICK: Duration = Duration::from_millis(250);

/// Manages the per-root watcher tasks.
pub struct Watchers {
	scanner: Arc<Scanner>,
	store: Arc<Store>,
	debounce: Duration,
	cancel: CancellationToken,
	enabled: bool,
	roots: Mutex<HashMap<i32, CancellationToken>>,
}

impl Watchers {
	pub fn new(
		scanner: Arc<Scanner>,
		store: Arc<Store>,
		debounce: Duration,
		cancel: CancellationToken,
		enabled: bool,
	) -> Self {
		Self {
			scanner,
			store,
			debounce,
			cancel,
			enabled,
			roots: Mutex::new(HashMap::new()),
		}
	}

	pub async fn start_all(&self) {
		if !self.enabled {
			return;
		}
		match self.store.list_roots().await {
			Ok(roots) => {
				for root in roots.into_iter().filter(|r| r.enabled) {
					self.start(root);
				}
			}
			Err(e) => warn!("Cannot list roots for watching: {}", e),
		}
	}

	pub fn start(&self, root: root::Model) {
		if !self.enabled {
			return;
		}
		let mut roots = self.roots.lock().expect("watcher registry poisoned");
		if roots.contains_key(&root.id) {
			return;
		}
		let token = self.cancel.child_token();
		roots.insert(root.id, token.clone());
		drop(roots);

		let scanner = self.scanner.clone();
		let store = self.store.clone();
		let debounce = self.debounce;
		tokio::spawn(async move {
			watch_loop(scanner, store, root, debounce, token).await;
		});
	}

	pub fn stop(&self, root_id: i32) {
		if let Some(token) = self
			.roots
			.lock()
			.expect("watcher registry poisoned")
			.remove(&root_id)
		{
			token.cancel();
		}
	}

	pub fn active_count(&self) -> usize {
		self.roots.lock().map(|r| r.len()).unwrap_or(0)
	}
}

async fn watch_loop(
	scanner: Arc<Scanner>,
	store: Arc<Store>,
	root: root::Model,
	debounce: Duration,
	cancel: CancellationToken,
) {
	let (tx, mut rx) = mpsc::unbounded_channel();
	let mut watcher = match notify::recommended_watcher(move |res| {
		let _ = tx.send(res);
	}) {
		Ok(watcher) => watcher,
		Err(e) => {
			warn!("Cannot create watcher for {}: {}", root.path, e);
			return;
		}
	};

	let mode = if root.recursive {
		RecursiveMode::Recursive
	} else {
		RecursiveMode::NonRecursive
	};
	if let Err(e) = watcher.watch(Path::new(&root.path), mode) {
		warn!("Cannot watch {}: {}", root.path, e);
		let _ = store
			.append_activity(
				NewActivity::new(ActivityKind::Error)
					.root(root.id)
					.message(format!("watch failed: {e}")),
			)
			.await;
		return;
	}
	info!("Watching {}", root.path);

	let mut pending: HashMap<PathBuf, Instant> = HashMap::new();
	let mut tick = tokio::time::interval(TICK);
	tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

	loop {
		tokio::select! {
			_ = cancel.cancelled() => break,
			event = rx.recv() => match event {
				None => break,
				Some(Ok(event)) => {
					if event.attrs.flag() == Some(Flag::Rescan) {
						recover(&scanner, &store, &root).await;
						pending.clear();
						continue;
					}
					match event.kind {
						EventKind::Create(_)
						| EventKind::Modify(_)
						| EventKind::Remove(_)
						| EventKind::Any => {
							let now = Instant::now();
							for path in event.paths {
								pending.insert(path, now);
							}
						}
						_ => {}
					}
				}
				Some(Err(e)) => {
					warn!("Watcher error on {}: {}", root.path, e);
					recover(&scanner, &store, &root).await;
					pending.clear();
				}
			},
			_ = tick.tick() => {
				let now = Instant::now();
				let due: Vec<PathBuf> = pending
					.iter()
					.filter(|(_, seen)| now.duration_since(**seen) >= debounce)
					.map(|(path, _)| path.clone())
					.collect();
				if due.is_empty() {
					continue;
				}
				let excludes = match scanner.load_excludes().await {
					Ok(excludes) => excludes,
					// Store hiccup: keep the paths pending for the next tick.
					Err(e) => {
						warn!("Cannot load excludes: {}", e);
						continue;
					}
				};
				for path in due {
					pending.remove(&path);
					settle_path(&scanner, &store, &root, &excludes, &path).await;
				}
			}
		}
	}
	debug!("Watcher for {} stopped", root.path);
}

/// A debounced path has gone quiet: reconcile it with the store.
async fn settle_path(
	scanner: &Scanner,
	store: &Store,
	root: &root::Model,
	excludes: &ExcludeSet,
	path: &Path,
) {
	let relative = path.strip_prefix(&root.path).unwrap_or(path);
	if excludes.matches(relative) {
		return;
	}

	match std::fs::symlink_metadata(path) {
		Ok(meta) if meta.is_dir() => {
			// A directory appeared (created or moved in): walk the subtree.
			if let Err(e) = scanner.walk(root, path).await {
				warn!("Subtree walk of {} failed: {}", path.display(), e);
			}
		}
		Ok(meta) => {
			if let Err(e) = scanner.observe(root, path, &meta).await {
				warn!("Failed to record {}: {}", path.display(), e);
			}
		}
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
			settle_deletion(store, path).await;
		}
		Err(e) => {
			warn!("Cannot stat {}: {}", path.display(), e);
		}
	}
}

/// Soft-drop the path itself and, when it was a directory, every tracked
/// file underneath it.
async fn settle_deletion(store: &Store, path: &Path) {
	let path_str = path.to_string_lossy();
	if let Err(e) = store.record_deletion(&path_str).await {
		warn!("Failed to record deletion of {}: {}", path_str, e);
	}

	let prefix = format!("{path_str}/");
	let children = store
		.list_files(FileFilter {
			path_prefix: Some(prefix),
			limit: 10_000,
			..Default::default()
		})
		.await;
	match children {
		Ok(children) => {
			for child in children {
				if let Err(e) = store.record_deletion(&child.path).await {
					warn!("Failed to record deletion of {}: {}", child.path, e);
				}
			}
		}
		Err(e) => warn!("Cannot enumerate children of {}: {}", path_str, e),
	}
}

/// The notifier dropped events; trust nothing and rescan the root.
async fn recover(scanner: &Scanner, store: &Store, root: &root::Model) {
	warn!("Watcher overflow on {}, rescanning", root.path);
	let _ = store
		.append_activity(
			NewActivity::new(ActivityKind::ScanRecovered)
				.root(root.id)
				.path(&root.path),
		)
		.await;
	if let Err(e) = scanner.scan(root).await {
		warn!("Recovery scan of {} failed: {}", root.path, e);
	}
}
