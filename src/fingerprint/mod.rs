//! Content fingerprinting
//!
//! A single worker drains `queue_pending_checksum`; the bottleneck is disk
//! I/O on one volume, so more workers would only fight over it. A hash is
//! committed only if the file's mtime held still across the read, otherwise
//! the entry is retried shortly and picks up the fresh observation.

use crate::backoff::backoff_delay;
use crate::scanner::mtime_ns;
use crate::store::{
	ActivityKind, ClaimedEntry, FileStatus, NewActivity, QueueKind, Store,
};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub mod hash;

pub use hash::{hash_file, EMPTY_SHA256};

#[derive(Debug, Clone)]
pub struct FingerprintConfig {
	pub chunk_size: usize,
	pub chunk_sleep: Option<Duration>,
	pub batch: u64,
	pub lease: Duration,
	pub max_attempts: u32,
	pub retry_base: Duration,
	pub retry_cap: Duration,
	pub poll_interval: Duration,
}

impl Default for FingerprintConfig {
	fn default() -> Self {
		Self {
			chunk_size: 1024 * 1024,
			chunk_sleep: None,
			batch: 16,
			lease: Duration::from_secs(60),
			max_attempts: 5,
			retry_base: Duration::from_secs(1),
			retry_cap: Duration::from_secs(300),
			poll_interval: Duration::from_secs(1),
		}
	}
}

pub struct Fingerprinter {
	store: Arc<Store>,
	config: FingerprintConfig,
	cancel: CancellationToken,
	active: Arc<AtomicBool>,
}

impl Fingerprinter {
	pub fn new(store: Arc<Store>, config: FingerprintConfig, cancel: CancellationToken) -> Self {
		Self {
			store,
			config,
			cancel,
			active: Arc::new(AtomicBool::new(false)),
		}
	}

	/// Shared flag reported by `/status`.
	pub fn active_flag(&self) -> Arc<AtomicBool> {
		self.active.clone()
	}

	pub fn spawn(self) -> JoinHandle<()> {
		tokio::spawn(self.run())
	}

	async fn run(self) {
		loop {
			if self.cancel.is_cancelled() {
				break;
			}

			let claims = match self
				.store
				.claim(QueueKind::PendingChecksum, self.config.batch, self.config.lease)
				.await
			{
				Ok(claims) => claims,
				Err(e) => {
					warn!("Checksum claim failed: {}", e);
					self.idle().await;
					continue;
				}
			};

			if claims.is_empty() {
				self.idle().await;
				continue;
			}

			self.active.store(true, Ordering::Relaxed);
			for claim in &claims {
				if self.cancel.is_cancelled() {
					break;
				}
				self.process_entry(claim).await;
			}
			self.active.store(false, Ordering::Relaxed);
		}
		debug!("Fingerprinter stopped");
	}

	async fn idle(&self) {
		tokio::select! {
			_ = self.cancel.cancelled() => {}
			_ = tokio::time::sleep(self.config.poll_interval) => {}
		}
	}

	pub(crate) async fn process_entry(&self, claim: &ClaimedEntry) {
		let file = match self.store.get_file(claim.file_id()).await {
			Ok(file) => file,
			// Row gone (root deleted); nothing to do.
			Err(_) => {
				let _ = self.store.complete(claim).await;
				return;
			}
		};
		if file.is_symlink || file.status() == FileStatus::Deleted {
			let _ = self.store.complete(claim).await;
			return;
		}

		let path = Path::new(&file.path);
		let before = match tokio::fs::symlink_metadata(path).await {
			Ok(meta) => meta,
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
				if self.store.complete(claim).await.unwrap_or(false) {
					let _ = self
						.store
						.append_activity(
							NewActivity::new(ActivityKind::FileMissing)
								.path(&file.path)
								.root(file.root_id),
						)
						.await;
				}
				return;
			}
			Err(e) => {
				self.retry_or_give_up(claim, &format!("stat failed: {e}")).await;
				return;
			}
		};

		// The scanner's record is the contract; a different mtime means a
		// newer observation is (or will be) in flight.
		if mtime_ns(&before) != file.mtime_ns {
			if let Err(e) = self
				.store
				.fail(claim, "changed before hashing", self.config.retry_base)
				.await
			{
				warn!("Cannot reschedule {}: {}", file.path, e);
			}
			return;
		}

		if let Err(e) = self.store.set_file_status(file.id, FileStatus::Hashing).await {
			warn!("Cannot mark {} hashing: {}", file.path, e);
		}

		let hashed = match hash_file(path, self.config.chunk_size, self.config.chunk_sleep).await {
			Ok(hashed) => hashed,
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
				if self.store.complete(claim).await.unwrap_or(false) {
					let _ = self
						.store
						.append_activity(
							NewActivity::new(ActivityKind::FileMissing)
								.path(&file.path)
								.root(file.root_id),
						)
						.await;
				}
				return;
			}
			Err(e) => {
				self.retry_or_give_up(claim, &format!("read failed: {e}")).await;
				return;
			}
		};

		// Discard the digest if the file moved under us mid-read.
		let after = match tokio::fs::symlink_metadata(path).await {
			Ok(meta) => meta,
			Err(_) => {
				let _ = self
					.store
					.fail(claim, "changed during hashing", self.config.retry_base)
					.await;
				return;
			}
		};
		if mtime_ns(&after) != file.mtime_ns {
			let _ = self
				.store
				.fail(claim, "changed during hashing", self.config.retry_base)
				.await;
			return;
		}

		match self
			.store
			.commit_fingerprint(claim, &hashed.sha256, after.len() as i64, mtime_ns(&after))
			.await
		{
			Ok(outcome) => debug!("Fingerprinted {}: {:?}", file.path, outcome),
			Err(e) => warn!("Cannot commit fingerprint for {}: {}", file.path, e),
		}
	}

	/// Transient failure: back off exponentially until attempts run out,
	/// then mark the file failed for good.
	async fn retry_or_give_up(&self, claim: &ClaimedEntry, error: &str) {
		let attempt = claim.attempts() as u32;
		if attempt + 1 >= self.config.max_attempts {
			if let Err(e) = self
				.store
				.fail_file(claim, error, ActivityKind::FingerprintFailed)
				.await
			{
				warn!("Cannot fail entry: {}", e);
			}
			return;
		}
		let delay = backoff_delay(self.config.retry_base, attempt, self.config.retry_cap);
		if let Err(e) = self.store.fail(claim, error, delay).await {
			warn!("Cannot reschedule entry: {}", e);
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::store::ObservedFile;

	const LEASE: Duration = Duration::from_secs(60);

	async fn fixture() -> (tempfile::TempDir, Arc<Store>, Fingerprinter) {
		let dir = tempfile::tempdir().unwrap();
		let store = Arc::new(Store::open_in_memory().await.unwrap());
		let worker = Fingerprinter::new(
			store.clone(),
			FingerprintConfig {
				retry_base: Duration::ZERO,
				..Default::default()
			},
			CancellationToken::new(),
		);
		(dir, store, worker)
	}

	async fn observe_on_disk(store: &Store, path: &Path) {
		let meta = std::fs::symlink_metadata(path).unwrap();
		store
			.record_observation(ObservedFile {
				path: path.to_string_lossy().to_string(),
				root_id: 1,
				size: meta.len() as i64,
				mtime_ns: mtime_ns(&meta),
				mode: 0o644,
				uid: 0,
				gid: 0,
				is_symlink: false,
				link_target: None,
			})
			.await
			.unwrap();
	}

	#[tokio::test]
	async fn fingerprints_and_queues_upload() {
		let (dir, store, worker) = fixture().await;
		let path = dir.path().join("a.txt");
		std::fs::write(&path, b"hello").unwrap();
		observe_on_disk(&store, &path).await;

		let claim = &store
			.claim(QueueKind::PendingChecksum, 1, LEASE)
			.await
			.unwrap()[0];
		worker.process_entry(claim).await;

		let file = store.get_file(claim.file_id()).await.unwrap();
		assert_eq!(file.status(), FileStatus::ReadyForUpload);
		assert_eq!(
			file.sha256.as_deref(),
			Some("2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824")
		);
		assert_eq!(
			store
				.claim(QueueKind::PendingUpload, 10, LEASE)
				.await
				.unwrap()
				.len(),
			1
		);
	}

	#[tokio::test]
	async fn zero_byte_file_gets_the_empty_hash() {
		let (dir, store, worker) = fixture().await;
		let path = dir.path().join("empty");
		std::fs::write(&path, b"").unwrap();
		observe_on_disk(&store, &path).await;

		let claim = &store
			.claim(QueueKind::PendingChecksum, 1, LEASE)
			.await
			.unwrap()[0];
		worker.process_entry(claim).await;

		let file = store.get_file(claim.file_id()).await.unwrap();
		assert_eq!(file.sha256.as_deref(), Some(EMPTY_SHA256));
		assert_eq!(file.status(), FileStatus::ReadyForUpload);
	}

	#[tokio::test]
	async fn missing_file_completes_with_event() {
		let (dir, store, worker) = fixture().await;
		let path = dir.path().join("gone.txt");
		std::fs::write(&path, b"soon gone").unwrap();
		observe_on_disk(&store, &path).await;
		std::fs::remove_file(&path).unwrap();

		let claim = &store
			.claim(QueueKind::PendingChecksum, 1, LEASE)
			.await
			.unwrap()[0];
		worker.process_entry(claim).await;

		assert!(store
			.claim(QueueKind::PendingChecksum, 10, LEASE)
			.await
			.unwrap()
			.is_empty());
		let missing = store
			.read_activity(0, 100, Some(ActivityKind::FileMissing))
			.await
			.unwrap();
		assert_eq!(missing.len(), 1);
	}

	#[tokio::test]
	async fn stale_observation_is_rescheduled_not_committed() {
		let (dir, store, worker) = fixture().await;
		let path = dir.path().join("busy.txt");
		std::fs::write(&path, b"v1").unwrap();

		// Record an observation whose mtime no longer matches the disk.
		store
			.record_observation(ObservedFile {
				path: path.to_string_lossy().to_string(),
				root_id: 1,
				size: 2,
				mtime_ns: 1,
				mode: 0o644,
				uid: 0,
				gid: 0,
				is_symlink: false,
				link_target: None,
			})
			.await
			.unwrap();

		let claim = &store
			.claim(QueueKind::PendingChecksum, 1, LEASE)
			.await
			.unwrap()[0];
		worker.process_entry(claim).await;

		let file = store.get_file(claim.file_id()).await.unwrap();
		assert!(file.sha256.is_none());

		// Entry came back for another attempt.
		let again = store
			.claim(QueueKind::PendingChecksum, 1, LEASE)
			.await
			.unwrap();
		assert_eq!(again.len(), 1);
		assert_eq!(again[0].attempts(), 1);
	}
}
