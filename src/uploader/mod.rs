//! Upload pipeline
//!
//! A bounded pool of workers drains `queue_pending_upload` against the
//! default server: bearer login (token cached on the server row), metadata
//! post, then a streamed content upload when the server does not already
//! hold that SHA-256. Workers are independent; the store is their only
//! coordination.

use crate::backoff::backoff_delay;
use crate::store::entities::file;
use crate::store::{
	ActivityKind, ClaimedEntry, FileStatus, NewActivity, QueueKind, Store,
};
use chrono::Utc;
use serde_json::json;
use std::os::unix::fs::MetadataExt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub mod client;

pub use client::{FileRecord, LoginGrant, PutFileResponse, RemoteClient, UploadError};

#[derive(Debug, Clone)]
pub struct UploaderConfig {
	pub parallel: usize,
	/// Attempt cap for local I/O failures. Remote outages are not capped:
	/// entries keep retrying with capped backoff until the server returns.
	pub max_attempts: u32,
	pub retry_base: Duration,
	pub retry_cap: Duration,
	pub metadata_timeout: Duration,
	pub upload_timeout: Duration,
	/// Content policy, shared with the control plane so `/uploads/trigger`
	/// can flip it at runtime.
	pub upload_content: Arc<AtomicBool>,
	pub lease: Duration,
	pub poll_interval: Duration,
	pub token_validity: Duration,
}

impl Default for UploaderConfig {
	fn default() -> Self {
		Self {
			parallel: 2,
			max_attempts: 5,
			retry_base: Duration::from_secs(1),
			retry_cap: Duration::from_secs(300),
			metadata_timeout: Duration::from_secs(10),
			upload_timeout: Duration::from_secs(3600),
			upload_content: Arc::new(AtomicBool::new(true)),
			lease: Duration::from_secs(900),
			poll_interval: Duration::from_secs(1),
			token_validity: Duration::from_secs(50 * 60),
		}
	}
}

pub struct Uploader {
	store: Arc<Store>,
	config: UploaderConfig,
	cancel: CancellationToken,
	hostname: String,
	ip_address: String,
	in_flight: Arc<AtomicUsize>,
}

impl Uploader {
	pub fn new(store: Arc<Store>, config: UploaderConfig, cancel: CancellationToken) -> Self {
		let hostname = whoami::fallible::hostname().unwrap_or_else(|_| "unknown".to_string());
		let ip_address = local_ip_address::local_ip()
			.map(|ip| ip.to_string())
			.unwrap_or_else(|_| "127.0.0.1".to_string());
		Self {
			store,
			config,
			cancel,
			hostname,
			ip_address,
			in_flight: Arc::new(AtomicUsize::new(0)),
		}
	}

	pub fn in_flight_counter(&self) -> Arc<AtomicUsize> {
		self.in_flight.clone()
	}

	pub fn spawn_pool(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
		info!("Starting {} upload workers", self.config.parallel);
		(0..self.config.parallel)
			.map(|idx| {
				let this = self.clone();
				tokio::spawn(async move { this.worker(idx).await })
			})
			.collect()
	}

	async fn worker(&self, idx: usize) {
		loop {
			if self.cancel.is_cancelled() {
				break;
			}

			let claims = match self
				.store
				.claim(QueueKind::PendingUpload, 1, self.config.lease)
				.await
			{
				Ok(claims) => claims,
				Err(e) => {
					warn!("Upload claim failed: {}", e);
					self.idle().await;
					continue;
				}
			};
			let Some(claim) = claims.into_iter().next() else {
				self.idle().await;
				continue;
			};

			self.in_flight.fetch_add(1, Ordering::Relaxed);
			// Shutdown cancels in-flight uploads; the claim simply lapses
			// and the entry is picked up again on the next start.
			tokio::select! {
				_ = self.cancel.cancelled() => {
					self.in_flight.fetch_sub(1, Ordering::Relaxed);
					break;
				}
				_ = self.process(&claim) => {
					self.in_flight.fetch_sub(1, Ordering::Relaxed);
				}
			}
		}
		debug!("Upload worker {} stopped", idx);
	}

	async fn idle(&self) {
		tokio::select! {
			_ = self.cancel.cancelled() => {}
			_ = tokio::time::sleep(self.config.poll_interval) => {}
		}
	}

	pub(crate) async fn process(&self, claim: &ClaimedEntry) {
		let file = match self.store.get_file(claim.file_id()).await {
			Ok(file) => file,
			Err(_) => {
				let _ = self.store.complete(claim).await;
				return;
			}
		};
		// Only a row the fingerprinter parked for upload is shippable. A
		// stale claim on a re-discovered or deleted path carries the old
		// sha256 against new stat fields; drop it and let the fresh
		// checksum pass drive the file.
		if !matches!(
			file.status(),
			FileStatus::ReadyForUpload | FileStatus::Uploading
		) {
			let _ = self.store.complete(claim).await;
			return;
		}
		let Some(sha256) = file.sha256.clone() else {
			// Not fingerprinted; a rescan will recreate proper work.
			let _ = self.store.complete(claim).await;
			return;
		};

		match self.ship(&file, &sha256).await {
			Ok(content_uploaded) => {
				if self.store.complete_upload(claim).await.unwrap_or(false) {
					let _ = self
						.store
						.append_activity(
							NewActivity::new(ActivityKind::UploadComplete)
								.path(&file.path)
								.root(file.root_id)
								.details(json!({
									"sha256": sha256,
									"content_uploaded": content_uploaded,
								})),
						)
						.await;
				}
			}
			Err(UploadError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
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
			}
			Err(UploadError::Unauthorized) => {
				warn!("Authentication failed uploading {}", file.path);
				let _ = self
					.store
					.fail_file(claim, "authentication failed", ActivityKind::UploadFailed)
					.await;
			}
			Err(UploadError::Io(e)) => {
				let error = format!("read failed: {e}");
				if claim.attempts() as u32 + 1 >= self.config.max_attempts {
					let _ = self
						.store
						.fail_file(claim, &error, ActivityKind::UploadFailed)
						.await;
				} else {
					let delay = backoff_delay(
						self.config.retry_base,
						claim.attempts() as u32,
						self.config.retry_cap,
					);
					let _ = self.store.fail(claim, &error, delay).await;
				}
			}
			Err(e) if e.is_transient() => {
				let delay = e
					.retry_after()
					.unwrap_or_else(|| {
						backoff_delay(
							self.config.retry_base,
							claim.attempts() as u32,
							self.config.retry_cap,
						)
					});
				debug!(
					"Upload of {} failed ({}), retrying in {:?}",
					file.path, e, delay
				);
				if let Err(e) = self.store.fail(claim, &e.to_string(), delay).await {
					warn!("Cannot reschedule upload: {}", e);
				}
			}
			Err(e) => {
				warn!("Upload of {} rejected: {}", file.path, e);
				let _ = self
					.store
					.fail_file(claim, &e.to_string(), ActivityKind::UploadFailed)
					.await;
			}
		}
	}

	/// One full per-file protocol round. Returns whether content was
	/// actually streamed.
	async fn ship(&self, file: &file::Model, sha256: &str) -> Result<bool, UploadError> {
		let server = self
			.store
			.default_server()
			.await?
			.ok_or(UploadError::NoServer)?;
		let client = RemoteClient::new(
			&server.base_url,
			self.config.metadata_timeout,
			self.config.upload_timeout,
		)?;

		let record = self.build_record(file, sha256).await?;
		self.store
			.set_file_status(file.id, FileStatus::Uploading)
			.await?;

		let mut token = self.ensure_token(&client, &server).await?;
		let put = match client.put_file(&token, &record).await {
			Ok(put) => put,
			// Stale token: evict, refresh once, retry immediately. A second
			// 401 surfaces to the caller.
			Err(UploadError::Unauthorized) => {
				self.store.clear_token(server.id).await?;
				token = self.fresh_token(&client, &server).await?;
				client.put_file(&token, &record).await?
			}
			Err(e) => return Err(e),
		};

		if !put.upload_required || !self.config.upload_content.load(Ordering::Relaxed) {
			debug!(
				"No content needed for {} (dedup or metadata-only)",
				file.path
			);
			return Ok(false);
		}

		let size = record.file_size.max(0) as u64;
		self.store
			.append_activity(
				NewActivity::new(ActivityKind::UploadStarted)
					.path(&file.path)
					.root(file.root_id)
					.details(json!({ "file_size": size })),
			)
			.await?;

		let mut result = self
			.stream_content(&client, &token, sha256, file, size)
			.await;
		// The token can expire mid-round during a long upload; same policy
		// as the metadata post: evict, refresh once, retry. A second 401
		// surfaces to the caller.
		if matches!(result, Err(UploadError::Unauthorized)) {
			self.store.clear_token(server.id).await?;
			let token = self.fresh_token(&client, &server).await?;
			result = self
				.stream_content(&client, &token, sha256, file, size)
				.await;
		}

		match result {
			Ok(()) => Ok(true),
			Err(e) => {
				let _ = self
					.store
					.append_activity(
						NewActivity::new(ActivityKind::UploadFailed)
							.path(&file.path)
							.root(file.root_id)
							.message(e.to_string()),
					)
					.await;
				Err(e)
			}
		}
	}

	/// One content-upload attempt with its progress monitor attached.
	async fn stream_content(
		&self,
		client: &RemoteClient,
		token: &str,
		sha256: &str,
		file: &file::Model,
		size: u64,
	) -> Result<(), UploadError> {
		let (progress_tx, progress_rx) = mpsc::unbounded_channel();
		let monitor = spawn_progress(self.store.clone(), file.path.clone(), size, progress_rx);
		let result = client
			.upload_file(
				token,
				sha256,
				&self.hostname,
				&file.path,
				Path::new(&file.path),
				size,
				progress_tx,
			)
			.await;
		let _ = monitor.await;
		result
	}

	async fn ensure_token(
		&self,
		client: &RemoteClient,
		server: &crate::store::entities::server::Model,
	) -> Result<String, UploadError> {
		if let (Some(token), Some(expiry)) = (&server.token, server.token_expiry) {
			if expiry > Utc::now() + chrono::Duration::seconds(60) {
				return Ok(token.clone());
			}
		}
		self.fresh_token(client, server).await
	}

	async fn fresh_token(
		&self,
		client: &RemoteClient,
		server: &crate::store::entities::server::Model,
	) -> Result<String, UploadError> {
		let grant = client.login(&server.username, &server.secret).await?;
		let expiry = Utc::now()
			+ chrono::Duration::milliseconds(self.config.token_validity.as_millis() as i64);
		self.store
			.store_token(server.id, &grant.access_token, expiry)
			.await?;
		Ok(grant.access_token)
	}

	async fn build_record(
		&self,
		file: &file::Model,
		sha256: &str,
	) -> Result<FileRecord, UploadError> {
		let meta = tokio::fs::symlink_metadata(&file.path).await?;
		Ok(FileRecord {
			filepath: file.path.clone(),
			hostname: self.hostname.clone(),
			ip_address: self.ip_address.clone(),
			sha256: sha256.to_string(),
			file_size: file.size,
			file_mode: file.mode,
			file_uid: file.uid,
			file_gid: file.gid,
			file_mtime: file.mtime_ns as f64 / 1e9,
			file_atime: meta.atime() as f64 + meta.atime_nsec() as f64 / 1e9,
			file_ctime: meta.ctime() as f64 + meta.ctime_nsec() as f64 / 1e9,
			is_symlink: file.is_symlink,
			link_target: file.link_target.clone(),
		})
	}
}

/// Turn the raw byte counts from the stream into throttled
/// `upload_progress` events (roughly every 5%).
fn spawn_progress(
	store: Arc<Store>,
	path: String,
	size: u64,
	mut rx: mpsc::UnboundedReceiver<u64>,
) -> JoinHandle<()> {
	tokio::spawn(async move {
		let mut last_pct = 0u64;
		while let Some(sent) = rx.recv().await {
			if size == 0 {
				continue;
			}
			let pct = (sent * 100 / size).min(100);
			if pct >= last_pct + 5 || (sent == size && pct > last_pct) {
				last_pct = pct;
				let _ = store
					.append_activity(
						NewActivity::new(ActivityKind::UploadProgress)
							.path(&path)
							.details(json!({
								"bytes_uploaded": sent,
								"progress_percent": pct,
							})),
					)
					.await;
			}
		}
	})
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::store::{NewServer, ObservedFile};
	use axum::extract::State;
	use axum::http::HeaderMap;
	use axum::routing::post;
	use axum::{Json, Router};
	use std::sync::atomic::AtomicUsize;

	#[derive(Default)]
	struct MockRemote {
		logins: AtomicUsize,
		puts: AtomicUsize,
		uploads: AtomicUsize,
		/// Treat the first issued token as expired at `put_file`.
		reject_first_token: bool,
		/// Treat the first issued token as expired at `upload_file`.
		reject_first_token_on_upload: bool,
		upload_required: bool,
	}

	async fn mock_login(State(state): State<Arc<MockRemote>>) -> Json<serde_json::Value> {
		let n = state.logins.fetch_add(1, Ordering::SeqCst) + 1;
		Json(serde_json::json!({
			"access_token": format!("token-{n}"),
			"token_type": "bearer",
		}))
	}

	async fn mock_put_file(
		State(state): State<Arc<MockRemote>>,
		headers: HeaderMap,
		Json(record): Json<serde_json::Value>,
	) -> Result<Json<serde_json::Value>, axum::http::StatusCode> {
		let bearer = headers
			.get("authorization")
			.and_then(|v| v.to_str().ok())
			.unwrap_or_default()
			.to_string();
		if state.reject_first_token && bearer == "Bearer token-1" {
			return Err(axum::http::StatusCode::UNAUTHORIZED);
		}
		assert_eq!(record["sha256"].as_str().unwrap().len(), 64);
		assert!(record["file_mtime"].is_f64() || record["file_mtime"].is_number());
		state.puts.fetch_add(1, Ordering::SeqCst);
		Ok(Json(serde_json::json!({
			"upload_required": state.upload_required,
		})))
	}

	async fn mock_upload(
		State(state): State<Arc<MockRemote>>,
		headers: HeaderMap,
		body: axum::body::Bytes,
	) -> axum::http::StatusCode {
		let bearer = headers
			.get("authorization")
			.and_then(|v| v.to_str().ok())
			.unwrap_or_default();
		if state.reject_first_token_on_upload && bearer == "Bearer token-1" {
			return axum::http::StatusCode::UNAUTHORIZED;
		}
		assert!(!body.is_empty());
		state.uploads.fetch_add(1, Ordering::SeqCst);
		axum::http::StatusCode::OK
	}

	async fn serve_mock(state: Arc<MockRemote>) -> String {
		let app = Router::new()
			.route("/api/login", post(mock_login))
			.route("/put_file", post(mock_put_file))
			.route("/upload_file/{sha256}", post(mock_upload))
			.with_state(state);
		let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
		let addr = listener.local_addr().unwrap();
		tokio::spawn(async move {
			let _ = axum::serve(listener, app).await;
		});
		format!("http://{addr}")
	}

	async fn ready_file(store: &Store, path: &Path) -> ClaimedEntry {
		let meta = std::fs::symlink_metadata(path).unwrap();
		store
			.record_observation(ObservedFile {
				path: path.to_string_lossy().to_string(),
				root_id: 1,
				size: meta.len() as i64,
				mtime_ns: crate::scanner::mtime_ns(&meta),
				mode: 0o644,
				uid: 0,
				gid: 0,
				is_symlink: false,
				link_target: None,
			})
			.await
			.unwrap();
		let claim = store
			.claim(QueueKind::PendingChecksum, 1, Duration::from_secs(60))
			.await
			.unwrap()
			.remove(0);
		let hashed = crate::fingerprint::hash_file(path, 1024 * 1024, None)
			.await
			.unwrap();
		store
			.commit_fingerprint(
				&claim,
				&hashed.sha256,
				meta.len() as i64,
				crate::scanner::mtime_ns(&meta),
			)
			.await
			.unwrap();
		store
			.claim(QueueKind::PendingUpload, 1, Duration::from_secs(60))
			.await
			.unwrap()
			.remove(0)
	}

	async fn uploader_against(store: Arc<Store>, base_url: &str) -> Uploader {
		store
			.create_server(NewServer {
				name: "mock".into(),
				base_url: base_url.into(),
				username: "user".into(),
				secret: "secret".into(),
				is_default: true,
			})
			.await
			.unwrap();
		Uploader::new(
			store,
			UploaderConfig {
				retry_base: Duration::ZERO,
				..Default::default()
			},
			CancellationToken::new(),
		)
	}

	#[tokio::test]
	async fn dedup_skips_content_upload() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("a.txt");
		std::fs::write(&path, b"hello").unwrap();

		let state = Arc::new(MockRemote {
			upload_required: false,
			..Default::default()
		});
		let base = serve_mock(state.clone()).await;
		let store = Arc::new(Store::open_in_memory().await.unwrap());
		let claim = ready_file(&store, &path).await;
		let uploader = uploader_against(store.clone(), &base).await;

		uploader.process(&claim).await;

		assert_eq!(state.puts.load(Ordering::SeqCst), 1);
		assert_eq!(state.uploads.load(Ordering::SeqCst), 0);
		let file = store.get_file(claim.file_id()).await.unwrap();
		assert_eq!(file.status(), FileStatus::Completed);
		let complete = store
			.read_activity(0, 100, Some(ActivityKind::UploadComplete))
			.await
			.unwrap();
		assert_eq!(complete.len(), 1);
	}

	#[tokio::test]
	async fn content_upload_streams_and_reports_progress() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("big.bin");
		std::fs::write(&path, vec![7u8; 256 * 1024]).unwrap();

		let state = Arc::new(MockRemote {
			upload_required: true,
			..Default::default()
		});
		let base = serve_mock(state.clone()).await;
		let store = Arc::new(Store::open_in_memory().await.unwrap());
		let claim = ready_file(&store, &path).await;
		let uploader = uploader_against(store.clone(), &base).await;

		uploader.process(&claim).await;

		assert_eq!(state.uploads.load(Ordering::SeqCst), 1);
		let file = store.get_file(claim.file_id()).await.unwrap();
		assert_eq!(file.status(), FileStatus::Completed);

		let started = store
			.read_activity(0, 100, Some(ActivityKind::UploadStarted))
			.await
			.unwrap();
		assert_eq!(started.len(), 1);
		let progress = store
			.read_activity(0, 100, Some(ActivityKind::UploadProgress))
			.await
			.unwrap();
		assert!(!progress.is_empty());
		let last = progress.last().unwrap().details.as_ref().unwrap();
		assert_eq!(last["progress_percent"], 100);
	}

	#[tokio::test]
	async fn stale_token_is_refreshed_exactly_once() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("a.txt");
		std::fs::write(&path, b"hello").unwrap();

		let state = Arc::new(MockRemote {
			upload_required: false,
			reject_first_token: true,
			..Default::default()
		});
		let base = serve_mock(state.clone()).await;
		let store = Arc::new(Store::open_in_memory().await.unwrap());
		let claim = ready_file(&store, &path).await;
		let uploader = uploader_against(store.clone(), &base).await;

		uploader.process(&claim).await;

		assert_eq!(state.logins.load(Ordering::SeqCst), 2);
		assert_eq!(state.puts.load(Ordering::SeqCst), 1);
		let file = store.get_file(claim.file_id()).await.unwrap();
		assert_eq!(file.status(), FileStatus::Completed);

		// The second token is now cached for the next file.
		let server = store.default_server().await.unwrap().unwrap();
		assert_eq!(server.token.as_deref(), Some("token-2"));
	}

	#[tokio::test]
	async fn stale_token_during_content_upload_refreshes_once() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("big.bin");
		std::fs::write(&path, vec![3u8; 8192]).unwrap();

		let state = Arc::new(MockRemote {
			upload_required: true,
			reject_first_token_on_upload: true,
			..Default::default()
		});
		let base = serve_mock(state.clone()).await;
		let store = Arc::new(Store::open_in_memory().await.unwrap());
		let claim = ready_file(&store, &path).await;
		let uploader = uploader_against(store.clone(), &base).await;

		uploader.process(&claim).await;

		// put_file accepted the first token; only the content upload forced
		// the refresh, and exactly one re-login happened.
		assert_eq!(state.logins.load(Ordering::SeqCst), 2);
		assert_eq!(state.puts.load(Ordering::SeqCst), 1);
		assert_eq!(state.uploads.load(Ordering::SeqCst), 1);
		let file = store.get_file(claim.file_id()).await.unwrap();
		assert_eq!(file.status(), FileStatus::Completed);
	}

	#[tokio::test]
	async fn unreachable_server_reschedules_with_backoff() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("a.txt");
		std::fs::write(&path, b"hello").unwrap();

		let store = Arc::new(Store::open_in_memory().await.unwrap());
		let claim = ready_file(&store, &path).await;
		// Nothing listens on this port.
		let uploader = uploader_against(store.clone(), "http://127.0.0.1:1").await;

		uploader.process(&claim).await;

		let file = store.get_file(claim.file_id()).await.unwrap();
		assert_ne!(file.status(), FileStatus::Completed);
		assert!(file.last_error.is_some());

		// The entry is still queued for a later retry.
		let again = store
			.claim(QueueKind::PendingUpload, 1, Duration::from_secs(60))
			.await
			.unwrap();
		assert_eq!(again.len(), 1);
		assert_eq!(again[0].attempts(), 1);
	}
}
