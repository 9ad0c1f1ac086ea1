//! End-to-end pipeline tests against a mock remote server:
//! scan → fingerprint → upload, change detection, and offline retry.

use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use packrat::fingerprint::{FingerprintConfig, Fingerprinter, EMPTY_SHA256};
use packrat::scanner::Scanner;
use packrat::store::{ActivityKind, FileStatus, NewServer, QueueKind, Store};
use packrat::uploader::{Uploader, UploaderConfig};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Default)]
struct MockRemote {
	logins: AtomicUsize,
	puts: AtomicUsize,
	uploads: AtomicUsize,
	/// SHA-256 values the server claims to already hold.
	known_hashes: std::sync::Mutex<Vec<String>>,
}

async fn mock_login(State(state): State<Arc<MockRemote>>) -> Json<serde_json::Value> {
	state.logins.fetch_add(1, Ordering::SeqCst);
	Json(serde_json::json!({ "access_token": "tok", "token_type": "bearer" }))
}

async fn mock_put_file(
	State(state): State<Arc<MockRemote>>,
	Json(record): Json<serde_json::Value>,
) -> Json<serde_json::Value> {
	state.puts.fetch_add(1, Ordering::SeqCst);
	let sha = record["sha256"].as_str().unwrap_or_default().to_string();
	let known = state.known_hashes.lock().unwrap().contains(&sha);
	if !known {
		state.known_hashes.lock().unwrap().push(sha);
	}
	Json(serde_json::json!({ "upload_required": !known }))
}

async fn mock_upload(
	State(state): State<Arc<MockRemote>>,
	_body: axum::body::Bytes,
) -> axum::http::StatusCode {
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

struct Pipeline {
	store: Arc<Store>,
	scanner: Arc<Scanner>,
	cancel: CancellationToken,
}

async fn start_pipeline(base_url: &str) -> Pipeline {
	let store = Arc::new(Store::open_in_memory().await.unwrap());
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

	let cancel = CancellationToken::new();
	let scanner = Arc::new(Scanner::new(store.clone(), cancel.clone()));

	Fingerprinter::new(
		store.clone(),
		FingerprintConfig {
			poll_interval: Duration::from_millis(50),
			retry_base: Duration::from_millis(10),
			..Default::default()
		},
		cancel.clone(),
	)
	.spawn();

	let uploader = Arc::new(Uploader::new(
		store.clone(),
		UploaderConfig {
			parallel: 2,
			poll_interval: Duration::from_millis(50),
			retry_base: Duration::from_millis(50),
			retry_cap: Duration::from_millis(500),
			..Default::default()
		},
		cancel.clone(),
	));
	uploader.spawn_pool();

	Pipeline {
		store,
		scanner,
		cancel,
	}
}

async fn wait_until<F, Fut>(what: &str, mut check: F)
where
	F: FnMut() -> Fut,
	Fut: std::future::Future<Output = bool>,
{
	for _ in 0..200 {
		if check().await {
			return;
		}
		tokio::time::sleep(Duration::from_millis(50)).await;
	}
	panic!("timed out waiting for {what}");
}

async fn all_completed(store: &Store) -> bool {
	let files = store.list_files(Default::default()).await.unwrap();
	!files.is_empty() && files.iter().all(|f| f.status() == FileStatus::Completed)
}

#[tokio::test]
async fn fresh_install_small_tree_reaches_completed() {
	let dir = tempfile::tempdir().unwrap();
	std::fs::write(dir.path().join("a.txt"), b"hello").unwrap();
	std::fs::write(dir.path().join("b.bin"), vec![9u8; 1024 * 1024]).unwrap();
	std::fs::write(dir.path().join("c"), b"").unwrap();

	let remote = Arc::new(MockRemote::default());
	let base = serve_mock(remote.clone()).await;
	let pipeline = start_pipeline(&base).await;

	let root = pipeline
		.store
		.create_root(dir.path().to_str().unwrap(), true)
		.await
		.unwrap()
		.into_inner();
	pipeline.scanner.scan(&root).await.unwrap();

	wait_until("all files completed", || all_completed(&pipeline.store)).await;

	let files = pipeline.store.list_files(Default::default()).await.unwrap();
	assert_eq!(files.len(), 3);
	let empty = files.iter().find(|f| f.path.ends_with("/c")).unwrap();
	assert_eq!(empty.sha256.as_deref(), Some(EMPTY_SHA256));
	for file in &files {
		let sha = file.sha256.as_deref().unwrap();
		assert_eq!(sha.len(), 64);
		assert!(sha.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
	}

	// Three metadata posts, three content uploads (nothing deduped yet).
	assert_eq!(remote.puts.load(Ordering::SeqCst), 3);
	assert_eq!(remote.uploads.load(Ordering::SeqCst), 3);

	pipeline.cancel.cancel();
}

#[tokio::test]
async fn modification_triggers_exactly_one_new_upload() {
	let dir = tempfile::tempdir().unwrap();
	let a = dir.path().join("a.txt");
	std::fs::write(&a, b"v1").unwrap();
	std::fs::write(dir.path().join("b.txt"), b"stable").unwrap();

	let remote = Arc::new(MockRemote::default());
	let base = serve_mock(remote.clone()).await;
	let pipeline = start_pipeline(&base).await;

	let root = pipeline
		.store
		.create_root(dir.path().to_str().unwrap(), true)
		.await
		.unwrap()
		.into_inner();
	pipeline.scanner.scan(&root).await.unwrap();
	wait_until("initial settle", || all_completed(&pipeline.store)).await;
	let started_before = pipeline
		.store
		.read_activity(0, 1000, Some(ActivityKind::UploadStarted))
		.await
		.unwrap()
		.len();

	// Overwrite with new content and rescan.
	std::fs::write(&a, b"version two, longer").unwrap();
	pipeline.scanner.scan(&root).await.unwrap();
	wait_until("modified file settles", || all_completed(&pipeline.store)).await;

	let started_after = pipeline
		.store
		.read_activity(0, 1000, Some(ActivityKind::UploadStarted))
		.await
		.unwrap();
	assert_eq!(started_after.len(), started_before + 1);
	assert!(started_after
		.last()
		.unwrap()
		.file_path
		.as_deref()
		.unwrap()
		.ends_with("a.txt"));

	pipeline.cancel.cancel();
}

#[tokio::test]
async fn offline_server_keeps_entries_queued_until_it_returns() {
	let dir = tempfile::tempdir().unwrap();
	std::fs::write(dir.path().join("a.txt"), b"payload").unwrap();

	// Point at a dead port first.
	let pipeline = start_pipeline("http://127.0.0.1:1").await;
	let root = pipeline
		.store
		.create_root(dir.path().to_str().unwrap(), true)
		.await
		.unwrap()
		.into_inner();
	pipeline.scanner.scan(&root).await.unwrap();

	// The fingerprint lands but the upload cannot complete.
	wait_until("fingerprint lands", || async {
		pipeline
			.store
			.list_files(Default::default())
			.await
			.unwrap()
			.iter()
			.all(|f| f.sha256.is_some())
	})
	.await;
	tokio::time::sleep(Duration::from_millis(500)).await;
	let files = pipeline.store.list_files(Default::default()).await.unwrap();
	assert!(files.iter().all(|f| f.status() != FileStatus::Completed));
	assert!(files.iter().any(|f| f.last_error.is_some()));

	// Bring the server up at the same address the store points to: swap the
	// default server to a live mock instead.
	let remote = Arc::new(MockRemote::default());
	let base = serve_mock(remote.clone()).await;
	let server = pipeline
		.store
		.create_server(NewServer {
			name: "live".into(),
			base_url: base,
			username: "user".into(),
			secret: "secret".into(),
			is_default: false,
		})
		.await
		.unwrap()
		.into_inner();
	pipeline.store.set_default_server(server.id).await.unwrap();

	wait_until("upload completes after recovery", || {
		all_completed(&pipeline.store)
	})
	.await;
	assert!(remote.puts.load(Ordering::SeqCst) >= 1);

	pipeline.cancel.cancel();
}

#[tokio::test]
async fn lapsed_claim_is_picked_up_by_another_worker() {
	// Simulates a crash mid-upload: the first claim is never completed and
	// its zero lease lapses immediately; a later claim must see the entry.
	let store = Store::open_in_memory().await.unwrap();
	let dir = tempfile::tempdir().unwrap();
	let path = dir.path().join("big");
	std::fs::write(&path, vec![1u8; 4096]).unwrap();

	let meta = std::fs::symlink_metadata(&path).unwrap();
	store
		.record_observation(packrat::store::ObservedFile {
			path: path.to_string_lossy().to_string(),
			root_id: 1,
			size: meta.len() as i64,
			mtime_ns: 0,
			mode: 0o644,
			uid: 0,
			gid: 0,
			is_symlink: false,
			link_target: None,
		})
		.await
		.unwrap();

	let crashed = store
		.claim(QueueKind::PendingChecksum, 1, Duration::ZERO)
		.await
		.unwrap();
	assert_eq!(crashed.len(), 1);
	drop(crashed);

	let recovered = store
		.claim(QueueKind::PendingChecksum, 1, Duration::from_secs(60))
		.await
		.unwrap();
	assert_eq!(recovered.len(), 1);
	assert_eq!(recovered[0].file_id(), 1);
}

#[tokio::test]
async fn excluded_files_are_invisible_end_to_end() {
	let dir = tempfile::tempdir().unwrap();
	std::fs::write(dir.path().join("x.log"), b"noise").unwrap();
	std::fs::write(dir.path().join("y.txt"), b"signal").unwrap();

	let remote = Arc::new(MockRemote::default());
	let base = serve_mock(remote.clone()).await;
	let pipeline = start_pipeline(&base).await;
	pipeline.store.create_exclude("*.log").await.unwrap();

	let root = pipeline
		.store
		.create_root(dir.path().to_str().unwrap(), true)
		.await
		.unwrap()
		.into_inner();
	pipeline.scanner.scan(&root).await.unwrap();
	wait_until("tracked file settles", || all_completed(&pipeline.store)).await;

	let files = pipeline.store.list_files(Default::default()).await.unwrap();
	assert_eq!(files.len(), 1);
	assert!(files[0].path.ends_with("y.txt"));
	assert_eq!(remote.puts.load(Ordering::SeqCst), 1);

	let discovered = pipeline
		.store
		.read_activity(0, 1000, Some(ActivityKind::FileDiscovered))
		.await
		.unwrap();
	assert!(discovered.iter().all(|e| {
		!Path::new(e.file_path.as_deref().unwrap_or_default())
			.ends_with("x.log")
	}));

	pipeline.cancel.cancel();
}
