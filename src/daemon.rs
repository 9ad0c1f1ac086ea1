//! Daemon assembly
//!
//! Builds the store, starts the worker loops (fingerprinter, upload pool,
//! deletion drain, activity pruner, per-root watchers) and runs the control
//! plane until a shutdown signal cancels everything. Workers coordinate
//! only through store transactions, so stopping them mid-flight is safe:
//! unfinished claims lapse and are re-claimed on the next start.

use crate::config::Config;
use crate::control::{self, ControlContext, RuntimeStatus};
use crate::fingerprint::{FingerprintConfig, Fingerprinter};
use crate::scanner::{Scanner, Watchers};
use crate::store::{Created, NewServer, QueueKind, Store, StoreError};
use crate::uploader::{Uploader, UploaderConfig};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const DRAIN_BATCH: u64 = 32;
const DRAIN_LEASE: Duration = Duration::from_secs(60);
const PRUNE_INTERVAL: Duration = Duration::from_secs(60);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

pub struct Daemon {
	config: Config,
	store: Arc<Store>,
	cancel: CancellationToken,
}

impl Daemon {
	/// Open the store; a corrupt store refuses to start the daemon.
	pub async fn init(config: Config) -> Result<Self, StoreError> {
		let store = Store::open(&config.database.path).await?;
		Ok(Self {
			config,
			store: Arc::new(store),
			cancel: CancellationToken::new(),
		})
	}

	pub fn cancel_token(&self) -> CancellationToken {
		self.cancel.clone()
	}

	pub async fn run(self) -> anyhow::Result<()> {
		let Self {
			config,
			store,
			cancel,
		} = self;
		config.ensure_directories()?;

		let pid_file = config.pid_file();
		std::fs::write(&pid_file, std::process::id().to_string())?;

		bootstrap_remote_server(&store, &config).await;

		let scanner = Arc::new(Scanner::new(store.clone(), cancel.clone()));
		let watchers = Arc::new(Watchers::new(
			scanner.clone(),
			store.clone(),
			Duration::from_secs(config.watcher.debounce_secs),
			cancel.clone(),
			config.watcher.enabled,
		));

		let fingerprinter = Fingerprinter::new(
			store.clone(),
			FingerprintConfig {
				chunk_size: config.sha256.chunk_size,
				chunk_sleep: config.sha256.chunk_sleep(),
				..Default::default()
			},
			cancel.clone(),
		);
		let fingerprinter_active = fingerprinter.active_flag();

		let upload_content = Arc::new(AtomicBool::new(config.uploader.upload_content));
		let uploader = Arc::new(Uploader::new(
			store.clone(),
			UploaderConfig {
				parallel: config.uploader.effective_parallel(),
				max_attempts: config.uploader.retry_attempts.max(1),
				retry_base: config.uploader.retry_delay(),
				retry_cap: config.uploader.retry_delay_max(),
				upload_timeout: config.uploader.upload_timeout(),
				upload_content: upload_content.clone(),
				..Default::default()
			},
			cancel.clone(),
		));

		let mut workers: Vec<JoinHandle<()>> = Vec::new();
		workers.push(fingerprinter.spawn());
		workers.extend(uploader.spawn_pool());
		workers.push(spawn_deletion_drain(store.clone(), cancel.clone()));
		workers.push(spawn_activity_pruner(
			store.clone(),
			config.activity.max_age(),
			config.activity.max_events,
			cancel.clone(),
		));

		watchers.start_all().await;

		let ctx = Arc::new(ControlContext {
			store: store.clone(),
			scanner: scanner.clone(),
			watchers,
			status: RuntimeStatus::new(fingerprinter_active, uploader.in_flight_counter(), upload_content),
		});

		// Startup scan of every enabled root.
		{
			let scanner = scanner.clone();
			let scans = ctx.status.scans_in_flight.clone();
			workers.push(tokio::spawn(async move {
				scans.fetch_add(1, Ordering::Relaxed);
				let _ = scanner.scan_all().await;
				scans.fetch_sub(1, Ordering::Relaxed);
			}));
		}

		spawn_signal_handler(cancel.clone());

		info!("Daemon up, pid {}", std::process::id());
		let served = control::serve(
			ctx,
			&config.server.host,
			config.server.port,
			cancel.clone(),
		)
		.await;
		// Whatever stopped the control plane stops the daemon.
		cancel.cancel();

		for worker in workers {
			if tokio::time::timeout(SHUTDOWN_GRACE, worker).await.is_err() {
				warn!("Worker did not stop within grace period");
			}
		}

		let _ = std::fs::remove_file(&pid_file);
		info!("Daemon stopped");
		served
	}
}

/// Seed the default server from the config file, once. An existing row wins;
/// the bootstrap only claims the default slot when none is taken.
async fn bootstrap_remote_server(store: &Store, config: &Config) {
	let Some(remote) = &config.remote_server else {
		return;
	};
	let is_default = match store.default_server().await {
		Ok(existing) => existing.is_none(),
		Err(e) => {
			warn!("Cannot check default server: {}", e);
			return;
		}
	};
	match store
		.create_server(NewServer {
			name: remote.name.clone(),
			base_url: remote.url.clone(),
			username: remote.username.clone(),
			secret: remote.password.clone(),
			is_default,
		})
		.await
	{
		Ok(Created::New(server)) => info!("Registered remote server {}", server.name),
		Ok(Created::Existing(_)) => debug!("Remote server {} already registered", remote.name),
		Err(e) => warn!("Cannot register remote server: {}", e),
	}
}

/// The deletion queue is informational: the server has no delete endpoint,
/// the `file_deleted` event was appended when the deletion was observed, so
/// draining just retires the entries.
fn spawn_deletion_drain(store: Arc<Store>, cancel: CancellationToken) -> JoinHandle<()> {
	tokio::spawn(async move {
		loop {
			if cancel.is_cancelled() {
				break;
			}
			let claims = match store
				.claim(QueueKind::PendingDeletion, DRAIN_BATCH, DRAIN_LEASE)
				.await
			{
				Ok(claims) => claims,
				Err(e) => {
					warn!("Deletion claim failed: {}", e);
					Vec::new()
				}
			};
			if claims.is_empty() {
				tokio::select! {
					_ = cancel.cancelled() => break,
					_ = tokio::time::sleep(Duration::from_secs(2)) => {}
				}
				continue;
			}
			for claim in &claims {
				if let Err(e) = store.complete(claim).await {
					warn!("Cannot drain deletion entry: {}", e);
				}
			}
		}
	})
}

fn spawn_activity_pruner(
	store: Arc<Store>,
	max_age: Duration,
	max_count: u64,
	cancel: CancellationToken,
) -> JoinHandle<()> {
	tokio::spawn(async move {
		loop {
			tokio::select! {
				_ = cancel.cancelled() => break,
				_ = tokio::time::sleep(PRUNE_INTERVAL) => {}
			}
			match store.prune_activity(max_age, max_count).await {
				Ok(0) => {}
				Ok(n) => debug!("Pruned {} activity events", n),
				Err(e) => warn!("Activity prune failed: {}", e),
			}
		}
	})
}

fn spawn_signal_handler(cancel: CancellationToken) {
	tokio::spawn(async move {
		let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
			Ok(signal) => signal,
			Err(e) => {
				warn!("Cannot install SIGTERM handler: {}", e);
				return;
			}
		};
		tokio::select! {
			_ = sigterm.recv() => info!("SIGTERM received, shutting down"),
			result = tokio::signal::ctrl_c() => {
				if result.is_ok() {
					info!("Interrupt received, shutting down");
				}
			}
		}
		cancel.cancel();
	});
}
