//! HTTP control plane
//!
//! Loopback-only management API for the GUI and CLI: configuration CRUD,
//! status, file listing, upload triggering and the activity feed (poll or
//! SSE). Long operations are dispatched to background tasks and reported
//! through activity events; handlers themselves only touch the store.

use crate::scanner::{Scanner, Watchers};
use crate::store::Store;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;

pub mod error;
mod handlers;
mod sse;

pub use error::{ApiError, ApiResult};

/// Live daemon state the API reports but does not own.
pub struct RuntimeStatus {
	pub started_at: Instant,
	pub version: &'static str,
	pub scans_in_flight: Arc<AtomicUsize>,
	pub fingerprinter_active: Arc<AtomicBool>,
	pub uploads_in_flight: Arc<AtomicUsize>,
	/// Content policy; `POST /uploads/trigger` may flip it.
	pub upload_content: Arc<AtomicBool>,
}

impl RuntimeStatus {
	pub fn new(
		fingerprinter_active: Arc<AtomicBool>,
		uploads_in_flight: Arc<AtomicUsize>,
		upload_content: Arc<AtomicBool>,
	) -> Self {
		Self {
			started_at: Instant::now(),
			version: env!("CARGO_PKG_VERSION"),
			scans_in_flight: Arc::new(AtomicUsize::new(0)),
			fingerprinter_active,
			uploads_in_flight,
			upload_content,
		}
	}

	pub fn scanner_active(&self) -> bool {
		self.scans_in_flight.load(Ordering::Relaxed) > 0
	}
}

/// Everything the handlers need, shared behind one `Arc`.
pub struct ControlContext {
	pub store: Arc<Store>,
	pub scanner: Arc<Scanner>,
	pub watchers: Arc<Watchers>,
	pub status: RuntimeStatus,
}

pub fn router(ctx: Arc<ControlContext>) -> axum::Router {
	use axum::routing::{delete, get, post};

	axum::Router::new()
		.route("/health", get(handlers::health))
		.route("/status", get(handlers::status))
		.route("/roots", get(handlers::list_roots).post(handlers::create_root))
		.route("/roots/{id}", delete(handlers::delete_root))
		.route("/roots/{id}/scan", post(handlers::scan_root))
		.route("/scan_all", post(handlers::scan_all))
		.route(
			"/excludes",
			get(handlers::list_excludes).post(handlers::create_exclude),
		)
		.route("/excludes/{id}", delete(handlers::delete_exclude))
		.route(
			"/servers",
			get(handlers::list_servers).post(handlers::create_server),
		)
		.route("/servers/{id}", delete(handlers::delete_server))
		.route(
			"/servers/{id}/set_default",
			post(handlers::set_default_server),
		)
		.route("/files", get(handlers::list_files))
		.route("/files/{id}", get(handlers::get_file))
		.route("/uploads/trigger", post(handlers::trigger_uploads))
		.route("/activity", get(handlers::list_activity))
		.route("/activity/stream", get(sse::stream_activity))
		.layer(TraceLayer::new_for_http())
		.with_state(ctx)
}

/// Bind and serve until the cancellation token fires.
pub async fn serve(
	ctx: Arc<ControlContext>,
	host: &str,
	port: u16,
	cancel: CancellationToken,
) -> anyhow::Result<()> {
	let addr: SocketAddr = format!("{host}:{port}").parse()?;
	let listener = tokio::net::TcpListener::bind(addr).await?;
	info!("Control plane listening on {}", listener.local_addr()?);
	axum::serve(listener, router(ctx))
		.with_graceful_shutdown(cancel.cancelled_owned())
		.await?;
	Ok(())
}
