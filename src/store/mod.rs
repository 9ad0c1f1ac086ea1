//! Embedded transactional store
//!
//! Single SQLite database (WAL mode) owning all daemon state: registered
//! roots, exclude patterns, server configurations, the file table, the three
//! work queues and the activity log. Every mutation is a transaction; the
//! queue claim/complete/fail primitives are the only coordination between
//! pipeline stages.

use sea_orm::{
	ConnectOptions, ConnectionTrait, Database as SeaDatabase, DatabaseConnection, DbErr,
	EntityTrait, PaginatorTrait, QueryFilter, Statement,
};
use sea_orm::ColumnTrait;
use sea_orm_migration::MigratorTrait;
use serde::Serialize;
use std::path::Path;
use std::time::Duration;
use tracing::info;

pub mod activity;
pub mod entities;
pub mod files;
pub mod migration;
pub mod queue;
pub mod registry;

pub use activity::{NewActivity, SseCursors};
pub use entities::activity_event::ActivityKind;
pub use entities::file::FileStatus;
pub use entities::queue_entry::QueueKind;
pub use files::{Change, FileFilter, FingerprintOutcome, Observation, ObservedFile};
pub use queue::ClaimedEntry;
pub use registry::{Created, NewServer};

use entities::{file, queue_entry};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
	#[error("database error: {0}")]
	Db(#[from] DbErr),

	#[error("store is corrupt: {0}")]
	Corrupt(String),

	#[error("{0} not found")]
	NotFound(&'static str),

	#[error("{0}")]
	InvalidInput(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Durable home for all daemon state.
///
/// Cheap to share: clone the `Arc` it is handed out in. Workers and the
/// control plane all talk to the same connection pool.
pub struct Store {
	conn: DatabaseConnection,
	cursors: SseCursors,
}

impl Store {
	/// Open (creating if missing) the store at `path` and run migrations.
	pub async fn open(path: &Path) -> StoreResult<Self> {
		if let Some(parent) = path.parent() {
			std::fs::create_dir_all(parent)
				.map_err(|e| StoreError::Corrupt(format!("cannot create state dir: {e}")))?;
		}

		let db_url = format!("sqlite://{}?mode=rwc", path.display());
		let store = Self::connect(db_url).await?;
		info!("Opened store at {:?}", path);
		Ok(store)
	}

	/// In-memory store for tests.
	pub async fn open_in_memory() -> StoreResult<Self> {
		Self::connect("sqlite::memory:".to_string()).await
	}

	async fn connect(db_url: String) -> StoreResult<Self> {
		// A pooled :memory: database would be one empty database per
		// connection; keep it on a single connection.
		let max_connections = if db_url.contains(":memory:") { 1 } else { 8 };
		let mut opt = ConnectOptions::new(db_url);
		opt.max_connections(max_connections)
			.min_connections(1)
			.connect_timeout(Duration::from_secs(8))
			.sqlx_logging(false);

		let conn = SeaDatabase::connect(opt).await?;

		for pragma in [
			"PRAGMA journal_mode=WAL",
			"PRAGMA synchronous=NORMAL",
			"PRAGMA foreign_keys=ON",
			"PRAGMA temp_store=MEMORY",
		] {
			let _ = conn
				.execute(Statement::from_string(
					sea_orm::DatabaseBackend::Sqlite,
					pragma,
				))
				.await;
		}

		let store = Self {
			conn,
			cursors: SseCursors::default(),
		};
		store.verify_integrity().await?;
		migration::Migrator::up(&store.conn, None).await?;
		Ok(store)
	}

	/// Quick integrity check; a corrupt store refuses to serve.
	async fn verify_integrity(&self) -> StoreResult<()> {
		let row = self
			.conn
			.query_one(Statement::from_string(
				sea_orm::DatabaseBackend::Sqlite,
				"PRAGMA quick_check",
			))
			.await?;
		let verdict: String = match row {
			Some(row) => row.try_get_by_index(0).map_err(DbErr::from)?,
			None => String::new(),
		};
		if verdict != "ok" {
			return Err(StoreError::Corrupt(verdict));
		}
		Ok(())
	}

	/// Liveness probe used by `/health`.
	pub async fn healthy(&self) -> bool {
		self.conn
			.query_one(Statement::from_string(
				sea_orm::DatabaseBackend::Sqlite,
				"SELECT 1",
			))
			.await
			.is_ok()
	}

	pub fn conn(&self) -> &DatabaseConnection {
		&self.conn
	}

	pub fn cursors(&self) -> &SseCursors {
		&self.cursors
	}

	/// Aggregate counters for `/status`.
	pub async fn stats(&self) -> StoreResult<StoreStats> {
		let files_tracked = file::Entity::find().count(&self.conn).await?;
		let files_completed = file::Entity::find()
			.filter(file::Column::Status.eq(FileStatus::Completed.to_string()))
			.count(&self.conn)
			.await?;
		let files_failed = file::Entity::find()
			.filter(file::Column::Status.eq(FileStatus::Failed.to_string()))
			.count(&self.conn)
			.await?;

		let mut counts = [0u64; 3];
		for (i, kind) in [
			QueueKind::PendingChecksum,
			QueueKind::PendingUpload,
			QueueKind::PendingDeletion,
		]
		.iter()
		.enumerate()
		{
			counts[i] = queue_entry::Entity::find()
				.filter(queue_entry::Column::Queue.eq(kind.to_string()))
				.count(&self.conn)
				.await?;
		}

		Ok(StoreStats {
			files_tracked,
			files_completed,
			files_failed,
			pending_sha256: counts[0],
			pending_uploads: counts[1],
			pending_deletions: counts[2],
		})
	}
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct StoreStats {
	pub files_tracked: u64,
	pub files_completed: u64,
	pub files_failed: u64,
	pub pending_sha256: u64,
	pub pending_uploads: u64,
	pub pending_deletions: u64,
}
