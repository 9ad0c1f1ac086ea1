//! File table operations
//!
//! The file row is the serialization point of the pipeline: its status plus
//! the queue claim decide which stage may touch a path next. Every state
//! transition commits together with the queue mutation that triggered it.

use super::activity::{append_on, NewActivity};
use super::entities::{file, file::FileStatus, queue_entry};
use super::queue::{enqueue_on, ClaimedEntry};
use super::{ActivityKind, QueueKind, Store, StoreError, StoreResult};
use chrono::Utc;
use sea_orm::ActiveValue::Set;
use sea_orm::{
	ActiveModelTrait, ColumnTrait, EntityTrait, QueryFilter, QueryOrder, QuerySelect,
	TransactionTrait,
};

/// Everything the scanner learns about a path from one stat call.
#[derive(Debug, Clone)]
pub struct ObservedFile {
	pub path: String,
	pub root_id: i32,
	pub size: i64,
	pub mtime_ns: i64,
	pub mode: i32,
	pub uid: i64,
	pub gid: i64,
	pub is_symlink: bool,
	pub link_target: Option<String>,
}

/// How an observation related to the existing file table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Change {
	New,
	Changed,
	Unchanged,
}

#[derive(Debug)]
pub struct Observation {
	pub file: file::Model,
	pub change: Change,
}

/// What a committed fingerprint meant for the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FingerprintOutcome {
	/// Content identical to the last known hash; nothing to ship.
	Unchanged,
	/// New or changed content; an upload queue entry was created.
	NeedsUpload,
	/// The worker's lease lapsed mid-hash; nothing was written.
	Lost,
}

#[derive(Debug, Clone, Default)]
pub struct FileFilter {
	pub path_prefix: Option<String>,
	pub sha256: Option<String>,
	pub limit: u64,
	pub offset: u64,
}

impl Store {
	/// Upsert a scanner observation. New or changed paths drop back to
	/// `discovered` and get a checksum queue entry; the upsert, the enqueue
	/// and the activity event commit as one transaction.
	pub async fn record_observation(&self, obs: ObservedFile) -> StoreResult<Observation> {
		let txn = self.conn.begin().await?;
		let existing = file::Entity::find()
			.filter(file::Column::Path.eq(&obs.path))
			.one(&txn)
			.await?;

		let observation = match existing {
			None => {
				let model = file::ActiveModel {
					path: Set(obs.path.clone()),
					root_id: Set(obs.root_id),
					size: Set(obs.size),
					mtime_ns: Set(obs.mtime_ns),
					mode: Set(obs.mode),
					uid: Set(obs.uid),
					gid: Set(obs.gid),
					is_symlink: Set(obs.is_symlink),
					link_target: Set(obs.link_target.clone()),
					sha256: Set(None),
					status: Set(FileStatus::Discovered.to_string()),
					last_error: Set(None),
					discovered_at: Set(Utc::now()),
					updated_at: Set(Utc::now()),
					..Default::default()
				}
				.insert(&txn)
				.await?;

				if !obs.is_symlink {
					enqueue_on(&txn, QueueKind::PendingChecksum, model.id).await?;
				}
				append_on(
					&txn,
					NewActivity::new(ActivityKind::FileDiscovered)
						.path(&obs.path)
						.root(obs.root_id),
				)
				.await?;
				Observation {
					file: model,
					change: Change::New,
				}
			}
			Some(row) => {
				let reappeared = row.status() == FileStatus::Deleted;
				let changed = row.size != obs.size
					|| row.mtime_ns != obs.mtime_ns
					|| row.is_symlink != obs.is_symlink
					|| reappeared;
				if !changed {
					txn.commit().await?;
					return Ok(Observation {
						file: row,
						change: Change::Unchanged,
					});
				}

				let file_id = row.id;
				let mut active: file::ActiveModel = row.into();
				active.root_id = Set(obs.root_id);
				active.size = Set(obs.size);
				active.mtime_ns = Set(obs.mtime_ns);
				active.mode = Set(obs.mode);
				active.uid = Set(obs.uid);
				active.gid = Set(obs.gid);
				active.is_symlink = Set(obs.is_symlink);
				active.link_target = Set(obs.link_target.clone());
				active.status = Set(FileStatus::Discovered.to_string());
				active.last_error = Set(None);
				active.updated_at = Set(Utc::now());
				let model = active.update(&txn).await?;

				// A changed path restarts its pipeline; a stale upload or
				// deletion entry would race the fresh checksum pass and
				// leave two live entries for one file.
				queue_entry::Entity::delete_many()
					.filter(queue_entry::Column::FileId.eq(file_id))
					.filter(queue_entry::Column::Queue.is_in([
						QueueKind::PendingUpload.to_string(),
						QueueKind::PendingDeletion.to_string(),
					]))
					.exec(&txn)
					.await?;

				if !obs.is_symlink {
					enqueue_on(&txn, QueueKind::PendingChecksum, file_id).await?;
				}
				let kind = if reappeared {
					ActivityKind::FileDiscovered
				} else {
					ActivityKind::FileChanged
				};
				append_on(
					&txn,
					NewActivity::new(kind).path(&obs.path).root(obs.root_id),
				)
				.await?;
				Observation {
					file: model,
					change: Change::Changed,
				}
			}
		};

		txn.commit().await?;
		Ok(observation)
	}

	/// Record an observed deletion. The row is kept (soft drop) so the path
	/// is recognized if it ever reappears.
	pub async fn record_deletion(&self, path: &str) -> StoreResult<Option<file::Model>> {
		let txn = self.conn.begin().await?;
		let Some(row) = file::Entity::find()
			.filter(file::Column::Path.eq(path))
			.one(&txn)
			.await?
		else {
			return Ok(None);
		};
		if row.status() == FileStatus::Deleted {
			return Ok(None);
		}

		let file_id = row.id;
		let root_id = row.root_id;
		let mut active: file::ActiveModel = row.into();
		active.status = Set(FileStatus::Deleted.to_string());
		active.updated_at = Set(Utc::now());
		let model = active.update(&txn).await?;

		enqueue_on(&txn, QueueKind::PendingDeletion, file_id).await?;
		append_on(
			&txn,
			NewActivity::new(ActivityKind::FileDeleted)
				.path(path)
				.root(root_id),
		)
		.await?;
		txn.commit().await?;
		Ok(Some(model))
	}

	pub async fn get_file(&self, id: i32) -> StoreResult<file::Model> {
		file::Entity::find_by_id(id)
			.one(&self.conn)
			.await?
			.ok_or(StoreError::NotFound("file"))
	}

	pub async fn list_files(&self, filter: FileFilter) -> StoreResult<Vec<file::Model>> {
		let mut query = file::Entity::find().order_by_asc(file::Column::Id);
		if let Some(prefix) = &filter.path_prefix {
			query = query.filter(file::Column::Path.starts_with(prefix.as_str()));
		}
		if let Some(sha256) = &filter.sha256 {
			query = query.filter(file::Column::Sha256.eq(sha256.as_str()));
		}
		let limit = if filter.limit == 0 { 100 } else { filter.limit };
		Ok(query.limit(limit).offset(filter.offset).all(&self.conn).await?)
	}

	pub async fn set_file_status(&self, file_id: i32, status: FileStatus) -> StoreResult<()> {
		file::Entity::update_many()
			.filter(file::Column::Id.eq(file_id))
			.set(file::ActiveModel {
				status: Set(status.to_string()),
				updated_at: Set(Utc::now()),
				..Default::default()
			})
			.exec(&self.conn)
			.await?;
		Ok(())
	}

	/// Commit a computed fingerprint: update the file row, decide whether an
	/// upload is owed, and retire the claim, all in one transaction.
	pub async fn commit_fingerprint(
		&self,
		claim: &ClaimedEntry,
		sha256: &str,
		size: i64,
		mtime_ns: i64,
	) -> StoreResult<FingerprintOutcome> {
		let txn = self.conn.begin().await?;

		let retired = queue_entry::Entity::delete_many()
			.filter(queue_entry::Column::Id.eq(claim.entry.id))
			.filter(queue_entry::Column::ClaimToken.eq(claim.token()))
			.exec(&txn)
			.await?;
		if retired.rows_affected == 0 {
			return Ok(FingerprintOutcome::Lost);
		}

		let row = file::Entity::find_by_id(claim.file_id())
			.one(&txn)
			.await?
			.ok_or(StoreError::NotFound("file"))?;

		let unchanged = row.sha256.as_deref() == Some(sha256);
		let path = row.path.clone();
		let root_id = row.root_id;
		let mut active: file::ActiveModel = row.into();
		active.sha256 = Set(Some(sha256.to_string()));
		active.size = Set(size);
		active.mtime_ns = Set(mtime_ns);
		active.last_error = Set(None);
		active.updated_at = Set(Utc::now());

		let outcome = if unchanged {
			active.status = Set(FileStatus::Completed.to_string());
			active.update(&txn).await?;
			append_on(
				&txn,
				NewActivity::new(ActivityKind::FingerprintUnchanged)
					.path(path)
					.root(root_id),
			)
			.await?;
			FingerprintOutcome::Unchanged
		} else {
			active.status = Set(FileStatus::ReadyForUpload.to_string());
			active.update(&txn).await?;
			enqueue_on(&txn, QueueKind::PendingUpload, claim.file_id()).await?;
			FingerprintOutcome::NeedsUpload
		};

		txn.commit().await?;
		Ok(outcome)
	}

	/// Mark an upload finished: file completed, claim retired, atomically.
	/// Returns false when the lease had lapsed (another worker owns it now).
	pub async fn complete_upload(&self, claim: &ClaimedEntry) -> StoreResult<bool> {
		let txn = self.conn.begin().await?;
		let retired = queue_entry::Entity::delete_many()
			.filter(queue_entry::Column::Id.eq(claim.entry.id))
			.filter(queue_entry::Column::ClaimToken.eq(claim.token()))
			.exec(&txn)
			.await?;
		if retired.rows_affected == 0 {
			return Ok(false);
		}

		file::Entity::update_many()
			.filter(file::Column::Id.eq(claim.file_id()))
			.set(file::ActiveModel {
				status: Set(FileStatus::Completed.to_string()),
				last_error: Set(None),
				updated_at: Set(Utc::now()),
				..Default::default()
			})
			.exec(&txn)
			.await?;
		txn.commit().await?;
		Ok(true)
	}

	/// Terminal failure for a file: the claim is dropped for good, the row
	/// goes `failed` with the error, and an activity event records it.
	pub async fn fail_file(
		&self,
		claim: &ClaimedEntry,
		error: &str,
		kind: ActivityKind,
	) -> StoreResult<bool> {
		let txn = self.conn.begin().await?;
		let retired = queue_entry::Entity::delete_many()
			.filter(queue_entry::Column::Id.eq(claim.entry.id))
			.filter(queue_entry::Column::ClaimToken.eq(claim.token()))
			.exec(&txn)
			.await?;
		if retired.rows_affected == 0 {
			return Ok(false);
		}

		let path = file::Entity::find_by_id(claim.file_id())
			.one(&txn)
			.await?
			.map(|f| f.path);

		file::Entity::update_many()
			.filter(file::Column::Id.eq(claim.file_id()))
			.set(file::ActiveModel {
				status: Set(FileStatus::Failed.to_string()),
				last_error: Set(Some(error.to_string())),
				updated_at: Set(Utc::now()),
				..Default::default()
			})
			.exec(&txn)
			.await?;

		let mut event = NewActivity::new(kind).message(error);
		if let Some(path) = path {
			event = event.path(path);
		}
		append_on(&txn, event).await?;
		txn.commit().await?;
		Ok(true)
	}

	/// Re-enqueue eligible `ready_for_upload` rows, up to `limit`.
	pub async fn trigger_uploads(
		&self,
		path_prefix: Option<&str>,
		limit: Option<u64>,
	) -> StoreResult<u64> {
		let txn = self.conn.begin().await?;
		let mut query = file::Entity::find()
			.filter(file::Column::Status.eq(FileStatus::ReadyForUpload.to_string()))
			.order_by_asc(file::Column::Id);
		if let Some(prefix) = path_prefix {
			query = query.filter(file::Column::Path.starts_with(prefix));
		}
		if let Some(limit) = limit {
			query = query.limit(limit);
		}

		let mut queued = 0;
		for row in query.all(&txn).await? {
			if enqueue_on(&txn, QueueKind::PendingUpload, row.id).await? {
				queued += 1;
			}
		}
		txn.commit().await?;
		Ok(queued)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::time::Duration;

	fn observed(path: &str, size: i64, mtime_ns: i64) -> ObservedFile {
		ObservedFile {
			path: path.to_string(),
			root_id: 1,
			size,
			mtime_ns,
			mode: 0o644,
			uid: 1000,
			gid: 1000,
			is_symlink: false,
			link_target: None,
		}
	}

	#[tokio::test]
	async fn observation_detects_change_via_size_and_mtime() {
		let store = Store::open_in_memory().await.unwrap();

		let first = store
			.record_observation(observed("/r/a.txt", 5, 100))
			.await
			.unwrap();
		assert_eq!(first.change, Change::New);

		// Identical stat: no new work.
		let again = store
			.record_observation(observed("/r/a.txt", 5, 100))
			.await
			.unwrap();
		assert_eq!(again.change, Change::Unchanged);
		let claims = store
			.claim(QueueKind::PendingChecksum, 10, Duration::from_secs(60))
			.await
			.unwrap();
		assert_eq!(claims.len(), 1);

		// New mtime: exactly one fresh entry.
		store.complete(&claims[0]).await.unwrap();
		let changed = store
			.record_observation(observed("/r/a.txt", 5, 200))
			.await
			.unwrap();
		assert_eq!(changed.change, Change::Changed);
		assert_eq!(changed.file.status(), FileStatus::Discovered);
	}

	#[tokio::test]
	async fn fingerprint_unchanged_short_circuits_upload() {
		let store = Store::open_in_memory().await.unwrap();
		store
			.record_observation(observed("/r/b.bin", 3, 100))
			.await
			.unwrap();

		let claim = &store
			.claim(QueueKind::PendingChecksum, 1, Duration::from_secs(60))
			.await
			.unwrap()[0];
		let digest = "a".repeat(64);
		let outcome = store
			.commit_fingerprint(claim, &digest, 3, 100)
			.await
			.unwrap();
		assert_eq!(outcome, FingerprintOutcome::NeedsUpload);

		// Same content observed again after a touch.
		store
			.record_observation(observed("/r/b.bin", 3, 200))
			.await
			.unwrap();
		let claim = &store
			.claim(QueueKind::PendingChecksum, 1, Duration::from_secs(60))
			.await
			.unwrap()[0];
		let outcome = store
			.commit_fingerprint(claim, &digest, 3, 200)
			.await
			.unwrap();
		assert_eq!(outcome, FingerprintOutcome::Unchanged);

		let file = store.get_file(claim.file_id()).await.unwrap();
		assert_eq!(file.status(), FileStatus::Completed);
		assert_eq!(file.sha256.as_deref(), Some(digest.as_str()));
	}

	#[tokio::test]
	async fn change_removes_stale_upload_entry() {
		let store = Store::open_in_memory().await.unwrap();
		store
			.record_observation(observed("/r/d.bin", 3, 100))
			.await
			.unwrap();
		let claim = &store
			.claim(QueueKind::PendingChecksum, 1, Duration::from_secs(60))
			.await
			.unwrap()[0];
		store
			.commit_fingerprint(claim, &"b".repeat(64), 3, 100)
			.await
			.unwrap();

		// The file changes again before its upload entry is drained; only
		// the fresh checksum entry may survive.
		store
			.record_observation(observed("/r/d.bin", 9, 200))
			.await
			.unwrap();

		assert!(store
			.claim(QueueKind::PendingUpload, 10, Duration::from_secs(60))
			.await
			.unwrap()
			.is_empty());
		let checksum = store
			.claim(QueueKind::PendingChecksum, 10, Duration::from_secs(60))
			.await
			.unwrap();
		assert_eq!(checksum.len(), 1);
	}

	#[tokio::test]
	async fn deleted_path_is_terminal_until_it_reappears() {
		let store = Store::open_in_memory().await.unwrap();
		store
			.record_observation(observed("/r/c", 0, 100))
			.await
			.unwrap();

		let dropped = store.record_deletion("/r/c").await.unwrap();
		assert!(dropped.is_some());
		assert!(store.record_deletion("/r/c").await.unwrap().is_none());

		let back = store
			.record_observation(observed("/r/c", 0, 100))
			.await
			.unwrap();
		assert_eq!(back.change, Change::Changed);
		assert_eq!(back.file.status(), FileStatus::Discovered);
	}

	#[tokio::test]
	async fn trigger_uploads_requeues_ready_rows_only() {
		let store = Store::open_in_memory().await.unwrap();
		for (path, size) in [("/r/x", 1), ("/r/y", 2)] {
			store
				.record_observation(observed(path, size, 100))
				.await
				.unwrap();
		}
		let claims = store
			.claim(QueueKind::PendingChecksum, 10, Duration::from_secs(60))
			.await
			.unwrap();
		for (i, claim) in claims.iter().enumerate() {
			store
				.commit_fingerprint(claim, &format!("{i}").repeat(64), 1, 100)
				.await
				.unwrap();
		}

		// Both already have live upload entries; trigger adds nothing.
		assert_eq!(store.trigger_uploads(None, None).await.unwrap(), 0);

		// Drain one upload entry, then trigger restores it.
		let upload = &store
			.claim(QueueKind::PendingUpload, 1, Duration::from_secs(60))
			.await
			.unwrap()[0];
		store.fail(upload, "offline", Duration::ZERO).await.unwrap();
		let drained = store
			.claim(QueueKind::PendingUpload, 1, Duration::from_secs(60))
			.await
			.unwrap();
		store.complete(&drained[0]).await.unwrap();
		assert_eq!(store.trigger_uploads(None, None).await.unwrap(), 1);
	}
}
