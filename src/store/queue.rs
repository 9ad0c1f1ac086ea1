//! Durable work queues
//!
//! `claim` hands a worker a time-bounded exclusive lease on up to N entries;
//! `complete` retires them and `fail` reschedules them with backoff. A claim
//! that is neither completed nor failed simply becomes visible again when
//! its lease lapses, which is how work survives crashes and shutdowns.

use super::entities::{file, queue_entry};
use super::{QueueKind, Store, StoreResult};
use chrono::{DateTime, Utc};
use sea_orm::ActiveValue::Set;
use sea_orm::{
	ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter, QueryOrder, QuerySelect,
	TransactionTrait,
};
use std::time::Duration;
use uuid::Uuid;

/// A queue entry held under lease by one worker.
#[derive(Debug, Clone)]
pub struct ClaimedEntry {
	pub entry: queue_entry::Model,
	token: String,
}

impl ClaimedEntry {
	pub fn file_id(&self) -> i32 {
		self.entry.file_id
	}

	pub fn attempts(&self) -> i32 {
		self.entry.attempts
	}

	pub(crate) fn token(&self) -> &str {
		&self.token
	}
}

fn to_chrono(d: Duration) -> chrono::Duration {
	chrono::Duration::milliseconds(d.as_millis() as i64)
}

/// Insert a queue entry unless a live one already exists for the same
/// `(queue, file_id)`. Callers run this inside the transaction that updates
/// the file row so enqueue and status change commit together.
pub(crate) async fn enqueue_on<C: ConnectionTrait>(
	db: &C,
	queue: QueueKind,
	file_id: i32,
) -> Result<bool, sea_orm::DbErr> {
	let existing = queue_entry::Entity::find()
		.filter(queue_entry::Column::Queue.eq(queue.to_string()))
		.filter(queue_entry::Column::FileId.eq(file_id))
		.one(db)
		.await?;
	if existing.is_some() {
		return Ok(false);
	}

	queue_entry::Entity::insert(queue_entry::ActiveModel {
		queue: Set(queue.to_string()),
		file_id: Set(file_id),
		enqueued_at: Set(Utc::now()),
		attempts: Set(0),
		next_visible_at: Set(Utc::now()),
		claim_token: Set(None),
		..Default::default()
	})
	.exec(db)
	.await?;
	Ok(true)
}

impl Store {
	pub async fn enqueue(&self, queue: QueueKind, file_id: i32) -> StoreResult<bool> {
		Ok(enqueue_on(&self.conn, queue, file_id).await?)
	}

	/// Claim up to `limit` visible entries of `queue`, extending their
	/// visibility horizon to `now + lease`. Atomic: the guarded update only
	/// touches rows still visible, so two workers can never hold the same
	/// entry inside one lease window.
	pub async fn claim(
		&self,
		queue: QueueKind,
		limit: u64,
		lease: Duration,
	) -> StoreResult<Vec<ClaimedEntry>> {
		let now = Utc::now();
		let token = Uuid::new_v4().to_string();

		let txn = self.conn.begin().await?;
		let candidates: Vec<i32> = queue_entry::Entity::find()
			.filter(queue_entry::Column::Queue.eq(queue.to_string()))
			.filter(queue_entry::Column::NextVisibleAt.lte(now))
			.order_by_asc(queue_entry::Column::NextVisibleAt)
			.order_by_asc(queue_entry::Column::Id)
			.limit(limit)
			.all(&txn)
			.await?
			.into_iter()
			.map(|e| e.id)
			.collect();

		if candidates.is_empty() {
			txn.commit().await?;
			return Ok(Vec::new());
		}

		queue_entry::Entity::update_many()
			.filter(queue_entry::Column::Id.is_in(candidates))
			.filter(queue_entry::Column::NextVisibleAt.lte(now))
			.set(queue_entry::ActiveModel {
				claim_token: Set(Some(token.clone())),
				next_visible_at: Set(now + to_chrono(lease)),
				..Default::default()
			})
			.exec(&txn)
			.await?;

		let claimed = queue_entry::Entity::find()
			.filter(queue_entry::Column::ClaimToken.eq(token.clone()))
			.order_by_asc(queue_entry::Column::Id)
			.all(&txn)
			.await?;
		txn.commit().await?;

		Ok(claimed
			.into_iter()
			.map(|entry| ClaimedEntry {
				entry,
				token: token.clone(),
			})
			.collect())
	}

	/// Retire a claimed entry. Returns false when the lease had already
	/// lapsed and another worker took the entry over.
	pub async fn complete(&self, claim: &ClaimedEntry) -> StoreResult<bool> {
		let deleted = queue_entry::Entity::delete_many()
			.filter(queue_entry::Column::Id.eq(claim.entry.id))
			.filter(queue_entry::Column::ClaimToken.eq(claim.token()))
			.exec(&self.conn)
			.await?;
		Ok(deleted.rows_affected > 0)
	}

	/// Record a failed attempt: bump the attempt counter, release the claim
	/// and schedule the entry `backoff` into the future. The error lands on
	/// the file row's `last_error` in the same transaction.
	pub async fn fail(
		&self,
		claim: &ClaimedEntry,
		error: &str,
		backoff: Duration,
	) -> StoreResult<bool> {
		let txn = self.conn.begin().await?;
		let updated = queue_entry::Entity::update_many()
			.filter(queue_entry::Column::Id.eq(claim.entry.id))
			.filter(queue_entry::Column::ClaimToken.eq(claim.token()))
			.set(queue_entry::ActiveModel {
				attempts: Set(claim.entry.attempts + 1),
				claim_token: Set(None),
				next_visible_at: Set(Utc::now() + to_chrono(backoff)),
				..Default::default()
			})
			.exec(&txn)
			.await?;

		if updated.rows_affected > 0 {
			file::Entity::update_many()
				.filter(file::Column::Id.eq(claim.entry.file_id))
				.set(file::ActiveModel {
					last_error: Set(Some(error.to_string())),
					updated_at: Set(Utc::now()),
					..Default::default()
				})
				.exec(&txn)
				.await?;
		}
		txn.commit().await?;
		Ok(updated.rows_affected > 0)
	}

	/// Earliest moment any entry of `queue` becomes visible, for idle backoff.
	pub async fn next_visible(&self, queue: QueueKind) -> StoreResult<Option<DateTime<Utc>>> {
		Ok(queue_entry::Entity::find()
			.filter(queue_entry::Column::Queue.eq(queue.to_string()))
			.order_by_asc(queue_entry::Column::NextVisibleAt)
			.one(&self.conn)
			.await?
			.map(|e| e.next_visible_at))
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use pretty_assertions::assert_eq;

	const LEASE: Duration = Duration::from_secs(60);

	#[tokio::test]
	async fn claim_is_fifo_and_exclusive() {
		let store = Store::open_in_memory().await.unwrap();
		for file_id in 1..=3 {
			assert!(store
				.enqueue(QueueKind::PendingChecksum, file_id)
				.await
				.unwrap());
		}

		let first = store
			.claim(QueueKind::PendingChecksum, 2, LEASE)
			.await
			.unwrap();
		assert_eq!(
			first.iter().map(|c| c.file_id()).collect::<Vec<_>>(),
			vec![1, 2]
		);

		let second = store
			.claim(QueueKind::PendingChecksum, 10, LEASE)
			.await
			.unwrap();
		assert_eq!(second.len(), 1);
		assert_eq!(second[0].file_id(), 3);

		// Everything is leased out now.
		assert!(store
			.claim(QueueKind::PendingChecksum, 10, LEASE)
			.await
			.unwrap()
			.is_empty());
	}

	#[tokio::test]
	async fn enqueue_is_idempotent_while_entry_lives() {
		let store = Store::open_in_memory().await.unwrap();
		assert!(store.enqueue(QueueKind::PendingUpload, 7).await.unwrap());
		assert!(!store.enqueue(QueueKind::PendingUpload, 7).await.unwrap());

		// A claimed entry still blocks re-enqueue.
		let claims = store.claim(QueueKind::PendingUpload, 1, LEASE).await.unwrap();
		assert!(!store.enqueue(QueueKind::PendingUpload, 7).await.unwrap());

		// Completion frees the slot.
		assert!(store.complete(&claims[0]).await.unwrap());
		assert!(store.enqueue(QueueKind::PendingUpload, 7).await.unwrap());
	}

	#[tokio::test]
	async fn failed_entry_comes_back_with_bumped_attempts() {
		let store = Store::open_in_memory().await.unwrap();
		store.enqueue(QueueKind::PendingChecksum, 1).await.unwrap();

		let claims = store
			.claim(QueueKind::PendingChecksum, 1, LEASE)
			.await
			.unwrap();
		assert!(store
			.fail(&claims[0], "read error", Duration::ZERO)
			.await
			.unwrap());

		let again = store
			.claim(QueueKind::PendingChecksum, 1, LEASE)
			.await
			.unwrap();
		assert_eq!(again.len(), 1);
		assert_eq!(again[0].attempts(), 1);
	}

	#[tokio::test]
	async fn lapsed_lease_makes_entry_visible_again() {
		let store = Store::open_in_memory().await.unwrap();
		store.enqueue(QueueKind::PendingChecksum, 1).await.unwrap();

		let stale = store
			.claim(QueueKind::PendingChecksum, 1, Duration::ZERO)
			.await
			.unwrap();
		assert_eq!(stale.len(), 1);

		// Lease of zero lapses immediately; a second worker can claim.
		let fresh = store
			.claim(QueueKind::PendingChecksum, 1, LEASE)
			.await
			.unwrap();
		assert_eq!(fresh.len(), 1);

		// The original claimant lost the entry: complete is a no-op.
		assert!(!store.complete(&stale[0]).await.unwrap());
		assert!(store.complete(&fresh[0]).await.unwrap());
	}
}
