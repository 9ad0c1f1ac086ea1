//! Append-only activity log
//!
//! Consumers (polling API, SSE streams) read with an ever-advancing cursor;
//! nothing subscribes in-process, so a crash loses no events and slow
//! readers never block writers. Retention trims the head of the log but
//! never past the oldest live SSE cursor.

use super::entities::activity_event::{self, ActivityKind};
use super::{Store, StoreResult};
use chrono::Utc;
use sea_orm::ActiveValue::Set;
use sea_orm::{
	ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter, QueryOrder, QuerySelect,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// An activity record about to be appended.
#[derive(Debug, Clone)]
pub struct NewActivity {
	pub kind: ActivityKind,
	pub file_path: Option<String>,
	pub root_id: Option<i32>,
	pub message: Option<String>,
	pub details: Option<serde_json::Value>,
}

impl NewActivity {
	pub fn new(kind: ActivityKind) -> Self {
		Self {
			kind,
			file_path: None,
			root_id: None,
			message: None,
			details: None,
		}
	}

	pub fn path(mut self, path: impl Into<String>) -> Self {
		self.file_path = Some(path.into());
		self
	}

	pub fn root(mut self, root_id: i32) -> Self {
		self.root_id = Some(root_id);
		self
	}

	pub fn message(mut self, message: impl Into<String>) -> Self {
		self.message = Some(message.into());
		self
	}

	pub fn details(mut self, details: serde_json::Value) -> Self {
		self.details = Some(details);
		self
	}
}

/// Append an event inside an existing transaction.
pub(crate) async fn append_on<C: ConnectionTrait>(
	db: &C,
	event: NewActivity,
) -> Result<i64, sea_orm::DbErr> {
	let model = activity_event::Entity::insert(activity_event::ActiveModel {
		created_at: Set(Utc::now()),
		kind: Set(event.kind.to_string()),
		file_path: Set(event.file_path),
		root_id: Set(event.root_id),
		message: Set(event.message),
		details: Set(event.details),
		..Default::default()
	})
	.exec(db)
	.await?;
	Ok(model.last_insert_id)
}

impl Store {
	pub async fn append_activity(&self, event: NewActivity) -> StoreResult<i64> {
		Ok(append_on(&self.conn, event).await?)
	}

	/// Read events after `since_id` in id order.
	pub async fn read_activity(
		&self,
		since_id: i64,
		limit: u64,
		kind: Option<ActivityKind>,
	) -> StoreResult<Vec<activity_event::Model>> {
		let mut query = activity_event::Entity::find()
			.filter(activity_event::Column::Id.gt(since_id))
			.order_by_asc(activity_event::Column::Id)
			.limit(limit);
		if let Some(kind) = kind {
			query = query.filter(activity_event::Column::Kind.eq(kind.to_string()));
		}
		Ok(query.all(&self.conn).await?)
	}

	/// Trim the log by age and count cap, but never delete an event a live
	/// SSE stream has not delivered yet.
	pub async fn prune_activity(&self, max_age: Duration, max_count: u64) -> StoreResult<u64> {
		let newest = activity_event::Entity::find()
			.order_by_desc(activity_event::Column::Id)
			.one(&self.conn)
			.await?;
		let Some(newest) = newest else {
			return Ok(0);
		};

		let cutoff = Utc::now() - chrono::Duration::milliseconds(max_age.as_millis() as i64);
		let count_floor = newest.id - max_count as i64;

		let mut condition = sea_orm::Condition::any()
			.add(activity_event::Column::CreatedAt.lt(cutoff))
			.add(activity_event::Column::Id.lte(count_floor));
		let mut query = activity_event::Entity::delete_many().filter(condition.clone());
		if let Some(read_floor) = self.cursors.min_cursor() {
			condition = sea_orm::Condition::all()
				.add(condition)
				.add(activity_event::Column::Id.lte(read_floor));
			query = activity_event::Entity::delete_many().filter(condition);
		}

		let deleted = query.exec(&self.conn).await?;
		Ok(deleted.rows_affected)
	}
}

/// Registry of live SSE cursors, consulted by retention so pruning cannot
/// outrun an attached stream.
#[derive(Clone, Default)]
pub struct SseCursors {
	inner: Arc<CursorsInner>,
}

#[derive(Default)]
struct CursorsInner {
	positions: Mutex<HashMap<u64, i64>>,
	next_id: AtomicU64,
}

impl SseCursors {
	/// Register a stream starting at `since_id`; the guard withdraws the
	/// cursor when the stream ends.
	pub fn register(&self, since_id: i64) -> CursorGuard {
		let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
		self.inner
			.positions
			.lock()
			.expect("cursor registry poisoned")
			.insert(id, since_id);
		CursorGuard {
			cursors: self.clone(),
			id,
		}
	}

	fn advance(&self, id: u64, position: i64) {
		if let Ok(mut positions) = self.inner.positions.lock() {
			positions.insert(id, position);
		}
	}

	fn remove(&self, id: u64) {
		if let Ok(mut positions) = self.inner.positions.lock() {
			positions.remove(&id);
		}
	}

	fn min_cursor(&self) -> Option<i64> {
		self.inner
			.positions
			.lock()
			.ok()?
			.values()
			.copied()
			.min()
	}
}

/// Live handle on one SSE stream's position in the log.
pub struct CursorGuard {
	cursors: SseCursors,
	id: u64,
}

impl CursorGuard {
	pub fn advance(&self, position: i64) {
		self.cursors.advance(self.id, position);
	}
}

impl Drop for CursorGuard {
	fn drop(&mut self) {
		self.cursors.remove(self.id);
	}
}
