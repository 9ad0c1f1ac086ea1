//! Durable queue entry entity
//!
//! One table backs all three work queues; rows are discriminated by the
//! `queue` column. Visibility is purely time-based: a claimed entry has
//! `next_visible_at` pushed past its lease and becomes claimable again the
//! moment the lease lapses, so no sweeper exists.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "queue_entries")]
pub struct Model {
	#[sea_orm(primary_key)]
	pub id: i32,
	pub queue: String,
	pub file_id: i32,
	pub enqueued_at: DateTimeUtc,
	pub attempts: i32,
	/// FIFO order is `(next_visible_at, id)`.
	pub next_visible_at: DateTimeUtc,
	pub claim_token: Option<String>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
	#[sea_orm(
		belongs_to = "super::file::Entity",
		from = "Column::FileId",
		to = "super::file::Column::Id"
	)]
	File,
}

impl Related<super::file::Entity> for Entity {
	fn to() -> RelationDef {
		Relation::File.def()
	}
}

impl ActiveModelBehavior for ActiveModel {}

/// Which pipeline stage a queue feeds.
#[derive(
	Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, Serialize, Deserialize,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum QueueKind {
	PendingChecksum,
	PendingUpload,
	PendingDeletion,
}
