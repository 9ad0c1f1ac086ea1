//! Tracked file entity

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "files")]
pub struct Model {
	#[sea_orm(primary_key)]
	pub id: i32,
	/// Absolute path; unique across all roots.
	pub path: String,
	pub root_id: i32,
	pub size: i64,
	/// Modification time in nanoseconds since the epoch.
	/// `(size, mtime_ns)` is the change key.
	pub mtime_ns: i64,
	pub mode: i32,
	pub uid: i64,
	pub gid: i64,
	pub is_symlink: bool,
	pub link_target: Option<String>,
	/// 64 lowercase hex chars; present iff status is at least ready_for_upload.
	pub sha256: Option<String>,
	pub status: String,
	pub last_error: Option<String>,
	pub discovered_at: DateTimeUtc,
	pub updated_at: DateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
	#[sea_orm(
		belongs_to = "super::root::Entity",
		from = "Column::RootId",
		to = "super::root::Column::Id"
	)]
	Root,
}

impl Related<super::root::Entity> for Entity {
	fn to() -> RelationDef {
		Relation::Root.def()
	}
}

impl ActiveModelBehavior for ActiveModel {}

/// Lifecycle of a tracked file.
///
/// `discovered → hashing → ready_for_upload → uploading → completed`, with
/// `failed` reachable from any non-terminal state and `deleted` terminal for
/// a path until it reappears on disk. Completed rows stay in the table so
/// later modifications are detected via the change key.
#[derive(
	Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, Serialize, Deserialize,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum FileStatus {
	Discovered,
	Hashing,
	ReadyForUpload,
	Uploading,
	Completed,
	Failed,
	Deleted,
}

impl Model {
	pub fn status(&self) -> FileStatus {
		self.status.parse().unwrap_or(FileStatus::Failed)
	}
}
