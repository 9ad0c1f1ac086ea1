//! Activity event entity
//!
//! Append-only; ids are strictly increasing (SQLite AUTOINCREMENT) so SSE
//! consumers can replay from a cursor without gaps or duplicates.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "activity_events")]
pub struct Model {
	#[sea_orm(primary_key)]
	pub id: i64,
	pub created_at: DateTimeUtc,
	pub kind: String,
	pub file_path: Option<String>,
	pub root_id: Option<i32>,
	pub message: Option<String>,
	pub details: Option<Json>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

/// Kinds of activity the daemon reports.
#[derive(
	Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, Serialize, Deserialize,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ActivityKind {
	ScanStarted,
	ScanComplete,
	ScanRecovered,
	FileDiscovered,
	FileChanged,
	FileDeleted,
	FileMissing,
	FingerprintUnchanged,
	FingerprintFailed,
	UploadStarted,
	UploadProgress,
	UploadComplete,
	UploadFailed,
	Error,
}
