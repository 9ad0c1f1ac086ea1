//! Exclude pattern entity

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "excludes")]
pub struct Model {
	#[sea_orm(primary_key)]
	pub id: i32,
	/// Glob-or-component pattern; non-empty, case-sensitive, unique.
	pub pattern: String,
	pub created_at: DateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
