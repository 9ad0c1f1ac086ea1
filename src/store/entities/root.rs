//! Registered root entity

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "roots")]
pub struct Model {
	#[sea_orm(primary_key)]
	pub id: i32,
	/// Absolute path of the watched tree; unique.
	pub path: String,
	pub recursive: bool,
	pub enabled: bool,
	pub created_at: DateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
	#[sea_orm(has_many = "super::file::Entity")]
	Files,
}

impl Related<super::file::Entity> for Entity {
	fn to() -> RelationDef {
		Relation::Files.def()
	}
}

impl ActiveModelBehavior for ActiveModel {}
