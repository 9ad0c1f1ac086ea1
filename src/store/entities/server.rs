//! Remote server configuration entity
//!
//! Credentials are written once at creation; the bearer token is cached
//! opportunistically by the uploader and refreshed on expiry or 401.

use sea_orm::entity::prelude::*;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "servers")]
pub struct Model {
	#[sea_orm(primary_key)]
	pub id: i32,
	pub name: String,
	pub base_url: String,
	pub username: String,
	/// Login secret. Never serialized out of the store or logged.
	pub secret: String,
	/// At most one server row carries the default flag.
	pub is_default: bool,
	pub token: Option<String>,
	pub token_expiry: Option<DateTimeUtc>,
	pub created_at: DateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
