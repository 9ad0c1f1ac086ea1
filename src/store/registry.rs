//! Root, exclude, and server configuration CRUD

use super::entities::{exclude, file, queue_entry, root, server};
use super::{Store, StoreError, StoreResult};
use chrono::Utc;
use sea_orm::ActiveValue::Set;
use sea_orm::{
	ActiveModelTrait, ColumnTrait, EntityTrait, QueryFilter, QueryOrder, TransactionTrait,
};

/// Outcome of a create-if-absent operation.
#[derive(Debug, Clone, PartialEq)]
pub enum Created<T> {
	New(T),
	/// A row with the same unique key already existed; it is returned
	/// untouched so callers can report a conflict with the existing id.
	Existing(T),
}

impl<T> Created<T> {
	pub fn into_inner(self) -> T {
		match self {
			Created::New(m) | Created::Existing(m) => m,
		}
	}

	pub fn is_new(&self) -> bool {
		matches!(self, Created::New(_))
	}
}

impl Store {
	pub async fn create_root(&self, path: &str, recursive: bool) -> StoreResult<Created<root::Model>> {
		if !path.starts_with('/') {
			return Err(StoreError::InvalidInput(format!(
				"root path must be absolute: {path}"
			)));
		}
		let path = path.trim_end_matches('/');
		let path = if path.is_empty() { "/" } else { path };

		if let Some(existing) = root::Entity::find()
			.filter(root::Column::Path.eq(path))
			.one(&self.conn)
			.await?
		{
			return Ok(Created::Existing(existing));
		}

		let model = root::ActiveModel {
			path: Set(path.to_string()),
			recursive: Set(recursive),
			enabled: Set(true),
			created_at: Set(Utc::now()),
			..Default::default()
		}
		.insert(&self.conn)
		.await?;
		Ok(Created::New(model))
	}

	pub async fn list_roots(&self) -> StoreResult<Vec<root::Model>> {
		Ok(root::Entity::find()
			.order_by_asc(root::Column::Id)
			.all(&self.conn)
			.await?)
	}

	pub async fn get_root(&self, id: i32) -> StoreResult<root::Model> {
		root::Entity::find_by_id(id)
			.one(&self.conn)
			.await?
			.ok_or(StoreError::NotFound("root"))
	}

	/// Delete a root together with every file row under it and their queue
	/// entries, in one transaction.
	pub async fn delete_root(&self, id: i32) -> StoreResult<()> {
		let txn = self.conn.begin().await?;

		let files = file::Entity::find()
			.filter(file::Column::RootId.eq(id))
			.all(&txn)
			.await?;
		let file_ids: Vec<i32> = files.iter().map(|f| f.id).collect();
		if !file_ids.is_empty() {
			queue_entry::Entity::delete_many()
				.filter(queue_entry::Column::FileId.is_in(file_ids.clone()))
				.exec(&txn)
				.await?;
			file::Entity::delete_many()
				.filter(file::Column::Id.is_in(file_ids))
				.exec(&txn)
				.await?;
		}

		let deleted = root::Entity::delete_by_id(id).exec(&txn).await?;
		if deleted.rows_affected == 0 {
			return Err(StoreError::NotFound("root"));
		}
		txn.commit().await?;
		Ok(())
	}

	pub async fn create_exclude(&self, pattern: &str) -> StoreResult<Created<exclude::Model>> {
		if pattern.is_empty() {
			return Err(StoreError::InvalidInput(
				"exclude pattern must not be empty".into(),
			));
		}

		if let Some(existing) = exclude::Entity::find()
			.filter(exclude::Column::Pattern.eq(pattern))
			.one(&self.conn)
			.await?
		{
			return Ok(Created::Existing(existing));
		}

		let model = exclude::ActiveModel {
			pattern: Set(pattern.to_string()),
			created_at: Set(Utc::now()),
			..Default::default()
		}
		.insert(&self.conn)
		.await?;
		Ok(Created::New(model))
	}

	pub async fn list_excludes(&self) -> StoreResult<Vec<exclude::Model>> {
		Ok(exclude::Entity::find()
			.order_by_asc(exclude::Column::Id)
			.all(&self.conn)
			.await?)
	}

	pub async fn delete_exclude(&self, id: i32) -> StoreResult<()> {
		let deleted = exclude::Entity::delete_by_id(id).exec(&self.conn).await?;
		if deleted.rows_affected == 0 {
			return Err(StoreError::NotFound("exclude"));
		}
		Ok(())
	}

	pub async fn create_server(&self, new: NewServer) -> StoreResult<Created<server::Model>> {
		if let Some(existing) = server::Entity::find()
			.filter(server::Column::Name.eq(&new.name))
			.one(&self.conn)
			.await?
		{
			return Ok(Created::Existing(existing));
		}

		let txn = self.conn.begin().await?;
		if new.is_default {
			server::Entity::update_many()
				.filter(server::Column::IsDefault.eq(true))
				.set(server::ActiveModel {
					is_default: Set(false),
					..Default::default()
				})
				.exec(&txn)
				.await?;
		}
		let model = server::ActiveModel {
			name: Set(new.name),
			base_url: Set(new.base_url.trim_end_matches('/').to_string()),
			username: Set(new.username),
			secret: Set(new.secret),
			is_default: Set(new.is_default),
			token: Set(None),
			token_expiry: Set(None),
			created_at: Set(Utc::now()),
			..Default::default()
		}
		.insert(&txn)
		.await?;
		txn.commit().await?;
		Ok(Created::New(model))
	}

	pub async fn list_servers(&self) -> StoreResult<Vec<server::Model>> {
		Ok(server::Entity::find()
			.order_by_asc(server::Column::Id)
			.all(&self.conn)
			.await?)
	}

	pub async fn delete_server(&self, id: i32) -> StoreResult<()> {
		let deleted = server::Entity::delete_by_id(id).exec(&self.conn).await?;
		if deleted.rows_affected == 0 {
			return Err(StoreError::NotFound("server"));
		}
		Ok(())
	}

	/// Flip the default flag to `id`, clearing any previous default in the
	/// same transaction so at most one row ever carries it.
	pub async fn set_default_server(&self, id: i32) -> StoreResult<server::Model> {
		let txn = self.conn.begin().await?;
		let target = server::Entity::find_by_id(id)
			.one(&txn)
			.await?
			.ok_or(StoreError::NotFound("server"))?;

		server::Entity::update_many()
			.filter(server::Column::IsDefault.eq(true))
			.set(server::ActiveModel {
				is_default: Set(false),
				..Default::default()
			})
			.exec(&txn)
			.await?;

		let mut active: server::ActiveModel = target.into();
		active.is_default = Set(true);
		let model = active.update(&txn).await?;
		txn.commit().await?;
		Ok(model)
	}

	pub async fn default_server(&self) -> StoreResult<Option<server::Model>> {
		Ok(server::Entity::find()
			.filter(server::Column::IsDefault.eq(true))
			.one(&self.conn)
			.await?)
	}

	/// Cache a freshly minted bearer token on the server row.
	pub async fn store_token(
		&self,
		server_id: i32,
		token: &str,
		expiry: chrono::DateTime<Utc>,
	) -> StoreResult<()> {
		server::Entity::update_many()
			.filter(server::Column::Id.eq(server_id))
			.set(server::ActiveModel {
				token: Set(Some(token.to_string())),
				token_expiry: Set(Some(expiry)),
				..Default::default()
			})
			.exec(&self.conn)
			.await?;
		Ok(())
	}

	/// Evict a cached token after the server rejected it.
	pub async fn clear_token(&self, server_id: i32) -> StoreResult<()> {
		server::Entity::update_many()
			.filter(server::Column::Id.eq(server_id))
			.set(server::ActiveModel {
				token: Set(None),
				token_expiry: Set(None),
				..Default::default()
			})
			.exec(&self.conn)
			.await?;
		Ok(())
	}
}

/// Parameters for registering a remote server.
#[derive(Debug, Clone)]
pub struct NewServer {
	pub name: String,
	pub base_url: String,
	pub username: String,
	pub secret: String,
	pub is_default: bool,
}
