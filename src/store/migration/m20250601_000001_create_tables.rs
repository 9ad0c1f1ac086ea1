//! Initial migration creating all daemon tables

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
	async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
		manager
			.create_table(
				Table::create()
					.table(Roots::Table)
					.if_not_exists()
					.col(
						ColumnDef::new(Roots::Id)
							.integer()
							.not_null()
							.auto_increment()
							.primary_key(),
					)
					.col(ColumnDef::new(Roots::Path).string().not_null().unique_key())
					.col(
						ColumnDef::new(Roots::Recursive)
							.boolean()
							.not_null()
							.default(true),
					)
					.col(
						ColumnDef::new(Roots::Enabled)
							.boolean()
							.not_null()
							.default(true),
					)
					.col(
						ColumnDef::new(Roots::CreatedAt)
							.timestamp_with_time_zone()
							.not_null(),
					)
					.to_owned(),
			)
			.await?;

		manager
			.create_table(
				Table::create()
					.table(Excludes::Table)
					.if_not_exists()
					.col(
						ColumnDef::new(Excludes::Id)
							.integer()
							.not_null()
							.auto_increment()
							.primary_key(),
					)
					.col(
						ColumnDef::new(Excludes::Pattern)
							.string()
							.not_null()
							.unique_key(),
					)
					.col(
						ColumnDef::new(Excludes::CreatedAt)
							.timestamp_with_time_zone()
							.not_null(),
					)
					.to_owned(),
			)
			.await?;

		manager
			.create_table(
				Table::create()
					.table(Servers::Table)
					.if_not_exists()
					.col(
						ColumnDef::new(Servers::Id)
							.integer()
							.not_null()
							.auto_increment()
							.primary_key(),
					)
					.col(ColumnDef::new(Servers::Name).string().not_null().unique_key())
					.col(ColumnDef::new(Servers::BaseUrl).string().not_null())
					.col(ColumnDef::new(Servers::Username).string().not_null())
					.col(ColumnDef::new(Servers::Secret).string().not_null())
					.col(
						ColumnDef::new(Servers::IsDefault)
							.boolean()
							.not_null()
							.default(false),
					)
					.col(ColumnDef::new(Servers::Token).string())
					.col(ColumnDef::new(Servers::TokenExpiry).timestamp_with_time_zone())
					.col(
						ColumnDef::new(Servers::CreatedAt)
							.timestamp_with_time_zone()
							.not_null(),
					)
					.to_owned(),
			)
			.await?;

		manager
			.create_table(
				Table::create()
					.table(Files::Table)
					.if_not_exists()
					.col(
						ColumnDef::new(Files::Id)
							.integer()
							.not_null()
							.auto_increment()
							.primary_key(),
					)
					.col(ColumnDef::new(Files::Path).string().not_null().unique_key())
					.col(ColumnDef::new(Files::RootId).integer().not_null())
					.col(ColumnDef::new(Files::Size).big_integer().not_null())
					.col(ColumnDef::new(Files::MtimeNs).big_integer().not_null())
					.col(ColumnDef::new(Files::Mode).integer().not_null())
					.col(ColumnDef::new(Files::Uid).big_integer().not_null())
					.col(ColumnDef::new(Files::Gid).big_integer().not_null())
					.col(
						ColumnDef::new(Files::IsSymlink)
							.boolean()
							.not_null()
							.default(false),
					)
					.col(ColumnDef::new(Files::LinkTarget).string())
					.col(ColumnDef::new(Files::Sha256).string())
					.col(ColumnDef::new(Files::Status).string().not_null())
					.col(ColumnDef::new(Files::LastError).string())
					.col(
						ColumnDef::new(Files::DiscoveredAt)
							.timestamp_with_time_zone()
							.not_null(),
					)
					.col(
						ColumnDef::new(Files::UpdatedAt)
							.timestamp_with_time_zone()
							.not_null(),
					)
					.to_owned(),
			)
			.await?;

		manager
			.create_index(
				Index::create()
					.name("idx_files_root_id")
					.table(Files::Table)
					.col(Files::RootId)
					.to_owned(),
			)
			.await?;

		manager
			.create_index(
				Index::create()
					.name("idx_files_status")
					.table(Files::Table)
					.col(Files::Status)
					.to_owned(),
			)
			.await?;

		manager
			.create_index(
				Index::create()
					.name("idx_files_sha256")
					.table(Files::Table)
					.col(Files::Sha256)
					.to_owned(),
			)
			.await?;

		manager
			.create_table(
				Table::create()
					.table(QueueEntries::Table)
					.if_not_exists()
					.col(
						ColumnDef::new(QueueEntries::Id)
							.integer()
							.not_null()
							.auto_increment()
							.primary_key(),
					)
					.col(ColumnDef::new(QueueEntries::Queue).string().not_null())
					.col(ColumnDef::new(QueueEntries::FileId).integer().not_null())
					.col(
						ColumnDef::new(QueueEntries::EnqueuedAt)
							.timestamp_with_time_zone()
							.not_null(),
					)
					.col(
						ColumnDef::new(QueueEntries::Attempts)
							.integer()
							.not_null()
							.default(0),
					)
					.col(
						ColumnDef::new(QueueEntries::NextVisibleAt)
							.timestamp_with_time_zone()
							.not_null(),
					)
					.col(ColumnDef::new(QueueEntries::ClaimToken).string())
					.to_owned(),
			)
			.await?;

		manager
			.create_index(
				Index::create()
					.name("idx_queue_visibility")
					.table(QueueEntries::Table)
					.col(QueueEntries::Queue)
					.col(QueueEntries::NextVisibleAt)
					.col(QueueEntries::Id)
					.to_owned(),
			)
			.await?;

		manager
			.create_index(
				Index::create()
					.name("idx_queue_file")
					.table(QueueEntries::Table)
					.col(QueueEntries::Queue)
					.col(QueueEntries::FileId)
					.to_owned(),
			)
			.await?;

		manager
			.create_table(
				Table::create()
					.table(ActivityEvents::Table)
					.if_not_exists()
					.col(
						ColumnDef::new(ActivityEvents::Id)
							.big_integer()
							.not_null()
							.auto_increment()
							.primary_key(),
					)
					.col(
						ColumnDef::new(ActivityEvents::CreatedAt)
							.timestamp_with_time_zone()
							.not_null(),
					)
					.col(ColumnDef::new(ActivityEvents::Kind).string().not_null())
					.col(ColumnDef::new(ActivityEvents::FilePath).string())
					.col(ColumnDef::new(ActivityEvents::RootId).integer())
					.col(ColumnDef::new(ActivityEvents::Message).string())
					.col(ColumnDef::new(ActivityEvents::Details).json())
					.to_owned(),
			)
			.await?;

		manager
			.create_index(
				Index::create()
					.name("idx_activity_kind")
					.table(ActivityEvents::Table)
					.col(ActivityEvents::Kind)
					.to_owned(),
			)
			.await?;

		Ok(())
	}

	async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
		manager
			.drop_table(Table::drop().table(ActivityEvents::Table).to_owned())
			.await?;
		manager
			.drop_table(Table::drop().table(QueueEntries::Table).to_owned())
			.await?;
		manager
			.drop_table(Table::drop().table(Files::Table).to_owned())
			.await?;
		manager
			.drop_table(Table::drop().table(Servers::Table).to_owned())
			.await?;
		manager
			.drop_table(Table::drop().table(Excludes::Table).to_owned())
			.await?;
		manager
			.drop_table(Table::drop().table(Roots::Table).to_owned())
			.await?;
		Ok(())
	}
}

#[derive(Iden)]
enum Roots {
	Table,
	Id,
	Path,
	Recursive,
	Enabled,
	CreatedAt,
}

#[derive(Iden)]
enum Excludes {
	Table,
	Id,
	Pattern,
	CreatedAt,
}

#[derive(Iden)]
enum Servers {
	Table,
	Id,
	Name,
	BaseUrl,
	Username,
	Secret,
	IsDefault,
	Token,
	TokenExpiry,
	CreatedAt,
}

#[derive(Iden)]
enum Files {
	Table,
	Id,
	Path,
	RootId,
	Size,
	MtimeNs,
	Mode,
	Uid,
	Gid,
	IsSymlink,
	LinkTarget,
	Sha256,
	Status,
	LastError,
	DiscoveredAt,
	UpdatedAt,
}

#[derive(Iden)]
enum QueueEntries {
	Table,
	Id,
	Queue,
	FileId,
	EnqueuedAt,
	Attempts,
	NextVisibleAt,
	ClaimToken,
}

#[derive(Iden)]
enum ActivityEvents {
	Table,
	Id,
	CreatedAt,
	Kind,
	FilePath,
	RootId,
	Message,
	Details,
}
