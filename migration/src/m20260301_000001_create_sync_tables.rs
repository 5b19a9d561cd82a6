use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table("download_job")
                    .if_not_exists()
                    .col(
                        ColumnDef::new("id")
                            .big_integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(ColumnDef::new("platform").string().not_null())
                    .col(ColumnDef::new("track_id").string().not_null())
                    .col(ColumnDef::new("title").string().not_null())
                    .col(ColumnDef::new("artist").string().not_null())
                    .col(ColumnDef::new("album").string().not_null())
                    .col(ColumnDef::new("duration_ms").big_integer())
                    .col(ColumnDef::new("requested_quality").string().not_null())
                    .col(ColumnDef::new("current_quality").string().not_null())
                    .col(ColumnDef::new("state").string().not_null())
                    .col(ColumnDef::new("attempts").integer().not_null().default(0))
                    .col(ColumnDef::new("retries").integer().not_null().default(0))
                    .col(
                        ColumnDef::new("auth_refreshed")
                            .boolean()
                            .not_null()
                            .default(false),
                    )
                    .col(ColumnDef::new("fallback_history").text().not_null())
                    .col(ColumnDef::new("next_attempt_at").big_integer())
                    .col(ColumnDef::new("file_path").string())
                    .col(ColumnDef::new("delivered_quality").string())
                    .col(ColumnDef::new("bytes_written").big_integer())
                    .col(ColumnDef::new("error").text())
                    .col(ColumnDef::new("resumed").boolean().not_null().default(false))
                    .col(ColumnDef::new("subscription_id").big_integer())
                    .col(ColumnDef::new("finished_at").big_integer())
                    .col(ColumnDef::new("created_at").big_integer().not_null())
                    .col(ColumnDef::new("updated_at").big_integer().not_null())
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_download_job_state")
                    .table("download_job")
                    .col("state")
                    .to_owned(),
            )
            .await?;

        // At most one non-terminal job per (platform, track_id).
        manager
            .get_connection()
            .execute_unprepared(
                "CREATE UNIQUE INDEX IF NOT EXISTS idx_download_job_active_key \
                 ON download_job (platform, track_id) \
                 WHERE state NOT IN ('succeeded', 'failed')",
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table("playlist_subscription")
                    .if_not_exists()
                    .col(
                        ColumnDef::new("id")
                            .big_integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(ColumnDef::new("platform").string().not_null())
                    .col(ColumnDef::new("playlist_id").string().not_null())
                    .col(ColumnDef::new("name").string())
                    .col(ColumnDef::new("quality").string().not_null())
                    .col(ColumnDef::new("sync_interval_secs").big_integer().not_null())
                    .col(ColumnDef::new("last_seen_track_ids").text().not_null())
                    .col(ColumnDef::new("last_successful_run").big_integer())
                    .col(ColumnDef::new("last_error").text())
                    .col(ColumnDef::new("active").boolean().not_null().default(true))
                    .col(ColumnDef::new("created_at").big_integer().not_null())
                    .col(ColumnDef::new("updated_at").big_integer().not_null())
                    .index(
                        Index::create()
                            .name("idx_playlist_subscription_source")
                            .col("platform")
                            .col("playlist_id")
                            .unique(),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table("credential")
                    .if_not_exists()
                    .col(
                        ColumnDef::new("id")
                            .big_integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(ColumnDef::new("platform").string().not_null())
                    .col(ColumnDef::new("principal").string().not_null())
                    .col(ColumnDef::new("payload").text().not_null())
                    .col(ColumnDef::new("valid").boolean().not_null().default(false))
                    .col(ColumnDef::new("last_validated_at").big_integer())
                    .col(ColumnDef::new("validated_tier").string())
                    .col(ColumnDef::new("last_valid_at").big_integer())
                    .col(ColumnDef::new("expires_at").big_integer())
                    .col(ColumnDef::new("nickname").string())
                    .col(ColumnDef::new("is_vip").boolean())
                    .col(
                        ColumnDef::new("needs_attention")
                            .boolean()
                            .not_null()
                            .default(false),
                    )
                    .col(
                        ColumnDef::new("expiry_warning_sent")
                            .boolean()
                            .not_null()
                            .default(false),
                    )
                    .col(ColumnDef::new("created_at").big_integer().not_null())
                    .col(ColumnDef::new("updated_at").big_integer().not_null())
                    .index(
                        Index::create()
                            .name("idx_credential_key")
                            .col("platform")
                            .col("principal")
                            .unique(),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table("download_record")
                    .if_not_exists()
                    .col(
                        ColumnDef::new("id")
                            .big_integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(ColumnDef::new("job_id").big_integer().not_null())
                    .col(ColumnDef::new("platform").string().not_null())
                    .col(ColumnDef::new("succeeded").boolean().not_null())
                    .col(ColumnDef::new("bytes").big_integer().not_null().default(0))
                    .col(ColumnDef::new("duration_ms").big_integer().not_null().default(0))
                    .col(ColumnDef::new("day").string().not_null())
                    .col(ColumnDef::new("created_at").big_integer().not_null())
                    .col(ColumnDef::new("updated_at").big_integer().not_null())
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table("download_record").to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table("credential").to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table("playlist_subscription").to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table("download_job").to_owned())
            .await?;

        Ok(())
    }
}
