use async_trait::async_trait;
use sea_orm::entity::prelude::*;
use sea_orm::{ActiveModelBehavior, ActiveValue::Set};

use crate::models::Platform;

/// Outcome of one finished job, kept for statistics after the job itself is cleaned up.
#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Eq)]
#[sea_orm(table_name = "download_record")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub job_id: i64,
    pub platform: Platform,
    pub succeeded: bool,
    pub bytes: i64,
    pub duration_ms: i64,
    /// `YYYY-MM-DD`, UTC
    pub day: String,
    pub created_at: i64,
    pub updated_at: i64,
}

#[async_trait]
impl ActiveModelBehavior for ActiveModel {
    fn new() -> Self {
        let now = chrono::Utc::now();
        Self {
            created_at: Set(now.timestamp()),
            updated_at: Set(now.timestamp()),
            day: Set(now.format("%Y-%m-%d").to_string()),
            bytes: Set(0),
            duration_ms: Set(0),
            ..ActiveModelTrait::default()
        }
    }
}
