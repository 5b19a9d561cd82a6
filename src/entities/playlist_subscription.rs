use std::collections::BTreeSet;

use async_trait::async_trait;
use sea_orm::entity::prelude::*;
use sea_orm::{ActiveModelBehavior, ActiveValue::Set};
use serde::{Deserialize, Serialize};

use crate::models::{Platform, QualityTier};

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, FromJsonQueryResult)]
pub struct TrackIds(pub BTreeSet<String>);

#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Eq)]
#[sea_orm(table_name = "playlist_subscription")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub platform: Platform,
    pub playlist_id: String,
    pub name: Option<String>,
    pub quality: QualityTier,
    pub sync_interval_secs: i64,
    pub last_seen_track_ids: TrackIds,
    pub last_successful_run: Option<i64>,
    pub last_error: Option<String>,
    pub active: bool,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Model {
    /// Active and never run, or its interval has elapsed since the last good run
    pub fn is_due(&self, now: i64) -> bool {
        self.active
            && self
                .last_successful_run
                .is_none_or(|last| last + self.sync_interval_secs <= now)
    }
}

#[async_trait]
impl ActiveModelBehavior for ActiveModel {
    fn new() -> Self {
        let now = chrono::Utc::now().timestamp();
        Self {
            created_at: Set(now),
            updated_at: Set(now),
            last_seen_track_ids: Set(TrackIds::default()),
            active: Set(true),
            ..ActiveModelTrait::default()
        }
    }

    async fn before_save<C>(mut self, _db: &C, insert: bool) -> Result<Self, sea_orm::DbErr>
    where
        C: ConnectionTrait,
    {
        if !insert {
            self.updated_at = Set(chrono::Utc::now().timestamp());
        }
        Ok(self)
    }
}
