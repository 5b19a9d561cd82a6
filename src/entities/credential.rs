use async_trait::async_trait;
use sea_orm::entity::prelude::*;
use sea_orm::{ActiveModelBehavior, ActiveValue::Set};
use serde::{Deserialize, Serialize};

use crate::models::Platform;

/// Validation probes, strictest first. The declaration order is the probe order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, EnumIter, DeriveActiveEnum, Serialize, Deserialize)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::None)")]
#[serde(rename_all = "snake_case")]
pub enum ProbeTier {
    #[sea_orm(string_value = "account_profile")]
    AccountProfile,
    #[sea_orm(string_value = "owned_resources")]
    OwnedResources,
    #[sea_orm(string_value = "public_config")]
    PublicConfig,
}

impl ProbeTier {
    pub const ORDER: [ProbeTier; 3] = [
        ProbeTier::AccountProfile,
        ProbeTier::OwnedResources,
        ProbeTier::PublicConfig,
    ];
}

#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Eq)]
#[sea_orm(table_name = "credential")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub platform: Platform,
    pub principal: String,
    /// Opaque session payload, a cookie string for both platforms
    pub payload: String,
    pub valid: bool,
    pub last_validated_at: Option<i64>,
    pub validated_tier: Option<ProbeTier>,
    pub last_valid_at: Option<i64>,
    /// Estimated, unix seconds
    pub expires_at: Option<i64>,
    pub nickname: Option<String>,
    pub is_vip: Option<bool>,
    pub needs_attention: bool,
    pub expiry_warning_sent: bool,
    pub created_at: i64,
    pub updated_at: i64,
}

#[async_trait]
impl ActiveModelBehavior for ActiveModel {
    fn new() -> Self {
        let now = chrono::Utc::now().timestamp();
        Self {
            created_at: Set(now),
            updated_at: Set(now),
            valid: Set(false),
            needs_attention: Set(false),
            expiry_warning_sent: Set(false),
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
