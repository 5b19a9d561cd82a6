use async_trait::async_trait;
use sea_orm::entity::prelude::*;
use sea_orm::{ActiveModelBehavior, ActiveValue::Set};
use serde::{Deserialize, Serialize};

use crate::models::{JobKey, Platform, QualityTier, Track};

#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Hash,
    EnumIter,
    DeriveActiveEnum,
    Serialize,
    Deserialize,
    clap::ValueEnum,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::None)")]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    #[sea_orm(string_value = "queued")]
    Queued,
    #[sea_orm(string_value = "running")]
    Running,
    #[sea_orm(string_value = "retrying")]
    Retrying,
    #[sea_orm(string_value = "fallback_quality")]
    FallbackQuality,
    #[sea_orm(string_value = "succeeded")]
    Succeeded,
    #[sea_orm(string_value = "failed")]
    Failed,
}

impl JobState {
    pub const ACTIVE: [JobState; 4] = [
        JobState::Queued,
        JobState::Running,
        JobState::Retrying,
        JobState::FallbackQuality,
    ];

    /// States a worker may pick up
    pub const DISPATCHABLE: [JobState; 3] = [
        JobState::Queued,
        JobState::Retrying,
        JobState::FallbackQuality,
    ];

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Succeeded | JobState::Failed)
    }

    /// Allowed edges of the job state machine. Terminal states have none.
    pub fn can_transition_to(&self, next: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, next),
            (Queued, Running)
                | (Running, Succeeded)
                | (Running, Retrying)
                | (Running, FallbackQuality)
                | (Running, Failed)
                | (Retrying, Running)
                | (Retrying, Failed)
                | (FallbackQuality, Running)
                | (FallbackQuality, Failed)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Running => "running",
            JobState::Retrying => "retrying",
            JobState::FallbackQuality => "fallback_quality",
            JobState::Succeeded => "succeeded",
            JobState::Failed => "failed",
        }
    }
}

/// One tier that was tried and given up on.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FallbackAttempt {
    pub tier: QualityTier,
    pub reason: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, FromJsonQueryResult)]
pub struct FallbackHistory(pub Vec<FallbackAttempt>);

impl FallbackHistory {
    pub fn contains(&self, tier: QualityTier) -> bool {
        self.0.iter().any(|attempt| attempt.tier == tier)
    }

    pub fn tiers(&self) -> Vec<QualityTier> {
        self.0.iter().map(|attempt| attempt.tier).collect()
    }
}

#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Eq)]
#[sea_orm(table_name = "download_job")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub platform: Platform,
    pub track_id: String,
    pub title: String,
    pub artist: String,
    pub album: String,
    pub duration_ms: Option<i64>,
    pub requested_quality: QualityTier,
    pub current_quality: QualityTier,
    pub state: JobState,
    /// Times the job entered Running
    pub attempts: i32,
    /// Transient retries consumed
    pub retries: i32,
    /// The one credential refresh this job may trigger has been spent
    pub auth_refreshed: bool,
    pub fallback_history: FallbackHistory,
    /// Unix millis before which the job is not dispatched
    pub next_attempt_at: Option<i64>,
    pub file_path: Option<String>,
    pub delivered_quality: Option<QualityTier>,
    pub bytes_written: Option<i64>,
    pub error: Option<String>,
    /// Re-queued by a restart
    pub resumed: bool,
    pub subscription_id: Option<i64>,
    pub finished_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Model {
    pub fn key(&self) -> JobKey {
        JobKey {
            platform: self.platform,
            track_id: self.track_id.clone(),
        }
    }

    pub fn track(&self) -> Track {
        Track {
            id: self.track_id.clone(),
            title: self.title.clone(),
            artist: self.artist.clone(),
            album: self.album.clone(),
            duration_ms: self.duration_ms.map(|d| d.max(0) as u64),
            platform: self.platform,
        }
    }
}

#[async_trait]
impl ActiveModelBehavior for ActiveModel {
    fn new() -> Self {
        let now = chrono::Utc::now().timestamp();
        Self {
            created_at: Set(now),
            updated_at: Set(now),
            state: Set(JobState::Queued),
            attempts: Set(0),
            retries: Set(0),
            auth_refreshed: Set(false),
            fallback_history: Set(FallbackHistory::default()),
            resumed: Set(false),
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states_have_no_exits() {
        assert!(JobState::Succeeded.is_terminal());
        assert!(JobState::Failed.is_terminal());
        assert!(JobState::ACTIVE.iter().all(|state| !state.is_terminal()));
        for next in JobState::ACTIVE {
            assert!(!JobState::Succeeded.can_transition_to(next));
            assert!(!JobState::Failed.can_transition_to(next));
        }
    }

    #[test]
    fn test_waiting_states_return_to_running() {
        assert!(JobState::Retrying.can_transition_to(JobState::Running));
        assert!(JobState::FallbackQuality.can_transition_to(JobState::Running));
        assert!(!JobState::Queued.can_transition_to(JobState::Succeeded));
    }
}
