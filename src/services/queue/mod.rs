//! Persisted download queue.
//!
//! The `download_job` table is the only record of job state. Every transition is
//! written before anything else happens, so a restart picks up exactly where the
//! previous process stopped.

pub mod stats;
mod worker;

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::Utc;
use color_eyre::eyre::{Result, WrapErr};
use sea_orm::{
    ActiveModelBehavior, ActiveModelTrait, ColumnTrait, DbErr, EntityTrait, PaginatorTrait,
    QueryFilter, QueryOrder, QuerySelect, Set,
};
use serde::Serialize;
use tokio::sync::{Notify, Semaphore, broadcast};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::config::QueueConfig;
use crate::database::Database;
use crate::entities;
use crate::entities::download_job::JobState;
use crate::models::{JobKey, Platform, QualityTier, Track};
use crate::services::credentials::{CredentialAlert, CredentialStore};
use crate::services::downloader::Downloaders;
use crate::services::downloader::fallback::FallbackChains;
use crate::services::library::LibrarySnapshotStore;
use crate::services::matching::Matcher;

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobHandle {
    pub job_id: i64,
    pub key: JobKey,
    /// False when an active job for the key already existed
    pub created: bool,
}

/// What a finished download produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DownloadOutcome {
    pub file_path: PathBuf,
    pub platform: Platform,
    pub track: Track,
    /// Tier actually delivered
    pub quality: QualityTier,
    pub bytes_written: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum JobEvent {
    Completed {
        job_id: i64,
        outcome: DownloadOutcome,
    },
    /// A resumed job turned out to be in the library already
    Skipped { job_id: i64, library_id: String },
    Failed {
        job_id: i64,
        key: JobKey,
        reason: String,
    },
    CredentialAlert(CredentialAlert),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CancelOutcome {
    /// A queued job was deleted
    Removed,
    /// The job was marked failed, or its worker was told to stop
    Cancelled,
    AlreadyFinished,
    NotFound,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStatus {
    pub queued: u64,
    pub running: u64,
    pub retrying: u64,
    pub fallback_quality: u64,
    pub succeeded: u64,
    pub failed: u64,
    /// Platforms whose jobs are held by a credential alert
    pub held_platforms: Vec<Platform>,
}

#[derive(Debug, Clone)]
pub struct QueueSettings {
    pub config: QueueConfig,
    pub chains: FallbackChains,
    pub download_dir: PathBuf,
}

enum Claim {
    Job(Box<entities::download_job::Model>),
    /// Nothing due; the earliest deferred job becomes due at this unix millis
    Idle { next_due: Option<i64> },
}

pub(crate) struct QueueInner {
    db: Arc<Database>,
    downloaders: Downloaders,
    credentials: CredentialStore,
    library: Option<Arc<LibrarySnapshotStore>>,
    matcher: Matcher,
    settings: QueueSettings,
    /// Serializes the check-then-insert in `submit`
    submit_lock: tokio::sync::Mutex<()>,
    wake: Notify,
    running: Mutex<HashMap<i64, CancellationToken>>,
    /// Running jobs the user asked to cancel, as opposed to a shutdown
    user_cancelled: Mutex<HashSet<i64>>,
    events: broadcast::Sender<JobEvent>,
}

#[derive(Clone)]
pub struct QueueManager {
    inner: Arc<QueueInner>,
}

pub(crate) fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

impl QueueManager {
    pub fn new(
        db: Arc<Database>,
        downloaders: Downloaders,
        credentials: CredentialStore,
        library: Option<Arc<LibrarySnapshotStore>>,
        matcher: Matcher,
        settings: QueueSettings,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(QueueInner {
                db,
                downloaders,
                credentials,
                library,
                matcher,
                settings,
                submit_lock: tokio::sync::Mutex::new(()),
                wake: Notify::new(),
                running: Mutex::new(HashMap::new()),
                user_cancelled: Mutex::new(HashSet::new()),
                events,
            }),
        }
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<JobEvent> {
        self.inner.events.subscribe()
    }

    /// Queue a track, or hand back the active job that already covers it.
    #[tracing::instrument(skip(self, track), fields(platform = %track.platform, track_id = %track.id))]
    pub async fn submit(
        &self,
        track: Track,
        quality: QualityTier,
        subscription_id: Option<i64>,
    ) -> Result<JobHandle> {
        let key = JobKey {
            platform: track.platform,
            track_id: track.id.clone(),
        };
        let _guard = self.inner.submit_lock.lock().await;

        if let Some(existing) = self.active_job(&key).await? {
            tracing::debug!("Job {} already covers {}", existing.id, key);
            return Ok(JobHandle {
                job_id: existing.id,
                key,
                created: false,
            });
        }

        let job = entities::download_job::ActiveModel {
            platform: Set(track.platform),
            track_id: Set(track.id),
            title: Set(track.title),
            artist: Set(track.artist),
            album: Set(track.album),
            duration_ms: Set(track.duration_ms.map(|d| d as i64)),
            requested_quality: Set(quality),
            current_quality: Set(quality),
            subscription_id: Set(subscription_id),
            ..entities::download_job::ActiveModel::new()
        }
        .insert(&self.inner.db.conn)
        .await
        .wrap_err("Failed to create download job")?;

        tracing::info!("Queued job {} for {} at {}", job.id, key, quality);
        self.inner.wake.notify_one();
        Ok(JobHandle {
            job_id: job.id,
            key,
            created: true,
        })
    }

    async fn active_job(&self, key: &JobKey) -> Result<Option<entities::download_job::Model>> {
        entities::download_job::Entity::find()
            .filter(entities::download_job::Column::Platform.eq(key.platform))
            .filter(entities::download_job::Column::TrackId.eq(&key.track_id))
            .filter(entities::download_job::Column::State.is_in(JobState::ACTIVE))
            .one(&self.inner.db.conn)
            .await
            .wrap_err("Failed to look up active job")
    }

    pub async fn job(&self, job_id: i64) -> Result<Option<entities::download_job::Model>> {
        entities::download_job::Entity::find_by_id(job_id)
            .one(&self.inner.db.conn)
            .await
            .wrap_err("Failed to fetch download job")
    }

    /// Most recent jobs first.
    pub async fn jobs(
        &self,
        state: Option<JobState>,
        limit: u64,
    ) -> Result<Vec<entities::download_job::Model>> {
        let mut query = entities::download_job::Entity::find();
        if let Some(state) = state {
            query = query.filter(entities::download_job::Column::State.eq(state));
        }
        query
            .order_by_desc(entities::download_job::Column::Id)
            .limit(limit)
            .all(&self.inner.db.conn)
            .await
            .wrap_err("Failed to fetch download jobs")
    }

    /// Active jobs a subscription enqueued.
    pub async fn active_for_subscription(&self, subscription_id: i64) -> Result<u64> {
        entities::download_job::Entity::find()
            .filter(entities::download_job::Column::SubscriptionId.eq(subscription_id))
            .filter(entities::download_job::Column::State.is_in(JobState::ACTIVE))
            .count(&self.inner.db.conn)
            .await
            .wrap_err("Failed to count subscription jobs")
    }

    pub async fn cancel(&self, job_id: i64) -> Result<CancelOutcome> {
        // A dispatcher may claim the job between the read and the write
        for _ in 0..3 {
            let Some(job) = self.job(job_id).await? else {
                return Ok(CancelOutcome::NotFound);
            };

            match job.state {
                JobState::Queued => {
                    let res = entities::download_job::Entity::delete_many()
                        .filter(entities::download_job::Column::Id.eq(job_id))
                        .filter(entities::download_job::Column::State.eq(JobState::Queued))
                        .exec(&self.inner.db.conn)
                        .await
                        .wrap_err("Failed to delete queued job")?;
                    if res.rows_affected > 0 {
                        tracing::info!("Removed queued job {}", job_id);
                        return Ok(CancelOutcome::Removed);
                    }
                }
                JobState::Running => {
                    let token = self
                        .inner
                        .running
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .get(&job_id)
                        .cloned();
                    match token {
                        Some(token) => {
                            self.inner
                                .user_cancelled
                                .lock()
                                .unwrap_or_else(PoisonError::into_inner)
                                .insert(job_id);
                            token.cancel();
                            tracing::info!("Cancelling running job {}", job_id);
                            return Ok(CancelOutcome::Cancelled);
                        }
                        // Its worker lives in another process, or no longer exists
                        None => {
                            if self.inner.fail(&job, "cancelled", false).await?.is_some() {
                                return Ok(CancelOutcome::Cancelled);
                            }
                        }
                    }
                }
                JobState::Retrying | JobState::FallbackQuality => {
                    if self.inner.fail(&job, "cancelled", false).await?.is_some() {
                        tracing::info!("Cancelled waiting job {}", job_id);
                        return Ok(CancelOutcome::Cancelled);
                    }
                }
                JobState::Succeeded | JobState::Failed => {
                    return Ok(CancelOutcome::AlreadyFinished);
                }
            }
        }
        Ok(CancelOutcome::AlreadyFinished)
    }

    pub async fn status(&self) -> Result<QueueStatus> {
        let count_state = |state: JobState| {
            let db = self.inner.db.clone();
            async move {
                entities::download_job::Entity::find()
                    .filter(entities::download_job::Column::State.eq(state))
                    .count(&db.conn)
                    .await
                    .wrap_err("Failed to count download jobs")
            }
        };

        let mut held_platforms: Vec<Platform> = self
            .inner
            .credentials
            .blocked_platforms()
            .await?
            .into_iter()
            .collect();
        held_platforms.sort();

        Ok(QueueStatus {
            queued: count_state(JobState::Queued).await?,
            running: count_state(JobState::Running).await?,
            retrying: count_state(JobState::Retrying).await?,
            fallback_quality: count_state(JobState::FallbackQuality).await?,
            succeeded: count_state(JobState::Succeeded).await?,
            failed: count_state(JobState::Failed).await?,
            held_platforms,
        })
    }

    /// Delete finished jobs that finished more than `older_than` ago.
    pub async fn clear_finished(&self, older_than: Duration) -> Result<u64> {
        let cutoff = now_millis() - older_than.as_millis() as i64;
        let res = entities::download_job::Entity::delete_many()
            .filter(
                entities::download_job::Column::State
                    .is_in([JobState::Succeeded, JobState::Failed]),
            )
            .filter(entities::download_job::Column::FinishedAt.lte(cutoff))
            .exec(&self.inner.db.conn)
            .await
            .wrap_err("Failed to clear finished jobs")?;
        if res.rows_affected > 0 {
            tracing::info!("Cleared {} finished jobs", res.rows_affected);
        }
        Ok(res.rows_affected)
    }

    /// Put jobs left Running by a previous process back up for dispatch. Returns
    /// how many were recovered.
    pub async fn resume_interrupted(&self) -> Result<usize> {
        let interrupted = entities::download_job::Entity::find()
            .filter(entities::download_job::Column::State.eq(JobState::Running))
            .all(&self.inner.db.conn)
            .await
            .wrap_err("Failed to fetch interrupted jobs")?;

        let mut resumed = 0;
        for job in interrupted {
            if self.inner.requeue_resumed(&job).await?.is_some() {
                resumed += 1;
            }
        }
        if resumed > 0 {
            tracing::info!("Resumed {} interrupted jobs", resumed);
        }
        Ok(resumed)
    }

    /// Run the dispatcher until `cancel` fires. In-flight workers are stopped and
    /// their jobs put back for the next start.
    pub fn start(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let inner = self.inner.clone();
        tokio::spawn(async move { inner.dispatch_loop(cancel).await })
    }
}

impl QueueInner {
    fn emit(&self, event: JobEvent) {
        // Nobody listening is fine
        let _ = self.events.send(event);
    }

    /// Apply one state-machine edge, guarded on the state the caller last saw.
    /// `None` when the row moved on in the meantime.
    async fn transition(
        &self,
        job: &entities::download_job::Model,
        next: JobState,
        changes: impl FnOnce(&mut entities::download_job::ActiveModel),
    ) -> Result<Option<entities::download_job::Model>> {
        if !job.state.can_transition_to(next) {
            tracing::warn!(
                "Refusing transition {} -> {} for job {}",
                job.state.as_str(),
                next.as_str(),
                job.id
            );
            return Ok(None);
        }

        let mut active: entities::download_job::ActiveModel = job.clone().into();
        active.state = Set(next);
        active.updated_at = Set(Utc::now().timestamp());
        changes(&mut active);

        let result = match entities::download_job::Entity::update(active).validate() {
            Ok(update) => {
                update
                    .filter(entities::download_job::Column::State.eq(job.state))
                    .exec(&self.db.conn)
                    .await
            }
            Err(e) => Err(e),
        };
        match result {
            Ok(updated) => {
                tracing::debug!(
                    "Job {} {} -> {}",
                    job.id,
                    job.state.as_str(),
                    next.as_str()
                );
                Ok(Some(updated))
            }
            Err(DbErr::RecordNotUpdated) => Ok(None),
            Err(e) => Err(e).wrap_err("Failed to persist job transition"),
        }
    }

    /// Move a job to Failed, record it, and tell listeners.
    async fn fail(
        &self,
        job: &entities::download_job::Model,
        reason: &str,
        record: bool,
    ) -> Result<Option<entities::download_job::Model>> {
        let reason_owned = reason.to_string();
        let failed = self
            .transition(job, JobState::Failed, |active| {
                active.error = Set(Some(reason_owned));
                active.finished_at = Set(Some(now_millis()));
            })
            .await?;

        if let Some(failed) = &failed {
            tracing::warn!("Job {} for {} failed: {}", failed.id, failed.key(), reason);
            if record {
                self.record(failed, false, 0, 0).await?;
            }
            self.emit(JobEvent::Failed {
                job_id: failed.id,
                key: failed.key(),
                reason: reason.to_string(),
            });
        }
        Ok(failed)
    }

    /// Running jobs interrupted by a restart or shutdown wait as Retrying, flagged
    /// so the library is checked before they download again.
    async fn requeue_resumed(
        &self,
        job: &entities::download_job::Model,
    ) -> Result<Option<entities::download_job::Model>> {
        self.transition(job, JobState::Retrying, |active| {
            active.resumed = Set(true);
            active.next_attempt_at = Set(None);
        })
        .await
    }

    async fn record(
        &self,
        job: &entities::download_job::Model,
        succeeded: bool,
        bytes: u64,
        duration_ms: u64,
    ) -> Result<()> {
        entities::download_record::ActiveModel {
            job_id: Set(job.id),
            platform: Set(job.platform),
            succeeded: Set(succeeded),
            bytes: Set(bytes as i64),
            duration_ms: Set(duration_ms as i64),
            ..entities::download_record::ActiveModel::new()
        }
        .insert(&self.db.conn)
        .await
        .wrap_err("Failed to write download record")?;
        Ok(())
    }

    fn take_user_cancel(&self, job_id: i64) -> bool {
        self.user_cancelled
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&job_id)
    }

    /// Claim the oldest due job whose platform is not held.
    async fn claim_next(&self) -> Result<Claim> {
        let now = now_millis();
        let held = self.credentials.blocked_platforms().await?;
        let candidates = entities::download_job::Entity::find()
            .filter(entities::download_job::Column::State.is_in(JobState::DISPATCHABLE))
            .order_by_asc(entities::download_job::Column::Id)
            .all(&self.db.conn)
            .await
            .wrap_err("Failed to fetch dispatchable jobs")?;

        let mut next_due: Option<i64> = None;
        for job in candidates {
            if held.contains(&job.platform) {
                continue;
            }
            if let Some(due) = job.next_attempt_at
                && due > now
            {
                next_due = Some(next_due.map_or(due, |current| current.min(due)));
                continue;
            }

            let attempts = job.attempts + 1;
            if let Some(claimed) = self
                .transition(&job, JobState::Running, |active| {
                    active.attempts = Set(attempts);
                    active.next_attempt_at = Set(None);
                })
                .await?
            {
                return Ok(Claim::Job(Box::new(claimed)));
            }
        }
        Ok(Claim::Idle { next_due })
    }

    async fn dispatch_loop(self: Arc<Self>, cancel: CancellationToken) {
        let workers_allowed = self.settings.config.workers.max(1);
        let semaphore = Arc::new(Semaphore::new(workers_allowed));
        let poll = self.settings.config.poll_interval;
        let attention_cleared = self.credentials.attention_cleared();
        let mut workers = JoinSet::new();
        tracing::info!("Download dispatcher started with {} workers", workers_allowed);

        loop {
            while let Some(done) = workers.try_join_next() {
                if let Err(e) = done {
                    tracing::error!("Download worker panicked: {}", e);
                }
            }

            let permit = tokio::select! {
                _ = cancel.cancelled() => break,
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let pause = match self.claim_next().await {
                Ok(Claim::Job(job)) => {
                    let token = cancel.child_token();
                    self.running
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .insert(job.id, token.clone());
                    let inner = self.clone();
                    workers.spawn(async move {
                        let _permit = permit;
                        let job_id = job.id;
                        if let Err(e) = worker::run_job(&inner, *job, &token).await {
                            tracing::error!("Job {} worker failed: {:#}", job_id, e);
                        }
                        inner
                            .running
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner)
                            .remove(&job_id);
                    });
                    continue;
                }
                Ok(Claim::Idle { next_due }) => next_due
                    .map(|due| Duration::from_millis((due - now_millis()).max(0) as u64))
                    .map_or(poll, |until_due| until_due.min(poll)),
                Err(e) => {
                    tracing::error!("Failed to claim next job: {:#}", e);
                    poll
                }
            };
            drop(permit);

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.wake.notified() => {}
                _ = attention_cleared.notified() => {}
                _ = tokio::time::sleep(pause) => {}
            }
        }

        tracing::info!("Download dispatcher stopping, waiting for {} workers", workers.len());
        while let Some(done) = workers.join_next().await {
            if let Err(e) = done {
                tracing::error!("Download worker panicked: {}", e);
            }
        }
        tracing::info!("Download dispatcher stopped");
    }
}
