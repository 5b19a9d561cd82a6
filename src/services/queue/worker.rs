use std::sync::Arc;
use std::time::{Duration, Instant};

use backon::{BackoffBuilder, ExponentialBuilder};
use color_eyre::eyre::Result;
use sea_orm::{EntityTrait, Set};
use tokio_util::sync::CancellationToken;

use super::{DownloadOutcome, JobEvent, QueueInner, now_millis};
use crate::config::QueueConfig;
use crate::entities;
use crate::entities::download_job::{FallbackAttempt, JobState};
use crate::ports::platform::{FetchedFile, PlatformDownloader};
use crate::services::downloader::error::{Disposition, DownloadError};
use crate::services::downloader::transfer::{destination_for, remove_if_exists};
use crate::services::matching::MatchOutcome;

/// Delay before transient retry number `retries + 1`: `base * 2^retries`, capped.
pub(super) fn backoff_delay(config: &QueueConfig, retries: u32) -> Duration {
    ExponentialBuilder::default()
        .with_min_delay(config.backoff_base)
        .with_max_delay(config.max_backoff)
        .with_factor(2.0)
        .with_max_times(retries as usize + 1)
        .build()
        .nth(retries as usize)
        .unwrap_or(config.max_backoff)
}

/// Delay after a rate limit: the server's word if it gave one, otherwise a
/// stretched transient delay.
pub(super) fn rate_limit_delay(
    config: &QueueConfig,
    retries: u32,
    retry_after: Option<Duration>,
) -> Duration {
    retry_after.unwrap_or_else(|| {
        (backoff_delay(config, retries) * config.rate_limit_multiplier).min(config.max_backoff)
    })
}

/// Drive one claimed (Running) job through a single attempt and persist where it
/// ends up.
pub(super) async fn run_job(
    inner: &Arc<QueueInner>,
    job: entities::download_job::Model,
    cancel: &CancellationToken,
) -> Result<()> {
    let track = job.track();

    if job.resumed
        && let Some(library) = &inner.library
    {
        let snapshot = library.current();
        let matched = inner.matcher.match_track(&track, &snapshot);
        if matched.outcome == MatchOutcome::Present {
            let library_id = matched.library_id.unwrap_or_default();
            let skipped = inner
                .transition(&job, JobState::Succeeded, |active| {
                    active.finished_at = Set(Some(now_millis()));
                    active.error = Set(None);
                })
                .await?;
            if skipped.is_some() {
                tracing::info!(
                    "Job {} for {} already in library as {}",
                    job.id,
                    job.key(),
                    library_id
                );
                inner.emit(JobEvent::Skipped {
                    job_id: job.id,
                    library_id,
                });
            }
            return Ok(());
        }
    }

    let downloader = match inner.downloaders.get(job.platform) {
        Ok(downloader) => downloader,
        Err(e) => {
            inner.fail(&job, &format!("{:#}", e), true).await?;
            return Ok(());
        }
    };

    let credential = inner.credentials.active(job.platform).await?;
    let started = Instant::now();
    let result = match &credential {
        Some(credential) => {
            let attempt_cancel = cancel.child_token();
            let (result, ()) = tokio::join!(
                async {
                    let result = attempt(
                        downloader.as_ref(),
                        inner,
                        &job,
                        &credential.payload,
                        &attempt_cancel,
                    )
                    .await;
                    // Stops the row watcher
                    attempt_cancel.cancel();
                    result
                },
                watch_row(inner, job.id, &attempt_cancel),
            );
            result
        }
        None => Err(DownloadError::AuthExpired(format!(
            "no {} credential stored",
            job.platform
        ))),
    };
    let elapsed = started.elapsed();

    match result {
        Ok(fetched) => succeed(inner, &job, fetched, elapsed).await,
        Err(err) => {
            let principal = credential.map(|c| c.principal);
            handle_failure(inner, &job, err, principal.as_deref(), cancel).await
        }
    }
}

/// Cancel `token` once the job's row leaves Running. A cancel issued by another
/// process, or before this worker registered its token, only reaches the row.
async fn watch_row(inner: &QueueInner, job_id: i64, token: &CancellationToken) {
    loop {
        tokio::select! {
            _ = token.cancelled() => return,
            _ = tokio::time::sleep(inner.settings.config.poll_interval) => {}
        }
        match entities::download_job::Entity::find_by_id(job_id)
            .one(&inner.db.conn)
            .await
        {
            Ok(Some(row)) if row.state == JobState::Running => {}
            Ok(_) => {
                tracing::info!("Job {} was cancelled elsewhere, stopping its transfer", job_id);
                token.cancel();
                return;
            }
            Err(e) => tracing::warn!("Failed to check job {}: {}", job_id, e),
        }
    }
}

async fn attempt(
    downloader: &dyn PlatformDownloader,
    inner: &QueueInner,
    job: &entities::download_job::Model,
    session: &str,
    cancel: &CancellationToken,
) -> Result<FetchedFile, DownloadError> {
    let track = job.track();
    let tier = job.current_quality;
    tracing::info!(
        "Downloading {} - {} ({}) at {}, attempt {}",
        track.artist,
        track.title,
        job.key(),
        tier,
        job.attempts
    );

    let handle = tokio::select! {
        _ = cancel.cancelled() => return Err(DownloadError::Cancelled),
        handle = downloader.resolve_stream(&track, tier, session) => handle?,
    };
    let destination = destination_for(&inner.settings.download_dir, &track);
    downloader.fetch(&handle, &destination, cancel).await
}

pub(super) async fn succeed(
    inner: &QueueInner,
    job: &entities::download_job::Model,
    fetched: FetchedFile,
    elapsed: Duration,
) -> Result<()> {
    let file_path = fetched.path.display().to_string();
    let updated = inner
        .transition(job, JobState::Succeeded, |active| {
            active.file_path = Set(Some(file_path));
            active.delivered_quality = Set(Some(fetched.tier));
            active.bytes_written = Set(Some(fetched.bytes_written as i64));
            active.error = Set(None);
            active.finished_at = Set(Some(now_millis()));
        })
        .await?;

    let Some(updated) = updated else {
        tracing::warn!(
            "Job {} changed while downloading, discarding {}",
            job.id,
            fetched.path.display()
        );
        remove_if_exists(&fetched.path).await;
        return Ok(());
    };

    inner
        .record(
            &updated,
            true,
            fetched.bytes_written,
            elapsed.as_millis() as u64,
        )
        .await?;
    tracing::info!(
        "Job {} finished: {} ({} bytes at {})",
        job.id,
        fetched.path.display(),
        fetched.bytes_written,
        fetched.tier
    );
    inner.emit(JobEvent::Completed {
        job_id: job.id,
        outcome: DownloadOutcome {
            file_path: fetched.path,
            platform: job.platform,
            track: job.track(),
            quality: fetched.tier,
            bytes_written: fetched.bytes_written,
        },
    });
    Ok(())
}

async fn handle_failure(
    inner: &QueueInner,
    job: &entities::download_job::Model,
    err: DownloadError,
    principal: Option<&str>,
    cancel: &CancellationToken,
) -> Result<()> {
    let config = &inner.settings.config;
    let reason = err.to_string();
    let retries = job.retries.max(0) as u32;

    match err.disposition() {
        Disposition::Cancelled => {
            if inner.take_user_cancel(job.id) || !cancel.is_cancelled() {
                inner.fail(job, "cancelled", true).await?;
            } else {
                tracing::info!("Job {} interrupted by shutdown", job.id);
                inner.requeue_resumed(job).await?;
            }
        }
        disposition @ (Disposition::Retry | Disposition::Backoff { .. }) => {
            if retries >= config.max_retries {
                inner
                    .fail(job, &format!("{} (after {} retries)", reason, retries), true)
                    .await?;
                return Ok(());
            }
            let delay = match disposition {
                Disposition::Backoff { retry_after } => {
                    rate_limit_delay(config, retries, retry_after)
                }
                _ => backoff_delay(config, retries),
            };
            tracing::warn!(
                "Job {} attempt failed: {}, retrying in {:?}",
                job.id,
                reason,
                delay
            );
            let due = now_millis() + delay.as_millis() as i64;
            inner
                .transition(job, JobState::Retrying, |active| {
                    active.retries = Set(job.retries + 1);
                    active.next_attempt_at = Set(Some(due));
                    active.error = Set(Some(reason.clone()));
                })
                .await?;
        }
        Disposition::Fallback => {
            let mut history = job.fallback_history.clone();
            history.0.push(FallbackAttempt {
                tier: job.current_quality,
                reason: "unavailable".to_string(),
            });

            match inner.settings.chains.next_tier(
                job.requested_quality,
                job.current_quality,
                &history,
            ) {
                Some(next) => {
                    tracing::info!(
                        "Job {}: {} unavailable, falling back to {}",
                        job.id,
                        job.current_quality,
                        next
                    );
                    inner
                        .transition(job, JobState::FallbackQuality, |active| {
                            active.current_quality = Set(next);
                            active.fallback_history = Set(history);
                            active.next_attempt_at = Set(None);
                            active.error = Set(Some(reason.clone()));
                        })
                        .await?;
                }
                None => {
                    let tried = history
                        .tiers()
                        .iter()
                        .map(|t| t.as_str())
                        .collect::<Vec<_>>()
                        .join(", ");
                    // Keep the full history on the failed job
                    let with_history = inner
                        .transition(job, JobState::Failed, |active| {
                            active.fallback_history = Set(history);
                            active.error = Set(Some(format!("No tier available (tried {})", tried)));
                            active.finished_at = Set(Some(now_millis()));
                        })
                        .await?;
                    if let Some(failed) = with_history {
                        inner.record(&failed, false, 0, 0).await?;
                        inner.emit(JobEvent::Failed {
                            job_id: failed.id,
                            key: failed.key(),
                            reason: format!("No tier available (tried {})", tried),
                        });
                    }
                }
            }
        }
        Disposition::RefreshAuth => {
            if job.auth_refreshed {
                inner
                    .fail(job, &format!("{} (after credential refresh)", reason), true)
                    .await?;
                let alert = match principal {
                    Some(principal) => {
                        inner
                            .credentials
                            .mark_needs_attention(job.platform, principal, &reason)
                            .await?
                    }
                    None => crate::services::credentials::CredentialAlert {
                        platform: job.platform,
                        principal: String::new(),
                        reason: reason.clone(),
                    },
                };
                inner.emit(JobEvent::CredentialAlert(alert));
                return Ok(());
            }

            if let Some(principal) = principal {
                let outcome = inner.credentials.refresh(job.platform, principal).await;
                tracing::info!(
                    "Job {}: session rejected, refresh outcome {:?}",
                    job.id,
                    outcome
                );
            }
            inner
                .transition(job, JobState::Retrying, |active| {
                    active.auth_refreshed = Set(true);
                    active.next_attempt_at = Set(None);
                    active.error = Set(Some(reason.clone()));
                })
                .await?;
        }
        Disposition::Fail => {
            inner.fail(job, &reason, true).await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> QueueConfig {
        QueueConfig {
            backoff_base: Duration::from_secs(2),
            max_backoff: Duration::from_secs(60),
            rate_limit_multiplier: 4,
            ..QueueConfig::default()
        }
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let config = config();
        assert_eq!(backoff_delay(&config, 0), Duration::from_secs(2));
        assert_eq!(backoff_delay(&config, 1), Duration::from_secs(4));
        assert_eq!(backoff_delay(&config, 2), Duration::from_secs(8));
        assert_eq!(backoff_delay(&config, 10), Duration::from_secs(60));
    }

    #[test]
    fn test_rate_limit_prefers_retry_after() {
        let config = config();
        assert_eq!(
            rate_limit_delay(&config, 0, Some(Duration::from_secs(30))),
            Duration::from_secs(30)
        );
        assert_eq!(rate_limit_delay(&config, 1, None), Duration::from_secs(16));
        assert_eq!(rate_limit_delay(&config, 5, None), Duration::from_secs(60));
    }
}
