use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use color_eyre::eyre::Result;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::SyncConfig;
use crate::services::credentials::CredentialStore;
use crate::services::credentials::background_task::spawn_credential_refresh_task;
use crate::services::library::LibrarySnapshotStore;
use crate::services::queue::{JobEvent, QueueManager};
use crate::services::reconcile::Reconciler;

/// Everything the `serve` command runs. All tasks stop on the same token.
pub struct BackgroundTasks {
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl BackgroundTasks {
    /// Stop every task and wait for it. Running downloads are put back for the
    /// next start.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        for handle in self.handles {
            if let Err(e) = handle.await {
                tracing::error!("Background task panicked: {}", e);
            }
        }
    }
}

pub struct ServeSettings {
    pub sync: SyncConfig,
    pub library_scan_interval: Duration,
    pub credential_refresh_interval: Duration,
}

pub fn run_background_tasks(
    queue: &QueueManager,
    reconciler: Arc<Reconciler>,
    library: Arc<LibrarySnapshotStore>,
    credentials: CredentialStore,
    settings: ServeSettings,
) -> BackgroundTasks {
    let cancel = CancellationToken::new();
    let mut handles = vec![
        queue.start(cancel.child_token()),
        spawn_credential_refresh_task(
            credentials,
            settings.credential_refresh_interval,
            cancel.child_token(),
        ),
        spawn_rescan_on_completion(
            library.clone(),
            queue.subscribe_events(),
            settings.sync.rescan_debounce,
            cancel.child_token(),
        ),
        spawn_reconcile_scheduler(reconciler, settings.sync, cancel.child_token()),
    ];
    if let Some(handle) =
        spawn_library_refresh(library, settings.library_scan_interval, cancel.child_token())
    {
        handles.push(handle);
    }

    BackgroundTasks { cancel, handles }
}

/// Outcome of one scheduler pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleSummary {
    pub reconciled: usize,
    pub failed: usize,
}

/// Reconcile every due subscription once. One failing subscription does not stop
/// the rest.
pub async fn reconcile_due(reconciler: &Reconciler) -> Result<CycleSummary> {
    let due = reconciler.due_subscriptions(Utc::now().timestamp()).await?;
    let mut summary = CycleSummary::default();
    for subscription in due {
        match reconciler.reconcile(subscription.id).await {
            Ok(report) => {
                summary.reconciled += 1;
                for alert in &report.alerts {
                    tracing::warn!(
                        "{} credential for {} needs attention: {}",
                        alert.platform,
                        alert.principal,
                        alert.reason
                    );
                }
            }
            Err(e) => {
                summary.failed += 1;
                tracing::error!(
                    subscription_id = subscription.id,
                    error = ?e,
                    "Failed to reconcile subscription",
                );
            }
        }
    }
    Ok(summary)
}

pub fn spawn_reconcile_scheduler(
    reconciler: Arc<Reconciler>,
    config: SyncConfig,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tracing::info!("Reconciling due subscriptions every {:?}", config.poll_interval);
        let mut pause = config.initial_delay;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(pause) => {}
            }

            let cycle = tokio::select! {
                _ = cancel.cancelled() => break,
                cycle = reconcile_due(&reconciler) => cycle,
            };
            pause = match cycle {
                Ok(summary) if summary.failed == 0 => config.poll_interval,
                Ok(summary) => {
                    tracing::warn!(
                        "{} of {} subscriptions failed, pausing {:?}",
                        summary.failed,
                        summary.failed + summary.reconciled,
                        config.error_pause
                    );
                    config.error_pause
                }
                Err(e) => {
                    tracing::error!("Reconcile cycle failed: {:#}", e);
                    config.error_pause
                }
            };
        }
        tracing::info!("Reconcile scheduler stopped");
    })
}

/// Periodic snapshot refresh. `None` when the interval is zero.
pub fn spawn_library_refresh(
    library: Arc<LibrarySnapshotStore>,
    interval: Duration,
    cancel: CancellationToken,
) -> Option<JoinHandle<()>> {
    if interval.is_zero() {
        tracing::info!("Periodic library refresh disabled");
        return None;
    }
    Some(tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
            if let Err(e) = library.refresh().await {
                tracing::error!("Failed to refresh library snapshot: {:#}", e);
            }
        }
        tracing::info!("Library refresh task stopped");
    }))
}

/// After downloads complete, ask the library to rescan once things go quiet for
/// `debounce`, then publish a fresh snapshot.
pub fn spawn_rescan_on_completion(
    library: Arc<LibrarySnapshotStore>,
    mut events: broadcast::Receiver<JobEvent>,
    debounce: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut deadline: Option<Instant> = None;
        loop {
            let pending_until = deadline;
            let wait = async move {
                match pending_until {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending().await,
                }
            };
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = events.recv() => match event {
                    Ok(JobEvent::Completed { .. }) | Err(broadcast::error::RecvError::Lagged(_)) => {
                        deadline = Some(Instant::now() + debounce);
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                _ = wait => {
                    deadline = None;
                    if let Err(e) = library.trigger_rescan().await {
                        tracing::warn!("{:#}", e);
                        continue;
                    }
                    if let Err(e) = library.refresh().await {
                        tracing::error!("Failed to refresh library snapshot: {:#}", e);
                    }
                }
            }
        }
        tracing::info!("Rescan task stopped");
    })
}
