//! Playlist subscriptions and the reconciliation pass that turns new playlist
//! entries into download jobs.

pub mod playlist_url;
pub mod sources;

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use color_eyre::eyre::{OptionExt, Result, WrapErr, eyre};
use reqwest::Client;
use sea_orm::{ActiveModelBehavior, ActiveModelTrait, ColumnTrait, EntityTrait, QueryFilter, Set};
use serde::Serialize;

use crate::config::SyncConfig;
use crate::database::Database;
use crate::entities;
use crate::entities::playlist_subscription::TrackIds;
use crate::models::{Platform, QualityTier};
use crate::ports::playlist_source::PlaylistSource;
use crate::services::credentials::{CredentialAlert, CredentialStore};
use crate::services::library::LibrarySnapshotStore;
use crate::services::matching::{MatchOutcome, MatchResult, Matcher};
use crate::services::queue::{JobHandle, QueueManager};

#[derive(Debug, Clone, Serialize)]
pub struct ReconciliationReport {
    pub subscription_id: i64,
    pub playlist_name: String,
    /// Tracks currently in the playlist
    pub total: usize,
    /// Tracks not seen by the previous run
    pub new: usize,
    pub present: usize,
    pub enqueued: Vec<JobHandle>,
    /// New tracks an active job already covered
    pub already_queued: Vec<JobHandle>,
    pub ambiguous: Vec<MatchResult>,
    pub alerts: Vec<CredentialAlert>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SubscriptionStatus {
    pub id: i64,
    pub platform: Platform,
    pub playlist_id: String,
    pub name: Option<String>,
    pub quality: QualityTier,
    pub sync_interval_secs: i64,
    pub active: bool,
    pub last_successful_run: Option<i64>,
    pub last_error: Option<String>,
    pub tracks_seen: usize,
    /// Unfinished jobs this subscription enqueued
    pub active_jobs: u64,
}

pub struct Reconciler {
    db: Arc<Database>,
    client: Client,
    sources: HashMap<Platform, Arc<dyn PlaylistSource>>,
    library: Arc<LibrarySnapshotStore>,
    matcher: Matcher,
    queue: QueueManager,
    credentials: CredentialStore,
    config: SyncConfig,
}

impl Reconciler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db: Arc<Database>,
        client: Client,
        sources: Vec<Arc<dyn PlaylistSource>>,
        library: Arc<LibrarySnapshotStore>,
        matcher: Matcher,
        queue: QueueManager,
        credentials: CredentialStore,
        config: SyncConfig,
    ) -> Self {
        Self {
            db,
            client,
            sources: sources.into_iter().map(|s| (s.platform(), s)).collect(),
            library,
            matcher,
            queue,
            credentials,
            config,
        }
    }

    /// Subscribe to a playlist, reactivating an earlier subscription to it.
    #[tracing::instrument(skip(self))]
    pub async fn subscribe(
        &self,
        platform: Platform,
        playlist_id: &str,
        interval: Option<Duration>,
        quality: QualityTier,
    ) -> Result<entities::playlist_subscription::Model> {
        let interval = interval.unwrap_or(self.config.default_interval);
        if interval < self.config.min_interval {
            return Err(eyre!(
                "Sync interval {} is below the minimum of {}",
                humantime::format_duration(interval),
                humantime::format_duration(self.config.min_interval)
            ));
        }
        if !self.sources.contains_key(&platform) {
            return Err(eyre!("No playlist source for {}", platform));
        }

        let existing = entities::playlist_subscription::Entity::find()
            .filter(entities::playlist_subscription::Column::Platform.eq(platform))
            .filter(entities::playlist_subscription::Column::PlaylistId.eq(playlist_id))
            .one(&self.db.conn)
            .await
            .wrap_err("Failed to look up subscription")?;

        let model = match existing {
            Some(existing) => {
                if !existing.active {
                    tracing::info!("Reactivating subscription {}", existing.id);
                }
                let mut active: entities::playlist_subscription::ActiveModel = existing.into();
                active.active = Set(true);
                active.quality = Set(quality);
                active.sync_interval_secs = Set(interval.as_secs() as i64);
                active
                    .update(&self.db.conn)
                    .await
                    .wrap_err("Failed to update subscription")?
            }
            None => entities::playlist_subscription::ActiveModel {
                platform: Set(platform),
                playlist_id: Set(playlist_id.to_string()),
                quality: Set(quality),
                sync_interval_secs: Set(interval.as_secs() as i64),
                ..entities::playlist_subscription::ActiveModel::new()
            }
            .insert(&self.db.conn)
            .await
            .wrap_err("Failed to create subscription")?,
        };

        tracing::info!(
            "Subscribed to {} playlist {} every {}",
            platform,
            playlist_id,
            humantime::format_duration(interval)
        );
        Ok(model)
    }

    /// `subscribe` from a pasted share link.
    pub async fn subscribe_url(
        &self,
        input: &str,
        interval: Option<Duration>,
        quality: QualityTier,
    ) -> Result<entities::playlist_subscription::Model> {
        let (platform, playlist_id) =
            playlist_url::resolve_playlist_input(&self.client, input).await?;
        self.subscribe(platform, &playlist_id, interval, quality).await
    }

    /// Stop scheduling a subscription. Its jobs are left alone.
    pub async fn unsubscribe(&self, subscription_id: i64) -> Result<bool> {
        let Some(subscription) = self.subscription(subscription_id).await? else {
            return Ok(false);
        };
        let mut active: entities::playlist_subscription::ActiveModel = subscription.into();
        active.active = Set(false);
        active
            .update(&self.db.conn)
            .await
            .wrap_err("Failed to deactivate subscription")?;
        tracing::info!("Unsubscribed {}", subscription_id);
        Ok(true)
    }

    pub async fn subscription(
        &self,
        subscription_id: i64,
    ) -> Result<Option<entities::playlist_subscription::Model>> {
        entities::playlist_subscription::Entity::find_by_id(subscription_id)
            .one(&self.db.conn)
            .await
            .wrap_err("Failed to fetch subscription")
    }

    pub async fn subscription_status(
        &self,
        subscription_id: i64,
    ) -> Result<Option<SubscriptionStatus>> {
        let Some(subscription) = self.subscription(subscription_id).await? else {
            return Ok(None);
        };
        let active_jobs = self.queue.active_for_subscription(subscription_id).await?;
        Ok(Some(SubscriptionStatus {
            id: subscription.id,
            platform: subscription.platform,
            playlist_id: subscription.playlist_id,
            name: subscription.name,
            quality: subscription.quality,
            sync_interval_secs: subscription.sync_interval_secs,
            active: subscription.active,
            last_successful_run: subscription.last_successful_run,
            last_error: subscription.last_error,
            tracks_seen: subscription.last_seen_track_ids.0.len(),
            active_jobs,
        }))
    }

    pub async fn list_subscriptions(&self) -> Result<Vec<entities::playlist_subscription::Model>> {
        entities::playlist_subscription::Entity::find()
            .all(&self.db.conn)
            .await
            .wrap_err("Failed to fetch subscriptions")
    }

    /// Active subscriptions whose interval has elapsed at `now` (unix seconds).
    pub async fn due_subscriptions(
        &self,
        now: i64,
    ) -> Result<Vec<entities::playlist_subscription::Model>> {
        Ok(entities::playlist_subscription::Entity::find()
            .filter(entities::playlist_subscription::Column::Active.eq(true))
            .all(&self.db.conn)
            .await
            .wrap_err("Failed to fetch subscriptions")?
            .into_iter()
            .filter(|s| s.is_due(now))
            .collect())
    }

    /// Diff the playlist against what the last run saw and enqueue what the
    /// library is missing.
    #[tracing::instrument(skip(self))]
    pub async fn reconcile(&self, subscription_id: i64) -> Result<ReconciliationReport> {
        let subscription = self
            .subscription(subscription_id)
            .await?
            .ok_or_eyre(format!("Subscription {} not found", subscription_id))?;
        let source = self
            .sources
            .get(&subscription.platform)
            .ok_or_else(|| eyre!("No playlist source for {}", subscription.platform))?;

        // Against an empty placeholder every track would look missing
        let snapshot = self.library.current();
        if !snapshot.is_loaded() {
            let message = "library catalog has not been loaded yet".to_string();
            tracing::warn!("Not reconciling subscription {}: {}", subscription_id, message);
            self.record_error(subscription, message.clone()).await?;
            return Err(eyre!(
                "Cannot reconcile subscription {}: {}",
                subscription_id,
                message
            ));
        }

        let playlist = match source.fetch_playlist(&subscription.playlist_id).await {
            Ok(playlist) => playlist,
            Err(e) => {
                let message = format!("{:#}", e);
                tracing::warn!(
                    "Fetching playlist for subscription {} failed: {}",
                    subscription_id,
                    message
                );
                self.record_error(subscription, message).await?;
                return Err(e.wrap_err(format!(
                    "Failed to fetch playlist for subscription {}",
                    subscription_id
                )));
            }
        };

        let mut listed = HashSet::new();
        let tracks: Vec<_> = playlist
            .tracks
            .into_iter()
            .filter(|t| !t.title.trim().is_empty())
            .filter(|t| listed.insert(t.id.clone()))
            .collect();
        let seen = &subscription.last_seen_track_ids.0;
        let new_tracks: Vec<_> = tracks.iter().filter(|t| !seen.contains(&t.id)).collect();

        let mut report = ReconciliationReport {
            subscription_id,
            playlist_name: playlist.name.clone(),
            total: tracks.len(),
            new: new_tracks.len(),
            present: 0,
            enqueued: Vec::new(),
            already_queued: Vec::new(),
            ambiguous: Vec::new(),
            alerts: Vec::new(),
        };

        for track in new_tracks {
            let matched = self.matcher.match_track(track, &snapshot);
            match matched.outcome {
                MatchOutcome::Present => report.present += 1,
                MatchOutcome::Ambiguous => report.ambiguous.push(matched),
                MatchOutcome::Missing => {
                    let handle = self
                        .queue
                        .submit(track.clone(), subscription.quality, Some(subscription_id))
                        .await?;
                    if handle.created {
                        report.enqueued.push(handle);
                    } else {
                        report.already_queued.push(handle);
                    }
                }
            }
        }

        let platform = subscription.platform;
        let current: BTreeSet<String> = tracks.into_iter().map(|t| t.id).collect();
        let mut active: entities::playlist_subscription::ActiveModel = subscription.into();
        active.name = Set(Some(playlist.name));
        active.last_seen_track_ids = Set(TrackIds(current));
        active.last_successful_run = Set(Some(Utc::now().timestamp()));
        active.last_error = Set(None);
        active
            .update(&self.db.conn)
            .await
            .wrap_err("Failed to save reconciliation result")?;

        report.alerts = self
            .credentials
            .alerts()
            .await?
            .into_iter()
            .filter(|alert| alert.platform == platform)
            .collect();

        tracing::info!(
            "Reconciled subscription {} ({}): {} tracks, {} new, {} present, {} enqueued, {} already queued, {} ambiguous",
            subscription_id,
            report.playlist_name,
            report.total,
            report.new,
            report.present,
            report.enqueued.len(),
            report.already_queued.len(),
            report.ambiguous.len()
        );
        Ok(report)
    }

    async fn record_error(
        &self,
        subscription: entities::playlist_subscription::Model,
        message: String,
    ) -> Result<()> {
        let mut active: entities::playlist_subscription::ActiveModel = subscription.into();
        active.last_error = Set(Some(message));
        active
            .update(&self.db.conn)
            .await
            .wrap_err("Failed to record subscription error")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CredentialsConfig, QueueConfig};
    use crate::models::Track;
    use crate::ports::library::{CatalogEntry, MockMediaLibrary};
    use crate::ports::playlist_source::{MockPlaylistSource, SourcePlaylist};
    use crate::services::downloader::Downloaders;
    use crate::services::downloader::fallback::FallbackChains;
    use crate::services::queue::QueueSettings;
    use crate::test_utils::test_db;

    fn track(id: &str, title: &str, artist: &str) -> Track {
        Track {
            id: id.into(),
            title: title.into(),
            artist: artist.into(),
            album: String::new(),
            duration_ms: None,
            platform: Platform::Netease,
        }
    }

    fn catalog() -> Vec<CatalogEntry> {
        vec![
            CatalogEntry {
                id: "L1".into(),
                title: "晴天".into(),
                artist: "周杰伦".into(),
                album: String::new(),
            },
            CatalogEntry {
                id: "L2".into(),
                title: "Hello".into(),
                artist: "Adele".into(),
                album: String::new(),
            },
        ]
    }

    struct Harness {
        reconciler: Reconciler,
        queue: QueueManager,
        snapshots: Arc<LibrarySnapshotStore>,
        _dir: tempfile::TempDir,
    }

    async fn harness(source: MockPlaylistSource) -> Harness {
        let h = harness_without_catalog(source).await;
        h.snapshots.refresh().await.unwrap();
        h
    }

    async fn harness_without_catalog(source: MockPlaylistSource) -> Harness {
        let db = test_db().await;
        let mut library = MockMediaLibrary::new();
        library.expect_fetch_catalog().returning(|| Ok(catalog()));
        let snapshots = Arc::new(LibrarySnapshotStore::new(Arc::new(library), None));

        let credentials = CredentialStore::new(db.clone(), Vec::new(), CredentialsConfig::default());
        let dir = tempfile::tempdir().unwrap();
        let queue = QueueManager::new(
            db.clone(),
            Downloaders::new(),
            credentials.clone(),
            Some(snapshots.clone()),
            Matcher::default(),
            QueueSettings {
                config: QueueConfig::default(),
                chains: FallbackChains::default(),
                download_dir: dir.path().to_path_buf(),
            },
        );
        let reconciler = Reconciler::new(
            db,
            Client::new(),
            vec![Arc::new(source)],
            snapshots.clone(),
            Matcher::default(),
            queue.clone(),
            credentials,
            SyncConfig::default(),
        );
        Harness {
            reconciler,
            queue,
            snapshots,
            _dir: dir,
        }
    }

    fn source_returning(
        playlists: Vec<Result<Vec<Track>, &'static str>>,
    ) -> MockPlaylistSource {
        let mut source = MockPlaylistSource::new();
        source.expect_platform().return_const(Platform::Netease);
        let mut seq = mockall::Sequence::new();
        for playlist in playlists {
            source
                .expect_fetch_playlist()
                .times(1)
                .in_sequence(&mut seq)
                .returning(move |_| match &playlist {
                    Ok(tracks) => Ok(SourcePlaylist {
                        name: "Mix".into(),
                        tracks: tracks.clone(),
                    }),
                    Err(message) => Err(eyre!(*message)),
                });
        }
        source
    }

    #[tokio::test]
    async fn test_second_run_without_changes_enqueues_nothing() {
        let tracks = vec![
            track("1", "晴天", "周杰伦"),
            track("2", "稻香", "周杰伦"),
            track("3", "", "Nobody"),
        ];
        let h = harness(source_returning(vec![Ok(tracks.clone()), Ok(tracks)])).await;
        let sub = h
            .reconciler
            .subscribe(Platform::Netease, "42", None, QualityTier::Exhigh)
            .await
            .unwrap();

        let first = h.reconciler.reconcile(sub.id).await.unwrap();
        assert_eq!(first.total, 2);
        assert_eq!(first.new, 2);
        assert_eq!(first.present, 1);
        assert_eq!(first.enqueued.len(), 1);
        assert_eq!(first.enqueued[0].key.track_id, "2");

        let second = h.reconciler.reconcile(sub.id).await.unwrap();
        assert_eq!(second.new, 0);
        assert!(second.enqueued.is_empty());
        assert!(second.already_queued.is_empty());
        assert_eq!(h.queue.status().await.unwrap().queued, 1);

        let status = h.reconciler.subscription_status(sub.id).await.unwrap().unwrap();
        assert_eq!(status.tracks_seen, 2);
        assert_eq!(status.active_jobs, 1);
        assert_eq!(status.name.as_deref(), Some("Mix"));
        assert!(status.last_successful_run.is_some());
    }

    #[tokio::test]
    async fn test_one_new_track_enqueues_one_job() {
        let before = vec![track("1", "晴天", "周杰伦")];
        let mut after = before.clone();
        after.push(track("9", "New Song", "New Artist"));
        let h = harness(source_returning(vec![Ok(before), Ok(after)])).await;
        let sub = h
            .reconciler
            .subscribe(Platform::Netease, "42", None, QualityTier::Lossless)
            .await
            .unwrap();

        let first = h.reconciler.reconcile(sub.id).await.unwrap();
        assert!(first.enqueued.is_empty());

        let second = h.reconciler.reconcile(sub.id).await.unwrap();
        assert_eq!(second.new, 1);
        assert_eq!(second.enqueued.len(), 1);
        let job = h
            .queue
            .job(second.enqueued[0].job_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(job.requested_quality, QualityTier::Lossless);
        assert_eq!(job.subscription_id, Some(sub.id));
    }

    #[tokio::test]
    async fn test_failed_fetch_keeps_seen_set() {
        let tracks = vec![track("2", "稻香", "周杰伦")];
        let h = harness(source_returning(vec![
            Ok(tracks.clone()),
            Err("playlist is private"),
            Ok(tracks),
        ]))
        .await;
        let sub = h
            .reconciler
            .subscribe(Platform::Netease, "42", None, QualityTier::Exhigh)
            .await
            .unwrap();

        h.reconciler.reconcile(sub.id).await.unwrap();
        let err = h.reconciler.reconcile(sub.id).await.unwrap_err();
        assert!(format!("{:#}", err).contains("playlist is private"));

        let failed = h.reconciler.subscription(sub.id).await.unwrap().unwrap();
        assert!(failed.last_error.unwrap().contains("playlist is private"));
        assert_eq!(failed.last_seen_track_ids.0.len(), 1);

        let recovered = h.reconciler.reconcile(sub.id).await.unwrap();
        assert_eq!(recovered.new, 0);
        let sub = h.reconciler.subscription(sub.id).await.unwrap().unwrap();
        assert!(sub.last_error.is_none());
    }

    #[tokio::test]
    async fn test_unloaded_library_blocks_reconcile() {
        let tracks = vec![track("1", "晴天", "周杰伦"), track("2", "稻香", "周杰伦")];
        let h = harness_without_catalog(source_returning(vec![Ok(tracks)])).await;
        let sub = h
            .reconciler
            .subscribe(Platform::Netease, "42", None, QualityTier::Exhigh)
            .await
            .unwrap();

        let err = h.reconciler.reconcile(sub.id).await.unwrap_err();
        assert!(format!("{:#}", err).contains("not been loaded"));
        assert_eq!(h.queue.status().await.unwrap().queued, 0);
        let blocked = h.reconciler.subscription(sub.id).await.unwrap().unwrap();
        assert!(blocked.last_seen_track_ids.0.is_empty());
        assert!(blocked.last_error.is_some());

        // Once the catalog arrives, only the track it lacks is enqueued
        h.snapshots.refresh().await.unwrap();
        let report = h.reconciler.reconcile(sub.id).await.unwrap();
        assert_eq!(report.present, 1);
        assert_eq!(report.enqueued.len(), 1);
        assert_eq!(report.enqueued[0].key.track_id, "2");
    }

    #[tokio::test]
    async fn test_ambiguous_tracks_are_reported_not_enqueued() {
        let tracks = vec![track("5", "Hello", "Lionel Richie")];
        let h = harness(source_returning(vec![Ok(tracks)])).await;
        let sub = h
            .reconciler
            .subscribe(Platform::Netease, "42", None, QualityTier::Exhigh)
            .await
            .unwrap();

        let report = h.reconciler.reconcile(sub.id).await.unwrap();
        assert!(report.enqueued.is_empty());
        assert_eq!(report.ambiguous.len(), 1);
        assert_eq!(report.ambiguous[0].best_candidate.as_deref(), Some("L2"));
        assert_eq!(h.queue.status().await.unwrap().queued, 0);
    }

    #[tokio::test]
    async fn test_already_queued_tracks_are_reported_separately() {
        let tracks = vec![track("2", "稻香", "周杰伦")];
        let h = harness(source_returning(vec![Ok(tracks)])).await;
        let existing = h
            .queue
            .submit(track("2", "稻香", "周杰伦"), QualityTier::Exhigh, None)
            .await
            .unwrap();
        let sub = h
            .reconciler
            .subscribe(Platform::Netease, "42", None, QualityTier::Exhigh)
            .await
            .unwrap();

        let report = h.reconciler.reconcile(sub.id).await.unwrap();
        assert!(report.enqueued.is_empty());
        assert_eq!(report.already_queued.len(), 1);
        assert_eq!(report.already_queued[0].job_id, existing.job_id);
    }

    #[tokio::test]
    async fn test_subscribe_checks_interval_and_reactivates() {
        let h = harness(source_returning(Vec::new())).await;
        assert!(
            h.reconciler
                .subscribe(
                    Platform::Netease,
                    "42",
                    Some(Duration::from_secs(10)),
                    QualityTier::Exhigh
                )
                .await
                .is_err()
        );
        assert!(
            h.reconciler
                .subscribe(Platform::Qq, "42", None, QualityTier::Exhigh)
                .await
                .is_err()
        );

        let sub = h
            .reconciler
            .subscribe(Platform::Netease, "42", None, QualityTier::Exhigh)
            .await
            .unwrap();
        assert_eq!(sub.sync_interval_secs, 360 * 60);
        assert!(h.reconciler.unsubscribe(sub.id).await.unwrap());
        assert!(h.reconciler.due_subscriptions(i64::MAX).await.unwrap().is_empty());

        let again = h
            .reconciler
            .subscribe(
                Platform::Netease,
                "42",
                Some(Duration::from_secs(600)),
                QualityTier::Hires,
            )
            .await
            .unwrap();
        assert_eq!(again.id, sub.id);
        assert!(again.active);
        assert_eq!(again.sync_interval_secs, 600);
        assert_eq!(h.reconciler.list_subscriptions().await.unwrap().len(), 1);

        // Never run, so due straight away
        let now = Utc::now().timestamp();
        assert_eq!(h.reconciler.due_subscriptions(now).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_subscribe_url() {
        let h = harness(source_returning(Vec::new())).await;
        let sub = h
            .reconciler
            .subscribe_url(
                "https://music.163.com/playlist?id=2829883282",
                None,
                QualityTier::Exhigh,
            )
            .await
            .unwrap();
        assert_eq!(sub.platform, Platform::Netease);
        assert_eq!(sub.playlist_id, "2829883282");
        assert!(
            h.reconciler
                .subscribe_url("https://example.com/nothing", None, QualityTier::Exhigh)
                .await
                .is_err()
        );
    }
}
