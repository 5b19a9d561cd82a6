use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{CredentialStore, RefreshOutcome};

/// Refresh, then re-validate, every stored credential on a fixed interval.
/// The first cycle runs right away.
pub fn spawn_credential_refresh_task(
    store: CredentialStore,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tracing::info!("Credential refresh task started, every {:?}", interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = run_cycle(&store) => {}
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }
        tracing::info!("Credential refresh task stopped");
    })
}

pub async fn run_cycle(store: &CredentialStore) {
    let credentials = match store.list().await {
        Ok(credentials) => credentials,
        Err(e) => {
            tracing::error!("Credential refresh cycle failed: {:#}", e);
            return;
        }
    };

    for credential in credentials {
        let (platform, principal) = (credential.platform, credential.principal.as_str());
        match store.refresh(platform, principal).await {
            RefreshOutcome::Renewed => {}
            RefreshOutcome::Unsupported => {
                tracing::debug!("{} sessions cannot be renewed", platform);
            }
            RefreshOutcome::Failed(reason) => {
                tracing::warn!(
                    "Could not renew {} credential for {}: {}",
                    platform,
                    principal,
                    reason
                );
            }
        }
        if let Err(e) = store.validate(platform, principal).await {
            tracing::error!(
                "Failed to validate {} credential for {}: {:#}",
                platform,
                principal,
                e
            );
        }
    }

    match store.expiry_warnings(Utc::now().timestamp()).await {
        Ok(warnings) => {
            for warning in warnings {
                tracing::warn!(
                    "{} credential for {} needs attention soon: {}",
                    warning.platform,
                    warning.principal,
                    warning.reason
                );
            }
        }
        Err(e) => tracing::error!("Failed to check credential expiry: {:#}", e),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::config::CredentialsConfig;
    use crate::entities::credential::ProbeTier;
    use crate::models::Platform;
    use crate::ports::session::{MockPlatformSession, ProbeOutcome};
    use crate::test_utils::test_db;

    #[tokio::test]
    async fn test_cycle_renews_then_validates() {
        let db = test_db().await;
        let mut session = MockPlatformSession::new();
        session.expect_platform().return_const(Platform::Netease);
        session
            .expect_renew()
            .times(1)
            .returning(|_, _| Ok(Some("MUSIC_U=renewed".into())));
        session
            .expect_probe()
            .withf(|tier, _, payload| {
                *tier == ProbeTier::AccountProfile && payload == "MUSIC_U=renewed"
            })
            .times(1)
            .returning(|_, _, _| Ok(ProbeOutcome::Valid(None)));
        let store = CredentialStore::new(
            db,
            vec![Arc::new(session)],
            CredentialsConfig::default(),
        );
        store.put(Platform::Netease, "42", "MUSIC_U=a").await.unwrap();

        run_cycle(&store).await;

        let stored = store.get(Platform::Netease, "42").await.unwrap().unwrap();
        assert!(stored.valid);
        assert_eq!(stored.payload, "MUSIC_U=renewed");
    }

    #[tokio::test]
    async fn test_task_stops_on_cancel() {
        let db = test_db().await;
        let store = CredentialStore::new(db, Vec::new(), CredentialsConfig::default());
        let cancel = CancellationToken::new();
        let handle =
            spawn_credential_refresh_task(store, Duration::from_secs(3600), cancel.clone());

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
