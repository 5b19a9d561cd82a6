use std::sync::Arc;

use color_eyre::eyre::{Result, eyre};

use crate::entities::credential::ProbeTier;
use crate::models::{Platform, QualityTier};
use crate::ports::session::{AccountProfile, PlatformSession, ProbeOutcome};
use crate::services::downloader::error::DownloadError;
use crate::services::downloader::relay::RelayClient;

/// QQ Music sessions, probed through the relay. QQ cookies cannot be renewed.
pub struct QqSession {
    relay: Option<Arc<RelayClient>>,
    /// A track every account can at least stream at standard quality
    probe_track: String,
    preferred: QualityTier,
}

impl QqSession {
    pub fn new(relay: Option<Arc<RelayClient>>, probe_track: &str, preferred: QualityTier) -> Self {
        Self {
            relay,
            probe_track: probe_track.to_string(),
            preferred,
        }
    }

    fn relay(&self) -> Result<&RelayClient> {
        self.relay
            .as_deref()
            .ok_or_else(|| eyre!("QQ sessions can only be checked through the relay"))
    }

    async fn probe_url(&self, tier: QualityTier, payload: &str) -> Result<ProbeOutcome> {
        match self
            .relay()?
            .resolve_url(Platform::Qq, &self.probe_track, tier, payload)
            .await
        {
            Ok(_) => Ok(ProbeOutcome::Valid(None)),
            Err(DownloadError::QualityUnavailable(tier)) => {
                Ok(ProbeOutcome::Denied(format!("no {} entitlement", tier)))
            }
            Err(DownloadError::AuthExpired(reason)) => Ok(ProbeOutcome::Rejected(reason)),
            Err(err) => Err(err.into()),
        }
    }
}

/// The uin a QQ cookie belongs to, without the `o` prefix QQ sometimes adds.
pub fn principal_from_cookie(cookie: &str) -> Option<String> {
    cookie
        .split(';')
        .filter_map(|part| part.trim().split_once('='))
        .find(|(key, _)| matches!(key.trim(), "uin" | "qqmusic_uin" | "p_uin"))
        .map(|(_, value)| value.trim().trim_start_matches('o').to_string())
        .filter(|uin| !uin.is_empty())
}

#[async_trait::async_trait]
impl PlatformSession for QqSession {
    fn platform(&self) -> Platform {
        Platform::Qq
    }

    async fn probe(&self, tier: ProbeTier, _principal: &str, payload: &str) -> Result<ProbeOutcome> {
        match tier {
            ProbeTier::AccountProfile => {
                match self.relay()?.diagnose(Platform::Qq, payload).await {
                    Ok(diagnosis) if diagnosis.cookie_valid => {
                        Ok(ProbeOutcome::Valid(Some(AccountProfile {
                            nickname: diagnosis.uin,
                            is_vip: diagnosis.is_vip,
                        })))
                    }
                    Ok(_) => Ok(ProbeOutcome::Denied("relay reports cookie invalid".into())),
                    Err(DownloadError::AuthExpired(reason)) => Ok(ProbeOutcome::Rejected(reason)),
                    Err(err) => Err(err.into()),
                }
            }
            ProbeTier::OwnedResources => self.probe_url(self.preferred, payload).await,
            ProbeTier::PublicConfig => self.probe_url(QualityTier::Standard, payload).await,
        }
    }

    async fn renew(&self, _principal: &str, _payload: &str) -> Result<Option<String>> {
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{FakeRelay, spawn_fake_relay};

    #[test]
    fn test_principal_from_cookie() {
        assert_eq!(
            principal_from_cookie("qm_keyst=abc; uin=o0123456; foo=bar").as_deref(),
            Some("0123456")
        );
        assert_eq!(principal_from_cookie("qm_keyst=abc"), None);
    }

    #[tokio::test]
    async fn test_probes_through_relay() {
        let relay = spawn_fake_relay(FakeRelay {
            unavailable: vec![QualityTier::Lossless],
            expired_cookies: vec!["uin=2".into()],
            ..FakeRelay::default()
        })
        .await;
        let session = QqSession::new(
            Some(Arc::new(relay.client("secret"))),
            "0039MnYb0qxYhV",
            QualityTier::Lossless,
        );

        let outcome = session
            .probe(ProbeTier::AccountProfile, "1", "uin=1")
            .await
            .unwrap();
        assert_eq!(
            outcome,
            ProbeOutcome::Valid(Some(AccountProfile {
                nickname: Some("1".into()),
                is_vip: Some(true),
            }))
        );
        assert!(matches!(
            session
                .probe(ProbeTier::OwnedResources, "1", "uin=1")
                .await
                .unwrap(),
            ProbeOutcome::Denied(_)
        ));
        assert_eq!(
            session
                .probe(ProbeTier::PublicConfig, "1", "uin=1")
                .await
                .unwrap(),
            ProbeOutcome::Valid(None)
        );
        assert!(matches!(
            session
                .probe(ProbeTier::AccountProfile, "2", "uin=2")
                .await
                .unwrap(),
            ProbeOutcome::Rejected(_)
        ));
        assert_eq!(session.renew("1", "uin=1").await.unwrap(), None);
    }
}
