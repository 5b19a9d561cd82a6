//! Credential store: one session record per (platform, principal), tiered
//! validation, and single-flight renewal.

pub mod background_task;
pub mod netease;
pub mod qq;

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::Utc;
use color_eyre::eyre::{OptionExt, Result, WrapErr, eyre};
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use sea_orm::{
    ActiveModelBehavior, ActiveModelTrait, ColumnTrait, EntityTrait, QueryFilter, QueryOrder, Set,
};
use serde::Serialize;
use tokio::sync::Notify;

use crate::config::CredentialsConfig;
use crate::database::Database;
use crate::entities;
use crate::entities::credential::ProbeTier;
use crate::models::Platform;
use crate::ports::session::{AccountProfile, PlatformSession, ProbeOutcome};

const DAY_SECS: i64 = 24 * 60 * 60;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum RefreshOutcome {
    /// Payload replaced and expiry estimate reset
    Renewed,
    /// The platform cannot renew sessions. Nothing changed.
    Unsupported,
    /// Nothing changed
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Validation {
    pub valid: bool,
    /// First tier that accepted the session
    pub tier: Option<ProbeTier>,
    pub profile: Option<AccountProfile>,
    /// Why each tier before the deciding one failed
    pub failures: Vec<(ProbeTier, String)>,
}

/// A credential needs an operator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CredentialAlert {
    pub platform: Platform,
    pub principal: String,
    pub reason: String,
}

type RefreshKey = (Platform, String);
type InFlight = Shared<BoxFuture<'static, RefreshOutcome>>;

struct Inner {
    db: Arc<Database>,
    sessions: HashMap<Platform, Arc<dyn PlatformSession>>,
    config: CredentialsConfig,
    in_flight: Mutex<HashMap<RefreshKey, InFlight>>,
    /// Signalled whenever a credential alert is cleared
    attention_cleared: Arc<Notify>,
}

#[derive(Clone)]
pub struct CredentialStore {
    inner: Arc<Inner>,
}

impl CredentialStore {
    pub fn new(
        db: Arc<Database>,
        sessions: Vec<Arc<dyn PlatformSession>>,
        config: CredentialsConfig,
    ) -> Self {
        let sessions = sessions
            .into_iter()
            .map(|session| (session.platform(), session))
            .collect();
        Self {
            inner: Arc::new(Inner {
                db,
                sessions,
                config,
                in_flight: Mutex::new(HashMap::new()),
                attention_cleared: Arc::new(Notify::new()),
            }),
        }
    }

    pub fn attention_cleared(&self) -> Arc<Notify> {
        self.inner.attention_cleared.clone()
    }

    fn session(&self, platform: Platform) -> Result<&Arc<dyn PlatformSession>> {
        self.inner
            .sessions
            .get(&platform)
            .ok_or_else(|| eyre!("No session support for {}", platform))
    }

    /// Store a payload, replacing any previous one for the same principal.
    pub async fn put(
        &self,
        platform: Platform,
        principal: &str,
        payload: &str,
    ) -> Result<entities::credential::Model> {
        let now = Utc::now().timestamp();
        let expires_at = now + self.inner.config.assumed_lifetime.as_secs() as i64;

        let model = match self.get(platform, principal).await? {
            Some(existing) => {
                let was_flagged = existing.needs_attention;
                let mut active: entities::credential::ActiveModel = existing.into();
                active.payload = Set(payload.to_string());
                active.valid = Set(false);
                active.validated_tier = Set(None);
                active.expires_at = Set(Some(expires_at));
                active.needs_attention = Set(false);
                active.expiry_warning_sent = Set(false);
                let updated = active
                    .update(&self.inner.db.conn)
                    .await
                    .wrap_err("Failed to update credential")?;
                if was_flagged {
                    self.inner.attention_cleared.notify_waiters();
                }
                updated
            }
            None => entities::credential::ActiveModel {
                platform: Set(platform),
                principal: Set(principal.to_string()),
                payload: Set(payload.to_string()),
                expires_at: Set(Some(expires_at)),
                ..entities::credential::ActiveModel::new()
            }
            .insert(&self.inner.db.conn)
            .await
            .wrap_err("Failed to create credential")?,
        };

        tracing::info!("Stored {} credential for {}", platform, principal);
        Ok(model)
    }

    /// `put`, unless the stored payload is already this one.
    pub async fn seed(&self, platform: Platform, principal: &str, payload: &str) -> Result<()> {
        if let Some(existing) = self.get(platform, principal).await?
            && existing.payload == payload
        {
            return Ok(());
        }
        self.put(platform, principal, payload).await?;
        Ok(())
    }

    pub async fn get(
        &self,
        platform: Platform,
        principal: &str,
    ) -> Result<Option<entities::credential::Model>> {
        entities::credential::Entity::find()
            .filter(entities::credential::Column::Platform.eq(platform))
            .filter(entities::credential::Column::Principal.eq(principal))
            .one(&self.inner.db.conn)
            .await
            .wrap_err("Failed to fetch credential")
    }

    pub async fn list(&self) -> Result<Vec<entities::credential::Model>> {
        entities::credential::Entity::find()
            .order_by_asc(entities::credential::Column::Platform)
            .order_by_asc(entities::credential::Column::Principal)
            .all(&self.inner.db.conn)
            .await
            .wrap_err("Failed to fetch credentials")
    }

    pub async fn remove(&self, platform: Platform, principal: &str) -> Result<bool> {
        let res = entities::credential::Entity::delete_many()
            .filter(entities::credential::Column::Platform.eq(platform))
            .filter(entities::credential::Column::Principal.eq(principal))
            .exec(&self.inner.db.conn)
            .await
            .wrap_err("Failed to delete credential")?;
        Ok(res.rows_affected > 0)
    }

    /// The credential downloads use: the most recently validated valid one,
    /// otherwise the most recently updated.
    pub async fn active(&self, platform: Platform) -> Result<Option<entities::credential::Model>> {
        let credentials = entities::credential::Entity::find()
            .filter(entities::credential::Column::Platform.eq(platform))
            .all(&self.inner.db.conn)
            .await
            .wrap_err("Failed to fetch credentials")?;

        let best_valid = credentials
            .iter()
            .filter(|c| c.valid)
            .max_by_key(|c| (c.last_validated_at, c.id))
            .cloned();
        Ok(best_valid.or_else(|| {
            credentials
                .into_iter()
                .max_by_key(|c| (c.updated_at, c.id))
        }))
    }

    /// Probe tiers strictest first; the first tier that accepts decides.
    #[tracing::instrument(skip(self))]
    pub async fn validate(&self, platform: Platform, principal: &str) -> Result<Validation> {
        let credential = self
            .get(platform, principal)
            .await?
            .ok_or_eyre("Credential not found")?;
        let session = self.session(platform)?;

        let mut validation = Validation {
            valid: false,
            tier: None,
            profile: None,
            failures: Vec::new(),
        };
        for tier in ProbeTier::ORDER {
            let probe = session.probe(tier, principal, &credential.payload);
            let reason = match tokio::time::timeout(self.inner.config.probe_timeout, probe).await {
                Ok(Ok(ProbeOutcome::Valid(profile))) => {
                    validation.valid = true;
                    validation.tier = Some(tier);
                    validation.profile = profile;
                    break;
                }
                Ok(Ok(ProbeOutcome::Denied(reason))) => format!("denied: {}", reason),
                Ok(Ok(ProbeOutcome::Rejected(reason))) => format!("rejected: {}", reason),
                Ok(Err(err)) => format!("error: {:#}", err),
                Err(_) => format!("timed out after {:?}", self.inner.config.probe_timeout),
            };
            tracing::debug!("{} probe {:?} failed: {}", platform, tier, reason);
            validation.failures.push((tier, reason));
        }

        let now = Utc::now().timestamp();
        let was_flagged = credential.needs_attention;
        let mut active: entities::credential::ActiveModel = credential.into();
        active.valid = Set(validation.valid);
        active.last_validated_at = Set(Some(now));
        active.validated_tier = Set(validation.tier);
        if validation.valid {
            active.last_valid_at = Set(Some(now));
            active.needs_attention = Set(false);
            active.expiry_warning_sent = Set(false);
        }
        if let Some(profile) = &validation.profile {
            if profile.nickname.is_some() {
                active.nickname = Set(profile.nickname.clone());
            }
            if profile.is_vip.is_some() {
                active.is_vip = Set(profile.is_vip);
            }
        }
        active
            .update(&self.inner.db.conn)
            .await
            .wrap_err("Failed to save credential validation")?;

        if validation.valid {
            tracing::info!(
                "{} credential for {} is valid at {:?}",
                platform,
                principal,
                validation.tier
            );
            if was_flagged {
                self.inner.attention_cleared.notify_waiters();
            }
        } else {
            tracing::warn!("{} credential for {} is invalid", platform, principal);
        }
        Ok(validation)
    }

    /// Renew the session. Concurrent calls for the same key share one attempt.
    pub async fn refresh(&self, platform: Platform, principal: &str) -> RefreshOutcome {
        let key = (platform, principal.to_string());
        let in_flight = {
            let mut in_flight = self
                .inner
                .in_flight
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            match in_flight.get(&key) {
                Some(shared) => shared.clone(),
                None => {
                    let inner = self.inner.clone();
                    let owned_key = key.clone();
                    let shared = async move {
                        let outcome = inner.renew(owned_key.0, &owned_key.1).await;
                        inner
                            .in_flight
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner)
                            .remove(&owned_key);
                        outcome
                    }
                    .boxed()
                    .shared();
                    in_flight.insert(key, shared.clone());
                    shared
                }
            }
        };
        in_flight.await
    }

    /// Flag a credential after a job kept hitting AuthExpired.
    pub async fn mark_needs_attention(
        &self,
        platform: Platform,
        principal: &str,
        reason: &str,
    ) -> Result<CredentialAlert> {
        if let Some(credential) = self.get(platform, principal).await? {
            let mut active: entities::credential::ActiveModel = credential.into();
            active.needs_attention = Set(true);
            active.valid = Set(false);
            active
                .update(&self.inner.db.conn)
                .await
                .wrap_err("Failed to flag credential")?;
        }
        tracing::error!(
            "{} credential for {} needs attention: {}",
            platform,
            principal,
            reason
        );
        Ok(CredentialAlert {
            platform,
            principal: principal.to_string(),
            reason: reason.to_string(),
        })
    }

    /// Platforms whose every credential is flagged. Their jobs are held.
    pub async fn blocked_platforms(&self) -> Result<HashSet<Platform>> {
        let credentials = self.list().await?;
        let mut flagged = HashSet::new();
        let mut usable = HashSet::new();
        for credential in credentials {
            if credential.needs_attention {
                flagged.insert(credential.platform);
            } else {
                usable.insert(credential.platform);
            }
        }
        Ok(flagged.difference(&usable).copied().collect())
    }

    pub async fn alerts(&self) -> Result<Vec<CredentialAlert>> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .filter(|c| c.needs_attention)
            .map(|c| CredentialAlert {
                platform: c.platform,
                principal: c.principal,
                reason: "session rejected after refresh".to_string(),
            })
            .collect())
    }

    /// Credentials that should be looked at soon. Each one is returned once until it
    /// validates again.
    pub async fn expiry_warnings(&self, now: i64) -> Result<Vec<CredentialAlert>> {
        let warn_after = self.inner.config.warn_after.as_secs() as i64;
        let mut warnings = Vec::new();

        for credential in self.list().await? {
            if credential.expiry_warning_sent {
                continue;
            }
            let reason = if credential.last_validated_at.is_some() && !credential.valid {
                Some("last validation failed".to_string())
            } else if let Some(expires_at) = credential.expires_at
                && expires_at - now <= DAY_SECS
            {
                Some("session expires within a day".to_string())
            } else {
                credential
                    .last_valid_at
                    .filter(|last| now - last > warn_after)
                    .map(|last| format!("not confirmed valid for {} days", (now - last) / DAY_SECS))
            };
            let Some(reason) = reason else {
                continue;
            };

            let alert = CredentialAlert {
                platform: credential.platform,
                principal: credential.principal.clone(),
                reason,
            };
            let mut active: entities::credential::ActiveModel = credential.into();
            active.expiry_warning_sent = Set(true);
            active
                .update(&self.inner.db.conn)
                .await
                .wrap_err("Failed to mark expiry warning")?;
            warnings.push(alert);
        }
        Ok(warnings)
    }
}

impl Inner {
    async fn renew(&self, platform: Platform, principal: &str) -> RefreshOutcome {
        match self.try_renew(platform, principal).await {
            Ok(outcome) => outcome,
            Err(err) => {
                tracing::warn!(
                    "Refreshing {} credential for {} failed: {:#}",
                    platform,
                    principal,
                    err
                );
                RefreshOutcome::Failed(format!("{:#}", err))
            }
        }
    }

    async fn try_renew(&self, platform: Platform, principal: &str) -> Result<RefreshOutcome> {
        let session = self
            .sessions
            .get(&platform)
            .ok_or_else(|| eyre!("No session support for {}", platform))?;
        let credential = entities::credential::Entity::find()
            .filter(entities::credential::Column::Platform.eq(platform))
            .filter(entities::credential::Column::Principal.eq(principal))
            .one(&self.db.conn)
            .await
            .wrap_err("Failed to fetch credential")?
            .ok_or_eyre("Credential not found")?;

        let Some(payload) = session.renew(principal, &credential.payload).await? else {
            return Ok(RefreshOutcome::Unsupported);
        };

        let expires_at = Utc::now().timestamp() + self.config.assumed_lifetime.as_secs() as i64;
        let mut active: entities::credential::ActiveModel = credential.into();
        active.payload = Set(payload);
        active.expires_at = Set(Some(expires_at));
        active.expiry_warning_sent = Set(false);
        active
            .update(&self.db.conn)
            .await
            .wrap_err("Failed to save renewed credential")?;

        tracing::info!("Renewed {} credential for {}", platform, principal);
        Ok(RefreshOutcome::Renewed)
    }
}
