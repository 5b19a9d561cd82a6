use color_eyre::eyre::Result;

use crate::entities::credential::ProbeTier;
use crate::models::Platform;

/// Account details a profile probe may return.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccountProfile {
    pub nickname: Option<String>,
    pub is_vip: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// The session was accepted at this tier.
    Valid(Option<AccountProfile>),
    /// The endpoint refused this session (permission, region, missing entitlement).
    /// Lower tiers may still accept it.
    Denied(String),
    /// The platform says the session itself is not logged in.
    Rejected(String),
}

/// Port trait for probing and renewing platform sessions.
#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait PlatformSession: Send + Sync {
    fn platform(&self) -> Platform;

    /// Network problems are errors; a probe that got an answer returns an outcome.
    async fn probe(&self, tier: ProbeTier, principal: &str, payload: &str)
    -> Result<ProbeOutcome>;

    /// Exchange the payload for a renewed one. `Ok(None)` means renewal is not
    /// supported by the platform.
    async fn renew(&self, principal: &str, payload: &str) -> Result<Option<String>>;
}
