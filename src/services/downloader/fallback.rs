use std::collections::HashMap;

use color_eyre::eyre::{Result, eyre};

use crate::config::DownloaderConfig;
use crate::entities::download_job::FallbackHistory;
use crate::models::QualityTier;

/// Ordered tiers to try for each requested tier.
#[derive(Debug, Clone)]
pub struct FallbackChains {
    chains: HashMap<QualityTier, Vec<QualityTier>>,
}

impl Default for FallbackChains {
    fn default() -> Self {
        use QualityTier::*;
        let chains = HashMap::from([
            (Hires, vec![Hires, Lossless, Exhigh, Standard]),
            (Lossless, vec![Lossless, Exhigh, Standard]),
            (Exhigh, vec![Exhigh, Standard]),
            (Higher, vec![Higher, Standard]),
            (Standard, vec![Standard]),
        ]);
        Self { chains }
    }
}

impl FallbackChains {
    /// Defaults overlaid with the chains set in `[downloader.fallback]`.
    pub fn from_config(config: &DownloaderConfig) -> Result<Self> {
        let mut chains = Self::default();
        for (name, chain) in &config.fallback {
            let tier: QualityTier = name.parse()?;
            if chain.first() != Some(&tier) {
                return Err(eyre!("Fallback chain for {} must start with {}", tier, tier));
            }
            chains.chains.insert(tier, chain.clone());
        }
        Ok(chains)
    }

    pub fn chain(&self, requested: QualityTier) -> &[QualityTier] {
        self.chains
            .get(&requested)
            .map(Vec::as_slice)
            .unwrap_or(std::slice::from_ref(&QualityTier::Standard))
    }

    /// Next tier after `current` that the job has not given up on yet.
    pub fn next_tier(
        &self,
        requested: QualityTier,
        current: QualityTier,
        history: &FallbackHistory,
    ) -> Option<QualityTier> {
        let chain = self.chain(requested);
        let position = chain.iter().position(|tier| *tier == current)?;
        chain[position + 1..]
            .iter()
            .copied()
            .find(|tier| *tier != current && !history.contains(*tier))
    }
}
