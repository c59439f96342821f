use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::classifier::ErrorClassifier;
use crate::config::EscalatorConfig;

use super::{
    BrowserHybridFetch, BrowserLauncher, FullBrowserFetch, LightweightFetch, TierExecutor,
    TierKind,
};

/// Executors by tier. Adding a strategy means registering another variant.
#[derive(Clone, Default)]
pub struct TierRegistry {
    executors: BTreeMap<TierKind, Arc<dyn TierExecutor>>,
}

impl fmt::Debug for TierRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TierRegistry")
            .field("tiers", &self.kinds())
            .finish()
    }
}

impl TierRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds the enabled production executors.
    pub fn from_config(config: &EscalatorConfig) -> Self {
        let classifier = Arc::new(ErrorClassifier::new(&config.classifier));
        let launcher = BrowserLauncher::new(config.chromium.clone());
        let mut registry = Self::new();
        if config.tiers.lightweight.enabled {
            registry.register(Arc::new(LightweightFetch::new(
                config.tiers.lightweight.clone(),
                config.session.clone(),
                Arc::clone(&classifier),
            )));
        }
        if config.tiers.browser_hybrid.enabled {
            registry.register(Arc::new(BrowserHybridFetch::new(
                config.tiers.browser_hybrid.clone(),
                config.session.clone(),
                launcher.clone(),
                Arc::clone(&classifier),
            )));
        }
        if config.tiers.full_browser.enabled {
            registry.register(Arc::new(FullBrowserFetch::new(
                config.tiers.full_browser.clone(),
                config.session.clone(),
                launcher,
                classifier,
            )));
        }
        registry
    }

    /// Replaces any executor already registered for the same tier.
    pub fn register(&mut self, executor: Arc<dyn TierExecutor>) -> Option<Arc<dyn TierExecutor>> {
        self.executors.insert(executor.kind(), executor)
    }

    pub fn with(mut self, executor: Arc<dyn TierExecutor>) -> Self {
        self.register(executor);
        self
    }

    pub fn get(&self, kind: TierKind) -> Option<Arc<dyn TierExecutor>> {
        self.executors.get(&kind).cloned()
    }

    /// Registered tiers within `start..=max`, cheapest first.
    pub fn ladder(&self, start: TierKind, max: TierKind) -> Vec<Arc<dyn TierExecutor>> {
        if start > max {
            return Vec::new();
        }
        self.executors
            .range(start..=max)
            .map(|(_, executor)| Arc::clone(executor))
            .collect()
    }

    pub fn kinds(&self) -> Vec<TierKind> {
        self.executors.keys().copied().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.executors.is_empty()
    }

    pub async fn cleanup_all(&self) {
        for executor in self.executors.values() {
            executor.cleanup().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_tiers_are_not_registered() {
        let mut config = EscalatorConfig::default();
        config.tiers.browser_hybrid.enabled = false;
        let registry = TierRegistry::from_config(&config);
        assert_eq!(
            registry.kinds(),
            vec![TierKind::Lightweight, TierKind::FullBrowser]
        );
        let ladder = registry.ladder(TierKind::BrowserHybrid, TierKind::FullBrowser);
        assert_eq!(ladder.len(), 1);
        assert_eq!(ladder[0].kind(), TierKind::FullBrowser);
    }
}
