use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::tier::TierKind;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierCounters {
    pub attempts: u64,
    pub success: u64,
    pub retries: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrchestratorMetrics {
    pub tiers: BTreeMap<TierKind, TierCounters>,
    pub escalations: u64,
    pub fail_fasts: u64,
    pub smart_skips: u64,
    pub captcha_handoffs: u64,
    pub resolutions: u64,
    pub session_hits: u64,
    pub sessions_harvested: u64,
    pub session_invalidations: u64,
}

impl OrchestratorMetrics {
    pub fn record_tier(&mut self, tier: TierKind, success: bool) {
        let counters = self.tiers.entry(tier).or_default();
        counters.attempts = counters.attempts.saturating_add(1);
        if success {
            counters.success = counters.success.saturating_add(1);
        }
    }

    pub fn record_retry(&mut self, tier: TierKind) {
        let counters = self.tiers.entry(tier).or_default();
        counters.retries = counters.retries.saturating_add(1);
    }

    pub fn record_escalation(&mut self) {
        self.escalations = self.escalations.saturating_add(1);
    }

    pub fn record_fail_fast(&mut self) {
        self.fail_fasts = self.fail_fasts.saturating_add(1);
    }

    pub fn record_smart_skip(&mut self) {
        self.smart_skips = self.smart_skips.saturating_add(1);
    }

    pub fn record_captcha_handoff(&mut self) {
        self.captcha_handoffs = self.captcha_handoffs.saturating_add(1);
    }

    pub fn record_resolution(&mut self) {
        self.resolutions = self.resolutions.saturating_add(1);
    }

    pub fn record_session_hit(&mut self) {
        self.session_hits = self.session_hits.saturating_add(1);
    }

    pub fn record_session_harvested(&mut self) {
        self.sessions_harvested = self.sessions_harvested.saturating_add(1);
    }

    pub fn record_session_invalidation(&mut self) {
        self.session_invalidations = self.session_invalidations.saturating_add(1);
    }

    pub fn success_rate(&self, tier: TierKind) -> f64 {
        match self.tiers.get(&tier) {
            Some(counters) if counters.attempts > 0 => {
                (counters.success as f64 / counters.attempts as f64) * 100.0
            }
            _ => 0.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn per_tier_rates() {
        let mut metrics = OrchestratorMetrics::default();
        metrics.record_tier(TierKind::Lightweight, false);
        metrics.record_tier(TierKind::Lightweight, true);
        metrics.record_retry(TierKind::Lightweight);
        assert_eq!(metrics.success_rate(TierKind::Lightweight), 50.0);
        assert_eq!(metrics.success_rate(TierKind::FullBrowser), 0.0);
        assert_eq!(metrics.tiers[&TierKind::Lightweight].retries, 1);
        let json = serde_json::to_value(&metrics).unwrap();
        assert_eq!(json["tiers"]["lightweight"]["attempts"], 2);
    }
}
