//! Adaptive ordering of pending providers by historical success ratio.

use std::cmp::Ordering;
use std::collections::HashMap;

use crate::model::Provider;
use crate::source_stats::{SourceStats, NEUTRAL_SUCCESS_RATIO};

#[derive(Debug, Clone, Copy, Default)]
pub struct AdaptiveRouter {
    enabled: bool,
}

impl AdaptiveRouter {
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Orders `pending` by descending success ratio. Disabled routing, or a
    /// single pending provider, returns the input unchanged. Ties keep their
    /// input order.
    pub fn order(&self, pending: &[Provider], stats: &HashMap<Provider, SourceStats>) -> Vec<Provider> {
        let mut ordered = pending.to_vec();
        if !self.enabled || ordered.len() <= 1 {
            return ordered;
        }
        let ratio = |provider: &Provider| {
            stats
                .get(provider)
                .map(SourceStats::success_ratio)
                .unwrap_or(NEUTRAL_SUCCESS_RATIO)
        };
        // `sort_by` is stable.
        ordered.sort_by(|left, right| {
            ratio(right)
                .partial_cmp(&ratio(left))
                .unwrap_or(Ordering::Equal)
        });
        ordered
    }
}
