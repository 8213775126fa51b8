//! Additive confidence score for a scraped field set.

use crate::config::ScoringConfig;
use crate::model::ScrapedScene;

fn present(value: &Option<String>) -> bool {
    value.as_deref().is_some_and(|text| !text.trim().is_empty())
}

/// Sums the weight of every populated field, clamped to 0..=100.
pub fn score_scraped(scraped: &ScrapedScene, weights: &ScoringConfig) -> u8 {
    let fields = [
        (present(&scraped.title), weights.title),
        (present(&scraped.date), weights.date),
        (present(&scraped.details), weights.details),
        (scraped.studio.is_some(), weights.studio),
        (!scraped.performers.is_empty(), weights.performers),
        (!scraped.tags.is_empty(), weights.tags),
        (!scraped.urls.is_empty(), weights.urls),
        (present(&scraped.image), weights.image),
    ];
    let total: u32 = fields
        .iter()
        .filter(|(is_present, _)| *is_present)
        .map(|(_, weight)| *weight)
        .fold(0u32, u32::saturating_add);
    total.min(100) as u8
}
