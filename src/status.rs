//! Aggregated enrichment status for one scene, with change notification.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::debug;

use crate::detection::SourceDetector;
use crate::error::QueryError;
use crate::model::{CompletionSnapshot, Provider, ProviderStatus, SourceKey, SourceStatus};
use crate::query::{find_scene, QueryClient};

pub type StatusCallback = Arc<dyn Fn(&CompletionSnapshot) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub percentage: u8,
    pub recommendations: Vec<String>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Percentage of {providers..., organized} that are done, plus one
/// recommendation per missing item in fixed order.
pub fn compute_completion(per_source: &[ProviderStatus], organized: &SourceStatus) -> Completion {
    let total = per_source.len() + 1;
    let completed =
        per_source.iter().filter(|entry| entry.status.found).count() + usize::from(organized.found);
    let mut recommendations: Vec<String> = per_source
        .iter()
        .filter(|entry| !entry.status.found)
        .map(|entry| format!("Scrape metadata from {}", entry.provider))
        .collect();
    if !organized.found {
        recommendations.push("Mark scene as organized".to_string());
    }
    Completion {
        percentage: ((completed as f64 / total as f64) * 100.0).round() as u8,
        recommendations,
    }
}

pub struct StatusTracker {
    client: Arc<QueryClient>,
    detector: SourceDetector,
    subscribers: Mutex<Vec<(SubscriptionId, StatusCallback)>>,
    next_subscription: AtomicU64,
    latest: Mutex<Option<Arc<CompletionSnapshot>>>,
}

impl StatusTracker {
    pub fn new(client: Arc<QueryClient>, detector: SourceDetector) -> Self {
        Self {
            client,
            detector,
            subscribers: Mutex::new(Vec::new()),
            next_subscription: AtomicU64::new(1),
            latest: Mutex::new(None),
        }
    }

    /// One scene fetch, then every provider and the organized flag detected
    /// against that single snapshot. Subscribers are always notified.
    pub async fn refresh(&self, scene_id: &str) -> Result<Arc<CompletionSnapshot>, QueryError> {
        let scene = find_scene(&self.client, scene_id).await?;
        let mut per_source = Vec::with_capacity(Provider::ALL.len());
        for provider in Provider::ALL {
            let status = self
                .detector
                .detect_provider(provider, scene_id, Some(&scene))
                .await;
            per_source.push(ProviderStatus { provider, status });
        }
        let organized = self
            .detector
            .detect(SourceKey::Organized, scene_id, Some(&scene))
            .await;
        let completion = compute_completion(&per_source, &organized);
        let snapshot = Arc::new(CompletionSnapshot {
            scene,
            per_source,
            organized,
            percentage: completion.percentage,
            recommendations: completion.recommendations,
        });
        debug!(
            "Status[scene:{}]: {}% complete",
            scene_id, snapshot.percentage
        );
        *lock(&self.latest) = Some(snapshot.clone());
        self.notify(&snapshot);
        Ok(snapshot)
    }

    fn notify(&self, snapshot: &CompletionSnapshot) {
        let callbacks: Vec<StatusCallback> = lock(&self.subscribers)
            .iter()
            .map(|(_, callback)| callback.clone())
            .collect();
        for callback in callbacks {
            callback(snapshot);
        }
    }

    pub fn subscribe(&self, callback: StatusCallback) -> SubscriptionId {
        let id = SubscriptionId(self.next_subscription.fetch_add(1, Ordering::Relaxed));
        lock(&self.subscribers).push((id, callback));
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = lock(&self.subscribers);
        let before = subscribers.len();
        subscribers.retain(|(existing, _)| *existing != id);
        subscribers.len() != before
    }

    pub fn latest(&self) -> Option<Arc<CompletionSnapshot>> {
        lock(&self.latest).clone()
    }

    /// Completion of the most recent snapshot.
    pub fn completion(&self) -> Option<Completion> {
        self.latest().map(|snapshot| Completion {
            percentage: snapshot.percentage,
            recommendations: snapshot.recommendations.clone(),
        })
    }

    pub fn detector(&self) -> &SourceDetector {
        &self.detector
    }
}
