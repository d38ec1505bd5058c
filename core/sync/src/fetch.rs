//! Fetch coordination: rate-limited, retried access to the remote source.

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use minutesync_common::{RemoteId, Result};
use minutesync_storage::{Item, RemoteSource, SecondaryKind, SecondaryResource};

use crate::rate_limit::{RateLimitConfig, RateLimiter};
use crate::retry::{RetryConfig, RetryExecutor};

/// Secondary fetch settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FetchConfig {
    /// Concurrent panel fetches.
    pub panels_concurrency: usize,
    /// Concurrent transcript fetches.
    pub transcript_concurrency: usize,
    /// Secondary resources to fetch for every item.
    pub secondaries: Vec<SecondaryKind>,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            panels_concurrency: 5,
            transcript_concurrency: 2,
            secondaries: vec![SecondaryKind::Panels, SecondaryKind::Transcript],
        }
    }
}

impl FetchConfig {
    fn concurrency(&self, kind: SecondaryKind) -> usize {
        let limit = match kind {
            SecondaryKind::Panels => self.panels_concurrency,
            SecondaryKind::Transcript => self.transcript_concurrency,
        };
        limit.max(1)
    }
}

/// Secondary resources fetched for a batch, by item.
pub type Secondaries = HashMap<RemoteId, Vec<SecondaryResource>>;

/// Mediates every call to the remote source.
///
/// All calls pass through one rate limiter and are retried on transient errors.
pub struct FetchCoordinator {
    remote: Arc<dyn RemoteSource>,
    limiter: Arc<RateLimiter>,
    retry: RetryExecutor,
    config: FetchConfig,
}

impl FetchCoordinator {
    pub fn new(
        remote: Arc<dyn RemoteSource>,
        rate_limit: RateLimitConfig,
        retry: RetryConfig,
        config: FetchConfig,
    ) -> Self {
        Self {
            remote,
            limiter: Arc::new(RateLimiter::new(rate_limit)),
            retry: RetryExecutor::new(retry),
            config,
        }
    }

    /// Name of the underlying remote.
    pub fn remote_name(&self) -> &str {
        self.remote.name()
    }

    /// Check whether the remote is reachable.
    pub async fn test_connection(&self) -> Result<bool> {
        self.retry
            .execute(|| {
                let remote = self.remote.clone();
                let limiter = self.limiter.clone();
                async move {
                    limiter.acquire().await?;
                    remote.test_connection().await
                }
            })
            .await
    }

    /// List items, incrementally when `since` is given.
    ///
    /// # Errors
    /// The last error once retries are exhausted, or any non-transient error.
    pub async fn list_items(&self, since: Option<DateTime<Utc>>) -> Result<Vec<Item>> {
        let items = self
            .retry
            .execute(|| {
                let remote = self.remote.clone();
                let limiter = self.limiter.clone();
                async move {
                    limiter.acquire().await?;
                    match since {
                        Some(ts) => remote.list_items_since(ts).await,
                        None => remote.list_all_items().await,
                    }
                }
            })
            .await?;

        match since {
            Some(ts) => info!("Listed {} items changed since {}", items.len(), ts),
            None => info!("Listed {} items", items.len()),
        }
        Ok(items)
    }

    /// Fetch the configured secondary resources for `items`.
    ///
    /// Each kind runs under its own concurrency limit. A fetch that still fails
    /// after retries is left out; the item proceeds without it.
    pub async fn fetch_secondaries(&self, items: &[Item]) -> Secondaries {
        let mut out: Secondaries = HashMap::new();
        if items.is_empty() {
            return out;
        }

        let mut per_kind = Vec::with_capacity(self.config.secondaries.len());
        for kind in &self.config.secondaries {
            per_kind.push(self.fetch_kind(items, *kind));
        }
        let results = futures::future::join_all(per_kind).await;

        for (id, resource) in results.into_iter().flatten() {
            out.entry(id).or_default().push(resource);
        }
        out
    }

    async fn fetch_kind(&self, items: &[Item], kind: SecondaryKind) -> Vec<(RemoteId, SecondaryResource)> {
        let limit = self.config.concurrency(kind);
        debug!("Fetching {} for {} items (concurrency {})", kind, items.len(), limit);

        let mut requests = Vec::with_capacity(items.len());
        for item in items {
            requests.push(self.fetch_one(&item.id, kind));
        }
        // `buffered` keeps listing order, so results line up with `items`.
        let results: Vec<Result<SecondaryResource>> =
            stream::iter(requests).buffered(limit).collect().await;

        let mut fetched = Vec::with_capacity(items.len());
        for (item, result) in items.iter().zip(results) {
            match result {
                Ok(resource) => fetched.push((item.id.clone(), resource)),
                Err(e) => warn!("Continuing without {} for {}: {}", kind, item.id, e),
            }
        }
        fetched
    }

    async fn fetch_one(&self, id: &RemoteId, kind: SecondaryKind) -> Result<SecondaryResource> {
        self.retry
            .execute(|| {
                let remote = self.remote.clone();
                let limiter = self.limiter.clone();
                let id = id.clone();
                async move {
                    limiter.acquire().await?;
                    remote.fetch_secondary(&id, kind).await
                }
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use minutesync_common::Error;
    use minutesync_storage::{MemoryRemote, Panel};
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    fn id(s: &str) -> RemoteId {
        RemoteId::new(s).unwrap()
    }

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 15, hour, 0, 0).unwrap()
    }

    fn fast_retry() -> RetryConfig {
        RetryConfig::new(3)
            .with_initial_delay(Duration::from_millis(1))
            .with_jitter(false)
    }

    fn coordinator(remote: Arc<MemoryRemote>) -> FetchCoordinator {
        FetchCoordinator::new(
            remote,
            RateLimitConfig::default(),
            fast_retry(),
            FetchConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_listing_retries_transient_failures() {
        let remote = Arc::new(MemoryRemote::new());
        remote.upsert_item(Item::new(id("a"), "A", at(9)));
        remote.fail_listing(2, "reset by peer");

        let fetch = coordinator(remote.clone());
        let items = fetch.list_items(None).await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(remote.stats().list_calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_listing_fails_after_retries() {
        let remote = Arc::new(MemoryRemote::new());
        remote.fail_listing(10, "down");

        let fetch = coordinator(remote.clone());
        let result = fetch.list_items(Some(at(8))).await;
        assert!(matches!(result, Err(Error::Network(_))));
        assert_eq!(remote.stats().list_calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_secondary_failure_is_isolated() {
        let remote = Arc::new(MemoryRemote::new());
        remote.upsert_item(Item::new(id("a"), "A", at(9)));
        remote.upsert_item(Item::new(id("b"), "B", at(10)));
        remote.set_secondary(
            id("a"),
            SecondaryResource::Panels(vec![Panel {
                id: "p1".to_string(),
                title: "Action items".to_string(),
                content: "- ship it".to_string(),
            }]),
        );
        remote.fail_secondaries_for(id("b"));

        let fetch = coordinator(remote.clone());
        let items = fetch.list_items(None).await.unwrap();
        let secondaries = fetch.fetch_secondaries(&items).await;

        let a = &secondaries[&id("a")];
        assert_eq!(a.len(), 2);
        assert!(a.iter().any(|r| r.kind() == SecondaryKind::Panels && !r.is_empty()));
        assert!(!secondaries.contains_key(&id("b")));
    }

    #[tokio::test]
    async fn test_only_configured_kinds_are_fetched() {
        let remote = Arc::new(MemoryRemote::new());
        remote.upsert_item(Item::new(id("a"), "A", at(9)));

        let fetch = FetchCoordinator::new(
            remote.clone(),
            RateLimitConfig::default(),
            fast_retry(),
            FetchConfig {
                secondaries: vec![SecondaryKind::Panels],
                ..FetchConfig::default()
            },
        );
        let items = fetch.list_items(None).await.unwrap();
        let secondaries = fetch.fetch_secondaries(&items).await;

        assert_eq!(secondaries[&id("a")].len(), 1);
        assert_eq!(remote.stats().secondary_calls.load(Ordering::SeqCst), 1);
    }
}
