//! In-memory remote source for testing.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::provider::{Item, RemoteSource, SecondaryKind, SecondaryResource};
use minutesync_common::{Error, RemoteId, Result};

#[derive(Default)]
struct Inner {
    items: Vec<Item>,
    secondaries: HashMap<(RemoteId, SecondaryKind), SecondaryResource>,
    unreachable: bool,
    list_failures: u32,
    list_error: Option<String>,
    failing_secondaries: HashSet<RemoteId>,
    latency: Duration,
}

/// Call counters, shared so tests can observe them after handing the remote away.
#[derive(Debug, Default)]
pub struct CallStats {
    pub list_calls: AtomicUsize,
    pub secondary_calls: AtomicUsize,
    pub active_lists: AtomicUsize,
    pub max_active_lists: AtomicUsize,
}

/// In-memory remote source.
///
/// Useful for testing and development. Failures and latency are scriptable.
pub struct MemoryRemote {
    inner: Mutex<Inner>,
    stats: Arc<CallStats>,
}

impl MemoryRemote {
    /// Create a new empty remote.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            stats: Arc::new(CallStats::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Add or replace an item.
    pub fn upsert_item(&self, item: Item) {
        let mut inner = self.lock();
        inner.items.retain(|i| i.id != item.id);
        inner.items.push(item);
    }

    /// Remove an item.
    pub fn remove_item(&self, id: &RemoteId) {
        self.lock().items.retain(|i| &i.id != id);
    }

    /// Set a secondary resource for an item.
    pub fn set_secondary(&self, id: RemoteId, resource: SecondaryResource) {
        self.lock()
            .secondaries
            .insert((id, resource.kind()), resource);
    }

    /// Make `test_connection` report the remote as unreachable.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.lock().unreachable = unreachable;
    }

    /// Fail the next `times` listing calls with a network error carrying `message`.
    pub fn fail_listing(&self, times: u32, message: impl Into<String>) {
        let mut inner = self.lock();
        inner.list_failures = times;
        inner.list_error = Some(message.into());
    }

    /// Fail every secondary fetch for `id`.
    pub fn fail_secondaries_for(&self, id: RemoteId) {
        self.lock().failing_secondaries.insert(id);
    }

    /// Delay every listing call.
    pub fn set_latency(&self, latency: Duration) {
        self.lock().latency = latency;
    }

    /// Shared call counters.
    pub fn stats(&self) -> Arc<CallStats> {
        self.stats.clone()
    }

    async fn list_where<F>(&self, filter: F) -> Result<Vec<Item>>
    where
        F: Fn(&Item) -> bool,
    {
        self.stats.list_calls.fetch_add(1, Ordering::SeqCst);
        let active = self.stats.active_lists.fetch_add(1, Ordering::SeqCst) + 1;
        self.stats.max_active_lists.fetch_max(active, Ordering::SeqCst);

        let latency = self.lock().latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let result = {
            let mut inner = self.lock();
            if inner.list_failures > 0 {
                inner.list_failures -= 1;
                let message = inner
                    .list_error
                    .clone()
                    .unwrap_or_else(|| "listing failed".to_string());
                Err(Error::Network(message))
            } else {
                let mut items: Vec<Item> = inner.items.iter().filter(|i| filter(i)).cloned().collect();
                items.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
                Ok(items)
            }
        };

        self.stats.active_lists.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

impl Default for MemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteSource for MemoryRemote {
    fn name(&self) -> &str {
        "memory"
    }

    async fn test_connection(&self) -> Result<bool> {
        Ok(!self.lock().unreachable)
    }

    async fn list_items_since(&self, since: DateTime<Utc>) -> Result<Vec<Item>> {
        self.list_where(|item| item.updated_at > since).await
    }

    async fn list_all_items(&self) -> Result<Vec<Item>> {
        self.list_where(|_| true).await
    }

    async fn fetch_secondary(
        &self,
        id: &RemoteId,
        kind: SecondaryKind,
    ) -> Result<SecondaryResource> {
        self.stats.secondary_calls.fetch_add(1, Ordering::SeqCst);
        let inner = self.lock();

        if inner.failing_secondaries.contains(id) {
            return Err(Error::Network(format!("{} unavailable for {}", kind, id)));
        }
        if !inner.items.iter().any(|i| &i.id == id) {
            return Err(Error::NotFound(format!("Item not found: {}", id)));
        }

        Ok(inner
            .secondaries
            .get(&(id.clone(), kind))
            .cloned()
            .unwrap_or(match kind {
                SecondaryKind::Panels => SecondaryResource::Panels(Vec::new()),
                SecondaryKind::Transcript => SecondaryResource::Transcript(Vec::new()),
            }))
    }
}
