//! Dependent listing refreshes (images, containers) triggered by finished
//! operations, plus the cached listings those refreshes produce.

use crate::endpoints::{EndpointResolver, HttpMethod};
use crate::error::TransportError;
use crate::model::{OperationKind, Phase, ResourceKind, StatusRecord};
use crate::transport::RemoteTransport;
use crate::wire::{listing_contains_image, parse_listing};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

#[async_trait]
pub trait ResourceRefresher: Send + Sync {
    async fn refresh(&self, resource: ResourceKind) -> Result<Vec<Value>, TransportError>;
}

/// Re-checks whether the subject of a remotely failed operation exists
/// anyway.
#[async_trait]
pub trait TargetVerifier: Send + Sync {
    async fn target_exists(&self, kind: OperationKind, target: &str) -> bool;
}

#[derive(Clone, Debug)]
pub struct CachedListing {
    pub items: Vec<Value>,
    pub fetched_at: DateTime<Utc>,
}

#[derive(Default)]
pub struct ResourceCache {
    listings: RwLock<HashMap<ResourceKind, CachedListing>>,
}

impl ResourceCache {
    pub fn get(&self, resource: ResourceKind) -> Option<CachedListing> {
        self.listings
            .read()
            .ok()
            .and_then(|listings| listings.get(&resource).cloned())
    }

    pub fn put(&self, resource: ResourceKind, items: Vec<Value>) {
        if let Ok(mut listings) = self.listings.write() {
            listings.insert(
                resource,
                CachedListing {
                    items,
                    fetched_at: Utc::now(),
                },
            );
        }
    }
}

pub struct HttpResourceRefresher {
    transport: Arc<dyn RemoteTransport>,
    resolver: Arc<EndpointResolver>,
    cache: Arc<ResourceCache>,
}

impl HttpResourceRefresher {
    pub fn new(
        transport: Arc<dyn RemoteTransport>,
        resolver: Arc<EndpointResolver>,
        cache: Arc<ResourceCache>,
    ) -> Self {
        Self {
            transport,
            resolver,
            cache,
        }
    }
}

#[async_trait]
impl ResourceRefresher for HttpResourceRefresher {
    async fn refresh(&self, resource: ResourceKind) -> Result<Vec<Value>, TransportError> {
        let path = self.resolver.listing_path(resource);
        let body = self.transport.send(HttpMethod::Get, &path, None).await?;
        let items = parse_listing(resource.as_str(), &body);
        debug!(
            "listing-refreshed resource={} items={}",
            resource.as_str(),
            items.len()
        );
        self.cache.put(resource, items.clone());
        Ok(items)
    }
}

#[async_trait]
impl TargetVerifier for HttpResourceRefresher {
    async fn target_exists(&self, kind: OperationKind, target: &str) -> bool {
        if kind == OperationKind::ContainerAction {
            return false;
        }
        match self.refresh(ResourceKind::Images).await {
            Ok(items) => listing_contains_image(&items, target),
            Err(err) => {
                warn!(
                    "verify-target-failed target={target} code={} error={err}",
                    err.code()
                );
                false
            }
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RefreshDecision {
    /// A refresh will run once the window closes.
    Scheduled,
    /// Folded into a refresh already waiting for its window.
    Coalesced,
    /// A refresh of this resource is running, or no runtime is available.
    Suppressed,
}

#[derive(Default)]
struct Slot {
    pending: bool,
    in_flight: bool,
    task: Option<AbortHandle>,
}

type Slots = Arc<Mutex<HashMap<ResourceKind, Slot>>>;

pub struct ResourceRefreshCoordinator {
    refresher: Arc<dyn ResourceRefresher>,
    window: Duration,
    slots: Slots,
}

impl ResourceRefreshCoordinator {
    pub fn new(refresher: Arc<dyn ResourceRefresher>, window: Duration) -> Self {
        Self {
            refresher,
            window,
            slots: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn resource_for(kind: OperationKind) -> ResourceKind {
        match kind {
            OperationKind::Build | OperationKind::Pull => ResourceKind::Images,
            OperationKind::ContainerAction => ResourceKind::Containers,
        }
    }

    /// Refreshes the listing a succeeded record affects. Failed records
    /// leave listings alone.
    pub fn on_terminal_success(&self, record: &StatusRecord) -> Option<RefreshDecision> {
        if record.phase != Phase::Succeeded {
            return None;
        }
        Some(self.request(Self::resource_for(record.kind)))
    }

    pub fn request(&self, resource: ResourceKind) -> RefreshDecision {
        let Ok(mut slots) = self.slots.lock() else {
            return RefreshDecision::Suppressed;
        };
        let slot = slots.entry(resource).or_default();
        if slot.in_flight {
            debug!("refresh-suppressed resource={}", resource.as_str());
            return RefreshDecision::Suppressed;
        }
        if slot.pending {
            return RefreshDecision::Coalesced;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!("refresh-skipped resource={} reason=no-runtime", resource.as_str());
            return RefreshDecision::Suppressed;
        };

        slot.pending = true;
        let refresher = self.refresher.clone();
        let task_slots = self.slots.clone();
        let window = self.window;
        let task = handle.spawn(async move {
            tokio::time::sleep(window).await;
            set_slot(&task_slots, resource, |slot| {
                slot.pending = false;
                slot.in_flight = true;
            });
            match refresher.refresh(resource).await {
                Ok(items) => info!(
                    "refresh-done resource={} items={}",
                    resource.as_str(),
                    items.len()
                ),
                // The previous cached listing stays in place.
                Err(err) => warn!(
                    "refresh-failed resource={} code={} error={err}",
                    resource.as_str(),
                    err.code()
                ),
            }
            set_slot(&task_slots, resource, |slot| {
                slot.in_flight = false;
                slot.task = None;
            });
        });
        slot.task = Some(task.abort_handle());
        RefreshDecision::Scheduled
    }

    /// Immediate refresh for an explicit caller request, outside the window.
    pub async fn refresh_now(&self, resource: ResourceKind) -> Result<Vec<Value>, TransportError> {
        self.refresher.refresh(resource).await
    }

    pub fn is_busy(&self, resource: ResourceKind) -> bool {
        self.slots
            .lock()
            .ok()
            .and_then(|slots| slots.get(&resource).map(|s| s.pending || s.in_flight))
            .unwrap_or(false)
    }

    pub fn shutdown(&self) {
        if let Ok(mut slots) = self.slots.lock() {
            for slot in slots.values_mut() {
                if let Some(task) = slot.task.take() {
                    task.abort();
                }
                slot.pending = false;
                slot.in_flight = false;
            }
        }
    }
}

fn set_slot(slots: &Slots, resource: ResourceKind, update: impl FnOnce(&mut Slot)) {
    if let Ok(mut slots) = slots.lock() {
        update(slots.entry(resource).or_default());
    }
}
