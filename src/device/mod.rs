//! Device enrichment cache: MAC address to last-known device identity.
//!
//! Read-mostly map refreshed wholesale on a timer. Lookups are
//! case-insensitive; a miss falls through to the device store and the
//! result is written back, including negative results, so a genuinely
//! unknown MAC does not trigger a store query per flow. Negative entries
//! age out at the next full refresh, which replaces the whole map
//! atomically.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use arc_swap::ArcSwap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::store::DeviceStore;

/// Last-known identity of a device, keyed by lowercase MAC.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceCacheEntry {
    pub hostname: String,
    pub ip: String,
}

type CacheMap = HashMap<String, Option<DeviceCacheEntry>>;

/// In-memory device identity cache over a [`DeviceStore`].
pub struct DeviceCache<S: DeviceStore> {
    store: Arc<S>,
    map: Arc<ArcSwap<CacheMap>>,
    refresh_interval: Duration,
}

impl<S: DeviceStore> Clone for DeviceCache<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            map: Arc::clone(&self.map),
            refresh_interval: self.refresh_interval,
        }
    }
}

impl<S: DeviceStore> DeviceCache<S> {
    pub fn new(store: Arc<S>, refresh_interval: Duration) -> Self {
        Self {
            store,
            map: Arc::new(ArcSwap::from_pointee(CacheMap::new())),
            refresh_interval,
        }
    }

    /// Resolves a MAC (case-insensitive) to its cached identity, falling
    /// through to the store on a miss and writing the result back.
    /// Store errors resolve to `None` without poisoning the cache.
    pub async fn get(&self, mac: &str) -> Option<DeviceCacheEntry> {
        let key = mac.to_ascii_lowercase();

        if let Some(cached) = self.map.load().get(&key) {
            return cached.clone();
        }

        let looked_up = match self.store.get_by_mac(&key).await {
            Ok(row) => row.map(|r| DeviceCacheEntry {
                hostname: r.hostname,
                ip: r.ip,
            }),
            Err(e) => {
                warn!(mac = %key, error = %e, "device lookup failed");
                return None;
            }
        };

        self.map.rcu(|current| {
            let mut next = CacheMap::clone(current);
            next.insert(key.clone(), looked_up.clone());
            next
        });

        looked_up
    }

    /// Queries every known device and atomically swaps the backing map.
    /// Entries for devices no longer in the store disappear here.
    pub async fn refresh(&self) -> Result<usize> {
        let rows = self.store.list_all().await.context("listing devices")?;

        let mut next = CacheMap::with_capacity(rows.len());
        for row in rows {
            next.insert(
                row.mac.to_ascii_lowercase(),
                Some(DeviceCacheEntry {
                    hostname: row.hostname,
                    ip: row.ip,
                }),
            );
        }

        let count = next.len();
        self.map.store(Arc::new(next));
        debug!(devices = count, "device cache refreshed");

        Ok(count)
    }

    /// Number of cached entries, negative entries included.
    pub fn len(&self) -> usize {
        self.map.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.load().is_empty()
    }

    /// Spawns the background full-refresh task. The first tick fires
    /// immediately, populating the cache at startup.
    pub fn start(&self, cancel: CancellationToken) {
        let cache = self.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(cache.refresh_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        if let Err(e) = cache.refresh().await {
                            warn!(error = %e, "device cache refresh failed");
                        }
                    }
                }
            }
        });
    }
}
