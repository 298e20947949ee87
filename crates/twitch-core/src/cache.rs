//! Short-TTL, single-flight resource cache.
//!
//! Each key is either holding a value until its expiry or tracking one shared
//! in-flight fetch. Concurrent callers for the same key await the same fetch.
//! Failures are never stored; every waiter sees the error and the next call
//! starts a fresh fetch. Expired values are swept out at most once per
//! [`SWEEP_INTERVAL`], on the next `get` after it elapses.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::api::HelixApi;
use crate::error::Result;
use crate::types::{ChannelInfo, StreamInfo};

/// Resource kinds with their fixed time-to-live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheKind {
    Channel,
    Stream,
}

impl CacheKind {
    pub const fn ttl(self) -> Duration {
        match self {
            CacheKind::Channel => Duration::from_secs(14),
            CacheKind::Stream => Duration::from_secs(8),
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            CacheKind::Channel => "channel",
            CacheKind::Stream => "stream",
        }
    }
}

/// Longest TTL of any kind; nothing older is worth keeping.
pub const SWEEP_INTERVAL: Duration = CacheKind::Channel.ttl();

type SharedFetch<T> = Shared<BoxFuture<'static, Result<T>>>;

enum Slot<T> {
    Ready { value: T, expires_at: Instant },
    InFlight { generation: u64, fetch: SharedFetch<T> },
}

enum Probe<T> {
    Hit(T),
    Join(u64, SharedFetch<T>),
    Miss,
}

pub struct ResourceCache<T>
where
    T: Clone + Send + Sync + 'static,
{
    entries: DashMap<(CacheKind, String), Slot<T>>,
    generation: AtomicU64,
    epoch: Instant,
    /// Milliseconds after `epoch` when the next sweep is due.
    next_sweep: AtomicU64,
}

impl<T> Default for ResourceCache<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ResourceCache<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            generation: AtomicU64::new(0),
            epoch: Instant::now(),
            next_sweep: AtomicU64::new(SWEEP_INTERVAL.as_millis() as u64),
        }
    }

    /// Return the live value for `(kind, id)` or run `fetch` once for all
    /// concurrent callers.
    pub async fn get<F, Fut>(&self, kind: CacheKind, id: &str, fetch: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        self.sweep_if_due();
        let key = (kind, id.to_string());

        let (generation, shared) = match self.entries.entry(key.clone()) {
            Entry::Occupied(mut occupied) => match Self::probe(occupied.get()) {
                Probe::Hit(value) => {
                    trace!("cache hit for {} {}", kind.as_str(), id);
                    return Ok(value);
                }
                Probe::Join(generation, shared) => {
                    drop(fetch);
                    (generation, shared)
                }
                Probe::Miss => {
                    let (generation, shared) = self.start(fetch);
                    occupied.insert(Slot::InFlight {
                        generation,
                        fetch: shared.clone(),
                    });
                    (generation, shared)
                }
            },
            Entry::Vacant(vacant) => {
                let (generation, shared) = self.start(fetch);
                vacant.insert(Slot::InFlight {
                    generation,
                    fetch: shared.clone(),
                });
                (generation, shared)
            }
        };

        let result = shared.await;
        self.settle(&key, generation, &result);
        result
    }

    /// Drop expired values. In-flight fetches are left alone.
    pub fn purge_expired(&self) {
        let now = Instant::now();
        self.entries.retain(|_, slot| match slot {
            Slot::Ready { expires_at, .. } => *expires_at > now,
            Slot::InFlight { .. } => true,
        });
    }

    // Must not run while an entry guard is held; `retain` locks every shard.
    fn sweep_if_due(&self) {
        let now = self.epoch.elapsed().as_millis() as u64;
        let due = self.next_sweep.load(Ordering::Relaxed);
        if now < due {
            return;
        }
        let next = now + SWEEP_INTERVAL.as_millis() as u64;
        if self
            .next_sweep
            .compare_exchange(due, next, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
        {
            let before = self.entries.len();
            self.purge_expired();
            trace!(
                "cache sweep dropped {} entries",
                before.saturating_sub(self.entries.len())
            );
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn probe(slot: &Slot<T>) -> Probe<T> {
        match slot {
            Slot::Ready { value, expires_at } if *expires_at > Instant::now() => {
                Probe::Hit(value.clone())
            }
            Slot::Ready { .. } => Probe::Miss,
            Slot::InFlight { generation, fetch } => Probe::Join(*generation, fetch.clone()),
        }
    }

    fn start<F, Fut>(&self, fetch: F) -> (u64, SharedFetch<T>)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        (generation, fetch().boxed().shared())
    }

    /// Any waiter may settle the slot; only the first one for the matching
    /// generation has an effect.
    fn settle(&self, key: &(CacheKind, String), generation: u64, result: &Result<T>) {
        let owns = |slot: &Slot<T>| {
            matches!(slot, Slot::InFlight { generation: current, .. } if *current == generation)
        };

        match result {
            Ok(value) => {
                if let Some(mut slot) = self.entries.get_mut(key) {
                    if owns(&slot) {
                        *slot = Slot::Ready {
                            value: value.clone(),
                            expires_at: Instant::now() + key.0.ttl(),
                        };
                    }
                }
            }
            Err(e) => {
                if self.entries.remove_if(key, |_, slot| owns(slot)).is_some() {
                    debug!("fetch for {} {} failed, not cached: {}", key.0.as_str(), key.1, e);
                }
            }
        }
    }
}

/// Cached lookups for the hot resources handlers ask for.
pub struct Lookups {
    api: Arc<dyn HelixApi>,
    channels: ResourceCache<ChannelInfo>,
    streams: ResourceCache<Option<StreamInfo>>,
}

impl Lookups {
    pub fn new(api: Arc<dyn HelixApi>) -> Self {
        Self {
            api,
            channels: ResourceCache::new(),
            streams: ResourceCache::new(),
        }
    }

    /// Channel metadata, cached for 14 seconds.
    pub async fn channel(&self, broadcaster_id: &str) -> Result<ChannelInfo> {
        let api = Arc::clone(&self.api);
        let id = broadcaster_id.to_string();
        self.channels
            .get(CacheKind::Channel, broadcaster_id, move || async move {
                api.get_channel(&id).await
            })
            .await
    }

    /// Live stream status, cached for 8 seconds. `None` while offline.
    pub async fn stream(&self, user_id: &str) -> Result<Option<StreamInfo>> {
        let api = Arc::clone(&self.api);
        let id = user_id.to_string();
        self.streams
            .get(CacheKind::Stream, user_id, move || async move {
                api.get_stream(&id).await
            })
            .await
    }

    pub async fn is_live(&self, user_id: &str) -> Result<bool> {
        Ok(self.stream(user_id).await?.is_some())
    }
}
