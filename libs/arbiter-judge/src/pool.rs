/// Container Pool - Warm Sandbox Reuse
///
/// **Core Responsibility:**
/// Keep at most one idle, prewarmed sandbox per language so a run can skip
/// cold start, and hand out exact-limit ad hoc sandboxes for everything else.
///
/// **Policy:**
/// - The pooled handle for a language is claimed with a compare-and-set on
///   its `in_use` flag, so it is never leased twice
/// - Reused only while idle for less than the freshness threshold and only
///   if its provisioned limits meet or exceed the request
/// - A reused handle is re-capped to the request before it is leased and
///   back to the warm limits before it returns to the slot
/// - Losing the race for the slot never blocks, it falls through to ad hoc
/// - Ad hoc handles are always destroyed after use
/// - Only healthy handles go back to the slot
///
/// Pool failures are never fatal: prewarm errors are logged and the next
/// caller simply gets an ad hoc handle.
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use arbiter_common::{Language, ResourceConstraints};
use serde::Serialize;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{JudgeError, Result};
use crate::language::LanguageRegistry;
use crate::metrics;
use crate::sandbox::{IsolationProvider, SandboxHandle, SandboxLimits};

struct IdleHandle {
    handle: SandboxHandle,
    idle_since: Instant,
}

#[derive(Default)]
struct PoolSlot {
    /// Set while the pooled handle is leased
    in_use: AtomicBool,
    /// Set while a background create for this slot is running
    warming: AtomicBool,
    idle: Mutex<Option<IdleHandle>>,
}

impl PoolSlot {
    fn take_idle(&self) -> Option<IdleHandle> {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner).take()
    }

    /// Stores `handle` if the slot is empty, otherwise hands it back
    fn store_idle(&self, handle: SandboxHandle) -> Option<SandboxHandle> {
        let mut idle = self.idle.lock().unwrap_or_else(PoisonError::into_inner);
        if idle.is_some() {
            return Some(handle);
        }
        *idle = Some(IdleHandle {
            handle,
            idle_since: Instant::now(),
        });
        None
    }

    fn is_idle(&self) -> bool {
        self.idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }
}

struct PoolInner {
    provider: Arc<dyn IsolationProvider>,
    registry: Arc<LanguageRegistry>,
    slots: HashMap<Language, PoolSlot>,
    freshness: Duration,
    /// Limits prewarmed handles are provisioned with
    warm_limits: SandboxLimits,
    shutting_down: AtomicBool,
    stop_sweeper: Notify,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

/// Per-language pool occupancy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SlotStats {
    pub idle: bool,
    pub leased: bool,
}

pub type PoolStats = HashMap<Language, SlotStats>;

/// Exclusive use of one sandbox handle
///
/// Hand it back with [`ContainerPool::release`]. A lease that is dropped
/// instead has its handle destroyed in the background.
pub struct SandboxLease {
    handle: Option<SandboxHandle>,
    pooled: bool,
    pool: Arc<PoolInner>,
}

impl SandboxLease {
    pub fn handle(&self) -> Option<&SandboxHandle> {
        self.handle.as_ref()
    }

    pub fn handle_mut(&mut self) -> Option<&mut SandboxHandle> {
        self.handle.as_mut()
    }

    pub fn is_pooled(&self) -> bool {
        self.pooled
    }
}

impl fmt::Debug for SandboxLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SandboxLease")
            .field("handle", &self.handle.as_ref().map(|h| &h.id))
            .field("pooled", &self.pooled)
            .finish()
    }
}

impl Drop for SandboxLease {
    fn drop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        warn!(sandbox = %handle.id, "sandbox lease dropped without release, destroying");

        let pool = Arc::clone(&self.pool);
        let pooled = self.pooled;
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    pool.destroy(&handle).await;
                    if pooled {
                        pool.free_slot(handle.language);
                    }
                });
            }
            Err(_) => {
                if pooled {
                    self.pool.free_slot(handle.language);
                }
            }
        }
    }
}

impl PoolInner {
    fn slot(&self, language: Language) -> Option<&PoolSlot> {
        self.slots.get(&language)
    }

    fn free_slot(&self, language: Language) {
        if let Some(slot) = self.slot(language) {
            slot.in_use.store(false, Ordering::Release);
        }
    }

    async fn destroy(&self, handle: &SandboxHandle) {
        if let Err(e) = self.provider.destroy(handle).await {
            warn!(sandbox = %handle.id, error = %e, "failed to destroy sandbox");
        }
    }

    async fn create(&self, language: Language, limits: SandboxLimits) -> Result<SandboxHandle> {
        let profile = self.registry.get(language)?;
        self.provider
            .create(profile, limits)
            .await
            .map_err(JudgeError::SandboxCreation)
    }

    /// Fills an empty slot; a no-op if one is already idle or warming
    async fn warm(&self, language: Language) {
        let Some(slot) = self.slot(language) else {
            return;
        };
        if self.shutting_down.load(Ordering::Acquire) || slot.is_idle() {
            return;
        }
        if slot
            .warming
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        match self.create(language, self.warm_limits).await {
            Ok(handle) => {
                let surplus = if self.shutting_down.load(Ordering::Acquire) {
                    Some(handle)
                } else {
                    slot.store_idle(handle)
                };
                match surplus {
                    Some(handle) => self.destroy(&handle).await,
                    None if self.shutting_down.load(Ordering::Acquire) => {
                        // Shutdown drained the slot before this handle landed
                        if let Some(entry) = slot.take_idle() {
                            self.destroy(&entry.handle).await;
                        }
                    }
                    None => debug!(%language, "warm sandbox ready"),
                }
            }
            Err(e) => warn!(%language, error = %e, "prewarm failed, falling back to ad hoc sandboxes"),
        }
        slot.warming.store(false, Ordering::Release);
    }
}

#[derive(Clone)]
pub struct ContainerPool {
    inner: Arc<PoolInner>,
}

impl ContainerPool {
    pub fn new(
        provider: Arc<dyn IsolationProvider>,
        registry: Arc<LanguageRegistry>,
        freshness: Duration,
        warm_limits: SandboxLimits,
    ) -> Self {
        let slots = registry
            .profiles()
            .map(|profile| (profile.language, PoolSlot::default()))
            .collect();

        Self {
            inner: Arc::new(PoolInner {
                provider,
                registry,
                slots,
                freshness,
                warm_limits,
                shutting_down: AtomicBool::new(false),
                stop_sweeper: Notify::new(),
                sweeper: Mutex::new(None),
            }),
        }
    }

    pub fn provider(&self) -> &Arc<dyn IsolationProvider> {
        &self.inner.provider
    }

    pub async fn acquire(
        &self,
        language: Language,
        constraints: &ResourceConstraints,
    ) -> Result<SandboxLease> {
        self.acquire_limits(language, SandboxLimits::from_constraints(constraints))
            .await
    }

    /// Leases a handle enforcing exactly `requested`
    pub async fn acquire_limits(
        &self,
        language: Language,
        requested: SandboxLimits,
    ) -> Result<SandboxLease> {
        // Resolve before touching any resource
        self.inner.registry.get(language)?;

        if let Some(lease) = self.try_pooled(language, &requested).await {
            metrics::record_acquisition(language.as_str(), true);
            return Ok(lease);
        }

        let handle = self.inner.create(language, requested).await?;
        debug!(sandbox = %handle.id, %language, "ad hoc sandbox created");
        metrics::record_acquisition(language.as_str(), false);
        Ok(SandboxLease {
            handle: Some(handle),
            pooled: false,
            pool: Arc::clone(&self.inner),
        })
    }

    async fn try_pooled(
        &self,
        language: Language,
        requested: &SandboxLimits,
    ) -> Option<SandboxLease> {
        if self.inner.shutting_down.load(Ordering::Acquire) {
            return None;
        }
        let slot = self.inner.slot(language)?;
        if slot
            .in_use
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return None;
        }

        match slot.take_idle() {
            Some(idle) if idle.idle_since.elapsed() >= self.inner.freshness => {
                slot.in_use.store(false, Ordering::Release);
                debug!(sandbox = %idle.handle.id, "pooled sandbox stale, evicting");
                self.inner.destroy(&idle.handle).await;
                self.replenish(language);
                None
            }
            Some(idle) if !idle.handle.limits.satisfies(requested) => {
                if let Some(handle) = slot.store_idle(idle.handle) {
                    self.inner.destroy(&handle).await;
                }
                slot.in_use.store(false, Ordering::Release);
                None
            }
            Some(idle) => {
                let mut handle = idle.handle;
                if handle.limits != *requested {
                    if let Err(e) = self.inner.provider.set_limits(&handle, *requested).await {
                        warn!(sandbox = %handle.id, error = %e, "re-cap failed, evicting pooled sandbox");
                        self.inner.destroy(&handle).await;
                        slot.in_use.store(false, Ordering::Release);
                        self.replenish(language);
                        return None;
                    }
                    handle.limits = *requested;
                }
                Some(SandboxLease {
                    handle: Some(handle),
                    pooled: true,
                    pool: Arc::clone(&self.inner),
                })
            }
            None => {
                slot.in_use.store(false, Ordering::Release);
                self.replenish(language);
                None
            }
        }
    }

    /// Returns a lease; only healthy pooled handles go back to the slot
    pub async fn release(&self, mut lease: SandboxLease, healthy: bool) {
        let pooled = lease.pooled;
        let Some(handle) = lease.handle.take() else {
            return;
        };
        let language = handle.language;

        if !pooled {
            self.inner.destroy(&handle).await;
            return;
        }

        let mut handle = handle;
        let mut keep = healthy && !self.inner.shutting_down.load(Ordering::Acquire);
        if keep && handle.limits != self.inner.warm_limits {
            match self
                .inner
                .provider
                .set_limits(&handle, self.inner.warm_limits)
                .await
            {
                Ok(()) => handle.limits = self.inner.warm_limits,
                Err(e) => {
                    warn!(sandbox = %handle.id, error = %e, "restoring warm limits failed");
                    keep = false;
                }
            }
        }
        let surplus = match (keep, self.inner.slot(language)) {
            (true, Some(slot)) => slot.store_idle(handle),
            _ => Some(handle),
        };
        if let Some(handle) = surplus {
            debug!(sandbox = %handle.id, healthy, "pooled sandbox not returned");
            self.inner.destroy(&handle).await;
            self.inner.free_slot(language);
            self.replenish(language);
        } else {
            self.inner.free_slot(language);
        }
    }

    fn replenish(&self, language: Language) {
        if self.inner.shutting_down.load(Ordering::Acquire) {
            return;
        }
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move { inner.warm(language).await });
    }

    /// Best effort and non-blocking
    pub fn prewarm(&self, languages: &[Language]) {
        for &language in languages {
            self.replenish(language);
        }
    }

    /// Awaitable prewarm
    pub async fn prewarm_now(&self, languages: &[Language]) {
        for &language in languages {
            self.inner.warm(language).await;
        }
    }

    /// Destroys idle handles past the freshness threshold, returns how many
    pub async fn evict_stale(&self) -> usize {
        let mut evicted = 0;
        for (&language, slot) in &self.inner.slots {
            let stale = {
                let mut idle = slot.idle.lock().unwrap_or_else(PoisonError::into_inner);
                match idle.as_ref() {
                    Some(entry) if entry.idle_since.elapsed() >= self.inner.freshness => idle.take(),
                    _ => None,
                }
            };
            if let Some(entry) = stale {
                debug!(sandbox = %entry.handle.id, %language, "evicting stale sandbox");
                self.inner.destroy(&entry.handle).await;
                evicted += 1;
                self.replenish(language);
            }
        }
        evicted
    }

    /// Periodic eviction until [`shutdown`](Self::shutdown)
    pub fn start_sweeper(&self, interval: Duration) {
        let pool = self.clone();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = pool.inner.stop_sweeper.notified() => break,
                    _ = ticker.tick() => {
                        let evicted = pool.evict_stale().await;
                        if evicted > 0 {
                            debug!(evicted, "pool sweep");
                        }
                    }
                }
            }
        });

        let previous = self
            .inner
            .sweeper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(task);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    /// Stops the sweeper and destroys every idle handle
    pub async fn shutdown(&self) {
        if self.inner.shutting_down.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.stop_sweeper.notify_one();
        let sweeper = self
            .inner
            .sweeper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = sweeper {
            if let Err(e) = task.await {
                debug!(error = %e, "sweeper ended abnormally");
            }
        }

        let mut destroyed = 0;
        for slot in self.inner.slots.values() {
            if let Some(entry) = slot.take_idle() {
                self.inner.destroy(&entry.handle).await;
                destroyed += 1;
            }
        }
        info!(destroyed, "sandbox pool shut down");
    }

    pub fn stats(&self) -> PoolStats {
        self.inner
            .slots
            .iter()
            .map(|(&language, slot)| {
                (
                    language,
                    SlotStats {
                        idle: slot.is_idle(),
                        leased: slot.in_use.load(Ordering::Acquire),
                    },
                )
            })
            .collect()
    }
}
