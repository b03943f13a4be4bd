//! Device allocator with size-keyed pointer reuse
//!
//! Device allocation latency dominates workloads that repeatedly allocate
//! same-shaped buffers (gradient and activation buffers reused every step),
//! so `allocate` climbs a strict four-tier ladder, each tier more expensive
//! and more destructive of future reuse opportunity than the last:
//!
//! 1. pop a retired pointer of the same size from the reuse registry;
//! 2. ask the native backend for fresh memory;
//! 3. force a reclamation pass on the collector bridge, then retry tier 1 -
//!    reclaimable memory may be sitting behind unreachable-but-unfinalized
//!    handles;
//! 4. drain the device's registry back to the native backend and retry the
//!    native allocation once.
//!
//! Exactly one attempt per tier, no retries within a tier. Only after tier 4
//! does the caller see `OutOfDeviceMemory`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::backend::{DeviceId, DevicePtr, NativeBackend};
use crate::bridge::{CollectorBridge, DirectCollector, FinalizeFn, RetiredAlloc};
use crate::error::{PoolError, PoolResult};
use crate::handle::Handle;
use crate::registry::{ReuseRegistry, SizeKey};

/// Allocator configuration.
#[derive(Debug, Clone)]
pub struct AllocatorConfig {
    /// When false, retired pointers are freed natively instead of pooled.
    /// Tier 1 then always misses; useful to isolate reuse-related bugs.
    pub pool_enabled: bool,
    /// Cap on pooled bytes per device. Retirements beyond the cap free
    /// natively. `None` pools without limit.
    pub max_cached_bytes_per_device: Option<usize>,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        AllocatorConfig {
            pool_enabled: true,
            max_cached_bytes_per_device: None,
        }
    }
}

impl AllocatorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_pool_enabled(mut self, enabled: bool) -> Self {
        self.pool_enabled = enabled;
        self
    }

    pub fn with_max_cached_bytes_per_device(mut self, cap: usize) -> Self {
        self.max_cached_bytes_per_device = Some(cap);
        self
    }
}

#[derive(Debug, Default)]
struct StatsInner {
    registry_hits: AtomicU64,
    native_allocs: AtomicU64,
    forced_collections: AtomicU64,
    registry_drains: AtomicU64,
    failed_allocs: AtomicU64,
    retired_pooled: AtomicU64,
    retired_freed: AtomicU64,
}

/// Point-in-time snapshot of allocator counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AllocatorStats {
    /// Allocations served from the reuse registry (tiers 1 and 3).
    pub registry_hits: u64,
    /// Allocations served fresh from the native backend (tiers 2 and 4).
    pub native_allocs: u64,
    /// Reclamation passes forced by tier 3.
    pub forced_collections: u64,
    /// Registry drains performed by tier 4.
    pub registry_drains: u64,
    /// Requests that exhausted all four tiers.
    pub failed_allocs: u64,
    /// Retired pointers that entered the registry.
    pub retired_pooled: u64,
    /// Retired pointers freed natively (pooling off or cap reached).
    pub retired_freed: u64,
}

impl StatsInner {
    fn snapshot(&self) -> AllocatorStats {
        AllocatorStats {
            registry_hits: self.registry_hits.load(Ordering::Relaxed),
            native_allocs: self.native_allocs.load(Ordering::Relaxed),
            forced_collections: self.forced_collections.load(Ordering::Relaxed),
            registry_drains: self.registry_drains.load(Ordering::Relaxed),
            failed_allocs: self.failed_allocs.load(Ordering::Relaxed),
            retired_pooled: self.retired_pooled.load(Ordering::Relaxed),
            retired_freed: self.retired_freed.load(Ordering::Relaxed),
        }
    }
}

struct AllocatorShared {
    backend: Arc<dyn NativeBackend>,
    registry: Arc<ReuseRegistry>,
    bridge: Arc<dyn CollectorBridge>,
    config: AllocatorConfig,
    stats: Arc<StatsInner>,
    finalize: FinalizeFn,
}

impl std::fmt::Debug for AllocatorShared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AllocatorShared")
            .field("backend", &self.backend)
            .field("registry", &self.registry)
            .field("bridge", &self.bridge)
            .field("config", &self.config)
            .finish()
    }
}

/// Build the finalize callback run when a retired allocation is reclaimed.
///
/// It captures the registry and backend directly (not the allocator), so
/// finalization keeps working whatever order allocator, bridge, and handles
/// are dropped in.
fn make_finalizer(
    registry: Arc<ReuseRegistry>,
    backend: Arc<dyn NativeBackend>,
    stats: Arc<StatsInner>,
    pool_enabled: bool,
) -> FinalizeFn {
    Arc::new(move |retired: RetiredAlloc| {
        if !pool_enabled {
            backend.raw_free(retired.device, retired.ptr);
            stats.retired_freed.fetch_add(1, Ordering::Relaxed);
            return;
        }
        let key = SizeKey::new(retired.device, retired.byte_len);
        match registry.put(key, retired.ptr) {
            Ok(true) => {
                stats.retired_pooled.fetch_add(1, Ordering::Relaxed);
            }
            Ok(false) => {
                // Cap eviction; the registry already freed natively.
                stats.retired_freed.fetch_add(1, Ordering::Relaxed);
            }
            Err(err) => {
                // A poisoned shard must not leak the pointer.
                tracing::error!(%err, ptr = retired.ptr.addr(), "registry put failed, freeing natively");
                backend.raw_free(retired.device, retired.ptr);
                stats.retired_freed.fetch_add(1, Ordering::Relaxed);
            }
        }
    })
}

/// The central allocator. Cheap to clone; clones share one registry, one
/// bridge, and one set of counters.
#[derive(Debug, Clone)]
pub struct DeviceAllocator {
    shared: Arc<AllocatorShared>,
}

impl DeviceAllocator {
    /// Allocator with deterministic reference counting (the
    /// [`DirectCollector`] bridge) and default configuration.
    pub fn new(backend: Arc<dyn NativeBackend>) -> Self {
        Self::with_bridge(backend, Arc::new(DirectCollector::new()), AllocatorConfig::default())
    }

    /// Allocator with deterministic reference counting and custom
    /// configuration.
    pub fn with_config(backend: Arc<dyn NativeBackend>, config: AllocatorConfig) -> Self {
        Self::with_bridge(backend, Arc::new(DirectCollector::new()), config)
    }

    /// Allocator wired to a specific collector bridge.
    pub fn with_bridge(
        backend: Arc<dyn NativeBackend>,
        bridge: Arc<dyn CollectorBridge>,
        config: AllocatorConfig,
    ) -> Self {
        let registry = Arc::new(ReuseRegistry::new(
            backend.clone(),
            config.max_cached_bytes_per_device,
        ));
        let stats = Arc::new(StatsInner::default());
        let finalize = make_finalizer(
            registry.clone(),
            backend.clone(),
            stats.clone(),
            config.pool_enabled,
        );
        tracing::debug!(
            devices = backend.device_count(),
            pool_enabled = config.pool_enabled,
            max_cached = ?config.max_cached_bytes_per_device,
            "device allocator created"
        );
        DeviceAllocator {
            shared: Arc::new(AllocatorShared {
                backend,
                registry,
                bridge,
                config,
                stats,
                finalize,
            }),
        }
    }

    /// Allocate `byte_len` bytes on `device`.
    ///
    /// Returned memory is uninitialized: a registry hit hands back whatever
    /// the previous owner left there.
    ///
    /// # Errors
    /// `InvalidRequest` for a zero-byte request, `InvalidDevice` for an
    /// unknown device id, `OutOfDeviceMemory` once all four tiers are
    /// exhausted (including a collector fault during the forced pass).
    pub fn allocate(&self, device: DeviceId, byte_len: usize) -> PoolResult<Handle> {
        let shared = &*self.shared;

        if byte_len == 0 {
            return Err(PoolError::InvalidRequest(
                "allocation size cannot be zero".to_string(),
            ));
        }
        let count = shared.backend.device_count();
        if device >= count {
            return Err(PoolError::InvalidDevice { device, count });
        }

        let key = SizeKey::new(device, byte_len);

        // Tier 1: registry lookup.
        if shared.config.pool_enabled {
            if let Some(ptr) = shared.registry.take(key)? {
                shared.stats.registry_hits.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(device, byte_len, ptr = ptr.addr(), "allocate: registry hit");
                return Ok(self.wrap(ptr, byte_len, device));
            }
        }

        // Tier 2: fresh native allocation.
        match shared.backend.raw_alloc(device, byte_len) {
            Ok(ptr) => {
                shared.stats.native_allocs.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(device, byte_len, ptr = ptr.addr(), "allocate: native");
                return Ok(self.wrap(ptr, byte_len, device));
            }
            Err(err) => {
                tracing::debug!(
                    %err,
                    device,
                    byte_len,
                    "native allocation failed, forcing a reclamation pass"
                );
            }
        }

        // Tier 3: force a reclamation pass, then retry the registry.
        // Reclaimable memory may be sitting behind handles the collector has
        // not finalized yet.
        shared
            .stats
            .forced_collections
            .fetch_add(1, Ordering::Relaxed);
        if let Err(err) = shared.bridge.force_collect() {
            // A collector fault is indistinguishable from collection not
            // freeing enough memory.
            shared.stats.failed_allocs.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(%err, device, byte_len, "forced reclamation pass failed");
            return Err(PoolError::OutOfDeviceMemory {
                device,
                requested: byte_len,
            });
        }
        if shared.config.pool_enabled {
            if let Some(ptr) = shared.registry.take(key)? {
                shared.stats.registry_hits.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(
                    device,
                    byte_len,
                    ptr = ptr.addr(),
                    "allocate: registry hit after forced reclamation"
                );
                return Ok(self.wrap(ptr, byte_len, device));
            }
        }

        // Tier 4: sacrifice all pending reuse on this device, then ask the
        // backend one final time.
        shared.stats.registry_drains.fetch_add(1, Ordering::Relaxed);
        let freed = shared.registry.drain_device(device)?;
        tracing::debug!(device, freed, "allocate: drained registry back to backend");

        match shared.backend.raw_alloc(device, byte_len) {
            Ok(ptr) => {
                shared.stats.native_allocs.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(device, byte_len, ptr = ptr.addr(), "allocate: native after drain");
                Ok(self.wrap(ptr, byte_len, device))
            }
            Err(_) => {
                shared.stats.failed_allocs.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(device, byte_len, "allocate: all four tiers exhausted");
                Err(PoolError::OutOfDeviceMemory {
                    device,
                    requested: byte_len,
                })
            }
        }
    }

    fn wrap(&self, ptr: DevicePtr, byte_len: usize, device: DeviceId) -> Handle {
        let shared = &*self.shared;
        Handle::new_owned(
            ptr,
            byte_len,
            device,
            shared.backend.clone(),
            shared.bridge.clone(),
            shared.finalize.clone(),
        )
    }

    /// Release every pooled pointer on `device` back to the backend.
    /// Returns the number of pointers freed.
    pub fn trim(&self, device: DeviceId) -> PoolResult<usize> {
        self.shared.registry.drain_device(device)
    }

    /// Bytes currently pooled for reuse on `device`.
    pub fn cached_bytes(&self, device: DeviceId) -> PoolResult<usize> {
        self.shared.registry.cached_bytes(device)
    }

    /// Number of pointers currently pooled on `device`.
    pub fn pooled_count(&self, device: DeviceId) -> PoolResult<usize> {
        self.shared.registry.pooled_count(device)
    }

    /// Snapshot of the allocator counters.
    pub fn stats(&self) -> AllocatorStats {
        self.shared.stats.snapshot()
    }

    /// The collector bridge this allocator reports retirements to.
    pub fn bridge(&self) -> &Arc<dyn CollectorBridge> {
        &self.shared.bridge
    }
}
