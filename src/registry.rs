//! Reuse registry: retired device pointers keyed by size
//!
//! Device allocation is the dominant cost in workloads that repeatedly
//! allocate same-shaped buffers, so retired pointers are pooled instead of
//! freed and handed out verbatim to the next same-sized request. Pointers
//! of equal [`SizeKey`] are interchangeable; nothing else about them is
//! tracked and contents are never cleared.
//!
//! One shard per device, each behind its own lock - allocation callers and
//! the finalization path contend only within a device, never across devices.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::backend::{DeviceId, DevicePtr, NativeBackend};
use crate::error::{PoolError, PoolResult};

/// Interchangeability key: two allocation requests can share a pointer iff
/// their keys are equal. `byte_len` must be nonzero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SizeKey {
    pub device: DeviceId,
    pub byte_len: usize,
}

impl SizeKey {
    pub fn new(device: DeviceId, byte_len: usize) -> Self {
        debug_assert!(byte_len > 0, "SizeKey requires a nonzero byte length");
        SizeKey { device, byte_len }
    }
}

#[derive(Debug, Default)]
struct Shard {
    /// byte length -> retired pointers of that length, unordered.
    buckets: HashMap<usize, Vec<DevicePtr>>,
    cached_bytes: usize,
    pooled: usize,
}

/// Per-device pool of retired pointers.
///
/// Invariant: every pointer held here is unreferenced by any live handle
/// and safe to hand out without reinitialization. A pointer lives in at
/// most one bucket and leaves it atomically on reuse.
pub struct ReuseRegistry {
    backend: Arc<dyn NativeBackend>,
    shards: Vec<Mutex<Shard>>,
    /// Cap on pooled bytes per device; exceeding puts free natively instead.
    max_cached_bytes: Option<usize>,
}

impl ReuseRegistry {
    pub fn new(backend: Arc<dyn NativeBackend>, max_cached_bytes: Option<usize>) -> Self {
        let shards = (0..backend.device_count())
            .map(|_| Mutex::new(Shard::default()))
            .collect();
        ReuseRegistry {
            backend,
            shards,
            max_cached_bytes,
        }
    }

    fn lock_shard(&self, device: DeviceId) -> PoolResult<MutexGuard<'_, Shard>> {
        let shard = self.shards.get(device).ok_or(PoolError::InvalidDevice {
            device,
            count: self.shards.len(),
        })?;
        Ok(shard.lock()?)
    }

    /// Insert a retired pointer. Returns `true` if pooled, `false` if the
    /// cached-byte cap forced a native free instead.
    pub fn put(&self, key: SizeKey, ptr: DevicePtr) -> PoolResult<bool> {
        let mut shard = self.lock_shard(key.device)?;

        if let Some(cap) = self.max_cached_bytes {
            let would_cache = shard.cached_bytes.saturating_add(key.byte_len);
            if would_cache > cap {
                drop(shard);
                tracing::debug!(
                    device = key.device,
                    byte_len = key.byte_len,
                    cap,
                    "cached-byte cap reached, freeing retired pointer natively"
                );
                self.backend.raw_free(key.device, ptr);
                return Ok(false);
            }
        }

        shard.cached_bytes += key.byte_len;
        shard.pooled += 1;
        shard.buckets.entry(key.byte_len).or_default().push(ptr);
        tracing::trace!(
            device = key.device,
            byte_len = key.byte_len,
            ptr = ptr.addr(),
            "pooled retired pointer"
        );
        Ok(true)
    }

    /// Remove and return any pointer matching `key`, or `None` on a miss.
    /// Contents are whatever the previous owner left there.
    pub fn take(&self, key: SizeKey) -> PoolResult<Option<DevicePtr>> {
        let mut shard = self.lock_shard(key.device)?;

        let popped = shard
            .buckets
            .get_mut(&key.byte_len)
            .and_then(|bucket| bucket.pop());

        match popped {
            Some(ptr) => {
                if shard
                    .buckets
                    .get(&key.byte_len)
                    .map_or(false, |bucket| bucket.is_empty())
                {
                    shard.buckets.remove(&key.byte_len);
                }
                shard.cached_bytes -= key.byte_len;
                shard.pooled -= 1;
                Ok(Some(ptr))
            }
            None => Ok(None),
        }
    }

    /// Release every pooled pointer on `device` back to the native backend.
    /// Returns the number of pointers freed. This sacrifices all pending
    /// reuse opportunity on the device; it is the allocator's last resort.
    pub fn drain_device(&self, device: DeviceId) -> PoolResult<usize> {
        let drained = {
            let mut shard = self.lock_shard(device)?;
            shard.cached_bytes = 0;
            shard.pooled = 0;
            std::mem::take(&mut shard.buckets)
        };

        // Native frees happen outside the shard lock.
        let mut freed = 0;
        for (byte_len, ptrs) in drained {
            for ptr in ptrs {
                tracing::trace!(device, byte_len, ptr = ptr.addr(), "draining pooled pointer");
                self.backend.raw_free(device, ptr);
                freed += 1;
            }
        }
        Ok(freed)
    }

    /// Bytes currently pooled on `device`.
    pub fn cached_bytes(&self, device: DeviceId) -> PoolResult<usize> {
        Ok(self.lock_shard(device)?.cached_bytes)
    }

    /// Number of pointers currently pooled on `device`.
    pub fn pooled_count(&self, device: DeviceId) -> PoolResult<usize> {
        Ok(self.lock_shard(device)?.pooled)
    }
}

impl std::fmt::Debug for ReuseRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReuseRegistry")
            .field("devices", &self.shards.len())
            .field("max_cached_bytes", &self.max_cached_bytes)
            .finish()
    }
}

impl Drop for ReuseRegistry {
    fn drop(&mut self) {
        // The registry owns every pointer it pools; return them to the
        // backend at teardown.
        for (device, shard) in self.shards.iter_mut().enumerate() {
            let shard = shard.get_mut().unwrap_or_else(|p| p.into_inner());
            for (_, ptrs) in std::mem::take(&mut shard.buckets) {
                for ptr in ptrs {
                    self.backend.raw_free(device, ptr);
                }
            }
        }
    }
}
