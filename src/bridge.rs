//! Collector bridge: how retired allocations reach the reuse registry
//!
//! The allocator does not decide when an unreachable handle's pointer is
//! recycled; the host environment's collector does. This module is that
//! boundary. When the last strong reference to an owning handle goes away,
//! the handle reports itself to a [`CollectorBridge`] together with a
//! finalize callback. The bridge runs the callback exactly once, at a time
//! of its choosing:
//!
//! - [`DirectCollector`] runs it immediately (deterministic reference
//!   counting - the count just hit zero, so reclamation is safe right now).
//! - [`DeferredCollector`] queues it until the next reclamation pass,
//!   modeling a host collector whose finalization timing is not ours to
//!   control.

use std::fmt;
use std::sync::{Arc, Mutex};

use crate::backend::{DeviceId, DevicePtr};
use crate::error::PoolResult;

/// A retired owning allocation: no live handle references it anymore.
#[derive(Debug, Clone, Copy)]
pub struct RetiredAlloc {
    pub ptr: DevicePtr,
    pub byte_len: usize,
    pub device: DeviceId,
}

/// Finalize callback handed to the bridge at retirement. Invoking it
/// releases the pointer into the reuse registry (or frees it natively when
/// pooling is off). Must be called exactly once per retired allocation.
pub type FinalizeFn = Arc<dyn Fn(RetiredAlloc) + Send + Sync>;

/// The reclamation boundary between handle ownership and pointer reuse.
pub trait CollectorBridge: Send + Sync + fmt::Debug {
    /// Report that `retired` has no remaining references. The bridge must
    /// invoke `finalize(retired)` exactly once, now or later.
    fn on_unreachable(&self, retired: RetiredAlloc, finalize: FinalizeFn);

    /// Synchronously run a full reclamation pass before returning. May be
    /// expensive; the allocator only calls this after a native allocation
    /// failure.
    fn force_collect(&self) -> PoolResult<()>;
}

/// Deterministic reference counting: finalization runs the instant the
/// reference count reaches zero. The default bridge.
#[derive(Debug, Default)]
pub struct DirectCollector;

impl DirectCollector {
    pub fn new() -> Self {
        DirectCollector
    }
}

impl CollectorBridge for DirectCollector {
    fn on_unreachable(&self, retired: RetiredAlloc, finalize: FinalizeFn) {
        finalize(retired);
    }

    fn force_collect(&self) -> PoolResult<()> {
        // Finalization is never deferred, so there is nothing to surface.
        Ok(())
    }
}

/// Queued finalization: retired allocations accumulate until a reclamation
/// pass runs them. Finalization may be delayed indefinitely, which is
/// exactly the situation the allocator's tier 3 and 4 exist for.
#[derive(Default)]
pub struct DeferredCollector {
    pending: Mutex<Vec<(RetiredAlloc, FinalizeFn)>>,
}

impl DeferredCollector {
    pub fn new() -> Self {
        DeferredCollector::default()
    }

    /// Number of retired allocations awaiting finalization.
    pub fn pending(&self) -> usize {
        match self.pending.lock() {
            Ok(guard) => guard.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    fn drain(&self) -> Vec<(RetiredAlloc, FinalizeFn)> {
        let mut guard = match self.pending.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        std::mem::take(&mut *guard)
    }
}

impl fmt::Debug for DeferredCollector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeferredCollector")
            .field("pending", &self.pending())
            .finish()
    }
}

impl CollectorBridge for DeferredCollector {
    fn on_unreachable(&self, retired: RetiredAlloc, finalize: FinalizeFn) {
        let mut guard = match self.pending.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.push((retired, finalize));
        tracing::trace!(
            device = retired.device,
            byte_len = retired.byte_len,
            ptr = retired.ptr.addr(),
            queued = guard.len(),
            "retirement deferred"
        );
    }

    fn force_collect(&self) -> PoolResult<()> {
        // Take the queue first; finalizers touch registry locks and must not
        // run under ours.
        let batch = self.drain();
        if !batch.is_empty() {
            tracing::debug!(count = batch.len(), "reclamation pass");
        }
        for (retired, finalize) in batch {
            finalize(retired);
        }
        Ok(())
    }
}

impl Drop for DeferredCollector {
    fn drop(&mut self) {
        // A retired pointer must not be stranded just because the process is
        // tearing down; run the outstanding finalizers.
        for (retired, finalize) in self.drain() {
            finalize(retired);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn retired(addr: usize, byte_len: usize) -> RetiredAlloc {
        RetiredAlloc {
            ptr: DevicePtr::from_addr(addr),
            byte_len,
            device: 0,
        }
    }

    fn counting_finalizer(count: Arc<AtomicUsize>) -> FinalizeFn {
        Arc::new(move |_| {
            count.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn test_direct_collector_finalizes_immediately() {
        let count = Arc::new(AtomicUsize::new(0));
        let bridge = DirectCollector::new();

        bridge.on_unreachable(retired(0x100, 96), counting_finalizer(count.clone()));
        assert_eq!(count.load(Ordering::SeqCst), 1);

        bridge.force_collect().unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_deferred_collector_waits_for_collection() {
        let count = Arc::new(AtomicUsize::new(0));
        let bridge = DeferredCollector::new();

        bridge.on_unreachable(retired(0x100, 96), counting_finalizer(count.clone()));
        bridge.on_unreachable(retired(0x200, 96), counting_finalizer(count.clone()));
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert_eq!(bridge.pending(), 2);

        bridge.force_collect().unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert_eq!(bridge.pending(), 0);

        // A second pass finds nothing; finalizers ran exactly once.
        bridge.force_collect().unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_deferred_collector_finalizes_on_drop() {
        let count = Arc::new(AtomicUsize::new(0));
        {
            let bridge = DeferredCollector::new();
            bridge.on_unreachable(retired(0x300, 32), counting_finalizer(count.clone()));
            assert_eq!(count.load(Ordering::SeqCst), 0);
        }
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
