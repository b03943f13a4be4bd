//! Host-memory emulation of a device backend
//!
//! Emulates N independent device arenas in host memory so the allocator is
//! fully exercisable without a GPU: every tier, including exhaustion, can be
//! driven by configuring a per-device byte capacity. Call counters expose
//! how often the raw primitives were actually invoked, which is what the
//! reuse guarantees are asserted against in tests.

use std::alloc::{alloc, dealloc, Layout};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use crate::backend::{DeviceId, DevicePtr, NativeBackend};
use crate::error::{PoolError, PoolResult};

/// Allocation alignment, matching typical device-allocator granularity.
const HOST_ALIGNMENT: usize = 256;

#[derive(Debug)]
struct HostArena {
    capacity: usize,
    in_use: usize,
    /// Base address -> allocation length. Ordered so interior pointers
    /// (views) can be mapped back to their containing allocation.
    live: BTreeMap<usize, usize>,
}

impl HostArena {
    fn new(capacity: usize) -> Self {
        HostArena {
            capacity,
            in_use: 0,
            live: BTreeMap::new(),
        }
    }

    /// Find the live allocation containing `[addr, addr + len)`, if any.
    fn containing(&self, addr: usize, len: usize) -> Option<(usize, usize)> {
        let (&base, &alloc_len) = self.live.range(..=addr).next_back()?;
        let end = addr.checked_add(len)?;
        if end <= base + alloc_len {
            Some((base, alloc_len))
        } else {
            None
        }
    }
}

/// Capacity-limited host-memory backend.
///
/// Each device id maps to its own arena with independent accounting and an
/// independent lock, so cross-device traffic never contends.
#[derive(Debug)]
pub struct HostBackend {
    arenas: Vec<Mutex<HostArena>>,
    alloc_calls: AtomicUsize,
    free_calls: AtomicUsize,
}

impl HostBackend {
    /// Backend with `device_count` arenas and unbounded capacity.
    pub fn new(device_count: usize) -> Self {
        Self::with_capacity(device_count, usize::MAX)
    }

    /// Backend with `device_count` arenas, each capped at
    /// `bytes_per_device` bytes of outstanding allocations.
    pub fn with_capacity(device_count: usize, bytes_per_device: usize) -> Self {
        let arenas = (0..device_count)
            .map(|_| Mutex::new(HostArena::new(bytes_per_device)))
            .collect();
        HostBackend {
            arenas,
            alloc_calls: AtomicUsize::new(0),
            free_calls: AtomicUsize::new(0),
        }
    }

    /// Number of times `raw_alloc` was invoked, successful or not.
    pub fn alloc_calls(&self) -> usize {
        self.alloc_calls.load(Ordering::Relaxed)
    }

    /// Number of pointers returned through `raw_free`.
    pub fn free_calls(&self) -> usize {
        self.free_calls.load(Ordering::Relaxed)
    }

    /// Bytes currently allocated on `device` (pooled pointers count as
    /// in use until the registry frees them natively).
    pub fn bytes_in_use(&self, device: DeviceId) -> PoolResult<usize> {
        Ok(self.lock_arena(device)?.in_use)
    }

    fn lock_arena(&self, device: DeviceId) -> PoolResult<MutexGuard<'_, HostArena>> {
        let arena = self
            .arenas
            .get(device)
            .ok_or(PoolError::InvalidDevice {
                device,
                count: self.arenas.len(),
            })?;
        Ok(arena.lock()?)
    }

    fn layout_for(byte_len: usize) -> PoolResult<Layout> {
        Layout::from_size_align(byte_len, HOST_ALIGNMENT)
            .map_err(|e| PoolError::Backend(format!("invalid layout for {} bytes: {}", byte_len, e)))
    }
}

impl NativeBackend for HostBackend {
    fn device_count(&self) -> usize {
        self.arenas.len()
    }

    fn raw_alloc(&self, device: DeviceId, byte_len: usize) -> PoolResult<DevicePtr> {
        self.alloc_calls.fetch_add(1, Ordering::Relaxed);

        if byte_len == 0 {
            return Err(PoolError::InvalidRequest(
                "allocation size cannot be zero".to_string(),
            ));
        }

        let mut arena = self.lock_arena(device)?;

        let would_use = arena.in_use.checked_add(byte_len);
        if would_use.map_or(true, |total| total > arena.capacity) {
            tracing::debug!(
                device,
                byte_len,
                in_use = arena.in_use,
                capacity = arena.capacity,
                "host arena exhausted"
            );
            return Err(PoolError::OutOfDeviceMemory {
                device,
                requested: byte_len,
            });
        }

        let layout = Self::layout_for(byte_len)?;
        // SAFETY: layout has nonzero size (checked above) and valid alignment.
        let raw = unsafe { alloc(layout) };
        if raw.is_null() {
            return Err(PoolError::Backend(format!(
                "host allocation of {} bytes failed",
                byte_len
            )));
        }

        arena.in_use += byte_len;
        arena.live.insert(raw as usize, byte_len);
        tracing::trace!(device, byte_len, ptr = raw as usize, "host raw_alloc");
        Ok(DevicePtr::new(raw.cast()))
    }

    fn raw_free(&self, device: DeviceId, ptr: DevicePtr) {
        let mut arena = match self.lock_arena(device) {
            Ok(arena) => arena,
            Err(err) => {
                tracing::error!(%err, device, ptr = ptr.addr(), "raw_free on invalid arena");
                return;
            }
        };

        match arena.live.remove(&ptr.addr()) {
            Some(byte_len) => {
                arena.in_use -= byte_len;
                drop(arena);
                let layout = match Self::layout_for(byte_len) {
                    Ok(layout) => layout,
                    Err(err) => {
                        tracing::error!(%err, "unreachable: layout was valid at alloc time");
                        return;
                    }
                };
                // SAFETY: ptr came from alloc() with this exact layout and was
                // removed from the live map, so it is freed exactly once.
                unsafe { dealloc(ptr.as_raw().cast(), layout) };
                self.free_calls.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(device, byte_len, ptr = ptr.addr(), "host raw_free");
            }
            None => {
                tracing::error!(
                    device,
                    ptr = ptr.addr(),
                    "raw_free of pointer not allocated on this device"
                );
            }
        }
    }

    fn write_bytes(&self, device: DeviceId, dst: DevicePtr, data: &[u8]) -> PoolResult<()> {
        if data.is_empty() {
            return Ok(());
        }
        let arena = self.lock_arena(device)?;
        if arena.containing(dst.addr(), data.len()).is_none() {
            return Err(PoolError::CopyFailed(format!(
                "write of {} bytes at 0x{:x} is outside any live allocation on device {}",
                data.len(),
                dst.addr(),
                device
            )));
        }
        // SAFETY: destination range verified to lie within a single live
        // allocation; the arena lock serializes against free.
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), dst.as_raw().cast::<u8>(), data.len());
        }
        Ok(())
    }

    fn read_bytes(&self, device: DeviceId, src: DevicePtr, out: &mut [u8]) -> PoolResult<()> {
        if out.is_empty() {
            return Ok(());
        }
        let arena = self.lock_arena(device)?;
        if arena.containing(src.addr(), out.len()).is_none() {
            return Err(PoolError::CopyFailed(format!(
                "read of {} bytes at 0x{:x} is outside any live allocation on device {}",
                out.len(),
                src.addr(),
                device
            )));
        }
        // SAFETY: source range verified as for write_bytes.
        unsafe {
            std::ptr::copy_nonoverlapping(src.as_raw().cast::<u8>(), out.as_mut_ptr(), out.len());
        }
        Ok(())
    }
}

impl Drop for HostBackend {
    fn drop(&mut self) {
        let mut leaked = 0usize;
        for arena in &mut self.arenas {
            let arena = arena.get_mut().unwrap_or_else(|p| p.into_inner());
            for (addr, byte_len) in std::mem::take(&mut arena.live) {
                if let Ok(layout) = Self::layout_for(byte_len) {
                    // SAFETY: every entry in the live map came from alloc()
                    // with this layout and has not been freed.
                    unsafe { dealloc(addr as *mut u8, layout) };
                }
                leaked += 1;
            }
        }
        if leaked > 0 {
            tracing::warn!(leaked, "host backend dropped with live allocations");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_free_roundtrip() {
        let backend = HostBackend::new(1);
        let ptr = backend.raw_alloc(0, 128).unwrap();
        assert!(!ptr.is_null());
        assert_eq!(backend.bytes_in_use(0).unwrap(), 128);
        assert_eq!(backend.alloc_calls(), 1);

        backend.raw_free(0, ptr);
        assert_eq!(backend.bytes_in_use(0).unwrap(), 0);
        assert_eq!(backend.free_calls(), 1);
    }

    #[test]
    fn test_capacity_exhaustion() {
        let backend = HostBackend::with_capacity(1, 256);
        let a = backend.raw_alloc(0, 200).unwrap();

        let err = backend.raw_alloc(0, 100).unwrap_err();
        assert!(matches!(err, PoolError::OutOfDeviceMemory { device: 0, requested: 100 }));
        // The failed attempt still counts as a call.
        assert_eq!(backend.alloc_calls(), 2);

        backend.raw_free(0, a);
        assert!(backend.raw_alloc(0, 100).is_ok());
    }

    #[test]
    fn test_devices_are_independent_arenas() {
        let backend = HostBackend::with_capacity(2, 128);
        let _a = backend.raw_alloc(0, 128).unwrap();
        // Device 0 is full; device 1 is untouched.
        assert!(backend.raw_alloc(0, 1).is_err());
        assert!(backend.raw_alloc(1, 128).is_ok());
    }

    #[test]
    fn test_invalid_device() {
        let backend = HostBackend::new(1);
        let err = backend.raw_alloc(3, 16).unwrap_err();
        assert!(matches!(err, PoolError::InvalidDevice { device: 3, count: 1 }));
    }

    #[test]
    fn test_zero_size_rejected() {
        let backend = HostBackend::new(1);
        assert!(matches!(
            backend.raw_alloc(0, 0),
            Err(PoolError::InvalidRequest(_))
        ));
    }

    #[test]
    fn test_free_of_unknown_pointer_is_logged_not_fatal() {
        let backend = HostBackend::new(1);
        backend.raw_free(0, DevicePtr::from_addr(0xdead_0000));
        assert_eq!(backend.free_calls(), 0);
    }

    #[test]
    fn test_write_read_roundtrip() {
        let backend = HostBackend::new(1);
        let ptr = backend.raw_alloc(0, 64).unwrap();

        let data: Vec<u8> = (0..64).collect();
        backend.write_bytes(0, ptr, &data).unwrap();

        let mut out = vec![0u8; 64];
        backend.read_bytes(0, ptr, &mut out).unwrap();
        assert_eq!(out, data);

        backend.raw_free(0, ptr);
    }

    #[test]
    fn test_interior_pointer_copies() {
        let backend = HostBackend::new(1);
        let ptr = backend.raw_alloc(0, 64).unwrap();
        let interior = DevicePtr::from_addr(ptr.addr() + 32);

        backend.write_bytes(0, interior, &[7u8; 32]).unwrap();

        let mut out = vec![0u8; 32];
        backend.read_bytes(0, interior, &mut out).unwrap();
        assert_eq!(out, [7u8; 32]);

        // One byte past the end must be rejected.
        let err = backend.write_bytes(0, interior, &[0u8; 33]).unwrap_err();
        assert!(matches!(err, PoolError::CopyFailed(_)));

        backend.raw_free(0, ptr);
    }

    #[test]
    fn test_copy_outside_live_allocation_rejected() {
        let backend = HostBackend::new(1);
        let err = backend
            .write_bytes(0, DevicePtr::from_addr(0x1000), &[1, 2, 3])
            .unwrap_err();
        assert!(matches!(err, PoolError::CopyFailed(_)));
    }
}
