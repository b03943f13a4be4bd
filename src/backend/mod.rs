//! Native device-allocation backends
//!
//! The allocator never talks to a device API directly; it goes through the
//! [`NativeBackend`] facade. Two implementations ship with the crate:
//!
//! - [`HostBackend`]: emulates per-device arenas in host memory with a
//!   configurable capacity. Always available; this is what tests and
//!   GPU-less builds run against.
//! - `HipBackend` (feature = "rocm"): the real thing, over the HIP runtime.

pub mod host;

#[cfg(feature = "rocm")]
pub mod hip;

pub use host::HostBackend;

#[cfg(feature = "rocm")]
pub use hip::HipBackend;

use std::fmt;

use crate::error::PoolResult;

/// Identifies an independent allocation arena. Pointers are never shared
/// across device ids.
pub type DeviceId = usize;

/// Opaque device address.
///
/// Never dereferenced by this crate outside the backend that produced it;
/// everywhere else it is an interchangeability token and a copy target.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct DevicePtr(*mut std::ffi::c_void);

// SAFETY: DevicePtr is an address, not a borrow. All dereferencing happens
// inside a NativeBackend implementation, which synchronizes access itself.
unsafe impl Send for DevicePtr {}
unsafe impl Sync for DevicePtr {}

impl DevicePtr {
    pub(crate) fn new(raw: *mut std::ffi::c_void) -> Self {
        DevicePtr(raw)
    }

    pub(crate) fn from_addr(addr: usize) -> Self {
        DevicePtr(addr as *mut std::ffi::c_void)
    }

    pub(crate) fn null() -> Self {
        DevicePtr(std::ptr::null_mut())
    }

    /// The raw address, for introspection and interchangeability checks.
    pub fn addr(&self) -> usize {
        self.0 as usize
    }

    /// The raw pointer, for backend FFI calls.
    pub fn as_raw(&self) -> *mut std::ffi::c_void {
        self.0
    }

    pub fn is_null(&self) -> bool {
        self.0.is_null()
    }
}

impl fmt::Debug for DevicePtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DevicePtr(0x{:x})", self.addr())
    }
}

/// Facade over the raw device-allocation primitives.
///
/// Calls are safe to issue concurrently but individually expensive; the
/// allocator exists to avoid them. `raw_free` returns unit: a free that
/// fails at the driver level can only be logged, never recovered.
pub trait NativeBackend: Send + Sync + fmt::Debug {
    /// Number of allocation arenas this backend exposes.
    fn device_count(&self) -> usize;

    /// Allocate `byte_len` fresh bytes on `device`.
    fn raw_alloc(&self, device: DeviceId, byte_len: usize) -> PoolResult<DevicePtr>;

    /// Return a pointer previously obtained from `raw_alloc` on `device`.
    fn raw_free(&self, device: DeviceId, ptr: DevicePtr);

    /// Copy `data` into device memory starting at `dst`.
    fn write_bytes(&self, device: DeviceId, dst: DevicePtr, data: &[u8]) -> PoolResult<()>;

    /// Copy `out.len()` bytes of device memory starting at `src` into `out`.
    fn read_bytes(&self, device: DeviceId, src: DevicePtr, out: &mut [u8]) -> PoolResult<()>;
}
