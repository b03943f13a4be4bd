//! Device memory handles
//!
//! A [`Handle`] wraps a device pointer with shared ownership; cloning is
//! cheap and every clone is a strong reference. Handles come in two kinds,
//! distinguished at the type level:
//!
//! - an *owning* handle is the unit of retirement: when its last strong
//!   reference goes away, the pointer is reported to the collector bridge
//!   exactly once, from where it reaches the reuse registry;
//! - a *view* aliases another handle's memory at a byte offset. It holds a
//!   strong reference to its parent, so parent memory strictly outlives
//!   every view, and it has no release path of its own.
//!
//! Views alias: a write through a view is visible through the parent at the
//! corresponding offset and vice versa. That is the point - slicing trades
//! copy cost for aliasing.

use std::fmt;
use std::sync::Arc;

use crate::backend::{DeviceId, DevicePtr, NativeBackend};
use crate::bridge::{CollectorBridge, FinalizeFn, RetiredAlloc};
use crate::error::{PoolError, PoolResult};

/// An owning allocation. Dropping it (i.e. dropping the last handle that
/// transitively references it) retires the pointer through the bridge.
pub(crate) struct OwnedAlloc {
    ptr: DevicePtr,
    byte_len: usize,
    device: DeviceId,
    backend: Arc<dyn NativeBackend>,
    bridge: Arc<dyn CollectorBridge>,
    finalize: FinalizeFn,
}

impl fmt::Debug for OwnedAlloc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OwnedAlloc")
            .field("ptr", &self.ptr)
            .field("byte_len", &self.byte_len)
            .field("device", &self.device)
            .finish()
    }
}

impl Drop for OwnedAlloc {
    fn drop(&mut self) {
        // Last strong reference is gone; this runs exactly once.
        tracing::trace!(
            device = self.device,
            byte_len = self.byte_len,
            ptr = self.ptr.addr(),
            "owning handle unreachable"
        );
        let retired = RetiredAlloc {
            ptr: self.ptr,
            byte_len: self.byte_len,
            device: self.device,
        };
        self.bridge.on_unreachable(retired, Arc::clone(&self.finalize));
    }
}

#[derive(Debug)]
enum Backing {
    Owned(OwnedAlloc),
    View { parent: Handle, offset: usize },
}

#[derive(Debug)]
struct HandleInner {
    byte_len: usize,
    backing: Backing,
}

/// Shared-ownership wrapper around a device pointer.
#[derive(Clone)]
pub struct Handle {
    inner: Arc<HandleInner>,
}

impl Handle {
    pub(crate) fn new_owned(
        ptr: DevicePtr,
        byte_len: usize,
        device: DeviceId,
        backend: Arc<dyn NativeBackend>,
        bridge: Arc<dyn CollectorBridge>,
        finalize: FinalizeFn,
    ) -> Self {
        Handle {
            inner: Arc::new(HandleInner {
                byte_len,
                backing: Backing::Owned(OwnedAlloc {
                    ptr,
                    byte_len,
                    device,
                    backend,
                    bridge,
                    finalize,
                }),
            }),
        }
    }

    /// Walk to the owning allocation, accumulating view offsets.
    fn owned_parts(&self) -> (&OwnedAlloc, usize) {
        let mut cur: &Handle = self;
        let mut total = 0usize;
        loop {
            match &cur.inner.backing {
                Backing::Owned(owned) => return (owned, total),
                Backing::View { parent, offset } => {
                    total += offset;
                    cur = parent;
                }
            }
        }
    }

    /// Length of the memory this handle addresses, in bytes.
    pub fn byte_len(&self) -> usize {
        self.inner.byte_len
    }

    /// Device the backing memory lives on.
    pub fn device(&self) -> DeviceId {
        self.owned_parts().0.device
    }

    /// Whether this handle is a non-owning alias into another handle.
    pub fn is_view(&self) -> bool {
        matches!(self.inner.backing, Backing::View { .. })
    }

    /// The device address this handle starts at.
    pub fn ptr(&self) -> DevicePtr {
        let (owned, offset) = self.owned_parts();
        if offset == 0 {
            return owned.ptr;
        }
        match owned.ptr.addr().checked_add(offset) {
            Some(addr) => DevicePtr::from_addr(addr),
            None => {
                // Offsets were bounds-checked at slice time; an overflow here
                // means the base address itself is corrupt.
                tracing::warn!(
                    base = owned.ptr.addr(),
                    offset,
                    "pointer arithmetic overflow"
                );
                DevicePtr::null()
            }
        }
    }

    /// Create a view sharing this handle's memory at byte `offset`.
    ///
    /// The view holds a strong reference to this handle; writes through
    /// either are visible through the other.
    ///
    /// # Errors
    /// `OutOfBounds` if `offset + len` exceeds this handle's length;
    /// `InvalidRequest` for a zero-length view.
    pub fn slice(&self, offset: usize, len: usize) -> PoolResult<Handle> {
        if len == 0 {
            return Err(PoolError::InvalidRequest(
                "slice length cannot be zero".to_string(),
            ));
        }
        let out_of_bounds = PoolError::OutOfBounds {
            offset,
            len,
            byte_len: self.inner.byte_len,
        };
        let end = offset.checked_add(len).ok_or(out_of_bounds)?;
        if end > self.inner.byte_len {
            return Err(PoolError::OutOfBounds {
                offset,
                len,
                byte_len: self.inner.byte_len,
            });
        }

        Ok(Handle {
            inner: Arc::new(HandleInner {
                byte_len: len,
                backing: Backing::View {
                    parent: self.clone(),
                    offset,
                },
            }),
        })
    }

    /// Copy `data` into this handle's memory, starting at its first byte.
    /// `data` may be shorter than the handle; the tail is left untouched.
    pub fn copy_from_host(&self, data: &[u8]) -> PoolResult<()> {
        if data.len() > self.inner.byte_len {
            return Err(PoolError::CopyFailed(format!(
                "source data too large: {} > {}",
                data.len(),
                self.inner.byte_len
            )));
        }
        let ptr = self.ptr();
        let (owned, _) = self.owned_parts();
        owned.backend.write_bytes(owned.device, ptr, data)
    }

    /// Copy `out.len()` bytes from this handle's memory into `out`.
    pub fn copy_to_host(&self, out: &mut [u8]) -> PoolResult<()> {
        if out.len() > self.inner.byte_len {
            return Err(PoolError::CopyFailed(format!(
                "read larger than handle: {} > {}",
                out.len(),
                self.inner.byte_len
            )));
        }
        let ptr = self.ptr();
        let (owned, _) = self.owned_parts();
        owned.backend.read_bytes(owned.device, ptr, out)
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("ptr", &self.ptr())
            .field("byte_len", &self.inner.byte_len)
            .field("device", &self.device())
            .field("view", &self.is_view())
            .finish()
    }
}
