//! hippool - reusing device-memory allocator for AMD GPUs
//!
//! Device-memory allocation is orders of magnitude slower than host
//! allocation, and alloc/free churn dominates workloads that request the
//! same buffer shapes over and over. This crate keeps retired device
//! pointers in a per-device, size-keyed reuse registry and hands them out
//! verbatim to matching requests, falling back through progressively more
//! expensive recovery tiers (forced reclamation, registry drain) before
//! reporting device memory exhausted.
//!
//! Retirement is driven by reachability, not scope: when the last strong
//! reference to an owning [`Handle`] disappears, the pointer is reported to
//! a [`CollectorBridge`], which decides when the reuse registry actually
//! receives it. [`DirectCollector`] recycles immediately;
//! [`DeferredCollector`] models a host collector whose finalization timing
//! is outside the allocator's control.
//!
//! ```
//! use std::sync::Arc;
//! use hippool::{DeviceAllocator, HostBackend, NativeBackend};
//!
//! # fn main() -> hippool::PoolResult<()> {
//! let backend = Arc::new(HostBackend::new(1));
//! let allocator = DeviceAllocator::new(backend as Arc<dyn NativeBackend>);
//!
//! let grad = allocator.allocate(0, 4096)?;
//! let first_half = grad.slice(0, 2048)?;
//! assert_eq!(first_half.device(), grad.device());
//! # Ok(())
//! # }
//! ```

pub mod allocator;
pub mod backend;
pub mod bridge;
pub mod error;
pub mod handle;
pub mod logging;
pub mod registry;

pub use allocator::{AllocatorConfig, AllocatorStats, DeviceAllocator};
pub use backend::{DeviceId, DevicePtr, HostBackend, NativeBackend};
#[cfg(feature = "rocm")]
pub use backend::HipBackend;
pub use bridge::{CollectorBridge, DeferredCollector, DirectCollector, FinalizeFn, RetiredAlloc};
pub use error::{ErrorCategory, PoolError, PoolResult};
pub use handle::Handle;
pub use registry::{ReuseRegistry, SizeKey};
