//! HIP backend implementation

use std::ptr;

use crate::backend::hip::ffi;
use crate::backend::{DeviceId, DevicePtr, NativeBackend};
use crate::error::{PoolError, PoolResult};

/// Native backend over the HIP runtime.
///
/// Each `DeviceId` maps directly to a HIP device ordinal. Every call selects
/// the target device first; HIP tracks the current device per host thread,
/// so allocator callers on different threads do not interfere.
#[derive(Debug)]
pub struct HipBackend {
    device_count: usize,
}

impl HipBackend {
    /// Initialize the HIP runtime and enumerate devices.
    pub fn new() -> PoolResult<Self> {
        let init = unsafe { ffi::hipInit(0) };
        if init != ffi::HIP_SUCCESS {
            return Err(PoolError::Backend(format!(
                "hipInit failed: {}",
                ffi::error_string(init)
            )));
        }

        let mut count: i32 = 0;
        let result = unsafe { ffi::hipGetDeviceCount(&mut count) };
        if result != ffi::HIP_SUCCESS {
            return Err(PoolError::Backend(format!(
                "hipGetDeviceCount failed: {}",
                ffi::error_string(result)
            )));
        }
        if count <= 0 {
            return Err(PoolError::Backend("no HIP devices present".to_string()));
        }

        tracing::info!(device_count = count, "HIP backend initialized");
        Ok(HipBackend {
            device_count: count as usize,
        })
    }

    fn set_device(&self, device: DeviceId) -> PoolResult<()> {
        if device >= self.device_count {
            return Err(PoolError::InvalidDevice {
                device,
                count: self.device_count,
            });
        }
        let result = unsafe { ffi::hipSetDevice(device as i32) };
        if result != ffi::HIP_SUCCESS {
            return Err(PoolError::Backend(format!(
                "hipSetDevice({}) failed: {}",
                device,
                ffi::error_string(result)
            )));
        }
        Ok(())
    }

    /// Free and total memory on `device`, in bytes.
    pub fn memory_info(&self, device: DeviceId) -> PoolResult<(usize, usize)> {
        self.set_device(device)?;
        let mut free: usize = 0;
        let mut total: usize = 0;
        let result = unsafe { ffi::hipMemGetInfo(&mut free, &mut total) };
        if result != ffi::HIP_SUCCESS {
            return Err(PoolError::Backend(format!(
                "hipMemGetInfo failed: {}",
                ffi::error_string(result)
            )));
        }
        Ok((free, total))
    }
}

impl NativeBackend for HipBackend {
    fn device_count(&self) -> usize {
        self.device_count
    }

    fn raw_alloc(&self, device: DeviceId, byte_len: usize) -> PoolResult<DevicePtr> {
        if byte_len == 0 {
            return Err(PoolError::InvalidRequest(
                "allocation size cannot be zero".to_string(),
            ));
        }
        self.set_device(device)?;

        let mut raw: *mut std::ffi::c_void = ptr::null_mut();
        let result = unsafe { ffi::hipMalloc(&mut raw, byte_len) };
        if result != ffi::HIP_SUCCESS {
            tracing::debug!(
                device,
                byte_len,
                error = %ffi::error_string(result),
                "hipMalloc failed"
            );
            return Err(PoolError::OutOfDeviceMemory {
                device,
                requested: byte_len,
            });
        }
        if raw.is_null() {
            tracing::error!(device, byte_len, "hipMalloc returned null without error");
            return Err(PoolError::OutOfDeviceMemory {
                device,
                requested: byte_len,
            });
        }

        tracing::trace!(device, byte_len, ptr = raw as usize, "hipMalloc");
        Ok(DevicePtr::new(raw))
    }

    fn raw_free(&self, device: DeviceId, ptr: DevicePtr) {
        if ptr.is_null() {
            return;
        }
        if let Err(err) = self.set_device(device) {
            tracing::error!(%err, device, "raw_free could not select device");
            return;
        }
        let result = unsafe { ffi::hipFree(ptr.as_raw()) };
        if result != ffi::HIP_SUCCESS {
            tracing::error!(
                device,
                ptr = ptr.addr(),
                error = %ffi::error_string(result),
                "hipFree failed"
            );
        }
    }

    fn write_bytes(&self, device: DeviceId, dst: DevicePtr, data: &[u8]) -> PoolResult<()> {
        if data.is_empty() {
            return Ok(());
        }
        self.set_device(device)?;
        let result = unsafe {
            ffi::hipMemcpy(
                dst.as_raw(),
                data.as_ptr() as *const std::ffi::c_void,
                data.len(),
                ffi::HIP_MEMCPY_HOST_TO_DEVICE,
            )
        };
        if result != ffi::HIP_SUCCESS {
            return Err(PoolError::CopyFailed(format!(
                "hipMemcpy H2D of {} bytes failed: {}",
                data.len(),
                ffi::error_string(result)
            )));
        }
        Ok(())
    }

    fn read_bytes(&self, device: DeviceId, src: DevicePtr, out: &mut [u8]) -> PoolResult<()> {
        if out.is_empty() {
            return Ok(());
        }
        self.set_device(device)?;
        let result = unsafe {
            ffi::hipMemcpy(
                out.as_mut_ptr() as *mut std::ffi::c_void,
                src.as_raw(),
                out.len(),
                ffi::HIP_MEMCPY_DEVICE_TO_HOST,
            )
        };
        if result != ffi::HIP_SUCCESS {
            return Err(PoolError::CopyFailed(format!(
                "hipMemcpy D2H of {} bytes failed: {}",
                out.len(),
                ffi::error_string(result)
            )));
        }
        Ok(())
    }
}
