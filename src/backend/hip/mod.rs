//! HIP native backend for AMD GPUs
//!
//! Only compiled with `feature = "rocm"`; links against `amdhip64`.

mod backend;
pub(crate) mod ffi;

pub use backend::HipBackend;
