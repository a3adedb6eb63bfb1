//! bcnkiln - GPU texture compression harness
//!
//! Fires RGBA textures through BC1/BC3 compute kernels and measures
//! how much the kiln warped them: a two-stage GPU reduction hands back
//! per-image RMSE for color and alpha.

pub mod encode;
pub mod gpu;
pub mod readback;
pub mod reduce;
pub mod sizing;

pub use encode::{BcnEncoder, EncodeError};
pub use gpu::{is_gpu_available, list_gpus, GpuContext, GpuError, GpuInfo};
pub use readback::ReadbackError;
pub use reduce::{ErrorReducer, ReduceError, Rmse, RmseRequest, DEFAULT_REDUCTION_FACTOR};
pub use sizing::EncodeFormat;
