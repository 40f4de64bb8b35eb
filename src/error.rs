//! Error types for the softmax operators

use candle_core::DType;

use crate::device::DeviceKind;

pub type Result<T> = std::result::Result<T, OpError>;

#[derive(thiserror::Error, Debug)]
pub enum OpError {
    #[error("{op}: logits must be 2-dimensional, got rank {} ({dims:?})", .dims.len())]
    InvalidArgument { op: &'static str, dims: Vec<usize> },

    #[error("{op}: logits live on {found:?} but the kernel runs on {expected}")]
    DeviceMismatch {
        op: &'static str,
        expected: DeviceKind,
        found: candle_core::DeviceLocation,
    },

    #[error("failed to allocate output of shape {shape:?}: {source}")]
    AllocationFailure {
        shape: Vec<usize>,
        #[source]
        source: candle_core::Error,
    },

    #[error("{op}: allocator returned {got_dtype:?} {got:?}, expected {expected_dtype:?} {expected:?}")]
    OutputMismatch {
        op: &'static str,
        expected: Vec<usize>,
        expected_dtype: DType,
        got: Vec<usize>,
        got_dtype: DType,
    },

    #[error("no kernel registered for {op} on {device} with T={dtype:?}")]
    KernelNotFound {
        op: String,
        device: DeviceKind,
        dtype: DType,
    },

    #[error("{0} device is not available in this execution context")]
    DeviceUnavailable(DeviceKind),

    #[error("{context}: NaNs and/or infs detected - inf: {inf}, nan: {nan}")]
    NonFinite {
        context: String,
        inf: u32,
        nan: u32,
    },

    #[error("failed to build cpu thread pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),

    #[error(transparent)]
    Device(#[from] candle_core::Error),
}
