//! Numerically stable softmax / log-softmax operators over `(batch, classes)`
//! matrices, with a cpu (rayon) and an accelerator (candle device kernels)
//! implementation behind one registry.

pub mod context;
pub mod device;
pub mod elem;
pub mod error;
pub mod kernel;
pub mod num_helpers;
pub mod ops;
pub mod registry;

pub use context::{DeviceAllocator, ExecConfig, ExecContext, OutputAllocator};
pub use device::{AcceleratorDevice, ComputeDevice, CpuDevice, DeviceKind};
pub use elem::{ElemType, FloatElem};
pub use error::{OpError, Result};
pub use kernel::StableSoftmaxOp;
pub use ops::{Activation, stable_softmax};
pub use registry::{KernelFn, KernelKey, Registry, log_softmax, softmax};
