//! Validation and dispatch in front of the stable compute engine

use candle_core::Tensor;
use log::trace;

use crate::context::OutputAllocator;
use crate::device::ComputeDevice;
use crate::elem::FloatElem;
use crate::error::{OpError, Result};
use crate::num_helpers::{check_nan_and_inf, check_nan_and_pos_inf};
use crate::ops::{Activation, stable_softmax};

/// One operator instance bound to a device.
pub struct StableSoftmaxOp<'a, D> {
    device: &'a D,
    activation: Activation,
}

impl<'a, D: ComputeDevice> StableSoftmaxOp<'a, D> {
    pub fn new(device: &'a D, activation: Activation) -> Self {
        Self { device, activation }
    }

    /// Checks `logits`, requests an output of the same shape and fills it.
    ///
    /// Nothing is allocated or written unless `logits` is a matrix on this
    /// op's device, and nothing is written unless the allocator hands back a
    /// buffer of exactly the same shape and dtype.
    pub fn compute<T: FloatElem>(
        &self,
        logits: &Tensor,
        allocator: &dyn OutputAllocator,
    ) -> Result<Tensor> {
        let op = self.activation.op_name();

        if logits.rank() != 2 {
            return Err(OpError::InvalidArgument {
                op,
                dims: logits.dims().to_vec(),
            });
        }
        if !logits.device().same_device(self.device.device()) {
            return Err(OpError::DeviceMismatch {
                op,
                expected: self.device.kind(),
                found: logits.device().location(),
            });
        }

        let out = allocator
            .allocate(logits.shape(), logits.dtype(), self.device.device())
            .map_err(|source| OpError::AllocationFailure {
                shape: logits.dims().to_vec(),
                source,
            })?;
        if out.dims() != logits.dims()
            || out.dtype() != logits.dtype()
            || !out.device().same_device(self.device.device())
        {
            return Err(OpError::OutputMismatch {
                op,
                expected: logits.dims().to_vec(),
                expected_dtype: logits.dtype(),
                got: out.dims().to_vec(),
                got_dtype: out.dtype(),
            });
        }

        trace!(
            "{op} on {} with T={:?}, dims {:?}",
            self.device.kind(),
            T::DTYPE,
            logits.dims()
        );

        stable_softmax::<D, T>(self.device, self.activation, logits, &out)?;

        // -inf is a valid log probability
        match self.activation {
            Activation::Softmax => check_nan_and_inf(&out, op)?,
            Activation::LogSoftmax => check_nan_and_pos_inf(&out, op)?,
        }

        Ok(out)
    }
}
