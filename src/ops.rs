//! Row-max stabilized softmax / log-softmax over `(batch, classes)` matrices

use candle_core::{Result, Tensor};

use crate::device::ComputeDevice;
use crate::elem::FloatElem;

/// Which normalization the engine finishes with.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Activation {
    /// `exp(x - max) / sum(exp(x - max))`
    Softmax,
    /// `(x - max) - ln(sum(exp(x - max)))`
    LogSoftmax,
}

impl Activation {
    pub fn op_name(self) -> &'static str {
        match self {
            Activation::Softmax => "Softmax",
            Activation::LogSoftmax => "LogSoftmax",
        }
    }

    pub fn from_op_name(name: &str) -> Option<Self> {
        match name {
            "Softmax" => Some(Activation::Softmax),
            "LogSoftmax" => Some(Activation::LogSoftmax),
            _ => None,
        }
    }
}

/// Computes `activation` of every row of `logits` into `out`.
///
/// `logits` and `out` must both be `(batch, classes)` on `device`; `out` is
/// written once, in full, and never resized. Rows never influence each other.
pub fn stable_softmax<D: ComputeDevice, T: FloatElem>(
    device: &D,
    activation: Activation,
    logits: &Tensor,
    out: &Tensor,
) -> Result<()> {
    let (batch_size, num_classes) = logits.dims2()?;
    if batch_size == 0 || num_classes == 0 {
        return Ok(());
    }

    // exponent arguments are <= 0 after the shift
    let max = device.reduce_max::<T>(logits)?;
    let shifted = device.broadcast_sub::<T>(logits, &max)?;
    let num = device.exp::<T>(&shifted)?;
    let den = device.reduce_sum::<T>(&num)?;

    let result = match activation {
        Activation::Softmax => device.broadcast_div::<T>(&num, &den)?,
        Activation::LogSoftmax => {
            let log_den = device.ln::<T>(&den)?;
            device.broadcast_sub::<T>(&shifted, &log_den)?
        }
    };

    out.slice_set(&result, 0, 0)
}
