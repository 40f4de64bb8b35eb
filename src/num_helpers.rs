//! Numerical stability helpers

use candle_core::{DType, Tensor};
#[cfg(feature = "check_num_stability")]
use log::{debug, trace};

#[cfg(feature = "check_num_stability")]
use crate::error::OpError;
use crate::error::Result;

#[cfg_attr(not(feature = "check_num_stability"), allow(dead_code))]
fn count_set(mask: &Tensor) -> Result<u32> {
    Ok(mask.to_dtype(DType::U32)?.sum_all()?.to_scalar::<u32>()?)
}

#[cfg(feature = "check_num_stability")]
fn check_non_finite(t: &Tensor, comment: &str, allow_neg_inf: bool) -> Result<()> {
    // nan not equal even to itself
    let nan_mask = t.ne(t)?;
    let nan_check = count_set(&nan_mask)?;

    // inf - inf is nan, anything finite cancels to zero
    let diff = (t - t)?;
    let inf_mask = diff.ne(&diff)?.to_dtype(DType::U32)? - nan_mask.to_dtype(DType::U32)?;
    let inf_mask = if allow_neg_inf {
        (inf_mask? * t.gt(&t.zeros_like()?)?.to_dtype(DType::U32)?)?
    } else {
        inf_mask?
    };
    let inf_check = count_set(&inf_mask)?;

    trace!("Tensor {:?}:\n{}", comment, t);
    if nan_check > 0 || inf_check > 0 {
        debug!("{:?}: non-finite values", comment);
        return Err(OpError::NonFinite {
            context: comment.to_string(),
            inf: inf_check,
            nan: nan_check,
        });
    }
    debug!("{:?}: OK", comment);

    Ok(())
}

#[cfg(feature = "check_num_stability")]
pub fn check_nan_and_inf(t: &Tensor, comment: &str) -> Result<()> {
    check_non_finite(t, comment, false)
}

/// Like [`check_nan_and_inf`] but lets `-inf` through, for log probabilities.
#[cfg(feature = "check_num_stability")]
pub fn check_nan_and_pos_inf(t: &Tensor, comment: &str) -> Result<()> {
    check_non_finite(t, comment, true)
}

#[cfg(not(feature = "check_num_stability"))]
pub fn check_nan_and_inf(_t: &Tensor, _comment: &str) -> Result<()> {
    Ok(())
}

#[cfg(not(feature = "check_num_stability"))]
pub fn check_nan_and_pos_inf(_t: &Tensor, _comment: &str) -> Result<()> {
    Ok(())
}
