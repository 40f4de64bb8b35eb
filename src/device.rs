//! Device capabilities the stable softmax engine is written against.
//!
//! Every primitive works on `(batch, classes)` matrices and `(batch, 1)` row
//! columns. [`CpuDevice`] runs them row-parallel on its own rayon pool over
//! host slices, [`AcceleratorDevice`] issues candle kernels on the device
//! stream.

use std::fmt;
use std::sync::Arc;

use candle_core::{Device, Result, Storage, Tensor};
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};

use crate::elem::FloatElem;
use crate::error::OpError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DeviceKind {
    Cpu,
    Accelerator,
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceKind::Cpu => f.write_str("CPU"),
            DeviceKind::Accelerator => f.write_str("GPU"),
        }
    }
}

pub trait ComputeDevice {
    fn kind(&self) -> DeviceKind;

    /// Where input and output buffers for this device live.
    fn device(&self) -> &Device;

    /// Row maximum as a `(batch, 1)` column. Empty rows reduce to `-inf`.
    fn reduce_max<T: FloatElem>(&self, xs: &Tensor) -> Result<Tensor>;

    /// Row sum as a `(batch, 1)` column. Empty rows reduce to `0`.
    fn reduce_sum<T: FloatElem>(&self, xs: &Tensor) -> Result<Tensor>;

    /// `xs[r, c] - rows[r, 0]`
    fn broadcast_sub<T: FloatElem>(&self, xs: &Tensor, rows: &Tensor) -> Result<Tensor>;

    /// `xs[r, c] / rows[r, 0]`
    fn broadcast_div<T: FloatElem>(&self, xs: &Tensor, rows: &Tensor) -> Result<Tensor>;

    fn exp<T: FloatElem>(&self, xs: &Tensor) -> Result<Tensor>;

    fn ln<T: FloatElem>(&self, xs: &Tensor) -> Result<Tensor>;
}

/// Host execution context. Cloning shares the thread pool.
#[derive(Clone)]
pub struct CpuDevice {
    device: Device,
    pool: Arc<ThreadPool>,
}

impl CpuDevice {
    /// `num_threads == 0` lets rayon pick.
    pub fn new(num_threads: usize) -> std::result::Result<Self, OpError> {
        let pool = ThreadPoolBuilder::new()
            .num_threads(num_threads)
            .thread_name(|i| format!("softmax-cpu-{i}"))
            .build()?;

        log::debug!("cpu device ready with {} threads", pool.current_num_threads());

        Ok(Self {
            device: Device::Cpu,
            pool: Arc::new(pool),
        })
    }

    pub fn num_threads(&self) -> usize {
        self.pool.current_num_threads()
    }

    fn reduce_rows<T: FloatElem>(
        &self,
        xs: &Tensor,
        init: T,
        f: impl Fn(T, T) -> T + Send + Sync,
    ) -> Result<Tensor> {
        let (rows, cols) = xs.dims2()?;

        let reduced: Vec<T> = if cols == 0 {
            vec![init; rows]
        } else {
            with_host_slice(xs, |data: &[T]| {
                Ok(self.pool.install(|| {
                    data.par_chunks(cols)
                        .map(|row| row.iter().fold(init, |acc, &v| f(acc, v)))
                        .collect()
                }))
            })?
        };

        Tensor::from_vec(reduced, (rows, 1), &self.device)
    }

    fn broadcast_rows<T: FloatElem>(
        &self,
        xs: &Tensor,
        by: &Tensor,
        f: impl Fn(T, T) -> T + Send + Sync,
    ) -> Result<Tensor> {
        let (rows, cols) = xs.dims2()?;
        let by_dims = by.dims2()?;
        if by_dims != (rows, 1) {
            candle_core::bail!("row column of shape {by_dims:?} does not match {rows} rows")
        }

        let mut out = vec![T::ZERO; rows * cols];
        if cols > 0 {
            with_host_slice(xs, |data: &[T]| {
                with_host_slice(by, |by: &[T]| {
                    self.pool.install(|| {
                        out.par_chunks_mut(cols)
                            .zip(data.par_chunks(cols))
                            .zip(by.par_iter())
                            .for_each(|((dst, src), &r)| {
                                dst.iter_mut().zip(src).for_each(|(d, &v)| *d = f(v, r))
                            });
                    });
                    Ok(())
                })
            })?;
        }

        Tensor::from_vec(out, (rows, cols), &self.device)
    }

    fn map<T: FloatElem>(&self, xs: &Tensor, f: impl Fn(T) -> T + Send + Sync) -> Result<Tensor> {
        let out: Vec<T> = with_host_slice(xs, |data: &[T]| {
            Ok(self.pool.install(|| data.par_iter().map(|&v| f(v)).collect()))
        })?;

        Tensor::from_vec(out, xs.shape().clone(), &self.device)
    }
}

impl fmt::Debug for CpuDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CpuDevice")
            .field("num_threads", &self.num_threads())
            .finish()
    }
}

/// Runs `f` over the row-major elements of a host tensor, borrowed straight
/// from its storage. Only non-contiguous inputs are copied.
fn with_host_slice<T: FloatElem, R>(xs: &Tensor, f: impl FnOnce(&[T]) -> Result<R>) -> Result<R> {
    if !xs.device().is_cpu() {
        candle_core::bail!("cpu kernel got a tensor on {:?}", xs.device().location())
    }
    let xs = xs.contiguous()?;
    let (storage, layout) = xs.storage_and_layout();
    let data = match &*storage {
        Storage::Cpu(cpu) => cpu.as_slice::<T>()?,
        _ => candle_core::bail!("cpu kernel got non-cpu storage"),
    };
    match layout.contiguous_offsets() {
        Some((start, end)) => f(&data[start..end]),
        None => candle_core::bail!("contiguous tensor without contiguous offsets"),
    }
}

impl ComputeDevice for CpuDevice {
    fn kind(&self) -> DeviceKind {
        DeviceKind::Cpu
    }

    fn device(&self) -> &Device {
        &self.device
    }

    fn reduce_max<T: FloatElem>(&self, xs: &Tensor) -> Result<Tensor> {
        self.reduce_rows(xs, T::NEG_INFINITY, <T as FloatElem>::max)
    }

    fn reduce_sum<T: FloatElem>(&self, xs: &Tensor) -> Result<Tensor> {
        self.reduce_rows(xs, T::ZERO, |acc, v| acc + v)
    }

    fn broadcast_sub<T: FloatElem>(&self, xs: &Tensor, rows: &Tensor) -> Result<Tensor> {
        self.broadcast_rows(xs, rows, |v, r: T| v - r)
    }

    fn broadcast_div<T: FloatElem>(&self, xs: &Tensor, rows: &Tensor) -> Result<Tensor> {
        self.broadcast_rows(xs, rows, |v, r: T| v / r)
    }

    fn exp<T: FloatElem>(&self, xs: &Tensor) -> Result<Tensor> {
        self.map(xs, <T as FloatElem>::exp)
    }

    fn ln<T: FloatElem>(&self, xs: &Tensor) -> Result<Tensor> {
        self.map(xs, <T as FloatElem>::ln)
    }
}

/// Accelerator stream. Primitives are candle device kernels and are only
/// registered for f32.
#[derive(Clone, Debug)]
pub struct AcceleratorDevice {
    device: Device,
}

impl AcceleratorDevice {
    pub fn new(device: Device) -> std::result::Result<Self, OpError> {
        if device.is_cpu() {
            return Err(OpError::DeviceUnavailable(DeviceKind::Accelerator));
        }
        Ok(Self { device })
    }

    pub fn cuda(ordinal: usize) -> std::result::Result<Self, OpError> {
        Self::new(Device::new_cuda(ordinal)?)
    }

    /// Binds the device kernels to the host backend so they can be checked
    /// without an accelerator.
    #[cfg(test)]
    pub(crate) fn host_emulated() -> Self {
        Self {
            device: Device::Cpu,
        }
    }
}

impl ComputeDevice for AcceleratorDevice {
    fn kind(&self) -> DeviceKind {
        DeviceKind::Accelerator
    }

    fn device(&self) -> &Device {
        &self.device
    }

    fn reduce_max<T: FloatElem>(&self, xs: &Tensor) -> Result<Tensor> {
        let (rows, cols) = xs.dims2()?;
        if cols == 0 {
            return Tensor::full(T::NEG_INFINITY, (rows, 1), &self.device);
        }
        xs.max_keepdim(1)
    }

    fn reduce_sum<T: FloatElem>(&self, xs: &Tensor) -> Result<Tensor> {
        let (rows, cols) = xs.dims2()?;
        if cols == 0 {
            return Tensor::zeros((rows, 1), T::DTYPE, &self.device);
        }
        xs.sum_keepdim(1)
    }

    fn broadcast_sub<T: FloatElem>(&self, xs: &Tensor, rows: &Tensor) -> Result<Tensor> {
        xs.broadcast_sub(rows)
    }

    fn broadcast_div<T: FloatElem>(&self, xs: &Tensor, rows: &Tensor) -> Result<Tensor> {
        xs.broadcast_div(rows)
    }

    fn exp<T: FloatElem>(&self, xs: &Tensor) -> Result<Tensor> {
        xs.exp()
    }

    fn ln<T: FloatElem>(&self, xs: &Tensor) -> Result<Tensor> {
        xs.log()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn matrix() -> Result<Tensor> {
        Tensor::new(&[[1f32, 5., 3.], [-2., -7., -1.]], &Device::Cpu)
    }

    #[test]
    fn test_cpu_reduce_max_and_sum() -> anyhow::Result<()> {
        let cpu = CpuDevice::new(2)?;
        let xs = matrix()?;

        let max = cpu.reduce_max::<f32>(&xs)?;
        assert_eq!(max.dims(), &[2, 1]);
        assert_eq!(max.to_vec2::<f32>()?, vec![vec![5.], vec![-1.]]);

        let sum = cpu.reduce_sum::<f32>(&xs)?;
        assert_eq!(sum.to_vec2::<f32>()?, vec![vec![9.], vec![-10.]]);

        Ok(())
    }

    #[test]
    fn test_cpu_reductions_of_empty_rows_are_identities() -> anyhow::Result<()> {
        let cpu = CpuDevice::new(1)?;
        let xs = Tensor::zeros((3, 0), candle_core::DType::F64, &Device::Cpu)?;

        let max = cpu.reduce_max::<f64>(&xs)?;
        assert_eq!(max.to_vec2::<f64>()?, vec![vec![f64::NEG_INFINITY]; 3]);

        let sum = cpu.reduce_sum::<f64>(&xs)?;
        assert_eq!(sum.to_vec2::<f64>()?, vec![vec![0.]; 3]);

        let shifted = cpu.broadcast_sub::<f64>(&xs, &max)?;
        assert_eq!(shifted.dims(), &[3, 0]);

        Ok(())
    }

    #[test]
    fn test_cpu_broadcasts_per_row() -> anyhow::Result<()> {
        let cpu = CpuDevice::new(0)?;
        let xs = matrix()?;
        let by = Tensor::new(&[[1f32], [2.]], &Device::Cpu)?;

        let sub = cpu.broadcast_sub::<f32>(&xs, &by)?;
        assert_eq!(sub.to_vec2::<f32>()?, vec![vec![0., 4., 2.], vec![-4., -9., -3.]]);

        let div = cpu.broadcast_div::<f32>(&xs, &by)?;
        assert_eq!(div.to_vec2::<f32>()?, vec![vec![1., 5., 3.], vec![-1., -3.5, -0.5]]);

        Ok(())
    }

    #[test]
    fn test_cpu_broadcast_rejects_wrong_column() -> anyhow::Result<()> {
        let cpu = CpuDevice::new(1)?;
        let xs = matrix()?;
        let by = Tensor::new(&[[1f32], [2.], [3.]], &Device::Cpu)?;

        assert!(cpu.broadcast_sub::<f32>(&xs, &by).is_err());

        Ok(())
    }

    #[test]
    fn test_cpu_reads_non_contiguous_input() -> anyhow::Result<()> {
        let cpu = CpuDevice::new(1)?;
        let xs = matrix()?.t()?;

        let max = cpu.reduce_max::<f32>(&xs)?;
        assert_eq!(max.to_vec2::<f32>()?, vec![vec![1.], vec![5.], vec![3.]]);

        Ok(())
    }

    #[test]
    fn test_cpu_reads_offset_views() -> anyhow::Result<()> {
        let cpu = CpuDevice::new(2)?;
        let xs = Tensor::new(&[[9f32, 9.], [1., 4.], [-3., -2.], [9., 9.]], &Device::Cpu)?;
        let view = xs.narrow(0, 1, 2)?;

        let max = cpu.reduce_max::<f32>(&view)?;
        assert_eq!(max.to_vec2::<f32>()?, vec![vec![4.], vec![-2.]]);

        let shifted = cpu.broadcast_sub::<f32>(&view, &max)?;
        assert_eq!(shifted.to_vec2::<f32>()?, vec![vec![-3., 0.], vec![-1., 0.]]);

        let doubled = cpu.map::<f32>(&view, |v| v + v)?;
        assert_eq!(doubled.to_vec2::<f32>()?, vec![vec![2., 8.], vec![-6., -4.]]);

        // inputs are only read
        assert_eq!(xs.to_vec2::<f32>()?[1], vec![1., 4.]);

        Ok(())
    }

    #[test]
    fn test_accelerator_primitives_match_cpu() -> anyhow::Result<()> {
        let cpu = CpuDevice::new(1)?;
        let acc = AcceleratorDevice::host_emulated();
        let xs = matrix()?;

        let cpu_max = cpu.reduce_max::<f32>(&xs)?;
        let acc_max = acc.reduce_max::<f32>(&xs)?;
        assert_eq!(cpu_max.to_vec2::<f32>()?, acc_max.to_vec2::<f32>()?);

        let cpu_exp = cpu.exp::<f32>(&cpu.broadcast_sub::<f32>(&xs, &cpu_max)?)?;
        let acc_exp = acc.exp::<f32>(&acc.broadcast_sub::<f32>(&xs, &acc_max)?)?;
        let diff = (cpu_exp - acc_exp)?.abs()?.max_all()?.to_scalar::<f32>()?;
        assert!(diff < 1e-6, "{diff}");

        Ok(())
    }

    #[test]
    fn test_accelerator_rejects_cpu_device() {
        assert!(matches!(
            AcceleratorDevice::new(Device::Cpu),
            Err(OpError::DeviceUnavailable(DeviceKind::Accelerator))
        ));
    }
}
