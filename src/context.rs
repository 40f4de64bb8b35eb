//! Execution context handed to every kernel invocation

use candle_core::{DType, Device, Shape, Tensor};

use crate::device::{AcceleratorDevice, CpuDevice};
use crate::error::Result;

/// Host runtime hook that provides output buffers.
pub trait OutputAllocator: Send + Sync {
    fn allocate(&self, shape: &Shape, dtype: DType, device: &Device) -> candle_core::Result<Tensor>;
}

/// Allocates zero-filled buffers directly on the target device.
#[derive(Clone, Copy, Debug, Default)]
pub struct DeviceAllocator;

impl OutputAllocator for DeviceAllocator {
    fn allocate(&self, shape: &Shape, dtype: DType, device: &Device) -> candle_core::Result<Tensor> {
        Tensor::zeros(shape.clone(), dtype, device)
    }
}

#[derive(Clone, Debug, Default)]
pub struct ExecConfig {
    /// Worker threads of the cpu pool, `0` lets rayon decide.
    pub cpu_threads: usize,
    /// CUDA ordinal to open, if any.
    pub accelerator_ordinal: Option<usize>,
}

pub struct ExecContext {
    cpu: CpuDevice,
    accelerator: Option<AcceleratorDevice>,
    allocator: Box<dyn OutputAllocator>,
}

impl ExecContext {
    pub fn new(config: &ExecConfig) -> Result<Self> {
        let cpu = CpuDevice::new(config.cpu_threads)?;
        let accelerator = config
            .accelerator_ordinal
            .map(AcceleratorDevice::cuda)
            .transpose()?;

        Ok(Self {
            cpu,
            accelerator,
            allocator: Box::new(DeviceAllocator),
        })
    }

    pub fn with_accelerator(mut self, accelerator: AcceleratorDevice) -> Self {
        self.accelerator = Some(accelerator);
        self
    }

    pub fn with_allocator(mut self, allocator: impl OutputAllocator + 'static) -> Self {
        self.allocator = Box::new(allocator);
        self
    }

    pub fn cpu(&self) -> &CpuDevice {
        &self.cpu
    }

    pub fn accelerator(&self) -> Option<&AcceleratorDevice> {
        self.accelerator.as_ref()
    }

    pub fn allocator(&self) -> &dyn OutputAllocator {
        self.allocator.as_ref()
    }
}
