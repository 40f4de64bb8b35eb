//! Kernel registry keyed on operator name, device and element type

use std::collections::HashMap;
use std::sync::OnceLock;

use candle_core::Tensor;
use log::{debug, trace};

use crate::context::ExecContext;
use crate::device::DeviceKind;
use crate::elem::{ElemType, FloatElem};
use crate::error::{OpError, Result};
use crate::kernel::StableSoftmaxOp;
use crate::ops::Activation;

pub type KernelFn = Box<dyn Fn(&ExecContext, &Tensor) -> Result<Tensor> + Send + Sync>;

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct KernelKey {
    pub op: String,
    pub device: DeviceKind,
    pub elem: ElemType,
}

impl KernelKey {
    pub fn new(op: impl Into<String>, device: DeviceKind, elem: ElemType) -> Self {
        Self {
            op: op.into(),
            device,
            elem,
        }
    }
}

#[derive(Default)]
pub struct Registry {
    kernels: HashMap<KernelKey, KernelFn>,
}

fn cpu_kernel<T: FloatElem>(activation: Activation) -> KernelFn {
    Box::new(move |ctx: &ExecContext, logits: &Tensor| {
        StableSoftmaxOp::new(ctx.cpu(), activation).compute::<T>(logits, ctx.allocator())
    })
}

fn accelerator_kernel<T: FloatElem>(activation: Activation) -> KernelFn {
    Box::new(move |ctx: &ExecContext, logits: &Tensor| {
        let device = ctx
            .accelerator()
            .ok_or(OpError::DeviceUnavailable(DeviceKind::Accelerator))?;
        StableSoftmaxOp::new(device, activation).compute::<T>(logits, ctx.allocator())
    })
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// `Softmax` and `LogSoftmax` for f32/f64 on the cpu, f32 only on the
    /// accelerator.
    pub fn with_builtin_kernels() -> Self {
        let mut registry = Self::new();

        for activation in [Activation::LogSoftmax, Activation::Softmax] {
            let op = activation.op_name();
            registry.register(
                KernelKey::new(op, DeviceKind::Cpu, ElemType::F32),
                cpu_kernel::<f32>(activation),
            );
            registry.register(
                KernelKey::new(op, DeviceKind::Cpu, ElemType::F64),
                cpu_kernel::<f64>(activation),
            );
            registry.register(
                KernelKey::new(op, DeviceKind::Accelerator, ElemType::F32),
                accelerator_kernel::<f32>(activation),
            );
        }

        registry
    }

    /// Process wide registry holding the builtin kernels.
    pub fn global() -> &'static Registry {
        static REGISTRY: OnceLock<Registry> = OnceLock::new();
        REGISTRY.get_or_init(Registry::with_builtin_kernels)
    }

    /// Replaces any kernel already registered under `key`.
    pub fn register(&mut self, key: KernelKey, kernel: KernelFn) {
        debug!("registering {} on {} with T={:?}", key.op, key.device, key.elem);
        self.kernels.insert(key, kernel);
    }

    pub fn contains(&self, op: &str, device: DeviceKind, elem: ElemType) -> bool {
        self.kernels.contains_key(&KernelKey::new(op, device, elem))
    }

    pub fn len(&self) -> usize {
        self.kernels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.kernels.is_empty()
    }

    /// Runs `op` on `device` with the kernel matching the dtype of `logits`.
    pub fn run(
        &self,
        op: &str,
        device: DeviceKind,
        ctx: &ExecContext,
        logits: &Tensor,
    ) -> Result<Tensor> {
        let not_found = || OpError::KernelNotFound {
            op: op.to_string(),
            device,
            dtype: logits.dtype(),
        };

        let elem = ElemType::from_dtype(logits.dtype()).ok_or_else(not_found)?;
        let kernel = self
            .kernels
            .get(&KernelKey::new(op, device, elem))
            .ok_or_else(not_found)?;

        trace!("dispatching {op} on {device} with T={elem:?}");
        kernel(ctx, logits)
    }
}

pub fn log_softmax(ctx: &ExecContext, device: DeviceKind, logits: &Tensor) -> Result<Tensor> {
    Registry::global().run(Activation::LogSoftmax.op_name(), device, ctx, logits)
}

pub fn softmax(ctx: &ExecContext, device: DeviceKind, logits: &Tensor) -> Result<Tensor> {
    Registry::global().run(Activation::Softmax.op_name(), device, ctx, logits)
}

#[cfg(test)]
mod test {
    use candle_core::{DType, Device};

    use super::*;
    use crate::context::ExecConfig;

    #[test]
    fn test_builtin_coverage() {
        let registry = Registry::with_builtin_kernels();

        assert_eq!(registry.len(), 6);
        for op in ["LogSoftmax", "Softmax"] {
            assert!(registry.contains(op, DeviceKind::Cpu, ElemType::F32));
            assert!(registry.contains(op, DeviceKind::Cpu, ElemType::F64));
            assert!(registry.contains(op, DeviceKind::Accelerator, ElemType::F32));
            assert!(!registry.contains(op, DeviceKind::Accelerator, ElemType::F64));
        }
    }

    #[test]
    fn test_unregistered_dtype_is_reported() -> anyhow::Result<()> {
        let ctx = ExecContext::new(&ExecConfig::default())?;
        let logits = Tensor::zeros((2, 3), DType::U32, &Device::Cpu)?;

        match log_softmax(&ctx, DeviceKind::Cpu, &logits) {
            Err(OpError::KernelNotFound { op, device, dtype }) => {
                assert_eq!(op, "LogSoftmax");
                assert_eq!(device, DeviceKind::Cpu);
                assert_eq!(dtype, DType::U32);
            }
            other => panic!("expected KernelNotFound, got {other:?}"),
        }

        Ok(())
    }

    #[test]
    fn test_accelerator_f64_has_no_kernel() -> anyhow::Result<()> {
        let ctx = ExecContext::new(&ExecConfig::default())?;
        let logits = Tensor::zeros((2, 3), DType::F64, &Device::Cpu)?;

        assert!(matches!(
            log_softmax(&ctx, DeviceKind::Accelerator, &logits),
            Err(OpError::KernelNotFound { .. })
        ));

        Ok(())
    }

    #[test]
    fn test_missing_accelerator_is_reported() -> anyhow::Result<()> {
        let ctx = ExecContext::new(&ExecConfig::default())?;
        let logits = Tensor::zeros((2, 3), DType::F32, &Device::Cpu)?;

        assert!(matches!(
            softmax(&ctx, DeviceKind::Accelerator, &logits),
            Err(OpError::DeviceUnavailable(DeviceKind::Accelerator))
        ));

        Ok(())
    }

    #[test]
    fn test_custom_kernel_replaces_builtin() -> anyhow::Result<()> {
        let ctx = ExecContext::new(&ExecConfig::default())?;
        let mut registry = Registry::with_builtin_kernels();
        registry.register(
            KernelKey::new("LogSoftmax", DeviceKind::Cpu, ElemType::F32),
            Box::new(|_: &ExecContext, logits: &Tensor| -> Result<Tensor> {
                Ok(logits.ones_like()?)
            }),
        );
        let logits = Tensor::zeros((1, 2), DType::F32, &Device::Cpu)?;

        let out = registry.run("LogSoftmax", DeviceKind::Cpu, &ctx, &logits)?;

        assert_eq!(out.to_vec2::<f32>()?, vec![vec![1., 1.]]);
        assert_eq!(registry.len(), 6);

        Ok(())
    }

    #[test]
    fn test_accelerator_kernel_runs_on_emulated_device() -> anyhow::Result<()> {
        let ctx = ExecContext::new(&ExecConfig::default())?
            .with_accelerator(crate::device::AcceleratorDevice::host_emulated());
        let logits = Tensor::new(&[[1f32, 2., 3.], [0., 0., 0.]], &Device::Cpu)?;

        let via_acc = log_softmax(&ctx, DeviceKind::Accelerator, &logits)?;
        let via_cpu = log_softmax(&ctx, DeviceKind::Cpu, &logits)?;

        let diff = (via_acc - via_cpu)?.abs()?.max_all()?.to_scalar::<f32>()?;
        assert!(diff < 1e-6, "{diff}");

        Ok(())
    }
}
