use anyhow::{Result, anyhow, bail};
use candle_core::{DType, Tensor};
use clap::{Parser, ValueEnum};

use candle_logsoftmax::{ComputeDevice, DeviceKind, ExecConfig, ExecContext, Registry};

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Dtype {
    F32,
    F64,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Target {
    Cpu,
    Gpu,
}

/// Runs a softmax operator over a matrix given on the command line
#[derive(Parser, Debug)]
#[command(version)]
struct Args {
    /// Rows separated by `;`, values by `,` e.g. "1,2,3;0,0,0"
    #[arg(long)]
    logits: String,

    #[arg(long, default_value = "LogSoftmax")]
    op: String,

    #[arg(long, value_enum, default_value_t = Dtype::F32)]
    dtype: Dtype,

    #[arg(long, value_enum, default_value_t = Target::Cpu)]
    device: Target,

    /// CUDA ordinal used with `--device gpu`
    #[arg(long, default_value_t = 0)]
    ordinal: usize,

    /// CPU worker threads, 0 picks automatically
    #[arg(long, default_value_t = 0)]
    threads: usize,
}

fn parse_matrix(s: &str) -> Result<Vec<Vec<f64>>> {
    let rows = s
        .split(';')
        .map(str::trim)
        .filter(|row| !row.is_empty())
        .map(|row| {
            row.split(',')
                .map(|v| v.trim().parse::<f64>().map_err(|e| anyhow!("bad value {v:?}: {e}")))
                .collect::<Result<Vec<_>>>()
        })
        .collect::<Result<Vec<_>>>()?;

    if let Some(first) = rows.first() {
        if rows.iter().any(|r| r.len() != first.len()) {
            bail!("all rows must have the same number of values");
        }
    }

    Ok(rows)
}

fn main() -> Result<()> {
    env_logger::init();

    let args = Args::parse();

    let (kind, accelerator_ordinal) = match args.device {
        Target::Cpu => (DeviceKind::Cpu, None),
        Target::Gpu => (DeviceKind::Accelerator, Some(args.ordinal)),
    };
    let ctx = ExecContext::new(&ExecConfig {
        cpu_threads: args.threads,
        accelerator_ordinal,
    })?;

    let device = match ctx.accelerator() {
        Some(acc) if kind == DeviceKind::Accelerator => acc.device().clone(),
        _ => candle_core::Device::Cpu,
    };

    let rows = parse_matrix(&args.logits)?;
    let num_classes = rows.first().map_or(0, Vec::len);
    let flat: Vec<f64> = rows.iter().flatten().copied().collect();
    let dtype = match args.dtype {
        Dtype::F32 => DType::F32,
        Dtype::F64 => DType::F64,
    };
    let logits = Tensor::from_vec(flat, (rows.len(), num_classes), &device)?.to_dtype(dtype)?;

    let out = Registry::global().run(&args.op, kind, &ctx, &logits)?;

    println!("{out}");

    Ok(())
}
