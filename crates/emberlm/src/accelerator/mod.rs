//! Accelerator execution backend on a `wgpu` compute device.
//!
//! Every primitive is a staged round trip: operands are copied into
//! persistent staging banks, one compute pass is submitted, the result bank
//! is copied into a mapped readback buffer, and the call blocks until the
//! mapping completes. A single mutex serialises callers; no two kernels are
//! ever in flight at once.

mod context;
mod kernels;
mod resources;

#[cfg(test)]
mod tests;

use std::borrow::Cow;
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{anyhow, Result};
use ndarray::ArrayView2;

pub use context::{AcceleratorConfig, AcceleratorContext};

use crate::backend::ExecutionBackend;
use crate::dims::{ModelDims, RMS_NORM_EPS};
use crate::error::{ensure_len, EngineError};
use crate::ops::HeadSpan;
use kernels::{Kernel, KernelParams};
use resources::{AcceleratorResources, Bank, Readback};

pub struct AcceleratorBackend {
    context: Arc<AcceleratorContext>,
    resources: Mutex<AcceleratorResources>,
}

impl AcceleratorBackend {
    /// Acquires an adapter and builds every kernel for `dims`.
    pub async fn new(config: &AcceleratorConfig, dims: &ModelDims) -> Result<Self> {
        let context = AcceleratorContext::new(config).await?;
        Self::with_context(context, dims).await
    }

    pub async fn with_context(context: Arc<AcceleratorContext>, dims: &ModelDims) -> Result<Self> {
        let resources = AcceleratorResources::new(context.clone(), dims).await?;
        Ok(Self {
            context,
            resources: Mutex::new(resources),
        })
    }

    pub fn adapter_name(&self) -> &str {
        &self.context.adapter_info.name
    }

    fn lock(&self) -> Result<MutexGuard<'_, AcceleratorResources>> {
        self.resources
            .lock()
            .map_err(|_| anyhow!("accelerator resources poisoned by an earlier failure"))
    }

    fn elementwise(&self, kernel: Kernel, out: &mut [f32], lhs: &[f32], rhs: &[f32]) -> Result<()> {
        ensure_len(kernel.label(), "lhs", lhs.len(), out.len())?;
        ensure_len(kernel.label(), "rhs", rhs.len(), out.len())?;
        if out.is_empty() {
            return Ok(());
        }
        let res = self.lock()?;
        res.stage(kernel, Bank::A, lhs)?;
        res.stage(kernel, Bank::C, rhs)?;
        let params = KernelParams {
            len: out.len() as u32,
            ..Default::default()
        };
        res.dispatch(kernel, params, kernel.workgroups_for(out.len()), Readback::whole(out), None)
    }
}

/// The kernels read matrices as dense row-major buffers.
fn contiguous<'a>(view: &'a ArrayView2<'_, f32>, op: &'static str) -> Cow<'a, [f32]> {
    match view.as_slice() {
        Some(slice) => Cow::Borrowed(slice),
        None => {
            log::debug!("{op}: copying non-contiguous matrix before staging");
            Cow::Owned(view.iter().copied().collect())
        }
    }
}

fn window_check(op: &'static str, window: &ArrayView2<'_, f32>, head: HeadSpan) -> Result<()> {
    if head.end() > window.ncols() {
        return Err(EngineError::shape(
            op,
            format!("cache rows of at least {} columns", head.end()),
            format!("cache rows of {} columns", window.ncols()),
        )
        .into());
    }
    Ok(())
}

impl ExecutionBackend for AcceleratorBackend {
    fn name(&self) -> &'static str {
        "accelerator"
    }

    fn matmul(&self, out: &mut [f32], input: &[f32], weight: ArrayView2<'_, f32>) -> Result<()> {
        let (rows, cols) = weight.dim();
        if cols != input.len() || rows != out.len() {
            return Err(EngineError::shape(
                "matmul",
                format!("weight [{}, {}]", out.len(), input.len()),
                format!("weight [{rows}, {cols}]"),
            )
            .into());
        }
        let kernel = Kernel::Matmul;
        let matrix = contiguous(&weight, kernel.label());
        let res = self.lock()?;
        res.stage(kernel, Bank::A, input)?;
        res.stage(kernel, Bank::B, &matrix)?;
        let params = KernelParams {
            rows: rows as u32,
            cols: cols as u32,
            ..Default::default()
        };
        res.dispatch(kernel, params, kernel.workgroups_for(rows), Readback::whole(out), None)
    }

    fn add(&self, out: &mut [f32], lhs: &[f32], rhs: &[f32]) -> Result<()> {
        self.elementwise(Kernel::Add, out, lhs, rhs)
    }

    fn mul(&self, out: &mut [f32], lhs: &[f32], rhs: &[f32]) -> Result<()> {
        self.elementwise(Kernel::Mul, out, lhs, rhs)
    }

    /// Runs on the multiply kernel with a broadcast factor operand.
    fn scale(&self, out: &mut [f32], input: &[f32], factor: f32) -> Result<()> {
        ensure_len("scale", "input", input.len(), out.len())?;
        let factors = vec![factor; input.len()];
        self.elementwise(Kernel::Mul, out, input, &factors)
    }

    fn rms_norm(&self, out: &mut [f32], input: &[f32], weight: &[f32]) -> Result<()> {
        let kernel = Kernel::RmsNorm;
        ensure_len(kernel.label(), "input", input.len(), out.len())?;
        ensure_len(kernel.label(), "weight", weight.len(), out.len())?;
        if input.is_empty() {
            return Ok(());
        }
        let res = self.lock()?;
        res.stage(kernel, Bank::A, input)?;
        res.stage(kernel, Bank::C, weight)?;
        let params = KernelParams {
            len: input.len() as u32,
            eps: RMS_NORM_EPS,
            ..Default::default()
        };
        res.dispatch(kernel, params, kernel.workgroups_for(input.len()), Readback::whole(out), None)
    }

    fn softmax(&self, out: &mut [f32], input: &[f32], len: usize) -> Result<()> {
        let kernel = Kernel::Softmax;
        let available = input.len().min(out.len());
        if len == 0 || len > available {
            return Err(EngineError::shape(
                kernel.label(),
                format!("prefix length in 1..={available}"),
                format!("prefix length {len}"),
            )
            .into());
        }
        let res = self.lock()?;
        res.stage(kernel, Bank::A, &input[..len])?;
        let params = KernelParams {
            len: len as u32,
            ..Default::default()
        };
        res.dispatch(kernel, params, kernel.workgroups_for(len), Readback::whole(&mut out[..len]), None)
    }

    fn silu(&self, out: &mut [f32], input: &[f32]) -> Result<()> {
        let kernel = Kernel::Silu;
        ensure_len(kernel.label(), "input", input.len(), out.len())?;
        if out.is_empty() {
            return Ok(());
        }
        let res = self.lock()?;
        res.stage(kernel, Bank::A, input)?;
        let params = KernelParams {
            len: out.len() as u32,
            ..Default::default()
        };
        res.dispatch(kernel, params, kernel.workgroups_for(out.len()), Readback::whole(out), None)
    }

    fn rope(
        &self,
        q_out: &mut [f32],
        k_out: &mut [f32],
        q_in: &[f32],
        k_in: &[f32],
        cos: &[f32],
        sin: &[f32],
        head: HeadSpan,
    ) -> Result<()> {
        let kernel = Kernel::Rope;
        let hidden = q_in.len();
        ensure_len(kernel.label(), "k_in", k_in.len(), hidden)?;
        ensure_len(kernel.label(), "q_out", q_out.len(), hidden)?;
        ensure_len(kernel.label(), "k_out", k_out.len(), hidden)?;
        ensure_len(kernel.label(), "cos row", cos.len(), head.pairs())?;
        ensure_len(kernel.label(), "sin row", sin.len(), head.pairs())?;
        if head.dim % 2 != 0 || head.end() > hidden {
            return Err(EngineError::shape(
                kernel.label(),
                format!("even head inside [0, {hidden})"),
                format!("head [{}, {})", head.begin, head.end()),
            )
            .into());
        }
        if head.pairs() == 0 {
            return Ok(());
        }

        let mut table = Vec::with_capacity(2 * head.pairs());
        table.extend_from_slice(cos);
        table.extend_from_slice(sin);

        let res = self.lock()?;
        res.stage(kernel, Bank::A, q_in)?;
        res.stage(kernel, Bank::C, k_in)?;
        res.stage(kernel, Bank::D, &table)?;
        let params = KernelParams {
            len: head.pairs() as u32,
            head_begin: head.begin as u32,
            head_dim: head.dim as u32,
            ..Default::default()
        };
        res.dispatch(
            kernel,
            params,
            kernel.workgroups_for(head.pairs()),
            Readback {
                dst: &mut q_out[head.range()],
                offset: head.begin,
            },
            Some(Readback {
                dst: &mut k_out[head.range()],
                offset: head.begin,
            }),
        )
    }

    fn attention_scores(
        &self,
        scores: &mut [f32],
        query: &[f32],
        keys: ArrayView2<'_, f32>,
        head: HeadSpan,
    ) -> Result<()> {
        let kernel = Kernel::AttentionScores;
        window_check(kernel.label(), &keys, head)?;
        if query.len() != keys.ncols() || scores.len() != keys.nrows() {
            return Err(EngineError::shape(
                kernel.label(),
                format!("query of {} and {} scores", keys.ncols(), keys.nrows()),
                format!("query of {} and {} scores", query.len(), scores.len()),
            )
            .into());
        }
        if scores.is_empty() {
            return Ok(());
        }
        let window = contiguous(&keys, kernel.label());
        let res = self.lock()?;
        res.stage(kernel, Bank::A, query)?;
        res.stage(kernel, Bank::B, &window)?;
        let params = KernelParams {
            rows: keys.nrows() as u32,
            head_begin: head.begin as u32,
            head_dim: head.dim as u32,
            stride: keys.ncols() as u32,
            ..Default::default()
        };
        res.dispatch(kernel, params, kernel.workgroups_for(keys.nrows()), Readback::whole(scores), None)
    }

    fn attention_values(
        &self,
        out: &mut [f32],
        weights: &[f32],
        values: ArrayView2<'_, f32>,
        head: HeadSpan,
    ) -> Result<()> {
        let kernel = Kernel::AttentionValues;
        window_check(kernel.label(), &values, head)?;
        if weights.len() != values.nrows() || out.len() != head.dim {
            return Err(EngineError::shape(
                kernel.label(),
                format!("{} weights into {} outputs", values.nrows(), head.dim),
                format!("{} weights into {} outputs", weights.len(), out.len()),
            )
            .into());
        }
        if out.is_empty() {
            return Ok(());
        }
        let window = contiguous(&values, kernel.label());
        let res = self.lock()?;
        res.stage(kernel, Bank::A, weights)?;
        res.stage(kernel, Bank::B, &window)?;
        let params = KernelParams {
            rows: values.nrows() as u32,
            head_begin: head.begin as u32,
            head_dim: head.dim as u32,
            stride: values.ncols() as u32,
            ..Default::default()
        };
        res.dispatch(kernel, params, kernel.workgroups_for(head.dim), Readback::whole(out), None)
    }
}
