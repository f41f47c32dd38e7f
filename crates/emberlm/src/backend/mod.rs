//! Execution backends.
//!
//! The decode engine only talks to [`ExecutionBackend`]. Two implementations
//! exist: [`LocalBackend`] runs the tensor math library on the calling
//! thread, and [`AcceleratorBackend`](crate::accelerator::AcceleratorBackend)
//! stages every call through a compute device. The backend is chosen once at
//! startup and held for the whole run.

use std::fmt;
use std::str::FromStr;

use anyhow::{anyhow, Result};
use ndarray::ArrayView2;
use serde::{Deserialize, Serialize};

use crate::ops::HeadSpan;

mod local;

pub use local::LocalBackend;

/// The primitive operation set used by the decode engine.
///
/// Every method checks operand shapes with the same rules as the matching
/// function in [`crate::ops`] and fails before computing anything when they
/// do not hold. Implementations must agree with [`LocalBackend`] up to
/// floating-point rounding.
pub trait ExecutionBackend: Send + Sync {
    /// Short display name.
    fn name(&self) -> &'static str;

    /// `out[i] = sum_j weight[i][j] * input[j]`
    fn matmul(&self, out: &mut [f32], input: &[f32], weight: ArrayView2<'_, f32>) -> Result<()>;

    fn add(&self, out: &mut [f32], lhs: &[f32], rhs: &[f32]) -> Result<()>;

    fn mul(&self, out: &mut [f32], lhs: &[f32], rhs: &[f32]) -> Result<()>;

    fn scale(&self, out: &mut [f32], input: &[f32], factor: f32) -> Result<()>;

    fn rms_norm(&self, out: &mut [f32], input: &[f32], weight: &[f32]) -> Result<()>;

    /// Softmax over `input[..len]` into `out[..len]`.
    fn softmax(&self, out: &mut [f32], input: &[f32], len: usize) -> Result<()>;

    fn silu(&self, out: &mut [f32], input: &[f32]) -> Result<()>;

    /// Rotates `head` of the query and key vectors; indices outside the head
    /// are not written.
    #[allow(clippy::too_many_arguments)]
    fn rope(
        &self,
        q_out: &mut [f32],
        k_out: &mut [f32],
        q_in: &[f32],
        k_in: &[f32],
        cos: &[f32],
        sin: &[f32],
        head: HeadSpan,
    ) -> Result<()>;

    /// One score per row of the causal key window.
    fn attention_scores(
        &self,
        scores: &mut [f32],
        query: &[f32],
        keys: ArrayView2<'_, f32>,
        head: HeadSpan,
    ) -> Result<()>;

    /// Weighted sum of the value window into the head's output slice.
    fn attention_values(
        &self,
        out: &mut [f32],
        weights: &[f32],
        values: ArrayView2<'_, f32>,
        head: HeadSpan,
    ) -> Result<()>;
}

/// Which backend a run uses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Local,
    Accelerator,
}

impl BackendKind {
    pub fn is_local(&self) -> bool {
        matches!(self, BackendKind::Local)
    }

    pub fn is_accelerator(&self) -> bool {
        matches!(self, BackendKind::Accelerator)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Local => "local",
            BackendKind::Accelerator => "accelerator",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "local" | "cpu" => Ok(BackendKind::Local),
            "accelerator" | "gpu" | "wgpu" => Ok(BackendKind::Accelerator),
            other => Err(anyhow!(
                "unknown backend '{}', expected 'local' or 'accelerator'",
                other
            )),
        }
    }
}
