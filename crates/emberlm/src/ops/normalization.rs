//! Root Mean Square normalization (RMSNorm).
//!
//! Formula: `y = x * (1 / sqrt(mean(x^2) + eps)) * weight`
//!
//! The epsilon keeps an all-zero input finite: the output is then all zeros.

use anyhow::Result;

use crate::dims::RMS_NORM_EPS;
use crate::error::ensure_len;

pub fn rms_norm(out: &mut [f32], input: &[f32], weight: &[f32]) -> Result<()> {
    ensure_len("rms_norm", "input", input.len(), out.len())?;
    ensure_len("rms_norm", "weight", weight.len(), out.len())?;
    if input.is_empty() {
        return Ok(());
    }

    let sum_sq: f32 = input.iter().map(|x| x * x).sum();
    let norm = 1.0 / (sum_sq / input.len() as f32 + RMS_NORM_EPS).sqrt();

    for ((o, &x), &w) in out.iter_mut().zip(input).zip(weight) {
        *o = x * norm * w;
    }
    Ok(())
}
