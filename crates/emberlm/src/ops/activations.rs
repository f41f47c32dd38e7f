//! Activation functions and softmax.

use anyhow::Result;

use crate::error::{ensure_len, EngineError};

#[inline(always)]
pub fn silu_scalar(x: f32) -> f32 {
    x * (1.0 / (1.0 + (-x).exp()))
}

#[inline(always)]
pub fn relu_scalar(x: f32) -> f32 {
    x.max(0.0)
}

/// `out[i] = in[i] * sigmoid(in[i])`
pub fn silu(out: &mut [f32], input: &[f32]) -> Result<()> {
    ensure_len("silu", "input", input.len(), out.len())?;
    for (o, &x) in out.iter_mut().zip(input) {
        *o = silu_scalar(x);
    }
    Ok(())
}

/// `out[i] = max(0, in[i])`. Not used by the decode path.
pub fn relu(out: &mut [f32], input: &[f32]) -> Result<()> {
    ensure_len("relu", "input", input.len(), out.len())?;
    for (o, &x) in out.iter_mut().zip(input) {
        *o = relu_scalar(x);
    }
    Ok(())
}

fn check_prefix(op: &'static str, len: usize, available: usize) -> Result<()> {
    if len == 0 || len > available {
        return Err(EngineError::shape(
            op,
            format!("prefix length in 1..={available}"),
            format!("prefix length {len}"),
        )
        .into());
    }
    Ok(())
}

/// Softmax over the first `len` elements of `input`, written to `out[..len]`.
///
/// Stabilized by subtracting the prefix maximum before exponentiation.
/// Elements past `len` in `out` are left untouched.
pub fn softmax(out: &mut [f32], input: &[f32], len: usize) -> Result<()> {
    check_prefix("softmax", len, input.len().min(out.len()))?;
    let input = &input[..len];
    let out = &mut out[..len];

    let max_val = input.iter().copied().fold(input[0], f32::max);
    let mut sum = 0.0f32;
    for (o, &x) in out.iter_mut().zip(input) {
        *o = (x - max_val).exp();
        sum += *o;
    }
    for o in out.iter_mut() {
        *o /= sum;
    }
    Ok(())
}

/// In-place variant of [`softmax`] for logits buffers.
pub fn softmax_in_place(values: &mut [f32], len: usize) -> Result<()> {
    check_prefix("softmax_in_place", len, values.len())?;
    let values = &mut values[..len];

    let max_val = values.iter().copied().fold(values[0], f32::max);
    let mut sum = 0.0f32;
    for v in values.iter_mut() {
        *v = (*v - max_val).exp();
        sum += *v;
    }
    for v in values.iter_mut() {
        *v /= sum;
    }
    Ok(())
}
