//! Elementwise arithmetic, reductions and copies.

use anyhow::Result;

use crate::error::{ensure_len, EngineError};

fn ensure_binary(op: &'static str, out: &[f32], lhs: &[f32], rhs: &[f32]) -> Result<()> {
    ensure_len(op, "lhs", lhs.len(), out.len())?;
    ensure_len(op, "rhs", rhs.len(), out.len())
}

fn ensure_unary(op: &'static str, out: &[f32], input: &[f32]) -> Result<()> {
    ensure_len(op, "input", input.len(), out.len())
}

pub fn copy(dst: &mut [f32], src: &[f32]) -> Result<()> {
    ensure_unary("copy", dst, src)?;
    dst.copy_from_slice(src);
    Ok(())
}

/// `out[i] = lhs[i] + rhs[i]`
pub fn add(out: &mut [f32], lhs: &[f32], rhs: &[f32]) -> Result<()> {
    ensure_binary("add", out, lhs, rhs)?;
    for ((o, &a), &b) in out.iter_mut().zip(lhs).zip(rhs) {
        *o = a + b;
    }
    Ok(())
}

/// `out[i] = lhs[i] - rhs[i]`
pub fn sub(out: &mut [f32], lhs: &[f32], rhs: &[f32]) -> Result<()> {
    ensure_binary("sub", out, lhs, rhs)?;
    for ((o, &a), &b) in out.iter_mut().zip(lhs).zip(rhs) {
        *o = a - b;
    }
    Ok(())
}

/// `out[i] = lhs[i] * rhs[i]`
pub fn mul(out: &mut [f32], lhs: &[f32], rhs: &[f32]) -> Result<()> {
    ensure_binary("mul", out, lhs, rhs)?;
    for ((o, &a), &b) in out.iter_mut().zip(lhs).zip(rhs) {
        *o = a * b;
    }
    Ok(())
}

/// `out[i] = lhs[i] / rhs[i]`
pub fn div(out: &mut [f32], lhs: &[f32], rhs: &[f32]) -> Result<()> {
    ensure_binary("div", out, lhs, rhs)?;
    for ((o, &a), &b) in out.iter_mut().zip(lhs).zip(rhs) {
        *o = a / b;
    }
    Ok(())
}

pub fn add_scalar(out: &mut [f32], input: &[f32], a: f32) -> Result<()> {
    ensure_unary("add_scalar", out, input)?;
    for (o, &x) in out.iter_mut().zip(input) {
        *o = x + a;
    }
    Ok(())
}

pub fn sub_scalar(out: &mut [f32], input: &[f32], a: f32) -> Result<()> {
    ensure_unary("sub_scalar", out, input)?;
    for (o, &x) in out.iter_mut().zip(input) {
        *o = x - a;
    }
    Ok(())
}

/// Multiplies every element by `factor`.
pub fn scale(out: &mut [f32], input: &[f32], factor: f32) -> Result<()> {
    ensure_unary("scale", out, input)?;
    for (o, &x) in out.iter_mut().zip(input) {
        *o = x * factor;
    }
    Ok(())
}

pub fn div_scalar(out: &mut [f32], input: &[f32], a: f32) -> Result<()> {
    ensure_unary("div_scalar", out, input)?;
    for (o, &x) in out.iter_mut().zip(input) {
        *o = x / a;
    }
    Ok(())
}

/// `sum_i lhs[i] * rhs[i]`
pub fn inner_product(lhs: &[f32], rhs: &[f32]) -> Result<f32> {
    ensure_len("inner_product", "rhs", rhs.len(), lhs.len())?;
    Ok(lhs.iter().zip(rhs).map(|(a, b)| a * b).sum())
}

/// Index and value of the largest element; the first one wins on ties.
pub fn max_with_index(values: &[f32]) -> Result<(usize, f32)> {
    let (&first, rest) = values
        .split_first()
        .ok_or_else(|| EngineError::shape("max_with_index", "non-empty input", "empty input"))?;
    let mut best = (0, first);
    for (i, &v) in rest.iter().enumerate() {
        if v > best.1 {
            best = (i + 1, v);
        }
    }
    Ok(best)
}

pub fn argmax(values: &[f32]) -> Result<usize> {
    max_with_index(values).map(|(i, _)| i)
}
