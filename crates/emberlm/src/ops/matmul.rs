//! Matrix-vector products.
//!
//! All products compute `out[i] = sum_j w[i][j] * in[j]` over a row-major
//! weight whose rows are output features. The same function serves the four
//! shape pairings of the model (hidden x hidden, ffn x hidden, hidden x ffn,
//! vocab x hidden); the weight view carries the shape and is checked against
//! the operand lengths before any arithmetic.
//!
//! The attention products work on a window of the KV cache: rows are
//! positions `0..=pos`, columns are hidden indices, and only the columns of one
//! head take part.

use anyhow::Result;
use ndarray::ArrayView2;
use rayon::prelude::*;

use super::HeadSpan;
use crate::error::EngineError;

/// Minimum weight size (in elements) before rows are split across threads.
pub const PARALLEL_THRESHOLD: usize = 16_384;

#[inline]
fn dot(row: impl Iterator<Item = f32>, input: &[f32]) -> f32 {
    row.zip(input).map(|(w, x)| w * x).sum()
}

/// `out[i] = sum_j weight[i][j] * input[j]`
///
/// Each row is reduced sequentially, so the result does not depend on how
/// rows are scheduled across threads.
pub fn matmul(out: &mut [f32], input: &[f32], weight: ArrayView2<'_, f32>) -> Result<()> {
    let (rows, cols) = weight.dim();
    if cols != input.len() || rows != out.len() {
        return Err(EngineError::shape(
            "matmul",
            format!("weight [{}, {}]", out.len(), input.len()),
            format!("weight [{rows}, {cols}]"),
        )
        .into());
    }

    let compute_row = |(i, o): (usize, &mut f32)| {
        let row = weight.row(i);
        *o = match row.as_slice() {
            Some(slice) => dot(slice.iter().copied(), input),
            None => dot(row.iter().copied(), input),
        };
    };

    if rows * cols >= PARALLEL_THRESHOLD {
        out.par_iter_mut().enumerate().for_each(compute_row);
    } else {
        out.iter_mut().enumerate().for_each(compute_row);
    }
    Ok(())
}

fn check_window(op: &'static str, window: ArrayView2<'_, f32>, head: HeadSpan) -> Result<()> {
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

/// Causal attention scores for one head.
///
/// `scores[t] = sum_{d in head} keys[t][d] * query[d]` for every row `t` of
/// the window. The caller passes the window `[0, pos]`, so `scores` has
/// `pos + 1` entries.
pub fn attention_scores(
    scores: &mut [f32],
    query: &[f32],
    keys: ArrayView2<'_, f32>,
    head: HeadSpan,
) -> Result<()> {
    check_window("attention_scores", keys, head)?;
    if query.len() != keys.ncols() || scores.len() != keys.nrows() {
        return Err(EngineError::shape(
            "attention_scores",
            format!("query of {} and {} scores", keys.ncols(), keys.nrows()),
            format!("query of {} and {} scores", query.len(), scores.len()),
        )
        .into());
    }
    let q = &query[head.range()];
    for (t, score) in scores.iter_mut().enumerate() {
        let row = keys.row(t);
        *score = dot(row.iter().skip(head.begin).take(head.dim).copied(), q);
    }
    Ok(())
}

/// Weighted value accumulation for one head, using the transposed indexing.
///
/// `out[d] = sum_t values[t][head.begin + d] * weights[t]`: the sum runs over
/// positions for a fixed hidden index. `out` holds exactly the head's slice.
pub fn attention_values(
    out: &mut [f32],
    weights: &[f32],
    values: ArrayView2<'_, f32>,
    head: HeadSpan,
) -> Result<()> {
    check_window("attention_values", values, head)?;
    if weights.len() != values.nrows() || out.len() != head.dim {
        return Err(EngineError::shape(
            "attention_values",
            format!("{} weights into {} outputs", values.nrows(), head.dim),
            format!("{} weights into {} outputs", weights.len(), out.len()),
        )
        .into());
    }
    for (d, o) in out.iter_mut().enumerate() {
        let column = values.column(head.begin + d);
        *o = dot(column.iter().copied(), weights);
    }
    Ok(())
}
