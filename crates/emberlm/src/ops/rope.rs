//! Rotary Position Embeddings (RoPE)
//!
//! Adjacent dimensions `(2i, 2i + 1)` inside a head form a pair that is
//! rotated by the angle stored at `(cos[i], sin[i])` for the current position:
//!
//! ```text
//! x0' = x0 * cos - x1 * sin
//! x1' = x0 * sin + x1 * cos
//! ```
//!
//! Queries and keys are rotated identically; values are never rotated.

use anyhow::Result;
use ndarray::Array2;

use super::HeadSpan;
use crate::error::{ensure_len, EngineError};

/// Rotates one head of `q_in`/`k_in` into the same head of `q_out`/`k_out`.
///
/// Only indices inside `head` are written; the rest of the outputs is left
/// as is so heads can be rotated one call at a time.
#[allow(clippy::too_many_arguments)]
pub fn rope(
    q_out: &mut [f32],
    k_out: &mut [f32],
    q_in: &[f32],
    k_in: &[f32],
    cos: &[f32],
    sin: &[f32],
    head: HeadSpan,
) -> Result<()> {
    let hidden = q_in.len();
    ensure_len("rope", "k_in", k_in.len(), hidden)?;
    ensure_len("rope", "q_out", q_out.len(), hidden)?;
    ensure_len("rope", "k_out", k_out.len(), hidden)?;
    ensure_len("rope", "cos row", cos.len(), head.pairs())?;
    ensure_len("rope", "sin row", sin.len(), head.pairs())?;
    if head.dim % 2 != 0 || head.end() > hidden {
        return Err(EngineError::shape(
            "rope",
            format!("even head inside [0, {hidden})"),
            format!("head [{}, {})", head.begin, head.end()),
        )
        .into());
    }

    for i in 0..head.pairs() {
        let i0 = head.begin + 2 * i;
        let i1 = i0 + 1;
        let (c, s) = (cos[i], sin[i]);

        let (q0, q1) = (q_in[i0], q_in[i1]);
        q_out[i0] = q0 * c - q1 * s;
        q_out[i1] = q0 * s + q1 * c;

        let (k0, k1) = (k_in[i0], k_in[i1]);
        k_out[i0] = k0 * c - k1 * s;
        k_out[i1] = k0 * s + k1 * c;
    }
    Ok(())
}

/// Builds `[max_seq, head_dim / 2]` cosine and sine tables.
///
/// Pair `i` at position `pos` uses the angle `pos * theta^(-2i / head_dim)`,
/// the standard Llama frequencies. Model files ship their own tables; this
/// is for building weights in memory.
pub fn rotary_tables(max_seq: usize, head_dim: usize, theta: f32) -> (Array2<f32>, Array2<f32>) {
    let half_dim = head_dim / 2;
    let inv_freq: Vec<f32> = (0..half_dim)
        .map(|i| 1.0 / theta.powf((2 * i) as f32 / head_dim as f32))
        .collect();

    let mut cos = Array2::<f32>::zeros((max_seq, half_dim));
    let mut sin = Array2::<f32>::zeros((max_seq, half_dim));
    for pos in 0..max_seq {
        for (i, freq) in inv_freq.iter().enumerate() {
            let angle = pos as f32 * freq;
            cos[[pos, i]] = angle.cos();
            sin[[pos, i]] = angle.sin();
        }
    }
    (cos, sin)
}
