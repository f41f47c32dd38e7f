//! The per-token forward pass.
//!
//! For every layer, in order:
//!
//! 1. **Attention**: RMSNorm, Q/K/V projections, RoPE on Q and K per head,
//!    cache write at `(layer, pos)`, then per head causal scores over
//!    `[0, pos]`, scaling by `1/sqrt(head_dim)`, softmax and weighted
//!    values. The merged heads go through the output projection and are
//!    added to the layer input.
//! 2. **Feed-forward**: RMSNorm, gate and up projections, SiLU on the gate,
//!    gate * up, down projection, added to the attention residual.
//!
//! The last layer's output is normalized with the final RMS weight and
//! returned. The engine only sees [`ExecutionBackend`], so the same code runs
//! on either backend.

use anyhow::Result;

use crate::backend::ExecutionBackend;
use crate::cache::KvCache;
use crate::error::{ensure_len, EngineError};
use crate::ops::HeadSpan;
use crate::state::{layer_row, layer_row_mut, DecodeState};
use crate::weights::{layer_matrix, Weights};

pub struct DecodeEngine<'a> {
    weights: &'a Weights,
    backend: &'a dyn ExecutionBackend,
}

impl<'a> DecodeEngine<'a> {
    pub fn new(weights: &'a Weights, backend: &'a dyn ExecutionBackend) -> Self {
        Self { weights, backend }
    }

    pub fn backend(&self) -> &dyn ExecutionBackend {
        self.backend
    }

    /// Runs one token through every layer and returns the normalized final
    /// hidden state, which lives in `state.final_norm`.
    ///
    /// `pos` must be the next unwritten position of `cache`.
    pub fn decode<'s>(
        &self,
        token: u32,
        pos: usize,
        embedding: &[f32],
        state: &'s mut DecodeState,
        cache: &mut KvCache,
    ) -> Result<&'s [f32]> {
        let dims = &self.weights.dims;
        if pos >= dims.max_seq {
            return Err(EngineError::PositionOutOfRange {
                pos,
                max_seq: dims.max_seq,
            }
            .into());
        }
        ensure_len("decode", "embedding", embedding.len(), dims.hidden)?;
        self.check_buffers(state, cache)?;

        log::debug!(
            "decode token {} at pos {} on {} backend",
            token,
            pos,
            self.backend.name()
        );

        for layer in 0..dims.layers {
            if layer == 0 {
                state.input.copy_from_slice(embedding);
            } else {
                state
                    .input
                    .copy_from_slice(layer_row(&state.ffn_residual, layer - 1)?);
            }
            self.attention(layer, pos, state, cache)?;
            self.feed_forward(layer, state)?;
        }

        let last = layer_row(&state.ffn_residual, dims.layers - 1)?;
        let rms_final = self
            .weights
            .rms_final
            .as_slice()
            .ok_or_else(|| EngineError::InvalidDims("final rms weight is not contiguous".into()))?;
        self.backend.rms_norm(&mut state.final_norm, last, rms_final)?;
        Ok(state.final_norm.as_slice())
    }

    fn check_buffers(&self, state: &DecodeState, cache: &KvCache) -> Result<()> {
        let dims = &self.weights.dims;
        ensure_len("decode", "state layers", state.num_layers(), dims.layers)?;
        ensure_len("decode", "state hidden", state.input.len(), dims.hidden)?;
        ensure_len("decode", "state ffn", state.ffn_gate.ncols(), dims.ffn)?;
        ensure_len("decode", "state scores", state.attn_scores.ncols(), dims.max_seq)?;
        ensure_len("decode", "cache layers", cache.num_layers(), dims.layers)?;
        ensure_len("decode", "cache hidden", cache.hidden(), dims.hidden)?;
        ensure_len("decode", "cache capacity", cache.max_seq(), dims.max_seq)
    }

    fn attention(&self, l: usize, pos: usize, state: &mut DecodeState, cache: &mut KvCache) -> Result<()> {
        let w = self.weights;
        let b = self.backend;
        let dims = &w.dims;

        b.rms_norm(
            layer_row_mut(&mut state.attn_norm, l)?,
            &state.input,
            layer_row(&w.rms_attn, l)?,
        )?;
        let x = layer_row(&state.attn_norm, l)?;
        b.matmul(layer_row_mut(&mut state.attn_q, l)?, x, layer_matrix(&w.wq, l)?)?;
        b.matmul(layer_row_mut(&mut state.attn_k, l)?, x, layer_matrix(&w.wk, l)?)?;
        b.matmul(layer_row_mut(&mut state.attn_v, l)?, x, layer_matrix(&w.wv, l)?)?;

        let q = layer_row(&state.attn_q, l)?;
        let k = layer_row(&state.attn_k, l)?;
        let q_rot = layer_row_mut(&mut state.attn_q_rot, l)?;
        let k_rot = layer_row_mut(&mut state.attn_k_rot, l)?;
        let (cos, sin) = w.rope_row(pos)?;
        for h in 0..dims.heads {
            b.rope(q_rot, k_rot, q, k, cos, sin, HeadSpan::new(h, dims.head_dim()))?;
        }

        // The current position must be visible to its own scores.
        cache.write(l, pos, layer_row(&state.attn_k_rot, l)?, layer_row(&state.attn_v, l)?)?;
        let (keys, values) = cache.read_range(l, pos)?;

        let window = pos + 1;
        let query = layer_row(&state.attn_q_rot, l)?;
        let scores = &mut layer_row_mut(&mut state.attn_scores, l)?[..window];
        let weights = &mut layer_row_mut(&mut state.attn_weights, l)?[..window];
        let merged = layer_row_mut(&mut state.attn_values, l)?;
        for h in 0..dims.heads {
            let head = HeadSpan::new(h, dims.head_dim());
            // `weights` holds the raw scores until the softmax overwrites them.
            b.attention_scores(weights, query, keys, head)?;
            b.scale(scores, weights, dims.attention_scale())?;
            b.softmax(weights, scores, window)?;
            b.attention_values(&mut merged[head.range()], weights, values, head)?;
        }

        b.matmul(
            layer_row_mut(&mut state.attn_out, l)?,
            layer_row(&state.attn_values, l)?,
            layer_matrix(&w.wo, l)?,
        )?;
        b.add(
            layer_row_mut(&mut state.attn_residual, l)?,
            &state.input,
            layer_row(&state.attn_out, l)?,
        )
    }

    fn feed_forward(&self, l: usize, state: &mut DecodeState) -> Result<()> {
        let w = self.weights;
        let b = self.backend;

        let residual = layer_row(&state.attn_residual, l)?;
        b.rms_norm(layer_row_mut(&mut state.ffn_norm, l)?, residual, layer_row(&w.rms_ffn, l)?)?;

        let x = layer_row(&state.ffn_norm, l)?;
        b.matmul(layer_row_mut(&mut state.ffn_gate, l)?, x, layer_matrix(&w.w_gate, l)?)?;
        b.matmul(layer_row_mut(&mut state.ffn_up, l)?, x, layer_matrix(&w.w_up, l)?)?;

        b.silu(layer_row_mut(&mut state.ffn_act, l)?, layer_row(&state.ffn_gate, l)?)?;
        b.mul(
            layer_row_mut(&mut state.ffn_hidden, l)?,
            layer_row(&state.ffn_act, l)?,
            layer_row(&state.ffn_up, l)?,
        )?;
        b.matmul(
            layer_row_mut(&mut state.ffn_out, l)?,
            layer_row(&state.ffn_hidden, l)?,
            layer_matrix(&w.w_down, l)?,
        )?;
        b.add(
            layer_row_mut(&mut state.ffn_residual, l)?,
            residual,
            layer_row(&state.ffn_out, l)?,
        )
    }
}

/// One-shot form of [`DecodeEngine::decode`].
pub fn decode<'s>(
    token: u32,
    pos: usize,
    embedding: &[f32],
    cache: &mut KvCache,
    weights: &Weights,
    backend: &dyn ExecutionBackend,
    state: &'s mut DecodeState,
) -> Result<&'s [f32]> {
    DecodeEngine::new(weights, backend).decode(token, pos, embedding, state, cache)
}

#[cfg(test)]
mod tests;
