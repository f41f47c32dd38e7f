use anyhow::Result;
use ndarray::ArrayView2;

use super::ExecutionBackend;
use crate::ops::{self, HeadSpan};

/// Runs every primitive with the tensor math library on the calling thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalBackend;

impl LocalBackend {
    pub fn new() -> Self {
        Self
    }
}

impl ExecutionBackend for LocalBackend {
    fn name(&self) -> &'static str {
        "local"
    }

    fn matmul(&self, out: &mut [f32], input: &[f32], weight: ArrayView2<'_, f32>) -> Result<()> {
        ops::matmul(out, input, weight)
    }

    fn add(&self, out: &mut [f32], lhs: &[f32], rhs: &[f32]) -> Result<()> {
        ops::add(out, lhs, rhs)
    }

    fn mul(&self, out: &mut [f32], lhs: &[f32], rhs: &[f32]) -> Result<()> {
        ops::mul(out, lhs, rhs)
    }

    fn scale(&self, out: &mut [f32], input: &[f32], factor: f32) -> Result<()> {
        ops::scale(out, input, factor)
    }

    fn rms_norm(&self, out: &mut [f32], input: &[f32], weight: &[f32]) -> Result<()> {
        ops::rms_norm(out, input, weight)
    }

    fn softmax(&self, out: &mut [f32], input: &[f32], len: usize) -> Result<()> {
        ops::softmax(out, input, len)
    }

    fn silu(&self, out: &mut [f32], input: &[f32]) -> Result<()> {
        ops::silu(out, input)
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
        ops::rope(q_out, k_out, q_in, k_in, cos, sin, head)
    }

    fn attention_scores(
        &self,
        scores: &mut [f32],
        query: &[f32],
        keys: ArrayView2<'_, f32>,
        head: HeadSpan,
    ) -> Result<()> {
        ops::attention_scores(scores, query, keys, head)
    }

    fn attention_values(
        &self,
        out: &mut [f32],
        weights: &[f32],
        values: ArrayView2<'_, f32>,
        head: HeadSpan,
    ) -> Result<()> {
        ops::attention_values(out, weights, values, head)
    }
}
