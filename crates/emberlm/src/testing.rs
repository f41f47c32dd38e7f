//! Shared fixtures for unit tests.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::dims::ModelDims;
use crate::weights::{TokenEmbeddings, Weights};

/// A model small enough to check by hand: 2 layers, 2 heads of width 4.
pub(crate) fn tiny_dims() -> ModelDims {
    ModelDims {
        hidden: 8,
        ffn: 12,
        layers: 2,
        heads: 2,
        kv_heads: 2,
        max_seq: 6,
        vocab: 10,
    }
}

/// Weights drawn uniformly from `[-0.5, 0.5)` with a fixed seed.
pub(crate) fn seeded_weights(dims: &ModelDims, seed: u64) -> (TokenEmbeddings, Weights) {
    let mut rng = StdRng::seed_from_u64(seed);
    Weights::from_fn(dims, |_, _| rng.gen_range(-0.5..0.5)).unwrap()
}

pub(crate) fn assert_close(actual: &[f32], expected: &[f32], rel_tol: f32) {
    assert_eq!(actual.len(), expected.len(), "length mismatch");
    for (i, (a, e)) in actual.iter().zip(expected).enumerate() {
        let tol = rel_tol * e.abs().max(1.0);
        assert!(
            (a - e).abs() <= tol,
            "mismatch at {}: {} vs {} (tolerance {})",
            i,
            a,
            e,
            tol
        );
    }
}
