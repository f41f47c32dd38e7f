//! Fixed-shape numeric primitives.
//!
//! This is the reference implementation every backend is measured against.
//! All functions take explicit output slices, check operand lengths before
//! touching memory, and never allocate on the hot path.
//!
//! | Primitive                  | Function                     |
//! |----------------------------|------------------------------|
//! | elementwise add/sub/mul/div | [`add`], [`mul`], [`scale`] ... |
//! | matrix-vector product      | [`matmul`]                   |
//! | causal attention scores    | [`attention_scores`]         |
//! | causal value accumulation  | [`attention_values`]         |
//! | RMS normalization          | [`rms_norm`]                 |
//! | softmax                    | [`softmax`]                  |
//! | activations                | [`silu`], [`relu`]           |
//! | rotary position encoding   | [`rope`]                     |

mod activations;
mod elementwise;
mod matmul;
mod normalization;
mod rope;

pub use activations::{relu, relu_scalar, silu, silu_scalar, softmax, softmax_in_place};
pub use elementwise::{
    add, add_scalar, argmax, copy, div, div_scalar, inner_product, max_with_index, mul, scale, sub,
    sub_scalar,
};
pub use matmul::{attention_scores, attention_values, matmul, PARALLEL_THRESHOLD};
pub use normalization::rms_norm;
pub use rope::{rope, rotary_tables};

/// The contiguous slice of the hidden vector owned by one attention head.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeadSpan {
    /// First hidden index of the head.
    pub begin: usize,
    /// Number of hidden indices in the head.
    pub dim: usize,
}

impl HeadSpan {
    pub fn new(head: usize, head_dim: usize) -> Self {
        Self {
            begin: head * head_dim,
            dim: head_dim,
        }
    }

    pub fn end(&self) -> usize {
        self.begin + self.dim
    }

    pub fn range(&self) -> std::ops::Range<usize> {
        self.begin..self.end()
    }

    /// Number of rotated `(x0, x1)` pairs in the head.
    pub fn pairs(&self) -> usize {
        self.dim / 2
    }
}
