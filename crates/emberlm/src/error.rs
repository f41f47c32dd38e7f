//! Error types for the decode engine.

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised by the decode engine and its loaders.
///
/// Most functions return `anyhow::Result`; these variants can be recovered
/// with `err.downcast_ref::<EngineError>()`.
#[derive(Debug, Error)]
pub enum EngineError {
    /// An operand did not have the length the operation requires.
    #[error("shape mismatch in {op}: expected {expected}, got {actual}")]
    ShapeMismatch {
        op: &'static str,
        expected: String,
        actual: String,
    },

    /// A position at or beyond the sequence capacity.
    #[error("position {pos} out of range (max sequence length {max_seq})")]
    PositionOutOfRange { pos: usize, max_seq: usize },

    /// A layer index at or beyond the layer count.
    #[error("layer {layer} out of range ({layers} layers)")]
    LayerOutOfRange { layer: usize, layers: usize },

    /// A second write to the same cache slot within one run.
    #[error("kv cache slot (layer {layer}, pos {pos}) already written")]
    CacheSlotWritten { layer: usize, pos: usize },

    /// A read or write that skips over an unwritten cache slot.
    #[error("kv cache slot (layer {layer}, pos {pos}) not written yet")]
    CacheSlotMissing { layer: usize, pos: usize },

    /// Token id outside the vocabulary.
    #[error("token {token} out of range (vocabulary size {vocab})")]
    TokenOutOfRange { token: u32, vocab: usize },

    /// Model dimensions that cannot describe a valid model.
    #[error("invalid model dimensions: {0}")]
    InvalidDims(String),

    /// A model or vocabulary file that does not match the expected layout.
    #[error("corrupt file {path:?}: {reason}")]
    CorruptFile { path: PathBuf, reason: String },

    /// No usable accelerator, or its kernels failed to build.
    #[error("accelerator unavailable: {0}")]
    AcceleratorUnavailable(String),

    /// A staged accelerator task failed to complete.
    #[error("accelerator dispatch failed in {kernel}: {reason}")]
    AcceleratorDispatch { kernel: &'static str, reason: String },
}

impl EngineError {
    pub(crate) fn shape(op: &'static str, expected: impl ToString, actual: impl ToString) -> Self {
        EngineError::ShapeMismatch {
            op,
            expected: expected.to_string(),
            actual: actual.to_string(),
        }
    }
}

/// Fails with [`EngineError::ShapeMismatch`] unless `actual == expected`.
pub(crate) fn ensure_len(op: &'static str, what: &str, actual: usize, expected: usize) -> anyhow::Result<()> {
    if actual != expected {
        return Err(EngineError::shape(
            op,
            format!("{what} of length {expected}"),
            format!("{what} of length {actual}"),
        )
        .into());
    }
    Ok(())
}
