//! Fixed model dimensions.
//!
//! Every tensor in the engine is sized from one [`ModelDims`] value. The
//! dimensions are validated once, when the weights, state and cache are
//! built; the hot path relies on that instead of re-deriving shapes.

use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// Size of the ignored prefix at the start of a weight file.
pub const WEIGHT_FILE_HEADER_BYTES: usize = 28;

/// RMSNorm epsilon, fixed for the whole model.
pub const RMS_NORM_EPS: f32 = 1e-5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelDims {
    pub hidden: usize,
    pub ffn: usize,
    pub layers: usize,
    pub heads: usize,
    pub kv_heads: usize,
    pub max_seq: usize,
    pub vocab: usize,
}

impl ModelDims {
    /// The 15M-parameter "stories" model the engine is built around.
    pub const STORIES_15M: ModelDims = ModelDims {
        hidden: 288,
        ffn: 768,
        layers: 6,
        heads: 6,
        kv_heads: 6,
        max_seq: 256,
        vocab: 32000,
    };

    pub const fn head_dim(&self) -> usize {
        self.hidden / self.heads
    }

    /// Width of one row of the sine/cosine tables (one entry per rotated pair).
    pub const fn rotary_width(&self) -> usize {
        self.head_dim() / 2
    }

    /// Attention score scale, `1/sqrt(head_dim)`.
    pub fn attention_scale(&self) -> f32 {
        1.0 / (self.head_dim() as f32).sqrt()
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        let fields = [
            ("hidden", self.hidden),
            ("ffn", self.ffn),
            ("layers", self.layers),
            ("heads", self.heads),
            ("kv_heads", self.kv_heads),
            ("max_seq", self.max_seq),
            ("vocab", self.vocab),
        ];
        if let Some((name, _)) = fields.iter().find(|(_, v)| *v == 0) {
            return Err(EngineError::InvalidDims(format!("{name} must be non-zero")));
        }
        if self.hidden % self.heads != 0 {
            return Err(EngineError::InvalidDims(format!(
                "hidden size {} is not divisible by {} heads",
                self.hidden, self.heads
            )));
        }
        if self.head_dim() % 2 != 0 {
            return Err(EngineError::InvalidDims(format!(
                "head dimension {} must be even for rotary encoding",
                self.head_dim()
            )));
        }
        // Grouped-query attention is not implemented.
        if self.kv_heads != self.heads {
            return Err(EngineError::InvalidDims(format!(
                "kv_heads ({}) must equal heads ({})",
                self.kv_heads, self.heads
            )));
        }
        Ok(())
    }

    /// Number of f32 values stored after the header of a weight file.
    pub fn weight_file_elements(&self) -> usize {
        let (h, f, l) = (self.hidden, self.ffn, self.layers);
        self.vocab * h
            + l * h              // attention rms
            + 4 * l * h * h      // wq, wk, wv, wo
            + l * h              // ffn rms
            + 3 * l * f * h      // gate, down, up
            + h                  // final rms
            + 2 * self.max_seq * self.rotary_width()
    }

    pub fn weight_file_bytes(&self) -> usize {
        WEIGHT_FILE_HEADER_BYTES + self.weight_file_elements() * std::mem::size_of::<f32>()
    }

    /// Longest vector operand any primitive sees (the vocabulary logits dominate).
    pub fn max_vector_len(&self) -> usize {
        self.hidden.max(self.ffn).max(self.max_seq).max(self.vocab)
    }

    /// Largest matrix operand any primitive sees, in elements.
    pub fn max_matrix_len(&self) -> usize {
        let h = self.hidden;
        (self.vocab * h).max(self.ffn * h).max(self.max_seq * h).max(h * h)
    }
}

impl Default for ModelDims {
    fn default() -> Self {
        Self::STORIES_15M
    }
}

impl std::fmt::Display for ModelDims {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "  dim       : {}", self.hidden)?;
        writeln!(f, "  ffn_dim   : {}", self.ffn)?;
        writeln!(f, "  n_layers  : {}", self.layers)?;
        writeln!(f, "  n_heads   : {}", self.heads)?;
        writeln!(f, "  n_kv_heads: {}", self.kv_heads)?;
        writeln!(f, "  vocab_size: {}", self.vocab)?;
        write!(f, "  seq_len   : {}", self.max_seq)
    }
}
