//! Per-token intermediate tensors of the forward pass.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use anyhow::{Context, Result};
use ndarray::Array2;

use crate::dims::ModelDims;
use crate::error::EngineError;

/// Every intermediate of one forward pass, one row per layer.
///
/// Allocated once by the caller and overwritten on every decode call. Within
/// a call, each row is written before anything reads it.
#[derive(Clone)]
pub struct DecodeState {
    pub attn_norm: Array2<f32>,
    pub attn_q: Array2<f32>,
    pub attn_k: Array2<f32>,
    pub attn_v: Array2<f32>,
    pub attn_q_rot: Array2<f32>,
    pub attn_k_rot: Array2<f32>,
    /// `[layers, max_seq]`; only `[0, pos]` is meaningful, and only for the
    /// last head processed.
    pub attn_scores: Array2<f32>,
    pub attn_weights: Array2<f32>,
    /// Per-head value outputs merged back into one hidden vector.
    pub attn_values: Array2<f32>,
    pub attn_out: Array2<f32>,
    pub attn_residual: Array2<f32>,
    pub ffn_norm: Array2<f32>,
    pub ffn_gate: Array2<f32>,
    pub ffn_up: Array2<f32>,
    pub ffn_act: Array2<f32>,
    pub ffn_hidden: Array2<f32>,
    pub ffn_out: Array2<f32>,
    /// Output of each layer; the next layer's input.
    pub ffn_residual: Array2<f32>,
    /// Input of the layer being processed.
    pub input: Vec<f32>,
    /// Output of the final normalization.
    pub final_norm: Vec<f32>,
}

impl DecodeState {
    pub fn new(dims: &ModelDims) -> Result<Self> {
        dims.validate()?;
        let (l, h, f) = (dims.layers, dims.hidden, dims.ffn);
        let hidden = || Array2::zeros((l, h));
        let ffn = || Array2::zeros((l, f));
        let seq = || Array2::zeros((l, dims.max_seq));
        Ok(Self {
            attn_norm: hidden(),
            attn_q: hidden(),
            attn_k: hidden(),
            attn_v: hidden(),
            attn_q_rot: hidden(),
            attn_k_rot: hidden(),
            attn_scores: seq(),
            attn_weights: seq(),
            attn_values: hidden(),
            attn_out: hidden(),
            attn_residual: hidden(),
            ffn_norm: hidden(),
            ffn_gate: ffn(),
            ffn_up: ffn(),
            ffn_act: ffn(),
            ffn_hidden: ffn(),
            ffn_out: hidden(),
            ffn_residual: hidden(),
            input: vec![0.0; h],
            final_norm: vec![0.0; h],
        })
    }

    pub fn num_layers(&self) -> usize {
        self.attn_norm.nrows()
    }

    fn fields(&self) -> [(&'static str, &Array2<f32>); 18] {
        [
            ("attn_norm", &self.attn_norm),
            ("attn_q", &self.attn_q),
            ("attn_k", &self.attn_k),
            ("attn_v", &self.attn_v),
            ("attn_q_rot", &self.attn_q_rot),
            ("attn_k_rot", &self.attn_k_rot),
            ("attn_scores", &self.attn_scores),
            ("attn_weights", &self.attn_weights),
            ("attn_values", &self.attn_values),
            ("attn_out", &self.attn_out),
            ("attn_residual", &self.attn_residual),
            ("ffn_norm", &self.ffn_norm),
            ("ffn_gate", &self.ffn_gate),
            ("ffn_up", &self.ffn_up),
            ("ffn_act", &self.ffn_act),
            ("ffn_hidden", &self.ffn_hidden),
            ("ffn_out", &self.ffn_out),
            ("ffn_residual", &self.ffn_residual),
        ]
    }

    /// Writes every per-layer field to `<dir>/<prefix><layer>_<field>`, one
    /// value per line, plus `<dir>/<prefix>final_norm`.
    pub fn dump(&self, dir: &Path, prefix: &str) -> Result<()> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create dump directory {}", dir.display()))?;
        for layer in 0..self.num_layers() {
            for (name, array) in self.fields() {
                let path = dir.join(format!("{prefix}{layer}_{name}"));
                write_values(&path, layer_row(array, layer)?)?;
            }
        }
        write_values(&dir.join(format!("{prefix}final_norm")), &self.final_norm)?;
        log::debug!("dumped decode state to {} ({prefix}*)", dir.display());
        Ok(())
    }
}

fn write_values(path: &Path, values: &[f32]) -> Result<()> {
    let file = File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    for v in values {
        writeln!(writer, "{v}")?;
    }
    writer
        .flush()
        .with_context(|| format!("failed to write {}", path.display()))
}

pub(crate) fn layer_row(array: &Array2<f32>, layer: usize) -> Result<&[f32]> {
    let layers = array.nrows();
    if layer >= layers {
        return Err(EngineError::LayerOutOfRange { layer, layers }.into());
    }
    array
        .row(layer)
        .to_slice()
        .ok_or_else(|| EngineError::InvalidDims("decode state row is not contiguous".into()).into())
}

pub(crate) fn layer_row_mut(array: &mut Array2<f32>, layer: usize) -> Result<&mut [f32]> {
    let layers = array.nrows();
    if layer >= layers {
        return Err(EngineError::LayerOutOfRange { layer, layers }.into());
    }
    array
        .row_mut(layer)
        .into_slice()
        .ok_or_else(|| EngineError::InvalidDims("decode state row is not contiguous".into()).into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shapes_follow_dims() {
        let dims = ModelDims::STORIES_15M;
        let state = DecodeState::new(&dims).unwrap();
        assert_eq!(state.attn_q.dim(), (6, 288));
        assert_eq!(state.attn_scores.dim(), (6, 256));
        assert_eq!(state.ffn_gate.dim(), (6, 768));
        assert_eq!(state.final_norm.len(), 288);
    }

    #[test]
    fn row_helpers_check_layer() {
        let dims = ModelDims { layers: 2, ..ModelDims::STORIES_15M };
        let mut state = DecodeState::new(&dims).unwrap();
        layer_row_mut(&mut state.attn_q, 1).unwrap()[0] = 3.0;
        assert_eq!(layer_row(&state.attn_q, 1).unwrap()[0], 3.0);
        assert!(layer_row(&state.attn_q, 2).is_err());
    }

    #[test]
    fn dump_writes_one_file_per_field_and_layer() {
        let dims = ModelDims {
            hidden: 4,
            ffn: 6,
            layers: 2,
            heads: 2,
            kv_heads: 2,
            max_seq: 3,
            vocab: 7,
        };
        let mut state = DecodeState::new(&dims).unwrap();
        state.ffn_out[[1, 2]] = 0.5;
        let dir = tempfile::tempdir().unwrap();
        state.dump(dir.path(), "local_").unwrap();

        let files = std::fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(files, 2 * 18 + 1);

        let text = std::fs::read_to_string(dir.path().join("local_1_ffn_out")).unwrap();
        let values: Vec<f32> = text.lines().map(|l| l.parse().unwrap()).collect();
        assert_eq!(values, vec![0.0, 0.0, 0.5, 0.0]);
    }
}
