//! Append-only key/value cache for single-sequence decoding.

use anyhow::Result;
use ndarray::{s, Array3, ArrayView1, ArrayView2};

use crate::dims::ModelDims;
use crate::error::{ensure_len, EngineError};

/// Rotated keys and raw values, one row per `(layer, position)`.
///
/// Every layer is written strictly in position order: slot `(layer, pos)`
/// can only be written when positions `0..pos` of that layer already are,
/// and never twice within one run. Reads see the causal window `[0, pos]`.
#[derive(Clone)]
pub struct KvCache {
    keys: Array3<f32>,
    values: Array3<f32>,
    written: Vec<usize>,
}

impl KvCache {
    pub fn new(dims: &ModelDims) -> Result<Self> {
        dims.validate()?;
        let shape = (dims.layers, dims.max_seq, dims.hidden);
        Ok(Self {
            keys: Array3::zeros(shape),
            values: Array3::zeros(shape),
            written: vec![0; dims.layers],
        })
    }

    pub fn num_layers(&self) -> usize {
        self.keys.shape()[0]
    }

    pub fn max_seq(&self) -> usize {
        self.keys.shape()[1]
    }

    pub fn hidden(&self) -> usize {
        self.keys.shape()[2]
    }

    /// Number of positions written for `layer`.
    pub fn len(&self, layer: usize) -> usize {
        self.written.get(layer).copied().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.written.iter().all(|&n| n == 0)
    }

    fn check_layer(&self, layer: usize) -> Result<()> {
        if layer >= self.num_layers() {
            return Err(EngineError::LayerOutOfRange {
                layer,
                layers: self.num_layers(),
            }
            .into());
        }
        Ok(())
    }

    fn check_pos(&self, pos: usize) -> Result<()> {
        if pos >= self.max_seq() {
            return Err(EngineError::PositionOutOfRange {
                pos,
                max_seq: self.max_seq(),
            }
            .into());
        }
        Ok(())
    }

    /// Stores the key and value for `(layer, pos)`.
    pub fn write(&mut self, layer: usize, pos: usize, key: &[f32], value: &[f32]) -> Result<()> {
        self.check_layer(layer)?;
        self.check_pos(pos)?;
        ensure_len("kv_cache.write", "key", key.len(), self.hidden())?;
        ensure_len("kv_cache.write", "value", value.len(), self.hidden())?;

        let written = self.written[layer];
        if pos < written {
            return Err(EngineError::CacheSlotWritten { layer, pos }.into());
        }
        if pos > written {
            return Err(EngineError::CacheSlotMissing {
                layer,
                pos: written,
            }
            .into());
        }

        self.keys
            .slice_mut(s![layer, pos, ..])
            .assign(&ArrayView1::from(key));
        self.values
            .slice_mut(s![layer, pos, ..])
            .assign(&ArrayView1::from(value));
        self.written[layer] = pos + 1;
        Ok(())
    }

    /// Keys and values of positions `0..=pos`, shaped `[pos + 1, hidden]`.
    pub fn read_range(&self, layer: usize, pos: usize) -> Result<(ArrayView2<'_, f32>, ArrayView2<'_, f32>)> {
        self.check_layer(layer)?;
        self.check_pos(pos)?;
        if pos >= self.written[layer] {
            return Err(EngineError::CacheSlotMissing {
                layer,
                pos: self.written[layer],
            }
            .into());
        }
        let window = s![layer, 0..=pos, ..];
        Ok((self.keys.slice(window), self.values.slice(window)))
    }

    /// Starts a new run. Contents are kept but every slot becomes writable.
    pub fn reset(&mut self) {
        self.written.iter_mut().for_each(|n| *n = 0);
    }
}
