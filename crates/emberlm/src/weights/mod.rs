//! Model parameters and the weight file loader.
//!
//! A weight file is a 28-byte prefix followed by little-endian `f32`s in a
//! fixed order: token embeddings, attention RMS weights, Q/K/V/O
//! projections, FFN RMS weights, gate/down/up projections, the final RMS
//! weight and the cosine/sine rotary tables. There is no magic number; the
//! exact file length is the only integrity check.

use std::path::Path;

use anyhow::{Context, Result};
use memmap2::Mmap;
use ndarray::{Array1, Array2, Array3, ArrayView2, Axis};

use crate::dims::{ModelDims, WEIGHT_FILE_HEADER_BYTES};
use crate::error::EngineError;
use crate::ops::rotary_tables;
use crate::state::layer_row;

/// Rotary base frequency used by [`Weights::from_fn`].
pub const ROPE_THETA: f32 = 10_000.0;

/// The token embedding table, `[vocab, hidden]`.
///
/// Kept apart from [`Weights`]: the caller owns embedding lookup and reuses
/// the table as the tied output projection.
#[derive(Clone)]
pub struct TokenEmbeddings {
    table: Array2<f32>,
}

impl TokenEmbeddings {
    pub fn new(table: Array2<f32>, dims: &ModelDims) -> Result<Self> {
        check_shape("token_embeddings", table.shape(), &[dims.vocab, dims.hidden])?;
        Ok(Self { table })
    }

    pub fn vocab_size(&self) -> usize {
        self.table.nrows()
    }

    pub fn hidden_size(&self) -> usize {
        self.table.ncols()
    }

    /// Embedding row of `token`.
    pub fn lookup(&self, token: u32) -> Result<&[f32]> {
        let vocab = self.vocab_size();
        if token as usize >= vocab {
            return Err(EngineError::TokenOutOfRange { token, vocab }.into());
        }
        layer_row(&self.table, token as usize)
    }

    /// The table viewed as a `[vocab, hidden]` projection matrix.
    pub fn as_projection(&self) -> ArrayView2<'_, f32> {
        self.table.view()
    }
}

/// Immutable per-layer and global parameters.
#[derive(Clone)]
pub struct Weights {
    pub dims: ModelDims,
    /// `[layers, hidden]`
    pub rms_attn: Array2<f32>,
    /// `[layers, hidden, hidden]`
    pub wq: Array3<f32>,
    pub wk: Array3<f32>,
    pub wv: Array3<f32>,
    pub wo: Array3<f32>,
    /// `[layers, hidden]`
    pub rms_ffn: Array2<f32>,
    /// `[layers, ffn, hidden]`
    pub w_gate: Array3<f32>,
    /// `[layers, hidden, ffn]`
    pub w_down: Array3<f32>,
    /// `[layers, ffn, hidden]`
    pub w_up: Array3<f32>,
    /// `[hidden]`
    pub rms_final: Array1<f32>,
    /// `[max_seq, head_dim / 2]`
    pub rope_cos: Array2<f32>,
    pub rope_sin: Array2<f32>,
}

fn check_shape(name: &str, actual: &[usize], expected: &[usize]) -> Result<()> {
    if actual != expected {
        return Err(EngineError::InvalidDims(format!(
            "{name} has shape {actual:?}, expected {expected:?}"
        ))
        .into());
    }
    Ok(())
}

impl Weights {
    /// Checks every tensor against `self.dims`.
    pub fn validate(&self) -> Result<()> {
        let d = &self.dims;
        d.validate()?;
        let (l, h, f) = (d.layers, d.hidden, d.ffn);
        check_shape("rms_attn", self.rms_attn.shape(), &[l, h])?;
        for (name, w) in [("wq", &self.wq), ("wk", &self.wk), ("wv", &self.wv), ("wo", &self.wo)] {
            check_shape(name, w.shape(), &[l, h, h])?;
        }
        check_shape("rms_ffn", self.rms_ffn.shape(), &[l, h])?;
        check_shape("w_gate", self.w_gate.shape(), &[l, f, h])?;
        check_shape("w_down", self.w_down.shape(), &[l, h, f])?;
        check_shape("w_up", self.w_up.shape(), &[l, f, h])?;
        check_shape("rms_final", self.rms_final.shape(), &[h])?;
        check_shape("rope_cos", self.rope_cos.shape(), &[d.max_seq, d.rotary_width()])?;
        check_shape("rope_sin", self.rope_sin.shape(), &[d.max_seq, d.rotary_width()])?;
        Ok(())
    }

    /// Builds weights whose element `i` of tensor `name` is `f(name, i)`.
    ///
    /// The rotary tables are the standard ones for [`ROPE_THETA`]. Also
    /// returns a `[vocab, hidden]` embedding table built the same way under
    /// the name `"token_embeddings"`.
    pub fn from_fn(
        dims: &ModelDims,
        mut f: impl FnMut(&str, usize) -> f32,
    ) -> Result<(TokenEmbeddings, Weights)> {
        dims.validate()?;
        let (l, h, ff) = (dims.layers, dims.hidden, dims.ffn);

        let mut gen2 = |name: &str, shape: (usize, usize)| {
            let mut i = 0;
            Array2::from_shape_simple_fn(shape, || {
                i += 1;
                f(name, i - 1)
            })
        };
        let embeddings = gen2("token_embeddings", (dims.vocab, h));
        let rms_attn = gen2("rms_attn", (l, h));
        let rms_ffn = gen2("rms_ffn", (l, h));
        let rms_final = gen2("rms_final", (1, h)).index_axis_move(Axis(0), 0);

        let mut gen3 = |name: &str, shape: (usize, usize, usize)| {
            let mut i = 0;
            Array3::from_shape_simple_fn(shape, || {
                i += 1;
                f(name, i - 1)
            })
        };
        let wq = gen3("wq", (l, h, h));
        let wk = gen3("wk", (l, h, h));
        let wv = gen3("wv", (l, h, h));
        let wo = gen3("wo", (l, h, h));
        let w_gate = gen3("w_gate", (l, ff, h));
        let w_down = gen3("w_down", (l, h, ff));
        let w_up = gen3("w_up", (l, ff, h));

        let (rope_cos, rope_sin) = rotary_tables(dims.max_seq, dims.head_dim(), ROPE_THETA);

        let weights = Weights {
            dims: *dims,
            rms_attn,
            wq,
            wk,
            wv,
            wo,
            rms_ffn,
            w_gate,
            w_down,
            w_up,
            rms_final,
            rope_cos,
            rope_sin,
        };
        weights.validate()?;
        Ok((TokenEmbeddings::new(embeddings, dims)?, weights))
    }

    /// Every weight equal to `value`, with identity rotary tables
    /// (`cos = 1`, `sin = 0`).
    pub fn constant(dims: &ModelDims, value: f32) -> Result<(TokenEmbeddings, Weights)> {
        let (embeddings, mut weights) = Self::from_fn(dims, |_, _| value)?;
        weights.rope_cos.fill(1.0);
        weights.rope_sin.fill(0.0);
        Ok((embeddings, weights))
    }

    /// Memory-maps a weight file and copies its tensors out.
    pub fn load(path: &Path, dims: &ModelDims) -> Result<(TokenEmbeddings, Weights)> {
        dims.validate()?;
        let file = std::fs::File::open(path)
            .with_context(|| format!("failed to open weight file {}", path.display()))?;
        // SAFETY: the mapping is read-only and dropped before this function returns.
        let mmap = unsafe { Mmap::map(&file) }
            .with_context(|| format!("failed to map weight file {}", path.display()))?;

        let expected = dims.weight_file_bytes();
        if mmap.len() != expected {
            return Err(EngineError::CorruptFile {
                path: path.to_path_buf(),
                reason: format!("expected {} bytes, found {}", expected, mmap.len()),
            }
            .into());
        }

        check_header(&mmap[..WEIGHT_FILE_HEADER_BYTES], dims);

        let mut reader = TensorReader::new(&mmap[WEIGHT_FILE_HEADER_BYTES..]);
        let (l, h, f) = (dims.layers, dims.hidden, dims.ffn);
        let rw = dims.rotary_width();

        let embeddings = reader.array2((dims.vocab, h))?;
        let rms_attn = reader.array2((l, h))?;
        let wq = reader.array3((l, h, h))?;
        let wk = reader.array3((l, h, h))?;
        let wv = reader.array3((l, h, h))?;
        let wo = reader.array3((l, h, h))?;
        let rms_ffn = reader.array2((l, h))?;
        let w_gate = reader.array3((l, f, h))?;
        let w_down = reader.array3((l, h, f))?;
        let w_up = reader.array3((l, f, h))?;
        let rms_final = Array1::from(reader.take(h)?);
        let rope_cos = reader.array2((dims.max_seq, rw))?;
        let rope_sin = reader.array2((dims.max_seq, rw))?;

        let weights = Weights {
            dims: *dims,
            rms_attn,
            wq,
            wk,
            wv,
            wo,
            rms_ffn,
            w_gate,
            w_down,
            w_up,
            rms_final,
            rope_cos,
            rope_sin,
        };
        weights.validate()?;
        log::info!(
            "loaded {} weights ({:.2}MB) from {}",
            dims.weight_file_elements(),
            expected as f64 / 1_048_576.0,
            path.display()
        );
        Ok((TokenEmbeddings::new(embeddings, dims)?, weights))
    }

    /// Cosine and sine rows for `pos`.
    pub fn rope_row(&self, pos: usize) -> Result<(&[f32], &[f32])> {
        if pos >= self.rope_cos.nrows() {
            return Err(EngineError::PositionOutOfRange {
                pos,
                max_seq: self.rope_cos.nrows(),
            }
            .into());
        }
        Ok((layer_row(&self.rope_cos, pos)?, layer_row(&self.rope_sin, pos)?))
    }
}

/// Projection matrix of one layer, e.g. `layer_matrix(&weights.wq, 0)`.
pub fn layer_matrix(tensor: &Array3<f32>, layer: usize) -> Result<ArrayView2<'_, f32>> {
    let layers = tensor.shape()[0];
    if layer >= layers {
        return Err(EngineError::LayerOutOfRange { layer, layers }.into());
    }
    Ok(tensor.index_axis(Axis(0), layer))
}

/// The prefix carries the exporter's config as seven `i32`s. It is not
/// trusted; a mismatch only warns.
fn check_header(header: &[u8], dims: &ModelDims) {
    let fields: Vec<i32> = header
        .chunks_exact(4)
        .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();
    log::debug!("weight file header: {:?}", fields);

    let expected = [
        dims.hidden,
        dims.ffn,
        dims.layers,
        dims.heads,
        dims.kv_heads,
        dims.vocab,
        dims.max_seq,
    ];
    // A negative vocabulary size marks an untied classifier in some exporters.
    let matches = fields.len() == expected.len()
        && fields
            .iter()
            .zip(expected)
            .all(|(&got, want)| got.unsigned_abs() as usize == want);
    if !matches {
        log::warn!(
            "weight file header {:?} does not match model dims {:?}; reading with model dims",
            fields,
            expected
        );
    }
}

struct TensorReader<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> TensorReader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, offset: 0 }
    }

    fn take(&mut self, count: usize) -> Result<Vec<f32>> {
        let end = self.offset + count * 4;
        let chunk = self.bytes.get(self.offset..end).ok_or_else(|| {
            EngineError::InvalidDims(format!(
                "weight data ends at byte {}, need {}",
                self.bytes.len(),
                end
            ))
        })?;
        self.offset = end;
        Ok(chunk
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect())
    }

    fn array2(&mut self, shape: (usize, usize)) -> Result<Array2<f32>> {
        let data = self.take(shape.0 * shape.1)?;
        Ok(Array2::from_shape_vec(shape, data)?)
    }

    fn array3(&mut self, shape: (usize, usize, usize)) -> Result<Array3<f32>> {
        let data = self.take(shape.0 * shape.1 * shape.2)?;
        Ok(Array3::from_shape_vec(shape, data)?)
    }
}
