//! Fixed-shape Llama-style decode engine.
//!
//! One token at a time flows through every layer of a small transformer
//! ([`engine::DecodeEngine`]), with each primitive executed by an
//! [`backend::ExecutionBackend`]: either the local tensor math library or a
//! `wgpu` compute device.

pub mod accelerator;
pub mod backend;
pub mod cache;
pub mod dims;
pub mod engine;
pub mod error;
pub mod generation;
pub mod ops;
pub mod state;
pub mod vocab;
pub mod weights;

pub use accelerator::{AcceleratorBackend, AcceleratorConfig, AcceleratorContext};
pub use backend::{BackendKind, ExecutionBackend, LocalBackend};
pub use cache::KvCache;
pub use dims::ModelDims;
pub use engine::{decode, DecodeEngine};
pub use error::EngineError;
pub use generation::{GenerationConfig, GenerationStats, Generator, Sampler, StepOutput};
pub use state::DecodeState;
pub use vocab::Vocab;
pub use weights::{TokenEmbeddings, Weights};

pub mod prelude {
    pub use crate::backend::{BackendKind, ExecutionBackend, LocalBackend};
    pub use crate::cache::KvCache;
    pub use crate::dims::ModelDims;
    pub use crate::engine::DecodeEngine;
    pub use crate::generation::{GenerationConfig, Generator};
    pub use crate::state::DecodeState;
    pub use crate::weights::{TokenEmbeddings, Weights};
}

#[cfg(test)]
mod testing;
