//! Token generation around the decode engine: embedding lookup, logits
//! projection through the tied embedding table, sampling and the token loop.

mod sampling;

use std::time::{Duration, Instant};

use anyhow::Result;
use serde::{Deserialize, Serialize};

pub use sampling::{Sampler, GREEDY_TEMPERATURE};

use crate::backend::ExecutionBackend;
use crate::cache::KvCache;
use crate::engine::DecodeEngine;
use crate::state::DecodeState;
use crate::weights::{TokenEmbeddings, Weights};

/// Beginning-of-sequence token of the Llama 2 vocabulary.
pub const BOS_TOKEN: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    /// Number of positions to decode; capped at the model's sequence length.
    pub max_steps: usize,
    /// Below [`GREEDY_TEMPERATURE`] sampling is greedy.
    pub temperature: f32,
    /// Seed for sampling; `None` draws one from the operating system.
    pub seed: Option<u64>,
    /// Token fed at position 0.
    pub bos_token: u32,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_steps: 256,
            temperature: 0.5,
            seed: None,
            bos_token: BOS_TOKEN,
        }
    }
}

/// Everything visible to the caller after one position.
pub struct StepOutput<'a> {
    pub pos: usize,
    /// Token fed at `pos`.
    pub input_token: u32,
    /// Token sampled from the logits at `pos`.
    pub token: u32,
    pub state: &'a DecodeState,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GenerationStats {
    pub tokens: usize,
    pub elapsed: Duration,
}

impl GenerationStats {
    pub fn tokens_per_second(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.tokens as f64 / secs
        } else {
            0.0
        }
    }
}

/// Owns the decode state, the cache and the logits buffer of one sequence.
pub struct Generator<'a> {
    engine: DecodeEngine<'a>,
    embeddings: &'a TokenEmbeddings,
    state: DecodeState,
    cache: KvCache,
    logits: Vec<f32>,
}

impl<'a> Generator<'a> {
    pub fn new(
        weights: &'a Weights,
        embeddings: &'a TokenEmbeddings,
        backend: &'a dyn ExecutionBackend,
    ) -> Result<Self> {
        let dims = &weights.dims;
        Ok(Self {
            engine: DecodeEngine::new(weights, backend),
            embeddings,
            state: DecodeState::new(dims)?,
            cache: KvCache::new(dims)?,
            logits: vec![0.0; dims.vocab],
        })
    }

    pub fn state(&self) -> &DecodeState {
        &self.state
    }

    pub fn cache(&self) -> &KvCache {
        &self.cache
    }

    /// Forgets every cached position so a new sequence can start at 0.
    pub fn reset(&mut self) {
        self.cache.reset();
    }

    /// Decodes `token` at `pos` and returns the vocabulary logits.
    pub fn step(&mut self, token: u32, pos: usize) -> Result<&mut [f32]> {
        let embedding = self.embeddings.lookup(token)?;
        let hidden = self
            .engine
            .decode(token, pos, embedding, &mut self.state, &mut self.cache)?;
        self.engine
            .backend()
            .matmul(&mut self.logits, hidden, self.embeddings.as_projection())?;
        Ok(&mut self.logits)
    }

    /// Runs the token loop from `config.bos_token`, calling `on_token` after
    /// every position. Starts from an empty cache.
    pub fn generate(
        &mut self,
        config: &GenerationConfig,
        mut on_token: impl FnMut(StepOutput<'_>) -> Result<()>,
    ) -> Result<GenerationStats> {
        let max_seq = self.cache.max_seq();
        let steps = config.max_steps.min(max_seq);
        if config.max_steps > max_seq {
            log::warn!(
                "max_steps {} exceeds sequence length {}, stopping at {}",
                config.max_steps,
                max_seq,
                max_seq
            );
        }

        self.reset();
        let mut sampler = Sampler::new(config.temperature, config.seed);
        let mut token = config.bos_token;
        let start = Instant::now();

        for pos in 0..steps {
            let logits = self.step(token, pos)?;
            let next = sampler.sample(logits)?;
            on_token(StepOutput {
                pos,
                input_token: token,
                token: next,
                state: &self.state,
            })?;
            token = next;
        }

        let stats = GenerationStats {
            tokens: steps,
            elapsed: start.elapsed(),
        };
        log::info!(
            "generated {} tokens in {:.3}s ({:.2} tok/s)",
            stats.tokens,
            stats.elapsed.as_secs_f64(),
            stats.tokens_per_second()
        );
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::LocalBackend;
    use crate::testing::{seeded_weights, tiny_dims};

    #[test]
    fn config_defaults_and_partial_json() {
        let config = GenerationConfig::default();
        assert_eq!(config.max_steps, 256);
        assert_eq!(config.bos_token, 1);

        let parsed: GenerationConfig = serde_json::from_str(r#"{"temperature": 0.0, "seed": 9}"#).unwrap();
        assert_eq!(parsed.temperature, 0.0);
        assert_eq!(parsed.seed, Some(9));
        assert_eq!(parsed.max_steps, 256);
    }

    #[test]
    fn step_projects_with_embedding_table() {
        let dims = tiny_dims();
        let (embeddings, weights) = seeded_weights(&dims, 5);
        let backend = LocalBackend::new();
        let mut generator = Generator::new(&weights, &embeddings, &backend).unwrap();

        let logits = generator.step(1, 0).unwrap().to_vec();
        let hidden = generator.state().final_norm.clone();
        assert_eq!(logits.len(), dims.vocab);
        for (t, &logit) in logits.iter().enumerate() {
            let row = embeddings.lookup(t as u32).unwrap();
            let expected: f32 = row.iter().zip(&hidden).map(|(a, b)| a * b).sum();
            approx::assert_relative_eq!(logit, expected, max_relative = 1e-5);
        }
    }

    #[test]
    fn generate_feeds_sampled_tokens_back() {
        let dims = tiny_dims();
        let (embeddings, weights) = seeded_weights(&dims, 8);
        let backend = LocalBackend::new();
        let mut generator = Generator::new(&weights, &embeddings, &backend).unwrap();
        let config = GenerationConfig {
            max_steps: 100,
            temperature: 0.0,
            ..Default::default()
        };

        let mut seen = Vec::new();
        let stats = generator
            .generate(&config, |step| {
                seen.push((step.pos, step.input_token, step.token));
                Ok(())
            })
            .unwrap();

        assert_eq!(stats.tokens, dims.max_seq);
        assert_eq!(seen.len(), dims.max_seq);
        assert_eq!(seen[0].1, BOS_TOKEN);
        for pair in seen.windows(2) {
            assert_eq!(pair[1].0, pair[0].0 + 1);
            assert_eq!(pair[1].1, pair[0].2);
        }
        assert_eq!(generator.cache().len(0), dims.max_seq);
    }

    #[test]
    fn greedy_generation_is_repeatable() {
        let dims = tiny_dims();
        let (embeddings, weights) = seeded_weights(&dims, 21);
        let backend = LocalBackend::new();
        let mut generator = Generator::new(&weights, &embeddings, &backend).unwrap();
        let config = GenerationConfig {
            temperature: 0.0,
            ..Default::default()
        };

        let mut run = || {
            let mut tokens = Vec::new();
            generator
                .generate(&config, |step| {
                    tokens.push(step.token);
                    Ok(())
                })
                .unwrap();
            tokens
        };
        let first = run();
        let second = run();
        assert_eq!(first, second);
    }

    #[test]
    fn callback_error_stops_generation() {
        let dims = tiny_dims();
        let (embeddings, weights) = seeded_weights(&dims, 2);
        let backend = LocalBackend::new();
        let mut generator = Generator::new(&weights, &embeddings, &backend).unwrap();

        let mut calls = 0;
        let result = generator.generate(&GenerationConfig::default(), |_| {
            calls += 1;
            anyhow::bail!("stop")
        });
        assert!(result.is_err());
        assert_eq!(calls, 1);
    }
}
