use anyhow::Result;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::ops::{argmax, softmax_in_place};

/// Temperatures below this are treated as greedy decoding.
pub const GREEDY_TEMPERATURE: f32 = 1e-5;

/// Picks the next token from a logits vector.
pub struct Sampler {
    temperature: f32,
    rng: StdRng,
}

impl Sampler {
    /// `seed = None` draws the seed from the operating system.
    pub fn new(temperature: f32, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self { temperature, rng }
    }

    pub fn is_greedy(&self) -> bool {
        self.temperature < GREEDY_TEMPERATURE
    }

    /// Samples a token id. Non-greedy sampling rewrites `logits` into
    /// probabilities in place.
    pub fn sample(&mut self, logits: &mut [f32]) -> Result<u32> {
        if self.is_greedy() {
            return Ok(argmax(logits)? as u32);
        }
        let inv_temp = 1.0 / self.temperature;
        logits.iter_mut().for_each(|l| *l *= inv_temp);
        let len = logits.len();
        softmax_in_place(logits, len)?;
        let r: f32 = self.rng.gen();
        Ok(sample_cdf(logits, r) as u32)
    }
}

/// First index whose cumulative probability exceeds `r`; the last index if
/// rounding leaves the total short of `r`.
fn sample_cdf(probs: &[f32], r: f32) -> usize {
    let mut cdf = 0.0f32;
    for (i, &p) in probs.iter().enumerate() {
        cdf += p;
        if r < cdf {
            return i;
        }
    }
    probs.len().saturating_sub(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn greedy_picks_argmax() {
        let mut sampler = Sampler::new(0.0, Some(1));
        let mut logits = [0.1, 2.5, -1.0, 2.4];
        assert_eq!(sampler.sample(&mut logits).unwrap(), 1);
        // Logits are left untouched.
        assert_eq!(logits, [0.1, 2.5, -1.0, 2.4]);
    }

    #[test]
    fn cdf_walks_cumulative_probabilities() {
        let probs = [0.2, 0.5, 0.3];
        assert_eq!(sample_cdf(&probs, 0.0), 0);
        assert_eq!(sample_cdf(&probs, 0.19), 0);
        assert_eq!(sample_cdf(&probs, 0.2), 1);
        assert_eq!(sample_cdf(&probs, 0.69), 1);
        assert_eq!(sample_cdf(&probs, 0.95), 2);
        assert_eq!(sample_cdf(&[0.3, 0.3], 0.9999), 1);
    }

    #[test]
    fn seeded_sampling_is_reproducible() {
        let logits: Vec<f32> = (0..50).map(|i| (i as f32 * 0.37).sin()).collect();
        let draw = |seed| {
            let mut sampler = Sampler::new(0.8, Some(seed));
            (0..20)
                .map(|_| sampler.sample(&mut logits.clone()).unwrap())
                .collect::<Vec<_>>()
        };
        assert_eq!(draw(42), draw(42));
    }

    #[test]
    fn low_temperature_concentrates_on_the_peak() {
        let mut sampler = Sampler::new(0.01, Some(3));
        for _ in 0..10 {
            let mut logits = [0.0, 1.0, 0.5];
            assert_eq!(sampler.sample(&mut logits).unwrap(), 1);
        }
    }

    #[test]
    fn sampling_empty_logits_fails() {
        let mut sampler = Sampler::new(1.0, Some(0));
        assert!(sampler.sample(&mut []).is_err());
        let mut greedy = Sampler::new(0.0, Some(0));
        assert!(greedy.sample(&mut []).is_err());
    }
}
