use approx::assert_relative_eq;

use super::*;
use crate::backend::LocalBackend;
use crate::dims::ModelDims;
use crate::testing::{seeded_weights, tiny_dims};
use crate::weights::TokenEmbeddings;

fn run(
    weights: &Weights,
    embeddings: &TokenEmbeddings,
    tokens: &[u32],
) -> (Vec<Vec<f32>>, DecodeState, KvCache) {
    let backend = LocalBackend::new();
    let engine = DecodeEngine::new(weights, &backend);
    let mut state = DecodeState::new(&weights.dims).unwrap();
    let mut cache = KvCache::new(&weights.dims).unwrap();
    let mut outputs = Vec::new();
    for (pos, &token) in tokens.iter().enumerate() {
        let embedding = embeddings.lookup(token).unwrap();
        let out = engine
            .decode(token, pos, embedding, &mut state, &mut cache)
            .unwrap();
        outputs.push(out.to_vec());
    }
    (outputs, state, cache)
}

#[test]
fn repeated_runs_are_bit_identical() {
    let dims = tiny_dims();
    let (embeddings, weights) = seeded_weights(&dims, 7);
    let tokens = [1, 4, 4, 9, 0];

    let (first, _, _) = run(&weights, &embeddings, &tokens);
    let (second, _, _) = run(&weights, &embeddings, &tokens);
    for (a, b) in first.iter().zip(&second) {
        let a_bits: Vec<u32> = a.iter().map(|v| v.to_bits()).collect();
        let b_bits: Vec<u32> = b.iter().map(|v| v.to_bits()).collect();
        assert_eq!(a_bits, b_bits);
    }
}

#[test]
fn attention_weights_sum_to_one_over_causal_window() {
    let dims = tiny_dims();
    let (embeddings, weights) = seeded_weights(&dims, 11);
    let backend = LocalBackend::new();
    let engine = DecodeEngine::new(&weights, &backend);
    let mut state = DecodeState::new(&dims).unwrap();
    let mut cache = KvCache::new(&dims).unwrap();

    for pos in 0..dims.max_seq {
        let token = (pos * 3 % dims.vocab) as u32;
        engine
            .decode(token, pos, embeddings.lookup(token).unwrap(), &mut state, &mut cache)
            .unwrap();
        for layer in 0..dims.layers {
            let weights_row = state.attn_weights.row(layer);
            let sum: f32 = weights_row.iter().take(pos + 1).sum();
            assert_relative_eq!(sum, 1.0, epsilon = 1e-5);
        }
    }
}

#[test]
fn cache_holds_rotated_keys_and_raw_values() {
    let dims = tiny_dims();
    let (embeddings, weights) = seeded_weights(&dims, 3);
    let backend = LocalBackend::new();
    let engine = DecodeEngine::new(&weights, &backend);
    let mut state = DecodeState::new(&dims).unwrap();
    let mut cache = KvCache::new(&dims).unwrap();

    let mut expected_keys = vec![Vec::new(); dims.layers];
    let mut expected_values = vec![Vec::new(); dims.layers];
    for (pos, token) in [2u32, 5, 7].into_iter().enumerate() {
        engine
            .decode(token, pos, embeddings.lookup(token).unwrap(), &mut state, &mut cache)
            .unwrap();
        for layer in 0..dims.layers {
            expected_keys[layer].push(state.attn_k_rot.row(layer).to_vec());
            expected_values[layer].push(state.attn_v.row(layer).to_vec());
        }

        // Earlier rows stay untouched by later steps.
        for layer in 0..dims.layers {
            let (keys, values) = cache.read_range(layer, pos).unwrap();
            for t in 0..=pos {
                assert_eq!(keys.row(t).to_vec(), expected_keys[layer][t]);
                assert_eq!(values.row(t).to_vec(), expected_values[layer][t]);
            }
        }
    }
}

#[test]
fn identical_positions_attend_uniformly() {
    let dims = tiny_dims();
    let (embeddings, weights) = Weights::constant(&dims, 0.1).unwrap();
    let (_, state, _) = run(&weights, &embeddings, &[3, 3]);
    for layer in 0..dims.layers {
        assert_relative_eq!(state.attn_weights[[layer, 0]], 0.5, epsilon = 1e-6);
        assert_relative_eq!(state.attn_weights[[layer, 1]], 0.5, epsilon = 1e-6);
    }
}

#[test]
fn single_layer_all_ones_matches_closed_form() {
    let dims = ModelDims {
        hidden: 4,
        ffn: 6,
        layers: 1,
        heads: 2,
        kv_heads: 2,
        max_seq: 2,
        vocab: 3,
    };
    let (embeddings, weights) = Weights::constant(&dims, 1.0).unwrap();
    let (outputs, state, _) = run(&weights, &embeddings, &[0]);

    let eps = 1e-5f32;
    let (h, f) = (dims.hidden as f32, dims.ffn as f32);
    // A constant vector c normalizes to c / sqrt(c^2 + eps).
    let norm = |c: f32| c / (c * c + eps).sqrt();

    let xn = norm(1.0);
    let v = h * xn;
    // One position: the softmax weight is 1 and the head output is v.
    let attn_residual = 1.0 + h * v;
    let g = h * norm(attn_residual);
    let silu = g / (1.0 + (-g).exp());
    let ffn_residual = attn_residual + f * silu * g;
    let expected = norm(ffn_residual);

    assert_relative_eq!(state.attn_weights[[0, 0]], 1.0);
    for &a in state.attn_residual.row(0).iter() {
        assert_relative_eq!(a, attn_residual, max_relative = 1e-5);
    }
    for &r in state.ffn_residual.row(0).iter() {
        assert_relative_eq!(r, ffn_residual, max_relative = 1e-5);
    }
    for &o in &outputs[0] {
        assert_relative_eq!(o, expected, max_relative = 1e-5);
    }
}

#[test]
fn rejects_position_past_capacity() {
    let dims = tiny_dims();
    let (embeddings, weights) = seeded_weights(&dims, 1);
    let backend = LocalBackend::new();
    let mut state = DecodeState::new(&dims).unwrap();
    let mut cache = KvCache::new(&dims).unwrap();

    let err = decode(
        0,
        dims.max_seq,
        embeddings.lookup(0).unwrap(),
        &mut cache,
        &weights,
        &backend,
        &mut state,
    )
    .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<EngineError>(),
        Some(EngineError::PositionOutOfRange { .. })
    ));
}

#[test]
fn rejects_skipped_position() {
    let dims = tiny_dims();
    let (embeddings, weights) = seeded_weights(&dims, 1);
    let backend = LocalBackend::new();
    let engine = DecodeEngine::new(&weights, &backend);
    let mut state = DecodeState::new(&dims).unwrap();
    let mut cache = KvCache::new(&dims).unwrap();

    let err = engine
        .decode(0, 1, embeddings.lookup(0).unwrap(), &mut state, &mut cache)
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<EngineError>(),
        Some(EngineError::CacheSlotMissing { layer: 0, pos: 0 })
    ));
}

#[test]
fn rejects_wrong_embedding_length() {
    let dims = tiny_dims();
    let (_, weights) = seeded_weights(&dims, 1);
    let backend = LocalBackend::new();
    let engine = DecodeEngine::new(&weights, &backend);
    let mut state = DecodeState::new(&dims).unwrap();
    let mut cache = KvCache::new(&dims).unwrap();

    let err = engine
        .decode(0, 0, &[0.0; 7], &mut state, &mut cache)
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<EngineError>(),
        Some(EngineError::ShapeMismatch { .. })
    ));
    assert!(cache.is_empty());
}

#[test]
fn rejects_state_for_other_dims() {
    let dims = tiny_dims();
    let (embeddings, weights) = seeded_weights(&dims, 1);
    let backend = LocalBackend::new();
    let engine = DecodeEngine::new(&weights, &backend);
    let other = ModelDims { layers: 3, ..dims };
    let mut state = DecodeState::new(&other).unwrap();
    let mut cache = KvCache::new(&dims).unwrap();

    assert!(engine
        .decode(0, 0, embeddings.lookup(0).unwrap(), &mut state, &mut cache)
        .is_err());
}
