use anyhow::Result;
use ndarray::Array2;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::*;
use crate::backend::LocalBackend;
use crate::cache::KvCache;
use crate::engine::DecodeEngine;
use crate::ops::rotary_tables;
use crate::state::DecodeState;
use crate::testing::{assert_close, seeded_weights, tiny_dims};

const TOL: f32 = 1e-4;

/// `None` when the machine has no usable adapter.
async fn get_test_backend(dims: &ModelDims) -> Option<AcceleratorBackend> {
    let _ = env_logger::builder().is_test(true).try_init();
    match AcceleratorBackend::new(&AcceleratorConfig::default(), dims).await {
        Ok(backend) => Some(backend),
        Err(e) => {
            log::warn!("skipping accelerator test: {e:#}");
            None
        }
    }
}

fn random_vec(rng: &mut StdRng, len: usize) -> Vec<f32> {
    (0..len).map(|_| rng.gen_range(-1.0..1.0)).collect()
}

fn random_matrix(rng: &mut StdRng, rows: usize, cols: usize) -> Array2<f32> {
    Array2::from_shape_fn((rows, cols), |_| rng.gen_range(-1.0..1.0))
}

#[tokio::test]
async fn test_matmul_parity() -> Result<()> {
    let dims = tiny_dims();
    let Some(gpu) = get_test_backend(&dims).await else {
        return Ok(());
    };
    let cpu = LocalBackend::new();
    let mut rng = StdRng::seed_from_u64(1);

    for (rows, cols) in [(dims.hidden, dims.hidden), (dims.ffn, dims.hidden), (dims.hidden, dims.ffn), (dims.vocab, dims.hidden)] {
        let weight = random_matrix(&mut rng, rows, cols);
        let input = random_vec(&mut rng, cols);
        let mut expected = vec![0.0; rows];
        let mut actual = vec![0.0; rows];
        cpu.matmul(&mut expected, &input, weight.view())?;
        gpu.matmul(&mut actual, &input, weight.view())?;
        assert_close(&actual, &expected, TOL);
    }
    Ok(())
}

#[tokio::test]
async fn test_matmul_transposed_view_is_staged_densely() -> Result<()> {
    let dims = tiny_dims();
    let Some(gpu) = get_test_backend(&dims).await else {
        return Ok(());
    };
    let cpu = LocalBackend::new();
    let mut rng = StdRng::seed_from_u64(2);
    let weight = random_matrix(&mut rng, dims.hidden, dims.ffn);
    let input = random_vec(&mut rng, dims.hidden);

    let mut expected = vec![0.0; dims.ffn];
    let mut actual = vec![0.0; dims.ffn];
    cpu.matmul(&mut expected, &input, weight.t())?;
    gpu.matmul(&mut actual, &input, weight.t())?;
    assert_close(&actual, &expected, TOL);
    Ok(())
}

#[tokio::test]
async fn test_elementwise_parity() -> Result<()> {
    let dims = tiny_dims();
    let Some(gpu) = get_test_backend(&dims).await else {
        return Ok(());
    };
    let cpu = LocalBackend::new();
    let mut rng = StdRng::seed_from_u64(3);
    let lhs = random_vec(&mut rng, dims.ffn);
    let rhs = random_vec(&mut rng, dims.ffn);
    let mut expected = vec![0.0; dims.ffn];
    let mut actual = vec![0.0; dims.ffn];

    cpu.add(&mut expected, &lhs, &rhs)?;
    gpu.add(&mut actual, &lhs, &rhs)?;
    assert_close(&actual, &expected, TOL);

    cpu.mul(&mut expected, &lhs, &rhs)?;
    gpu.mul(&mut actual, &lhs, &rhs)?;
    assert_close(&actual, &expected, TOL);

    cpu.scale(&mut expected, &lhs, 0.375)?;
    gpu.scale(&mut actual, &lhs, 0.375)?;
    assert_close(&actual, &expected, TOL);

    cpu.silu(&mut expected, &lhs)?;
    gpu.silu(&mut actual, &lhs)?;
    assert_close(&actual, &expected, TOL);
    Ok(())
}

#[tokio::test]
async fn test_rms_norm_parity() -> Result<()> {
    let dims = tiny_dims();
    let Some(gpu) = get_test_backend(&dims).await else {
        return Ok(());
    };
    let cpu = LocalBackend::new();
    let mut rng = StdRng::seed_from_u64(4);
    let input = random_vec(&mut rng, dims.hidden);
    let weight = random_vec(&mut rng, dims.hidden);
    let mut expected = vec![0.0; dims.hidden];
    let mut actual = vec![0.0; dims.hidden];

    cpu.rms_norm(&mut expected, &input, &weight)?;
    gpu.rms_norm(&mut actual, &input, &weight)?;
    assert_close(&actual, &expected, TOL);

    // Zero input stays finite.
    let zeros = vec![0.0; dims.hidden];
    gpu.rms_norm(&mut actual, &zeros, &weight)?;
    assert!(actual.iter().all(|v| *v == 0.0));
    Ok(())
}

#[tokio::test]
async fn test_softmax_prefix_parity() -> Result<()> {
    let dims = tiny_dims();
    let Some(gpu) = get_test_backend(&dims).await else {
        return Ok(());
    };
    let cpu = LocalBackend::new();
    let mut rng = StdRng::seed_from_u64(5);
    let input: Vec<f32> = random_vec(&mut rng, dims.vocab).iter().map(|v| v * 20.0).collect();

    for len in [1, 3, dims.vocab] {
        let mut expected = vec![-7.0; dims.vocab];
        let mut actual = vec![-7.0; dims.vocab];
        cpu.softmax(&mut expected, &input, len)?;
        gpu.softmax(&mut actual, &input, len)?;
        assert_close(&actual, &expected, TOL);
        // The tail past the prefix is not written.
        assert!(actual[len..].iter().all(|v| *v == -7.0));
    }
    Ok(())
}

#[tokio::test]
async fn test_rope_touches_only_its_head() -> Result<()> {
    let dims = tiny_dims();
    let Some(gpu) = get_test_backend(&dims).await else {
        return Ok(());
    };
    let cpu = LocalBackend::new();
    let mut rng = StdRng::seed_from_u64(6);
    let head_dim = dims.head_dim();
    let (cos, sin) = rotary_tables(dims.max_seq, head_dim, 10_000.0);
    let q = random_vec(&mut rng, dims.hidden);
    let k = random_vec(&mut rng, dims.hidden);
    let pos = 3;
    let cos_row = cos.row(pos).to_vec();
    let sin_row = sin.row(pos).to_vec();

    for h in 0..dims.heads {
        let head = HeadSpan::new(h, head_dim);
        let mut q_expected = vec![9.0; dims.hidden];
        let mut k_expected = vec![9.0; dims.hidden];
        let mut q_actual = vec![9.0; dims.hidden];
        let mut k_actual = vec![9.0; dims.hidden];
        cpu.rope(&mut q_expected, &mut k_expected, &q, &k, &cos_row, &sin_row, head)?;
        gpu.rope(&mut q_actual, &mut k_actual, &q, &k, &cos_row, &sin_row, head)?;
        assert_close(&q_actual, &q_expected, TOL);
        assert_close(&k_actual, &k_expected, TOL);
        for i in (0..dims.hidden).filter(|i| !head.range().contains(i)) {
            assert_eq!(q_actual[i], 9.0);
            assert_eq!(k_actual[i], 9.0);
        }
    }
    Ok(())
}

#[tokio::test]
async fn test_attention_parity() -> Result<()> {
    let dims = tiny_dims();
    let Some(gpu) = get_test_backend(&dims).await else {
        return Ok(());
    };
    let cpu = LocalBackend::new();
    let mut rng = StdRng::seed_from_u64(7);
    let window = 4;
    let keys = random_matrix(&mut rng, window, dims.hidden);
    let values = random_matrix(&mut rng, window, dims.hidden);
    let query = random_vec(&mut rng, dims.hidden);
    let weights = random_vec(&mut rng, window);

    for h in 0..dims.heads {
        let head = HeadSpan::new(h, dims.head_dim());

        let mut expected = vec![0.0; window];
        let mut actual = vec![0.0; window];
        cpu.attention_scores(&mut expected, &query, keys.view(), head)?;
        gpu.attention_scores(&mut actual, &query, keys.view(), head)?;
        assert_close(&actual, &expected, TOL);

        let mut expected = vec![0.0; head.dim];
        let mut actual = vec![0.0; head.dim];
        cpu.attention_values(&mut expected, &weights, values.view(), head)?;
        gpu.attention_values(&mut actual, &weights, values.view(), head)?;
        assert_close(&actual, &expected, TOL);
    }
    Ok(())
}

#[tokio::test]
async fn test_shape_errors_fail_before_dispatch() -> Result<()> {
    let dims = tiny_dims();
    let Some(gpu) = get_test_backend(&dims).await else {
        return Ok(());
    };
    let weight = Array2::<f32>::zeros((dims.hidden, dims.hidden));
    let mut out = vec![0.0; dims.hidden];
    let err = gpu.matmul(&mut out, &[0.0; 3], weight.view()).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<EngineError>(),
        Some(EngineError::ShapeMismatch { .. })
    ));
    assert!(gpu.softmax(&mut out, &[1.0; 4], 0).is_err());

    // The backend is still usable afterwards.
    gpu.add(&mut out, &[1.0; 8], &[2.0; 8])?;
    assert_eq!(out, vec![3.0; 8]);
    Ok(())
}

#[tokio::test]
async fn test_full_decode_matches_local() -> Result<()> {
    let dims = tiny_dims();
    let Some(gpu) = get_test_backend(&dims).await else {
        return Ok(());
    };
    let cpu = LocalBackend::new();
    let (embeddings, weights) = seeded_weights(&dims, 13);

    let run = |backend: &dyn ExecutionBackend| -> Result<Vec<Vec<f32>>> {
        let engine = DecodeEngine::new(&weights, backend);
        let mut state = DecodeState::new(&dims)?;
        let mut cache = KvCache::new(&dims)?;
        let mut outputs = Vec::new();
        for (pos, token) in [1u32, 7, 2, 2, 9, 0].into_iter().enumerate() {
            let out = engine.decode(token, pos, embeddings.lookup(token)?, &mut state, &mut cache)?;
            outputs.push(out.to_vec());
        }
        Ok(outputs)
    };

    let expected = run(&cpu)?;
    let actual = run(&gpu)?;
    assert_eq!(expected.len(), dims.max_seq);
    for (a, e) in actual.iter().zip(&expected) {
        assert_close(a, e, TOL);
    }
    Ok(())
}
