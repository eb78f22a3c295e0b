use std::thread;
use zero_rs::chunk::{AfterReduce, ChunkConfig, ChunkManager, Residency};
use zero_rs::distributed::{CollectiveBackend, CpuBackend, ReduceOp};
use zero_rs::tensor::{TensorId, TensorState};
use zero_rs::ZeroError;

/// Runs `f` once per rank of a `world_size` ring, each on its own thread.
fn run_ranks<R, F>(world_size: usize, f: F) -> Vec<R>
where
    R: Send + 'static,
    F: Fn(CpuBackend) -> R + Send + Sync + Clone + 'static,
{
    let handles: Vec<_> = CpuBackend::ring(world_size)
        .into_iter()
        .map(|backend| {
            let f = f.clone();
            thread::spawn(move || f(backend))
        })
        .collect();
    handles.into_iter().map(|h| h.join().unwrap()).collect()
}

fn param(index: usize) -> Vec<f32> {
    (0..32 * 32).map(|k| (index * 10_000 + k) as f32).collect()
}

#[test]
fn test_three_params_two_ranks_sharded() {
    run_ranks(2, |backend| {
        let rank = backend.rank();
        let mut m = ChunkManager::<f32, _>::new(ChunkConfig::new(Some(2048), true), backend).unwrap();
        let ids: Vec<TensorId> = (0..3).map(|_| TensorId::new()).collect();
        let chunks: Vec<_> = ids
            .iter()
            .enumerate()
            .map(|(i, &id)| m.append_tensor(id, &param(i), "fp16_param").unwrap())
            .collect();

        // The first two fill chunk A exactly, the third opens chunk B.
        assert_eq!(chunks[0], chunks[1]);
        assert_ne!(chunks[1], chunks[2]);
        assert_eq!(m.chunk(chunks[0]).unwrap().used(), 2048);

        // Only the local shard is resident.
        for &id in &ids {
            assert!(!m.is_chunk_free(id).unwrap());
            assert_eq!(m.tensor_state(id).unwrap(), TensorState::Free);
        }
        assert_eq!(m.chunk(chunks[0]).unwrap().residency(), Residency::Shard);
        assert_eq!(m.memory_stats().total, 1024 + 1024);
        let own = m.local_view(ids[rank]).unwrap();
        assert_eq!(own.range, 0..1024);
        assert_eq!(own.data, param(rank).as_slice());

        for &id in &ids {
            m.access_chunk(id).unwrap();
        }
        for (i, &id) in ids.iter().enumerate() {
            assert_eq!(m.tensor_state(id).unwrap(), TensorState::Hold);
            assert_eq!(m.tensor_data(id).unwrap(), param(i).as_slice());
        }
        assert_eq!(m.memory_stats().total, 2048 + 2048);

        for &id in &ids {
            m.release_chunk(id).unwrap();
        }
        for &id in &ids {
            assert_eq!(m.tensor_state(id).unwrap(), TensorState::Free);
            assert!(matches!(m.tensor_data(id), Err(ZeroError::ChunkFree(_))));
        }
        assert_eq!(m.chunk(chunks[2]).unwrap().residency(), Residency::Shard);
        assert_eq!(m.memory_stats().total, 2048);
    });
}

#[test]
fn test_three_params_local_storage() {
    let mut m = ChunkManager::<f32, _>::new(ChunkConfig::new(Some(2048), false), CpuBackend::single()).unwrap();
    let ids: Vec<TensorId> = (0..3).map(|_| TensorId::new()).collect();
    for (i, &id) in ids.iter().enumerate() {
        m.append_tensor(id, &param(i), "fp16_param").unwrap();
    }
    assert_eq!(m.chunk_count(), 2);
    for (i, &id) in ids.iter().enumerate() {
        assert_eq!(m.tensor_state(id).unwrap(), TensorState::Hold);
        assert_eq!(m.tensor_data(id).unwrap(), param(i).as_slice());
    }
    assert_eq!(m.memory_stats().total, 4096);
}

#[test]
fn test_unchunked_one_chunk_per_tensor() {
    let mut m = ChunkManager::<f32, _>::new(ChunkConfig::new(None, false), CpuBackend::single()).unwrap();
    for i in 0..3 {
        m.append_tensor(TensorId::new(), &param(i), "fp16_param").unwrap();
    }
    assert_eq!(m.chunk_count(), 3);
    assert_eq!(m.group_chunks("fp16_param").len(), 3);
}

#[test]
fn test_slots_never_exceed_capacity() {
    let sizes = [7, 3, 10, 1, 9, 4, 4, 2, 10, 6];
    let mut m = ChunkManager::<f32, _>::new(ChunkConfig::new(Some(10), false), CpuBackend::single()).unwrap();
    let ids: Vec<TensorId> = sizes
        .iter()
        .map(|&n| {
            let id = TensorId::new();
            m.append_tensor(id, &vec![1.0; n], "p").unwrap();
            id
        })
        .collect();

    for id in 0..m.chunk_count() {
        let chunk = m.chunk(zero_rs::chunk::ChunkId(id)).unwrap();
        let total: usize = chunk.slots().iter().map(|s| s.len).sum();
        assert!(total <= chunk.capacity());
        // Slots are packed back to back in append order.
        let mut end = 0;
        for slot in chunk.slots() {
            assert_eq!(slot.offset, end);
            end += slot.len;
        }
    }
    for &id in &ids {
        let owner = m.chunk_of(id).unwrap();
        let holders = (0..m.chunk_count())
            .filter(|&c| m.chunk(zero_rs::chunk::ChunkId(c)).unwrap().contains(id))
            .count();
        assert_eq!(holders, 1);
        assert!(m.chunk(owner).unwrap().contains(id));
    }
}

#[test]
fn test_access_release_pair_restores_state() {
    for distributed in [false, true] {
        let mut m = ChunkManager::<f64, _>::new(ChunkConfig::new(Some(6), distributed), CpuBackend::single()).unwrap();
        let a = TensorId::new();
        let b = TensorId::new();
        m.append_tensor(a, &[1.0; 4], "p").unwrap();
        m.append_tensor(b, &[2.0; 2], "p").unwrap();

        let before = (m.tensor_state(a).unwrap(), m.tensor_state(b).unwrap());
        let resident_before = m.memory_stats().total;
        m.access_chunk(a).unwrap();
        m.release_chunk(a).unwrap();
        assert_eq!((m.tensor_state(a).unwrap(), m.tensor_state(b).unwrap()), before);
        assert_eq!(m.memory_stats().total, resident_before);
    }
}

#[test]
fn test_illegal_transitions_rejected() {
    let mut m = ChunkManager::<f32, _>::new(ChunkConfig::new(Some(4), false), CpuBackend::single()).unwrap();
    let t = TensorId::new();
    m.append_tensor(t, &[0.0; 4], "p").unwrap();

    assert!(matches!(
        m.trans_tensor_state(t, TensorState::Hold),
        Err(ZeroError::InvalidStateTransition { from: TensorState::Hold, to: TensorState::Hold, .. })
    ));
    m.trans_tensor_state(t, TensorState::Compute).unwrap();
    assert!(matches!(
        m.trans_tensor_state(t, TensorState::ReadyForReduce),
        Err(ZeroError::InvalidStateTransition { .. })
    ));
    assert!(matches!(
        m.trans_tensor_state(t, TensorState::Free),
        Err(ZeroError::InvalidStateTransition { .. })
    ));
    assert_eq!(m.tensor_state(t).unwrap(), TensorState::Compute);
}

#[test]
fn test_no_busy_state_without_storage() {
    let mut m = ChunkManager::<f32, _>::new(ChunkConfig::new(Some(4), true), CpuBackend::single()).unwrap();
    let t = TensorId::new();
    m.append_tensor(t, &[0.0; 4], "p").unwrap();
    m.access_chunk(t).unwrap();
    m.release_chunk(t).unwrap();

    // Sharded again: nothing may become resident without an access.
    assert!(matches!(m.trans_tensor_state(t, TensorState::Hold), Err(ZeroError::ChunkFree(_))));
    assert_eq!(m.tensor_state(t).unwrap(), TensorState::Free);
}

#[test]
fn test_premature_reduce_leaves_states() {
    let mut m = ChunkManager::<f32, _>::new(ChunkConfig::new(Some(8), false), CpuBackend::single()).unwrap();
    let a = TensorId::new();
    let b = TensorId::new();
    let c = TensorId::new();
    m.append_tensor(a, &[1.0; 3], "g").unwrap();
    m.append_tensor(b, &[1.0; 3], "g").unwrap();
    m.append_tensor(c, &[1.0; 2], "g").unwrap();
    m.trans_tensor_state(a, TensorState::ReadyForReduce).unwrap();
    m.trans_tensor_state(b, TensorState::Compute).unwrap();

    assert!(!m.can_reduce_chunk(a).unwrap());
    assert!(matches!(m.reduce_chunk(c), Err(ZeroError::PrematureReduce { .. })));
    assert_eq!(m.tensor_state(a).unwrap(), TensorState::ReadyForReduce);
    assert_eq!(m.tensor_state(b).unwrap(), TensorState::Compute);
    assert_eq!(m.tensor_state(c).unwrap(), TensorState::Hold);
}

fn reduce_on_ranks(after: AfterReduce, op: ReduceOp) -> Vec<(usize, TensorState, Vec<f64>, std::ops::Range<usize>)> {
    run_ranks(2, move |backend| {
        let rank = backend.rank();
        let config = ChunkConfig::new(Some(4), true)
            .with_reduce_op(op)
            .with_after_reduce(after);
        let mut m = ChunkManager::<f64, _>::new(config, backend).unwrap();
        let t = TensorId::new();
        m.append_tensor(t, &[0.0; 4], "grads").unwrap();

        m.access_chunk(t).unwrap();
        m.trans_tensor_state(t, TensorState::ReadyForReduce).unwrap();
        let grad: Vec<f64> = (0..4).map(|k| (rank * 4 + k) as f64).collect();
        m.copy_tensor_to_chunk_slice(t, &grad).unwrap();
        m.reduce_chunk(t).unwrap();
        m.release_chunk(t).unwrap();

        let view = m.local_view(t).unwrap();
        (rank, m.tensor_state(t).unwrap(), view.data.to_vec(), view.range.clone())
    })
}

#[test]
fn test_reduce_keep_averages_everywhere() {
    // rank0 [0,1,2,3] + rank1 [4,5,6,7], averaged.
    for (rank, state, data, range) in reduce_on_ranks(AfterReduce::Hold, ReduceOp::Average) {
        // The last release drops back to the shard.
        assert_eq!(state, TensorState::Free);
        assert_eq!(range, rank * 2..rank * 2 + 2);
        let expected = [2.0, 3.0, 4.0, 5.0];
        assert_eq!(data, &expected[range.clone()]);
    }
}

#[test]
fn test_reduce_free_keeps_summed_shard() {
    for (rank, state, data, range) in reduce_on_ranks(AfterReduce::Free, ReduceOp::Sum) {
        assert_eq!(state, TensorState::Free);
        assert_eq!(range, rank * 2..rank * 2 + 2);
        let expected = [4.0, 6.0, 8.0, 10.0];
        assert_eq!(data, &expected[range.clone()]);
    }
}

#[test]
fn test_config_json_round_trip() {
    let config = ChunkConfig::new(Some(2048), true)
        .with_reduce_op(ReduceOp::Sum)
        .with_after_reduce(AfterReduce::Free);
    let json = serde_json::to_string(&config).unwrap();
    assert!(json.contains("\"reduce_op\":\"sum\""));
    assert!(json.contains("\"after_reduce\":\"free\""));
    let back: ChunkConfig = serde_json::from_str(&json).unwrap();
    assert_eq!(back, config);

    let partial: ChunkConfig = serde_json::from_str(r#"{"distributed_storage": true}"#).unwrap();
    assert_eq!(partial.chunk_size, None);
    assert_eq!(partial.reduce_op, ReduceOp::Average);
    assert_eq!(partial.after_reduce, AfterReduce::Hold);
}
