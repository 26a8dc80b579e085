//! Integration tests for multi-worker MoE passes.
//!
//! Every test spawns one thread per worker, each holding a
//! `ThreadCommunicator` of the same group, and runs the same pass on all of
//! them (SPMD). Experts are deterministic mocks so expected outputs can be
//! computed directly from the routing. All tests are CPU-only.

use std::sync::Arc;
use std::thread;

use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use fmoe_core::{
    config::MoEConfig,
    distributed::{
        DeviceCommunicator, DistributedError, ProcessGroup, ReduceOp, ThreadCommunicator,
    },
    moe::{
        ExpertCompute, ExpertMap, ExpertPlacement, FusionConfig, MlpExperts, MoEError, MoELayer,
        MoEOutput, NaiveGate, PassContext, Routing, TransformerMlp,
    },
};

// ─── Mock Experts ────────────────────────────────────────────────────────────

/// Expert with global id `e` multiplies its rows by `e + 1`.
/// With `identity` set every expert returns its input unchanged.
struct ScaledExperts {
    global_ids: Vec<usize>,
    identity: bool,
}

impl ScaledExperts {
    fn new(map: &ExpertMap, identity: bool) -> Self {
        Self {
            global_ids: map.local_global_ids().collect(),
            identity,
        }
    }
}

impl ExpertCompute for ScaledExperts {
    fn compute(&self, batch: &Tensor, fwd_expert_count: &[usize]) -> fmoe_core::moe::Result<Tensor> {
        assert_eq!(fwd_expert_count.len(), self.global_ids.len());
        assert_eq!(fwd_expert_count.iter().sum::<usize>(), batch.dim(0)?);
        if self.identity {
            return Ok(batch.clone());
        }

        let mut pieces = Vec::new();
        let mut offset = 0;
        for (&global, &count) in self.global_ids.iter().zip(fwd_expert_count) {
            if count == 0 {
                continue;
            }
            let segment = batch.narrow(0, offset, count)?;
            offset += count;
            pieces.push(segment.affine((global + 1) as f64, 0.0)?);
        }
        if pieces.is_empty() {
            return Ok(batch.clone());
        }
        Ok(Tensor::cat(&pieces, 0)?)
    }

    fn num_expert(&self) -> usize {
        self.global_ids.len()
    }
}

// ─── Lossy Communicator ──────────────────────────────────────────────────────

/// Drops the last received row of every non-empty token exchange on one rank.
struct LossyCommunicator {
    inner: ThreadCommunicator,
    lossy_rank: usize,
}

impl DeviceCommunicator for LossyCommunicator {
    fn process_group(&self) -> &dyn ProcessGroup {
        self.inner.process_group()
    }

    fn all_reduce(&self, tensor: &Tensor, op: ReduceOp) -> DistributedResult<Tensor> {
        self.inner.all_reduce(tensor, op)
    }

    fn all_gather(&self, tensor: &Tensor, gather_dim: usize) -> DistributedResult<Tensor> {
        self.inner.all_gather(tensor, gather_dim)
    }

    fn all_to_all_v(
        &self,
        tensor: &Tensor,
        send_splits: &[usize],
        recv_splits: &[usize],
    ) -> DistributedResult<Tensor> {
        let out = self.inner.all_to_all_v(tensor, send_splits, recv_splits)?;
        let rows = out.dim(0)?;
        if self.inner.process_group().rank() != self.lossy_rank || rows == 0 {
            return Ok(out);
        }
        Ok(out.narrow(0, 0, rows - 1)?)
    }

    fn abort(&self, reason: &str) {
        self.inner.abort(reason);
    }
}

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn run_workers<F, T>(world_size: usize, f: F) -> Vec<T>
where
    F: Fn(ThreadCommunicator) -> T + Send + Sync + 'static,
    T: Send + 'static,
{
    let f = Arc::new(f);
    let handles: Vec<_> = ThreadCommunicator::group(world_size)
        .into_iter()
        .map(|comm| {
            let f = Arc::clone(&f);
            thread::spawn(move || f(comm))
        })
        .collect();
    handles.into_iter().map(|h| h.join().unwrap()).collect()
}

fn config(num_expert: usize, world_size: usize, d_model: usize, top_k: usize) -> MoEConfig {
    MoEConfig {
        num_expert,
        world_size,
        d_model,
        d_hidden: 2 * d_model,
        top_k,
        ..Default::default()
    }
}

fn build_layer(config: &MoEConfig, comm: ThreadCommunicator, identity: bool) -> MoELayer {
    build_layer_on(config, Arc::new(comm), identity)
}

fn build_layer_on(
    config: &MoEConfig,
    comm: Arc<dyn DeviceCommunicator>,
    identity: bool,
) -> MoELayer {
    let rank = comm.process_group().rank();
    let map = ExpertMap::new(config.num_expert, config.world_size, rank, config.placement);
    let vb = VarBuilder::zeros(DType::F32, &Device::Cpu);
    let gate = NaiveGate::new(
        config.d_model,
        config.total_experts(),
        config.top_k,
        vb.pp("gate"),
    )
    .unwrap();
    MoELayer::from_parts(
        config.clone(),
        Box::new(gate),
        Box::new(ScaledExperts::new(&map, identity)),
        comm,
    )
    .unwrap()
}

/// Token `i` of worker `rank`: feature `d` is `rank * 1000 + i * 10 + d`.
fn tokens(rank: usize, num_tokens: usize, d_model: usize) -> Vec<f32> {
    (0..num_tokens)
        .flat_map(|i| (0..d_model).map(move |d| (rank * 1000 + i * 10 + d) as f32))
        .collect()
}

/// Deterministic pseudo-random assignments, distinct experts within a token.
fn assignments(rank: usize, num_tokens: usize, top_k: usize, total: usize) -> Vec<u32> {
    let mut state = 0x9e37_79b9u64 ^ (rank as u64 * 0x85eb_ca6b);
    let mut ids = Vec::with_capacity(num_tokens * top_k);
    for _ in 0..num_tokens {
        state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        let first = (state >> 33) as usize % total;
        for k in 0..top_k {
            ids.push(((first + k) % total) as u32);
        }
    }
    ids
}

fn routing(ids: Vec<u32>, num_tokens: usize, top_k: usize, weights: Option<Vec<f32>>) -> Routing {
    let device = Device::Cpu;
    let expert_ids = Tensor::from_vec(ids, (num_tokens, top_k), &device).unwrap();
    let weights = weights.map(|w| Tensor::from_vec(w, (num_tokens, top_k), &device).unwrap());
    Routing::new(expert_ids, weights)
}

fn run_pass(
    layer: &MoELayer,
    rank: usize,
    num_tokens: usize,
    ids: Vec<u32>,
    ctx: &PassContext,
) -> (Vec<f32>, MoEOutput) {
    let cfg = layer.config();
    let input = tokens(rank, num_tokens, cfg.d_model);
    let hidden = Tensor::from_vec(input.clone(), (num_tokens, cfg.d_model), &Device::Cpu).unwrap();
    let out = layer
        .forward_with_routing(&hidden, &routing(ids, num_tokens, cfg.top_k, None), ctx)
        .unwrap();
    (input, out)
}

fn flat(t: &Tensor) -> Vec<f32> {
    t.flatten_all().unwrap().to_vec1().unwrap()
}

fn assert_close(a: &[f32], b: &[f32]) {
    assert_eq!(a.len(), b.len());
    for (x, y) in a.iter().zip(b) {
        assert!((x - y).abs() <= 1e-3 * (1.0 + y.abs()), "{x} != {y}");
    }
}

// ─── Round trip ──────────────────────────────────────────────────────────────

#[test]
fn round_trip_identity_experts_restores_input() {
    for world_size in [1, 2, 4] {
        let cfg = config(3, world_size, 4, 1);
        let results = run_workers(world_size, move |comm| {
            let rank = comm.process_group().rank();
            let layer = build_layer(&cfg, comm, true);
            let num_tokens = 5 + rank;
            let ids = assignments(rank, num_tokens, 1, cfg.total_experts());
            let (input, out) = run_pass(&layer, rank, num_tokens, ids, &PassContext::default());
            (input, flat(&out.output))
        });
        for (input, output) in results {
            assert_eq!(input, output, "world_size {world_size}");
        }
    }
}

#[test]
fn every_token_reaches_its_expert() {
    let cfg = config(2, 2, 3, 1);
    let results = run_workers(2, move |comm| {
        let rank = comm.process_group().rank();
        let layer = build_layer(&cfg, comm, false);
        let num_tokens = 6;
        let ids = assignments(rank, num_tokens, 1, cfg.total_experts());
        let (input, out) = run_pass(&layer, rank, num_tokens, ids.clone(), &PassContext::default());
        (input, ids, flat(&out.output))
    });

    for (input, ids, output) in results {
        let expected: Vec<f32> = input
            .chunks(3)
            .zip(&ids)
            .flat_map(|(row, &e)| row.iter().map(move |x| x * (e + 1) as f32))
            .collect();
        assert_close(&output, &expected);
    }
}

// ─── Conservation ────────────────────────────────────────────────────────────

#[test]
fn fwd_expert_count_conserves_assignments() {
    let world_size = 4;
    let num_tokens = 7;
    let top_k = 2;
    let cfg = config(2, world_size, 4, top_k);

    let patterns: Vec<Box<dyn Fn(usize) -> Vec<u32> + Send + Sync>> = vec![
        // all tokens to expert 0
        Box::new(move |_rank| vec![0; num_tokens * top_k]),
        // uniform spread
        Box::new(move |_rank| (0..num_tokens * top_k).map(|i| (i % 8) as u32).collect()),
        // pseudo-random
        Box::new(move |rank| assignments(rank, num_tokens, top_k, 8)),
    ];

    for pattern in patterns {
        let pattern = Arc::new(pattern);
        let cfg = cfg.clone();
        let counts = run_workers(world_size, move |comm| {
            let rank = comm.process_group().rank();
            let layer = build_layer(&cfg, comm, true);
            let (_, out) = run_pass(&layer, rank, num_tokens, (*pattern)(rank), &PassContext::default());
            out.fwd_expert_count
        });
        let total: usize = counts.iter().flatten().sum();
        assert_eq!(total, world_size * num_tokens * top_k);
    }
}

#[test]
fn all_tokens_to_one_expert_leaves_others_empty() {
    let cfg = config(2, 2, 4, 1);
    let counts = run_workers(2, move |comm| {
        let rank = comm.process_group().rank();
        let layer = build_layer(&cfg, comm, true);
        let (input, out) = run_pass(&layer, rank, 4, vec![3; 4], &PassContext::default());
        assert_eq!(flat(&out.output), input);
        out.fwd_expert_count
    });
    assert_eq!(counts, vec![vec![0, 0], vec![0, 8]]);
}

// ─── Zero batches ────────────────────────────────────────────────────────────

#[test]
fn worker_without_tokens_still_serves_experts() {
    let cfg = config(2, 2, 4, 1);
    let results = run_workers(2, move |comm| {
        let rank = comm.process_group().rank();
        let layer = build_layer(&cfg, comm, false);
        // rank 0 has no tokens; rank 1 sends everything to rank 0's experts
        let num_tokens = if rank == 0 { 0 } else { 3 };
        let ids = vec![0, 1, 0][..num_tokens].to_vec();
        let (input, out) = run_pass(&layer, rank, num_tokens, ids, &PassContext::default());
        (rank, input, out)
    });

    for (rank, input, out) in results {
        if rank == 0 {
            assert_eq!(out.output.dims(), &[0, 4]);
            assert_eq!(out.fwd_expert_count, vec![2, 1]);
        } else {
            assert_eq!(out.fwd_expert_count, vec![0, 0]);
            let expected: Vec<f32> = input
                .chunks(4)
                .zip([1.0f32, 2.0, 1.0])
                .flat_map(|(row, s)| row.iter().map(move |x| x * s))
                .collect();
            assert_close(&flat(&out.output), &expected);
        }
    }
}

// ─── Fusion ──────────────────────────────────────────────────────────────────

#[test]
fn fused_and_unfused_outputs_match() {
    let mut cfg = config(3, 2, 4, 2);
    cfg.fusion = FusionConfig {
        force: true,
        ..Default::default()
    };

    let results = run_workers(2, move |comm| {
        let rank = comm.process_group().rank();
        let layer = build_layer(&cfg, comm, false);
        let num_tokens = 9;
        let ids = assignments(rank, num_tokens, 2, cfg.total_experts());

        let baseline = PassContext::default();
        let (_, unfused) = run_pass(&layer, rank, num_tokens, ids.clone(), &baseline);
        let fused_ctx = PassContext::default().with_fuse_token(true);
        let (_, fused) = run_pass(&layer, rank, num_tokens, ids, &fused_ctx);
        (unfused, fused)
    });

    for (unfused, fused) in results {
        assert_close(&flat(&fused.output), &flat(&unfused.output));

        assert!(!unfused.record.fused);
        assert_eq!(unfused.record.fusion_cost, 0.0);
        // count exchange + one round per local expert in each direction
        assert_eq!(unfused.record.collectives, 1 + 2 * 3);

        assert!(fused.record.fused);
        assert_eq!(fused.record.collectives, 1 + 2);
        assert_eq!(fused.record.traffic_size(), unfused.record.traffic_size());
    }
}

#[test]
fn fusion_decision_is_identical_on_every_worker() {
    let cfg = config(4, 4, 8, 2);
    let decisions = run_workers(4, move |comm| {
        let rank = comm.process_group().rank();
        let layer = build_layer(&cfg, comm, true);
        // skewed load: rank 0 sends many tokens, the others a few
        let num_tokens = if rank == 0 { 32 } else { 2 };
        let ids = assignments(rank, num_tokens, 2, cfg.total_experts());
        let ctx = PassContext::default().with_fuse_token(true);
        let (_, out) = run_pass(&layer, rank, num_tokens, ids, &ctx);
        (out.record.fused, out.record.fusion_cost, out.record.collectives)
    });
    assert!(decisions.windows(2).all(|w| w[0] == w[1]));
}

// ─── Top-k accumulation ──────────────────────────────────────────────────────

#[test]
fn top2_half_weights_with_identity_experts_returns_input() {
    let cfg = config(2, 2, 4, 2);
    let results = run_workers(2, move |comm| {
        let rank = comm.process_group().rank();
        let layer = build_layer(&cfg, comm, true);
        let num_tokens = 6;
        let ids = assignments(rank, num_tokens, 2, cfg.total_experts());
        let input = tokens(rank, num_tokens, 4);
        let hidden = Tensor::from_vec(input.clone(), (num_tokens, 4), &Device::Cpu).unwrap();
        let routing = routing(ids, num_tokens, 2, Some(vec![0.5; num_tokens * 2]));
        let out = layer
            .forward_with_routing(&hidden, &routing, &PassContext::default())
            .unwrap();
        (input, flat(&out.output))
    });
    for (input, output) in results {
        assert_close(&output, &input);
    }
}

// ─── Scale invariance ────────────────────────────────────────────────────────

#[test]
fn doubling_world_size_redistributes_without_loss() {
    // Per-worker num_expert stays fixed; total_experts follows world_size.
    let num_tokens = 8;
    let run = move |world_size: usize| {
        let cfg = config(2, world_size, 3, 1);
        let total = cfg.total_experts();
        run_workers(world_size, move |comm| {
            let rank = comm.process_group().rank();
            let layer = build_layer(&cfg, comm, false);
            let ids = assignments(rank, num_tokens, 1, total);
            let (input, out) = run_pass(&layer, rank, num_tokens, ids.clone(), &PassContext::default());
            (input, ids, flat(&out.output), out.fwd_expert_count)
        })
    };

    for world_size in [2, 4] {
        let results = run(world_size);
        let total_count: usize = results.iter().map(|r| r.3.iter().sum::<usize>()).sum();
        assert_eq!(total_count, world_size * num_tokens);
        assert_eq!(results[0].3.len(), 2);

        for (input, ids, output, _) in results {
            let expected: Vec<f32> = input
                .chunks(3)
                .zip(&ids)
                .flat_map(|(row, &e)| row.iter().map(move |x| x * (e + 1) as f32))
                .collect();
            assert_close(&output, &expected);
        }
    }
}

#[test]
fn round_robin_placement_routes_correctly() {
    let mut cfg = config(2, 3, 2, 1);
    cfg.placement = ExpertPlacement::RoundRobin;
    let results = run_workers(3, move |comm| {
        let rank = comm.process_group().rank();
        let layer = build_layer(&cfg, comm, false);
        let ids: Vec<u32> = (0..6).collect();
        let (input, out) = run_pass(&layer, rank, 6, ids.clone(), &PassContext::default());
        (rank, input, ids, flat(&out.output), out.fwd_expert_count)
    });

    for (rank, input, ids, output, counts) in results {
        // every worker sends one token to each of the 6 experts
        assert_eq!(counts, vec![3, 3], "rank {rank}");
        let expected: Vec<f32> = input
            .chunks(2)
            .zip(&ids)
            .flat_map(|(row, &e)| row.iter().map(move |x| x * (e + 1) as f32))
            .collect();
        assert_close(&output, &expected);
    }
}

// ─── Telemetry ───────────────────────────────────────────────────────────────

#[test]
fn traffic_size_counts_cross_worker_bytes_only() {
    let cfg = config(2, 2, 4, 1);
    let records = run_workers(2, move |comm| {
        let rank = comm.process_group().rank();
        let layer = build_layer(&cfg, comm, true);
        // one token to each of the four experts: two stay local, two cross
        let (_, out) = run_pass(&layer, rank, 4, vec![0, 1, 2, 3], &PassContext::default());
        out.record
    });
    for record in records {
        let row_bytes = 4 * 4;
        assert_eq!(record.scatter_bytes, 2 * row_bytes);
        assert_eq!(record.gather_bytes, 2 * row_bytes);
        assert_eq!(record.traffic_size(), 4 * row_bytes);
    }
}

// ─── Padding ─────────────────────────────────────────────────────────────────

#[test]
fn padded_tokens_are_not_dispatched() {
    let cfg = config(2, 2, 4, 2);
    let results = run_workers(2, move |comm| {
        let rank = comm.process_group().rank();
        let layer = build_layer(&cfg, comm, true);
        let mask = Tensor::new(&[1u8, 0, 1, 0], &Device::Cpu).unwrap();
        let ctx = PassContext::default().with_padding_mask(mask);
        let ids = vec![0, 1, 2, 3, 1, 2, 3, 0];
        let (input, out) = run_pass(&layer, rank, 4, ids, &ctx);
        (input, out)
    });

    let total: usize = results
        .iter()
        .map(|(_, out)| out.fwd_expert_count.iter().sum::<usize>())
        .sum();
    // two kept tokens per worker, two assignments each
    assert_eq!(total, 2 * 2 * 2);

    for (input, out) in results {
        let output = flat(&out.output);
        for (i, (got, want)) in output.chunks(4).zip(input.chunks(4)).enumerate() {
            if i % 2 == 0 {
                let doubled: Vec<f32> = want.iter().map(|x| 2.0 * x).collect();
                assert_close(got, &doubled);
            } else {
                assert!(got.iter().all(|&x| x == 0.0));
            }
        }
    }
}

// ─── Errors and adapter ──────────────────────────────────────────────────────

type DistributedResult<T> = std::result::Result<T, DistributedError>;

fn is_peer_abort(err: &MoEError) -> bool {
    matches!(
        err,
        MoEError::Distributed(DistributedError::Collective { reason, .. })
            if reason.contains("aborted by rank")
    )
}

#[test]
fn bad_expert_id_on_one_worker_fails_every_worker() {
    let cfg = config(2, 2, 4, 1);
    let errors = run_workers(2, move |comm| {
        let rank = comm.process_group().rank();
        let layer = build_layer(&cfg, comm, true);
        // rank 1 routes to an expert that does not exist
        let ids = if rank == 1 { vec![0, 9, 1] } else { vec![0, 2, 3] };
        let hidden = Tensor::ones((3, 4), DType::F32, &Device::Cpu).unwrap();
        let err = layer
            .forward_with_routing(&hidden, &routing(ids, 3, 1, None), &PassContext::default())
            .unwrap_err();
        (rank, err)
    });

    for (rank, err) in errors {
        if rank == 1 {
            assert!(
                matches!(err, MoEError::ExpertOutOfRange { expert: 9, total_experts: 4 }),
                "{err}"
            );
        } else {
            assert!(is_peer_abort(&err), "rank {rank}: {err}");
        }
    }
}

#[test]
fn lost_rows_are_reported_per_expert_on_both_paths() {
    for fuse_token in [false, true] {
        let mut cfg = config(2, 2, 4, 1);
        cfg.fusion = FusionConfig {
            force: true,
            ..Default::default()
        };
        let errors = run_workers(2, move |comm| {
            let rank = comm.process_group().rank();
            let lossy: Arc<dyn DeviceCommunicator> = Arc::new(LossyCommunicator {
                inner: comm,
                lossy_rank: 0,
            });
            let layer = build_layer_on(&cfg, lossy, true);
            // every token of both workers goes to expert 0 on rank 0
            let hidden = Tensor::ones((3, 4), DType::F32, &Device::Cpu).unwrap();
            let ctx = PassContext::default().with_fuse_token(fuse_token);
            let err = layer
                .forward_with_routing(&hidden, &routing(vec![0; 3], 3, 1, None), &ctx)
                .unwrap_err();
            (rank, err)
        });

        for (rank, err) in errors {
            if rank == 0 {
                assert!(
                    matches!(
                        err,
                        MoEError::CountMismatch {
                            expert: 0,
                            declared: 6,
                            received: 5
                        }
                    ),
                    "fuse_token {fuse_token}: {err}"
                );
            } else {
                assert!(is_peer_abort(&err), "fuse_token {fuse_token}: {err}");
            }
        }
    }
}

#[test]
fn width_mismatch_fails_before_any_collective() {
    // Only rank 0 gets a bad input; it must fail without entering a collective,
    // so rank 1 is not run at all.
    let cfg = config(2, 2, 4, 1);
    let mut comms = ThreadCommunicator::group(2);
    let comm = comms.remove(0);
    let layer = build_layer(&cfg, comm, true);

    let hidden = Tensor::zeros((3, 6), DType::F32, &Device::Cpu).unwrap();
    let err = layer
        .forward(&hidden, &PassContext::default())
        .unwrap_err();
    assert!(matches!(
        err,
        MoEError::ShapeMismatch {
            expected: 4,
            actual: 6
        }
    ));
}

#[test]
fn transformer_mlp_runs_across_workers() {
    let cfg = config(2, 2, 8, 2);
    let outputs = run_workers(2, move |comm| {
        let device = Device::Cpu;
        let vb = VarBuilder::zeros(DType::F32, &device);
        let gate = NaiveGate::new(cfg.d_model, cfg.total_experts(), cfg.top_k, vb.pp("gate")).unwrap();
        let experts = MlpExperts::new(
            cfg.num_expert,
            cfg.d_model,
            cfg.d_hidden,
            cfg.activation,
            vb.pp("experts"),
        )
        .unwrap();
        assert_eq!(experts.activation(), cfg.activation);
        let layer =
            MoELayer::from_parts(cfg.clone(), Box::new(gate), Box::new(experts), Arc::new(comm))
                .unwrap();
        let mlp = TransformerMlp::from_layer(layer);
        let inp = Tensor::randn(0f32, 1.0, (2, 3, 8), &device).unwrap();
        let ctx = PassContext::new(0, 0).with_fuse_token(true);
        let out = mlp.forward(&inp, &ctx).unwrap();
        (out.output.dims().to_vec(), out.comm_time)
    });
    for (dims, comm_time) in outputs {
        assert_eq!(dims, vec![2, 3, 8]);
        assert!(comm_time >= 0.0);
    }
}
