//! One simulated job: a thread per worker, all running the same pass.

use std::sync::Arc;
use std::thread;

use anyhow::Context;
use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use fmoe_core::distributed::{DeviceCommunicator, ReduceOp, ThreadCommunicator};
use fmoe_core::moe::{PassContext, TransformerMlp};
use serde::Serialize;

use crate::config::SimConfig;

/// Telemetry of one worker after a pass.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerReport {
    pub rank: usize,
    pub output_shape: Vec<usize>,
    pub fwd_expert_count: Vec<usize>,
    pub fused: bool,
    pub fusion_cost: f64,
    pub comm_time: f64,
    pub traffic_size: u64,
    pub collectives: usize,
    /// Sum of `traffic_size` over the whole job.
    pub job_traffic_size: u64,
}

/// Run one forward pass on `config.moe.world_size` in-process workers.
pub fn run_job(config: &SimConfig) -> anyhow::Result<Vec<WorkerReport>> {
    config.moe.validate()?;
    let world_size = config.moe.world_size;

    let handles: Vec<_> = ThreadCommunicator::group(world_size)
        .into_iter()
        .enumerate()
        .map(|(rank, comm)| {
            let config = config.clone();
            thread::Builder::new()
                .name(format!("worker-{rank}"))
                .spawn(move || run_worker(&config, comm))
                .context("failed to spawn worker thread")
        })
        .collect::<anyhow::Result<_>>()?;

    let mut reports = Vec::with_capacity(world_size);
    for handle in handles {
        let report = handle
            .join()
            .map_err(|_| anyhow::anyhow!("worker thread panicked"))??;
        reports.push(report);
    }
    Ok(reports)
}

fn run_worker(config: &SimConfig, comm: ThreadCommunicator) -> anyhow::Result<WorkerReport> {
    let comm = Arc::new(comm);
    let result = run_pass(config, &comm);
    if let Err(err) = &result {
        // release peers still waiting in a collective
        comm.abort(&format!("{err:#}"));
    }
    result
}

fn run_pass(config: &SimConfig, comm: &Arc<ThreadCommunicator>) -> anyhow::Result<WorkerReport> {
    let device = Device::Cpu;
    let rank = comm.process_group().rank();

    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
    let mlp = TransformerMlp::new(config.moe.clone(), vb, comm.clone())?;

    let input = Tensor::randn(
        0f32,
        1.0,
        (1, config.tokens_per_worker, config.moe.d_model),
        &device,
    )?;
    let ctx = PassContext::new(0, 0).with_fuse_token(config.fuse_token);
    let out = mlp.forward(&input, &ctx)?;

    anyhow::ensure!(
        out.output.dims() == input.dims(),
        "rank {rank}: output shape {:?} differs from input {:?}",
        out.output.dims(),
        input.dims()
    );

    let local = Tensor::new(&[out.traffic_size as f64], &device)?;
    let job_traffic: Vec<f64> = comm.all_reduce(&local, ReduceOp::Sum)?.to_vec1()?;
    let job_traffic_size = job_traffic.first().copied().unwrap_or(0.0) as u64;

    tracing::info!(
        rank,
        tokens = config.tokens_per_worker,
        fused = out.record.fused,
        fusion_cost = out.fusion_cost,
        comm_time = out.comm_time,
        traffic_size = out.traffic_size,
        collectives = out.record.collectives,
        "pass complete"
    );

    Ok(WorkerReport {
        rank,
        output_shape: out.output.dims().to_vec(),
        fwd_expert_count: out.fwd_expert_count,
        fused: out.record.fused,
        fusion_cost: out.fusion_cost,
        comm_time: out.comm_time,
        traffic_size: out.traffic_size,
        collectives: out.record.collectives,
        job_traffic_size,
    })
}
