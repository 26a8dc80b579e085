use std::path::PathBuf;

use clap::{Parser, Subcommand};

mod config;
mod logging;
mod worker;

use config::{Overrides, SimConfig};

#[derive(Parser)]
#[command(
    name = "fmoe-sim",
    about = "Run expert-parallel MoE forward passes on in-process workers"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run one forward pass on every worker and report telemetry.
    Run {
        /// TOML config file.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Number of workers.
        #[arg(long)]
        world_size: Option<usize>,

        /// Experts per worker.
        #[arg(long)]
        num_expert: Option<usize>,

        #[arg(long)]
        d_model: Option<usize>,

        #[arg(long)]
        d_hidden: Option<usize>,

        /// Experts per token.
        #[arg(long)]
        top_k: Option<usize>,

        /// Tokens per worker.
        #[arg(long)]
        tokens: Option<usize>,

        /// Allow fusing per-expert transfers.
        #[arg(long)]
        fuse_token: bool,

        /// Print per-worker reports as JSON on stdout.
        #[arg(long)]
        json: bool,

        /// Log level used when RUST_LOG is unset.
        #[arg(long, default_value = "info")]
        log_level: String,
    },
    /// Print the effective configuration as TOML.
    ShowConfig {
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<SimConfig> {
    match path {
        Some(path) => SimConfig::load_from(path)
            .map_err(|e| anyhow::anyhow!("failed to load {}: {e}", path.display())),
        None => Ok(SimConfig::default()),
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            config,
            world_size,
            num_expert,
            d_model,
            d_hidden,
            top_k,
            tokens,
            fuse_token,
            json,
            log_level,
        } => {
            logging::init(&log_level)?;

            let mut sim_config = load_config(config.as_ref())?;
            sim_config.merge(&Overrides {
                world_size,
                num_expert,
                d_model,
                d_hidden,
                top_k,
                tokens,
                fuse_token,
            });

            tracing::info!(
                world_size = sim_config.moe.world_size,
                num_expert = sim_config.moe.num_expert,
                total_experts = sim_config.moe.total_experts(),
                d_model = sim_config.moe.d_model,
                top_k = sim_config.moe.top_k,
                tokens_per_worker = sim_config.tokens_per_worker,
                fuse_token = sim_config.fuse_token,
                "starting simulated job"
            );

            let reports = worker::run_job(&sim_config)?;

            if json {
                println!("{}", serde_json::to_string_pretty(&reports)?);
            } else {
                for report in &reports {
                    println!(
                        "rank {:>3}  experts {:?}  fused {:<5}  fusion_cost {:>10.2} us  comm_time {:>10.6} s  traffic {:>10} B",
                        report.rank,
                        report.fwd_expert_count,
                        report.fused,
                        report.fusion_cost,
                        report.comm_time,
                        report.traffic_size,
                    );
                }
                if let Some(first) = reports.first() {
                    println!("job traffic {} B", first.job_traffic_size);
                }
            }
        }
        Command::ShowConfig { config } => {
            let sim_config = load_config(config.as_ref())?;
            print!("{}", sim_config.to_toml()?);
        }
    }

    Ok(())
}
