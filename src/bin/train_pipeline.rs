//! Pipeline-parallel training launcher.
//!
//! Run without `--rank` to act as the master: it spawns one worker process
//! per stage (re-invoking this binary with `--rank N`), relays each worker's
//! output under a `[Stage N]` prefix, and waits for all of them. Each worker
//! connects the TCP mesh, builds its stage runner, and trains the shared
//! deterministic MLP for the requested number of steps.

use std::io::{BufRead, BufReader};
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::Result;
use candle_core::Tensor;
use clap::Parser;
use tracing::{debug, error, info};

use pipegraph::models::{build_mlp_registry, deterministic_tensor, sequential_graph, LOSS_TARGET};
use pipegraph::{Messaging, PipelineConfig, StageRunner, TcpMesh};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Number of pipeline stages (worker processes)
    #[arg(long, default_value_t = 2)]
    num_stages: usize,

    /// Process rank (set automatically when spawning)
    #[arg(long)]
    rank: Option<usize>,

    /// Optional JSON config file; command-line flags are ignored if set
    #[arg(long)]
    config: Option<PathBuf>,

    /// Global batch size
    #[arg(long, default_value_t = 8)]
    batch_size: usize,

    /// Micro-batches per training step
    #[arg(long, default_value_t = 2)]
    num_microbatches: usize,

    /// Model input width
    #[arg(long, default_value_t = 8)]
    input_dim: usize,

    /// Hidden layer width
    #[arg(long, default_value_t = 16)]
    hidden_dim: usize,

    /// Model output width
    #[arg(long, default_value_t = 4)]
    output_dim: usize,

    /// Number of dense layers
    #[arg(long, default_value_t = 4)]
    num_layers: usize,

    /// Training steps
    #[arg(long, default_value_t = 10)]
    steps: usize,

    /// SGD learning rate
    #[arg(long, default_value_t = 0.05)]
    lr: f64,

    #[arg(long, default_value = "127.0.0.1")]
    master_addr: String,

    /// Rank r listens on base_port + r
    #[arg(long, default_value_t = 29500)]
    base_port: u16,

    #[arg(short, long)]
    verbose: bool,
}

impl Args {
    fn to_config(&self) -> Result<PipelineConfig> {
        let config = match &self.config {
            Some(path) => PipelineConfig::load(path)?,
            None => {
                let mut dims = vec![self.input_dim];
                for _ in 0..self.num_layers.saturating_sub(1) {
                    dims.push(self.hidden_dim);
                }
                dims.push(self.output_dim);
                let config = PipelineConfig {
                    stages: self.num_stages,
                    micro_batches: self.num_microbatches,
                    batch_size: self.batch_size,
                    dims,
                    steps: self.steps,
                    learning_rate: self.lr,
                    master_addr: self.master_addr.clone(),
                    base_port: self.base_port,
                };
                config.validate()?;
                config
            }
        };
        Ok(config)
    }
}

fn run_worker(rank: usize, config: &PipelineConfig) -> Result<()> {
    info!(rank, stages = config.stages, "pipeline worker starting");

    let registry = build_mlp_registry(&config.dims, 1)?;
    let graph = sequential_graph(config.layer_count(), true)?;
    let mesh: Arc<dyn Messaging> = Arc::new(TcpMesh::connect(
        rank,
        config.stages,
        &config.master_addr,
        config.base_port,
    )?);
    info!(rank, "transport mesh connected");

    let mut runner = StageRunner::new(
        graph,
        registry,
        mesh,
        config.micro_batches,
        Some(LOSS_TARGET.to_string()),
    )?;
    pipegraph::split::describe_range(runner.graph(), runner.metadata(), rank)?;

    // Every rank derives the same fixture data, so only the placeholders a
    // rank actually touches need feeding: the first stage executes both
    // placeholder nodes, the last stage's loss head reads the targets.
    let input = deterministic_tensor(config.batch_size, config.dims[0], 101, 1.0)?;
    let targets = deterministic_tensor(config.batch_size, config.output_dim(), 202, 1.0)?;

    for step in 0..config.steps {
        let mut feeds: Vec<(&str, &Tensor)> = Vec::new();
        if runner.is_first_stage() {
            feeds.push(("x", &input));
            feeds.push(("targets", &targets));
        } else if runner.is_last_stage() {
            feeds.push(("targets", &targets));
        }
        runner.run_forward_with(&feeds)?;
        runner.run_backward()?;
        apply_sgd(&runner, config.learning_rate)?;

        if let Some(loss) = runner.mean_loss()? {
            info!(rank, step, loss, "training step complete");
        } else {
            debug!(rank, step, "training step complete");
        }
    }

    info!(rank, steps = config.steps, "pipeline worker finished");
    Ok(())
}

/// Plain SGD over this rank's parameters. Gradients were summed over
/// micro-batches, so the rate is scaled by 1/M to step on their mean.
fn apply_sgd(runner: &StageRunner, lr: f64) -> Result<()> {
    let scale = lr / runner.micro_batches() as f64;
    for (path, var) in runner.registry().params() {
        if let Some(grad) = runner.param_grads().get(path) {
            let step = (grad * scale)?;
            var.set(&var.as_tensor().sub(&step)?)?;
        }
    }
    Ok(())
}

fn spawn_workers(args: &Args, config: &PipelineConfig) -> Result<()> {
    info!(stages = config.stages, "spawning pipeline worker processes");

    let binary_path = std::env::current_exe()?;
    let mut children = Vec::new();

    for rank in 0..config.stages {
        let mut cmd = Command::new(&binary_path);
        cmd.arg("--rank")
            .arg(rank.to_string())
            .arg("--num-stages")
            .arg(config.stages.to_string())
            .arg("--batch-size")
            .arg(config.batch_size.to_string())
            .arg("--num-microbatches")
            .arg(config.micro_batches.to_string())
            .arg("--steps")
            .arg(config.steps.to_string())
            .arg("--lr")
            .arg(config.learning_rate.to_string())
            .arg("--master-addr")
            .arg(&config.master_addr)
            .arg("--base-port")
            .arg(config.base_port.to_string());
        if let Some(path) = &args.config {
            cmd.arg("--config").arg(path);
        } else {
            cmd.arg("--input-dim")
                .arg(args.input_dim.to_string())
                .arg("--hidden-dim")
                .arg(args.hidden_dim.to_string())
                .arg("--output-dim")
                .arg(args.output_dim.to_string())
                .arg("--num-layers")
                .arg(args.num_layers.to_string());
        }
        if args.verbose {
            cmd.arg("--verbose");
        }
        cmd.stdout(Stdio::piped()).stderr(Stdio::piped());

        let mut child = cmd.spawn()?;

        if let Some(stdout) = child.stdout.take() {
            let reader = BufReader::new(stdout);
            thread::spawn(move || {
                for line in reader.lines().map_while(|l| l.ok()) {
                    println!("[Stage {rank}] {line}");
                }
            });
        }
        if let Some(stderr) = child.stderr.take() {
            let reader = BufReader::new(stderr);
            thread::spawn(move || {
                for line in reader.lines().map_while(|l| l.ok()) {
                    eprintln!("[Stage {rank}] {line}");
                }
            });
        }

        children.push(child);
        // Stagger the listeners so lower ranks are bound before higher
        // ranks dial them.
        thread::sleep(Duration::from_millis(100));
    }

    let mut failures = 0usize;
    for (rank, mut child) in children.into_iter().enumerate() {
        match child.wait() {
            Ok(status) if status.success() => {
                info!(rank, "stage completed");
            }
            Ok(status) => {
                error!(rank, code = ?status.code(), "stage failed");
                failures += 1;
            }
            Err(e) => {
                error!(rank, error = %e, "stage did not finish");
                failures += 1;
            }
        }
    }

    if failures > 0 {
        anyhow::bail!("{failures} pipeline stage(s) failed");
    }
    info!("pipeline training completed");
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(false)
        .init();

    let config = args.to_config()?;
    match args.rank {
        None => {
            info!(
                stages = config.stages,
                layers = config.layer_count(),
                batch = config.batch_size,
                micro_batches = config.micro_batches,
                steps = config.steps,
                "pipeline-parallel training"
            );
            spawn_workers(&args, &config)
        }
        Some(rank) => run_worker(rank, &config),
    }
}
