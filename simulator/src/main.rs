use anyhow::Context;
use clap::{Args as ClapArgs, Parser, Subcommand};
use generator::profile::{emit_sweeps, Emitter, GeneratorConfig};
use generator::template::{FlightRecording, OrbitTemplate};
use log::info;
use serde::Serialize;
use std::fs;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Builder as TokioBuilder;
use tokio::signal;
use workflow::config::WorkflowConfig;
use workflow::runner::Runner;

mod generator;
mod gui_bridge;
mod workflow;

#[derive(Parser)]
#[command(author, version, about = "HackRF sweep workflow driver and emulator")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print synthetic hackrf_sweep lines to stdout
    Emit(EmitArgs),
    /// Sweep, aggregate and store detections for a fixed time
    Run(WorkflowArgs),
    /// Probe the sweep device once
    Health(WorkflowArgs),
    /// Analyze a recorded flight, or a generated orbit when no file is given
    Analyze(AnalyzeArgs),
    /// Expose the workflow over HTTP until Ctrl+C
    Serve(ServeArgs),
}

#[derive(ClapArgs)]
struct EmitArgs {
    #[arg(long, default_value_t = 424)]
    start_mhz: u32,
    #[arg(long, default_value_t = 444)]
    end_mhz: u32,
    #[arg(long, default_value_t = 100_000)]
    bin_width_hz: u32,
    /// Stop after this many sweeps
    #[arg(long)]
    sweeps: Option<u64>,
    #[arg(long, default_value_t = 0)]
    seed: u64,
    #[arg(long, default_value_t = 200)]
    interval_ms: u64,
    /// Emitter frequency in MHz; repeat for several
    #[arg(long = "emitter")]
    emitters: Vec<f64>,
    #[arg(long, default_value_t = -40.0, allow_hyphen_values = true)]
    emitter_power_db: f32,
}

#[derive(ClapArgs, Clone)]
struct WorkflowArgs {
    /// Load a workflow config from YAML
    #[arg(long)]
    workflow: Option<PathBuf>,
    /// Target frequency in MHz; repeat for several
    #[arg(long = "frequency")]
    frequencies: Vec<f64>,
    #[arg(long, default_value_t = 5_000)]
    dwell_ms: u64,
    #[arg(long, default_value_t = 10)]
    run_seconds: u64,
    /// Sweep with this binary's `emit` instead of hackrf_sweep
    #[arg(long, default_value_t = false)]
    emulate: bool,
}

#[derive(ClapArgs)]
struct AnalyzeArgs {
    /// Flight recording JSON (flight_path, captures, area_of_interest)
    #[arg(long)]
    flight: Option<PathBuf>,
    /// Orbit template YAML used when no recording is given
    #[arg(long)]
    template: Option<PathBuf>,
    /// Write the generated recording here as well
    #[arg(long)]
    save_recording: Option<PathBuf>,
    #[command(flatten)]
    workflow: WorkflowArgs,
}

#[derive(ClapArgs)]
struct ServeArgs {
    #[arg(long, default_value_t = gui_bridge::bridge::default_bind_address())]
    address: SocketAddr,
    #[command(flatten)]
    workflow: WorkflowArgs,
}

impl WorkflowArgs {
    fn config(&self) -> anyhow::Result<WorkflowConfig> {
        match &self.workflow {
            Some(path) => {
                let mut config = WorkflowConfig::load(path)?;
                if self.emulate {
                    config.backend = workflow::config::BackendConfig::emulator()?;
                }
                Ok(config)
            }
            None => WorkflowConfig::from_args(
                self.frequencies.clone(),
                self.dwell_ms,
                self.run_seconds,
                self.emulate,
            ),
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    let text = serde_json::to_string_pretty(value).context("serializing output")?;
    println!("{}", text);
    Ok(())
}

fn emit(args: EmitArgs) -> anyhow::Result<()> {
    let mut config = GeneratorConfig {
        start_mhz: args.start_mhz,
        end_mhz: args.end_mhz,
        bin_width_hz: args.bin_width_hz,
        sweeps: args.sweeps,
        seed: args.seed,
        interval_ms: args.interval_ms,
        ..Default::default()
    };
    if !args.emitters.is_empty() {
        config.emitters = args
            .emitters
            .iter()
            .map(|&frequency_mhz| Emitter {
                frequency_mhz,
                power_db: args.emitter_power_db,
                width_mhz: 0.2,
            })
            .collect();
    }
    let stdout = io::stdout();
    let mut out = stdout.lock();
    let sweeps = emit_sweeps(config, &mut out)?;
    info!("emitted {} sweeps", sweeps);
    Ok(())
}

fn load_recording(args: &AnalyzeArgs) -> anyhow::Result<FlightRecording> {
    if let Some(path) = &args.flight {
        let text = fs::read_to_string(path)
            .with_context(|| format!("reading flight recording {}", path.display()))?;
        return serde_json::from_str(&text)
            .with_context(|| format!("parsing flight recording {}", path.display()));
    }
    let template = match &args.template {
        Some(path) => {
            let text = fs::read_to_string(path)
                .with_context(|| format!("reading orbit template {}", path.display()))?;
            serde_yaml::from_str::<OrbitTemplate>(&text)
                .with_context(|| format!("parsing orbit template {}", path.display()))?
        }
        None => OrbitTemplate::default(),
    };
    let recording = template.record(chrono::Utc::now());
    if let Some(path) = &args.save_recording {
        let text = serde_json::to_string_pretty(&recording).context("serializing recording")?;
        fs::write(path, text)
            .with_context(|| format!("writing flight recording {}", path.display()))?;
    }
    Ok(recording)
}

async fn wait_for_ctrl_c() {
    if let Err(err) = signal::ctrl_c().await {
        log::warn!("Ctrl+C handler failed: {}", err);
    }
}

async fn run(args: WorkflowArgs) -> anyhow::Result<()> {
    let config = args.config()?;
    let run_for = Duration::from_secs(config.run_seconds);
    let runner = Arc::new(Runner::new(config)?);
    let summary = runner.run_for(run_for).await?;
    print_json(&summary)
}

async fn health(args: WorkflowArgs) -> anyhow::Result<()> {
    let runner = Runner::new(args.config()?)?;
    let result = runner.health().await;
    print_json(&result)?;
    if !result.healthy {
        anyhow::bail!("sweep device unhealthy: {}", result.detail);
    }
    Ok(())
}

async fn analyze(args: AnalyzeArgs) -> anyhow::Result<()> {
    let recording = load_recording(&args)?;
    let runner = Runner::new(args.workflow.config()?)?;
    let analysis = runner.analyze(
        &recording.flight_path,
        &recording.captures,
        recording.area_of_interest.as_ref(),
    );
    print_json(&analysis)
}

async fn serve(args: ServeArgs) -> anyhow::Result<()> {
    let runner = Arc::new(Runner::new(args.workflow.config()?)?);
    gui_bridge::bridge::serve(runner, args.address, wait_for_ctrl_c()).await
}

fn block_on(task: impl Future<Output = anyhow::Result<()>>) -> anyhow::Result<()> {
    let runtime = TokioBuilder::new_multi_thread()
        .enable_all()
        .build()
        .context("creating tokio runtime")?;
    runtime.block_on(task)
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    match cli.command {
        Command::Emit(args) => emit(args),
        Command::Run(args) => block_on(run(args)),
        Command::Health(args) => block_on(health(args)),
        Command::Analyze(args) => block_on(analyze(args)),
        Command::Serve(args) => block_on(serve(args)),
    }
}
