use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use dxcap_subcapture::config::analysis_path;
use dxcap_subcapture::content::ContentStats;
use dxcap_subcapture::gpu::GpuStats;
use dxcap_subcapture::{
    AnalyzerResults, CommandRecord, HostMemoryGpu, InclusiveRange, MemorySink, RecordedCommand,
    RestoreReport, StateOrchestrator, SubcaptureConfig,
};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "dxcap-analysis", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Parse an analysis artifact and print it back in canonical form.
    Inspect {
        /// Path to the artifact.
        path: PathBuf,
    },
    /// Print where the analysis artifact of a subcapture is expected.
    ArtifactPath(RangeArgs),
    /// Run a subcapture over a JSON array of command records against host memory.
    Run(RunArgs),
}

#[derive(Debug, Args)]
struct RangeArgs {
    /// Capture stream directory.
    #[arg(long, env = "DXCAP_STREAM_DIR")]
    stream_dir: PathBuf,

    /// Frames to capture: `N` or `START-END`, counted from 1.
    #[arg(long, env = "DXCAP_FRAMES", default_value = "1")]
    frames: InclusiveRange,

    /// Executions narrowing the first and last frame: `N` or `START-END`.
    #[arg(long, env = "DXCAP_EXECUTIONS")]
    executions: Option<InclusiveRange>,
}

#[derive(Debug, Args)]
struct RunArgs {
    #[command(flatten)]
    range: RangeArgs,

    /// JSON file holding the intercepted command records, in call order.
    #[arg(long)]
    script: PathBuf,

    /// Prune acceleration structure states nothing in the range depends on.
    #[arg(long, env = "DXCAP_OPTIMIZE", default_value_t = false)]
    optimize: bool,

    /// Narrow the restore with the analysis artifact found in the stream directory.
    #[arg(long, env = "DXCAP_USE_ANALYSIS", default_value_t = false)]
    use_analysis: bool,

    /// Byte budget of one buffer restore batch.
    #[arg(long, env = "DXCAP_BUFFER_BATCH_BYTES")]
    buffer_batch_bytes: Option<u64>,

    /// Byte budget of one texture restore batch.
    #[arg(long, env = "DXCAP_TEXTURE_BATCH_BYTES")]
    texture_batch_bytes: Option<u64>,

    /// Write the outgoing command stream here as JSON.
    #[arg(long)]
    output: Option<PathBuf>,
}

impl RunArgs {
    fn config(&self) -> SubcaptureConfig {
        let defaults = SubcaptureConfig::default();
        SubcaptureConfig {
            stream_dir: self.range.stream_dir.clone(),
            frames: self.range.frames,
            executions: self.range.executions,
            optimize: self.optimize,
            use_analysis: self.use_analysis,
            buffer_batch_bytes: self.buffer_batch_bytes.unwrap_or(defaults.buffer_batch_bytes),
            texture_batch_bytes: self
                .texture_batch_bytes
                .unwrap_or(defaults.texture_batch_bytes),
            ..defaults
        }
    }
}

#[derive(Debug, Serialize)]
struct RunSummary {
    restore: Option<RestoreReport>,
    records_written: usize,
    restore_records: usize,
    content: ContentStats,
    gpu: GpuStats,
    limitations: Vec<(String, u64)>,
}

fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut stdout = std::io::stdout().lock();
    match cli.command {
        Commands::Inspect { path } => {
            let results = AnalyzerResults::load(&path)
                .with_context(|| format!("failed to load {}", path.display()))?;
            write!(stdout, "{results}")?;
        }
        Commands::ArtifactPath(range) => {
            let path = analysis_path(&range.stream_dir, range.frames, range.executions);
            writeln!(stdout, "{}", path.display())?;
        }
        Commands::Run(args) => {
            let (summary, records) = run(&args.config(), &args.script)?;
            if let Some(output) = &args.output {
                let json = serde_json::to_vec_pretty(&records)?;
                fs::write(output, json)
                    .with_context(|| format!("failed to write {}", output.display()))?;
            }
            serde_json::to_writer_pretty(&mut stdout, &summary)?;
            writeln!(stdout)?;
        }
    }
    Ok(())
}

fn load_script(path: &Path) -> Result<Vec<CommandRecord>> {
    let text =
        fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&text)
        .with_context(|| format!("invalid command script {}", path.display()))
}

fn run(config: &SubcaptureConfig, script: &Path) -> Result<(RunSummary, Vec<RecordedCommand>)> {
    let records = load_script(script)?;
    tracing::info!(records = records.len(), frames = %config.frames, "running subcapture");

    let gpu = HostMemoryGpu::new().with_zero_fill_unknown();
    let mut orchestrator = StateOrchestrator::new(config, gpu, MemorySink::new())?;
    for record in records {
        let key = record.key;
        orchestrator
            .process(record)
            .with_context(|| format!("while processing command {key}"))?;
    }

    let limitations = orchestrator
        .diagnostics()
        .iter()
        .map(|(limitation, count)| (format!("{limitation:?}"), count))
        .collect();
    let restore = orchestrator.report().copied();
    let content = orchestrator.content_stats();
    let gpu = orchestrator.gpu().stats();
    let written = orchestrator.into_sink().into_records();

    let summary = RunSummary {
        restore,
        records_written: written.len(),
        restore_records: written.iter().filter(|record| record.key.is_restore()).count(),
        content,
        gpu,
        limitations,
    };
    Ok((summary, written))
}
