//! Stagegraph CLI
//!
//! # Usage
//!
//! ```bash
//! # Show what would run, without deleting anything
//! stagegraph plan demos/decode.yaml exp/tri1/decode --num-jobs 8
//!
//! # Run locally, or submit array jobs to the cluster
//! stagegraph run demos/decode.yaml exp/tri1/decode
//! stagegraph run demos/train.yaml exp/mono --cluster --backend-options "-l walltime=8:00:00"
//! ```

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use stagegraph_orchestration::{
    BackendKind, OrchestratorConfig, PipelineFile, PipelineResult, StageOrchestrator,
    StagePreview, StageRunState, TemplateVars,
};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "stagegraph")]
#[command(about = "Re-runnable partitioned batch stages, locally or on a cluster", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run (local) or submit (cluster) the pipeline
    Run(InvocationArgs),

    /// Report pending work and the range that would be submitted
    Plan(InvocationArgs),
}

#[derive(Args)]
struct InvocationArgs {
    /// Pipeline file (YAML)
    pipeline: PathBuf,

    /// Working directory; commands run here and relative paths resolve here
    work_dir: PathBuf,

    /// Number of partitions, overriding the pipeline file
    #[arg(long)]
    num_jobs: Option<u32>,

    /// Recompute every task, deleting prior outputs first
    #[arg(long)]
    overwrite: bool,

    /// Submit array jobs instead of running local processes
    #[arg(long)]
    cluster: bool,

    /// Passed verbatim into the batch script header
    #[arg(long)]
    backend_options: Option<String>,

    /// Write compressible outputs as .gz
    #[arg(long)]
    compress: bool,

    /// Cap on concurrently running local processes
    #[arg(long)]
    max_parallel: Option<usize>,

    /// Template variable, may be repeated
    #[arg(long = "var", value_name = "KEY=VALUE", value_parser = parse_var)]
    vars: Vec<(String, String)>,

    /// Output format
    #[arg(long, value_enum, default_value = "text")]
    format: OutputFormat,
}

#[derive(Clone, Copy, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

fn parse_var(s: &str) -> std::result::Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.to_string()))
        }
        _ => Err(format!("expected KEY=VALUE, got '{}'", s)),
    }
}

impl InvocationArgs {
    fn load(&self) -> Result<(PipelineFile, OrchestratorConfig, TemplateVars)> {
        let file = PipelineFile::from_yaml_file(&self.pipeline)
            .with_context(|| format!("loading {}", self.pipeline.display()))?;

        let mut config = file.orchestrator_config(&self.work_dir);
        if self.overwrite {
            config.overwrite = true;
        }
        if self.cluster {
            config.backend = BackendKind::Cluster;
        }
        if let Some(options) = &self.backend_options {
            config.backend_options = Some(options.clone());
        }
        if self.compress {
            config.compress_outputs = true;
        }
        if let Some(n) = self.max_parallel {
            config.max_parallel = Some(n);
        }

        let mut vars = TemplateVars::new();
        for (key, value) in &self.vars {
            vars.insert(key.clone(), value);
        }
        Ok((file, config, vars))
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "stagegraph=info,stagegraph_orchestration=info".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let outcome = match cli.command {
        Commands::Run(args) => run(args).await,
        Commands::Plan(args) => plan(args),
    };

    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {:#}", e);
            ExitCode::from(1)
        }
    }
}

async fn run(args: InvocationArgs) -> Result<()> {
    let (file, config, vars) = args.load()?;
    let pipeline = file.build(&vars, args.num_jobs);
    let mut orchestrator = StageOrchestrator::new(config)?;

    let result = orchestrator.run_pipeline(&*pipeline).await?;
    match args.format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&result)?),
        OutputFormat::Text => print_result(&result),
    }
    Ok(())
}

fn plan(args: InvocationArgs) -> Result<()> {
    let (file, config, vars) = args.load()?;
    let pipeline = file.build(&vars, args.num_jobs);
    pipeline.validate()?;
    let orchestrator = StageOrchestrator::new(config)?;

    let stage = pipeline.first_stage(orchestrator.config())?;
    let preview = orchestrator.preview_stage(&stage)?;
    match args.format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&preview)?),
        OutputFormat::Text => print_preview(pipeline.name(), &preview),
    }
    Ok(())
}

fn print_preview(pipeline: &str, preview: &StagePreview) {
    println!("Pipeline: {}", pipeline);
    println!("Stage:    {} ({} tasks)", preview.stage, preview.plan.total);
    println!("Complete: {:?}", preview.plan.complete);
    println!("Pending:  {:?}", preview.plan.pending);
    match &preview.range {
        Some(range) => println!("Range:    {}", range),
        None => println!("Range:    - (nothing to do)"),
    }
}

fn print_result(result: &PipelineResult) {
    if result.skipped {
        println!("{}: final artifact present, nothing to do", result.pipeline);
        return;
    }
    for run in &result.stages {
        let detail = match &run.state {
            StageRunState::Skipped { reason, .. } => reason.clone(),
            StageRunState::Submitted { handle, range, .. } => format!("range {} job {}", range, handle),
            StageRunState::Succeeded { tasks_run, duration_ms, .. } => {
                format!("{} task(s) in {}ms", tasks_run, duration_ms)
            }
            StageRunState::Failed { error, .. } => error.clone(),
            StageRunState::Planned { pending, .. } => format!("pending {:?}", pending),
        };
        println!("{:<24} {:<10} {}", run.stage, run.state.state_name(), detail);
    }
    println!(
        "{}: {} task(s) run, {} already complete, {}ms",
        result.pipeline, result.tasks_run, result.tasks_skipped, result.duration_ms
    );
}
