use std::fs;
use std::io::{self, BufRead, Read, Write};
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use kontext_contracts::job::{FailureKind, Job, JobResponse};
use kontext_engine::config::{HandlerConfig, ProvisionConfig};
use kontext_engine::provision::Provisioner;
use kontext_engine::{handle_job, HandlerContext};
use serde_json::{json, Value};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Exit status used when the worker stops so its supervisor can recycle it.
const REFRESH_EXIT_CODE: i32 = 3;
const DEFAULT_LOG_FILTER: &str = "kontext_cli=info,kontext_engine=info,kontext_contracts=info";
const VERBOSE_LOG_FILTER: &str = "kontext_cli=debug,kontext_engine=debug,kontext_contracts=debug";

#[derive(Debug, Parser)]
#[command(name = "kontext-worker", version, about = "FLUX.1 Kontext image-edit worker")]
struct Cli {
    /// Log at debug level unless RUST_LOG says otherwise.
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Process a single job and print its response.
    Handle(HandleArgs),
    /// Process JSON-lines jobs from stdin until EOF or a worker refresh.
    Worker,
    /// Download the model weights into the local cache.
    FetchWeights(FetchWeightsArgs),
}

#[derive(Debug, Parser)]
struct HandleArgs {
    /// Job file (`{"id", "input"}`); stdin when omitted.
    #[arg(long)]
    job: Option<PathBuf>,
}

#[derive(Debug, Parser)]
struct FetchWeightsArgs {
    #[arg(long)]
    model_id: Option<String>,
    #[arg(long)]
    cache_dir: Option<PathBuf>,
}

fn main() {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_logging(cli.verbose);
    match run(cli) {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            tracing::error!("{err:#}");
            eprintln!("kontext-worker error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn init_logging(verbose: bool) {
    let default = if verbose {
        VERBOSE_LOG_FILTER
    } else {
        DEFAULT_LOG_FILTER
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();
}

fn run(cli: Cli) -> Result<i32> {
    match cli.command {
        Command::Handle(args) => run_handle(args),
        Command::Worker => run_worker(),
        Command::FetchWeights(args) => run_fetch_weights(args),
    }
}

fn build_context() -> Result<HandlerContext> {
    let config = HandlerConfig::from_env()?;
    let ctx = HandlerContext::from_config(&config)?;
    tracing::info!(
        model = ctx.model_name(),
        uploads = ctx.uploads(),
        work_dir = %config.work_dir.display(),
        "worker ready"
    );
    Ok(ctx)
}

fn run_handle(args: HandleArgs) -> Result<i32> {
    let raw = match &args.job {
        Some(path) => fs::read_to_string(path)
            .with_context(|| format!("failed to read job file {}", path.display()))?,
        None => {
            let mut buffer = String::new();
            io::stdin()
                .read_to_string(&mut buffer)
                .context("failed to read job from stdin")?;
            buffer
        }
    };
    let job: Job = serde_json::from_str(&raw).context("job is not valid JSON")?;
    let ctx = build_context()?;
    let response = handle_job(&ctx, &job);
    println!("{}", serde_json::to_string(&response)?);
    Ok(if response.is_success() { 0 } else { 1 })
}

fn run_worker() -> Result<i32> {
    let ctx = build_context()?;
    let stdin = io::stdin();
    let stdout = io::stdout();
    let summary = serve_lines(&ctx, stdin.lock(), stdout.lock())?;
    tracing::info!(
        handled = summary.handled,
        refresh = summary.refresh_requested,
        "worker stopping"
    );
    Ok(if summary.refresh_requested {
        REFRESH_EXIT_CODE
    } else {
        0
    })
}

#[derive(Debug, Default, PartialEq, Eq)]
struct WorkerSummary {
    handled: usize,
    refresh_requested: bool,
}

/// Answers one `{"id", "output"}` line per job line. Stops early once a
/// response asks for the worker to be refreshed.
fn serve_lines<R: BufRead, W: Write>(
    ctx: &HandlerContext,
    input: R,
    mut output: W,
) -> Result<WorkerSummary> {
    let mut summary = WorkerSummary::default();
    for line in input.lines() {
        let line = line.context("failed reading job stream")?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let (id, response) = match serde_json::from_str::<Job>(trimmed) {
            Ok(job) => (job.id.clone(), handle_job(ctx, &job)),
            Err(err) => {
                tracing::warn!("rejecting malformed job line: {err}");
                (
                    None,
                    JobResponse::failure(FailureKind::Input, format!("Invalid job: {err}")),
                )
            }
        };
        let row = json!({
            "id": id.map(Value::String).unwrap_or(Value::Null),
            "output": response,
        });
        writeln!(output, "{}", serde_json::to_string(&row)?)?;
        output.flush()?;
        summary.handled += 1;
        if response.refresh_worker() {
            summary.refresh_requested = true;
            break;
        }
    }
    Ok(summary)
}

fn run_fetch_weights(args: FetchWeightsArgs) -> Result<i32> {
    let mut config = ProvisionConfig::from_env();
    if let Some(model_id) = args.model_id {
        config.model_id = model_id;
    }
    if let Some(cache_dir) = args.cache_dir {
        config.cache_dir = cache_dir;
    }
    let report = Provisioner::new(config).fetch()?;
    tracing::info!(
        model_dir = %report.model_dir.display(),
        downloaded = report.downloaded,
        skipped = report.skipped,
        "weights ready"
    );
    println!("{}", report.model_dir.display());
    Ok(0)
}
