use std::str::FromStr;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use futures::StreamExt as _;
use tracing_subscriber::{
    EnvFilter, Layer as _, filter::Directive, fmt::format::FmtSpan, layer::SubscriberExt,
    util::SubscriberInitExt as _,
};

use docstream::{
    config::Config,
    convert::FileEntry,
    engine::Engine,
    pipeline::ProcessRequest,
    prelude::*,
    provider::Providers,
    sse,
    ui::Ui,
};

/// Turn documents into schema-validated structured records.
#[derive(Debug, Parser)]
#[clap(
    version,
    after_help = r#"
Environment Variables:
  - OPENAI_API_BASE (optional): Override the server URL.
  - OPENAI_API_KEY: The API key to use.

  These variables may be set in a standard `.env` file.
"#
)]
struct Opts {
    /// Path to a TOML configuration file.
    #[clap(long, global = true)]
    config: Option<PathBuf>,

    #[clap(subcommand)]
    subcmd: Cmd,
}

/// The subcommands we support.
#[derive(Debug, Subcommand)]
enum Cmd {
    /// Process files and print the run's event stream as SSE frames.
    Process(ProcessOpts),
    /// Print the available schemas as JSON.
    Schemas,
    /// Print recent processing runs from the ledger.
    Runs(RunsOpts),
    /// Print aggregate run statistics.
    Stats(StatsOpts),
}

#[derive(Debug, Parser)]
struct ProcessOpts {
    /// Files to process. ZIP archives are expanded.
    #[clap(required = true)]
    files: Vec<PathBuf>,

    /// Schema key to extract with.
    #[clap(long, short = 's')]
    schema: String,

    /// Extra instructions passed to the model.
    #[clap(long, default_value = "")]
    instructions: String,

    /// Model override.
    #[clap(long)]
    model: Option<String>,
}

#[derive(Debug, Parser)]
struct RunsOpts {
    /// Maximum number of runs to print.
    #[clap(long, default_value = "20")]
    limit: usize,

    /// Only show runs for this schema key.
    #[clap(long)]
    schema: Option<String>,
}

#[derive(Debug, Parser)]
struct StatsOpts {
    /// How many days to look back.
    #[clap(long, default_value = "30")]
    days: u32,
}

/// Our entry point, which can return an error. [`anyhow::Result`] will
/// automatically print a nice error message with optional backtrace.
#[tokio::main]
async fn main() -> Result<()> {
    let ui = Ui::init();

    // Initialize tracing.
    let directive =
        Directive::from_str("info").expect("built-in directive should be valid");
    let env_filter = EnvFilter::builder()
        .with_default_directive(directive)
        .from_env_lossy();

    let subscriber = tracing_subscriber::fmt::layer()
        .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
        .with_writer(ui.get_stderr_writer())
        .with_filter(env_filter);

    tracing_subscriber::registry().with(subscriber).init();

    // Call our real `main` function now that logging is set up.
    real_main(ui).await
}

/// Our real entry point.
#[instrument(level = "debug", name = "main", skip_all)]
async fn real_main(ui: Ui) -> Result<()> {
    // Load environment variables from a `.env` file, if it exists.
    dotenvy::dotenv().ok();

    let opts = Opts::parse();
    debug!("Parsed options: {:?}", opts);

    let config = match &opts.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };

    // Everything writes machine-readable output to stdout; keep the
    // progress bars out of the way.
    ui.hide_progress_bars();

    match opts.subcmd {
        Cmd::Process(process_opts) => cmd_process(config, process_opts).await,
        Cmd::Schemas => cmd_schemas(config),
        Cmd::Runs(runs_opts) => cmd_runs(config, runs_opts).await,
        Cmd::Stats(stats_opts) => cmd_stats(config, stats_opts).await,
    }
}

async fn cmd_process(config: Config, opts: ProcessOpts) -> Result<()> {
    let engine = Engine::new(config, Providers::openai()?)?;
    engine.start().await?;

    let files: Vec<FileEntry> = opts.files.iter().map(FileEntry::direct).collect();
    let mut stream = engine
        .process(ProcessRequest {
            files,
            schema_key: opts.schema.clone(),
            instructions: opts.instructions.clone(),
            model_id: opts.model.clone(),
            run_id: None,
        })
        .map_err(|rejected| anyhow!("{rejected}"))?;

    while let Some(event) = stream.next().await {
        print!("{}", sse::frame(&event));
    }

    engine.stop().await;
    Ok(())
}

fn cmd_schemas(config: Config) -> Result<()> {
    let engine = Engine::new(config, noop_providers())?;
    let descriptors = engine.registry.list_descriptors();
    println!("{}", serde_json::to_string_pretty(&descriptors)?);
    Ok(())
}

async fn cmd_runs(config: Config, opts: RunsOpts) -> Result<()> {
    let engine = Engine::new(config, noop_providers())?;
    let runs = engine.ledger.recent_runs(opts.limit, opts.schema).await;
    println!("{}", serde_json::to_string_pretty(&runs)?);
    Ok(())
}

async fn cmd_stats(config: Config, opts: StatsOpts) -> Result<()> {
    let engine = Engine::new(config, noop_providers())?;
    let stats = engine.ledger.stats(opts.days).await;
    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}

/// Read-only commands don't need a working provider; the stub never gets
/// called.
fn noop_providers() -> Providers {
    Providers::stubbed(Arc::new(docstream::provider::stub::StubProvider::always(
        json!({}),
    )))
}
