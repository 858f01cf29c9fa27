use std::{path::PathBuf, sync::Arc};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use bakery_api::HttpImageProvider;
use bakery_engine::{
    BuildConfig, CancellationFlag, ConsoleUi, ExecutionContext, InMemoryProvider, InMemoryTrackingStore, RemoteProvider, RunReport,
    Sequencer, TrackingStore, Ui, default_config_path, keys, load_config_from_path,
    steps::{CreateImageStep, SourceImageStep},
};
use bakery_store::SqliteTrackingStore;
use bakery_types::{ResourceId, ResourceMetadata, ResourceStatus, TrackingKey, VirtualizationType};

#[derive(Debug, Parser)]
#[command(name = "bakery", version, about = "Bake machine images from running instances")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Create an image from a running instance and record it.
    Bake(BakeArgs),
    /// Load and validate the build configuration.
    Validate {
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Print the configuration path that would be used.
    ConfigPath,
}

#[derive(Debug, clap::Args)]
struct BakeArgs {
    /// Instance the image is captured from.
    #[arg(long)]
    instance_id: String,
    /// Image the instance was launched from.
    #[arg(long)]
    source_image_id: String,
    #[arg(long)]
    config: Option<PathBuf>,
    /// Run against an in-process provider and tracking store.
    #[arg(long)]
    simulate: bool,
    /// Print the run report as JSON.
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Command::Bake(args) => run_bake(args).await,
        Command::Validate { config } => {
            let path = config.unwrap_or_else(default_config_path);
            load_config_from_path(&path)?;
            println!("{} is valid", path.display());
            Ok(())
        }
        Command::ConfigPath => {
            println!("{}", default_config_path().display());
            Ok(())
        }
    }
}

fn log_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(log_filter())
        .with_writer(std::io::stderr)
        .try_init();
}

async fn run_bake(args: BakeArgs) -> Result<()> {
    let path = args.config.clone().unwrap_or_else(default_config_path);
    let config = load_config_from_path(&path)?;
    info!(config = %path.display(), image = %config.image_name, region = %config.region, simulate = args.simulate, "starting bake");

    let cancellation = CancellationFlag::new();
    let signal_flag = cancellation.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; cancelling");
            signal_flag.cancel();
        }
    });

    let mut ctx = build_context(&args, config, cancellation)?;
    let mut sequencer = Sequencer::new().with_step(SourceImageStep::new()).with_step(CreateImageStep::new());
    let report = sequencer.run(&mut ctx).await;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    }
    finish(&report)
}

fn build_context(args: &BakeArgs, config: BuildConfig, cancellation: CancellationFlag) -> Result<ExecutionContext> {
    let source_image_id = ResourceId::from(args.source_image_id.as_str());
    let (provider, tracking_store): (Arc<dyn RemoteProvider>, Arc<dyn TrackingStore>) = if args.simulate {
        simulated_backends(&config, &source_image_id)
    } else {
        let provider = HttpImageProvider::new_from_env(config.region.clone()).context("configure image service client")?;
        (Arc::new(provider), Arc::new(SqliteTrackingStore::open(&config.tracking.database_path)))
    };

    let mut ctx = ExecutionContext::with_cancellation(cancellation);
    ctx.put(keys::CONFIG, config);
    ctx.put(keys::PROVIDER, provider);
    ctx.put(keys::TRACKING_STORE, tracking_store);
    ctx.put(keys::UI, Arc::new(ConsoleUi) as Arc<dyn Ui>);
    ctx.put(keys::SOURCE_IMAGE_ID, source_image_id);
    ctx.put(keys::INSTANCE, ResourceId::from(args.instance_id.as_str()));
    Ok(ctx)
}

/// In-process backends seeded so that a simulated bake of an HVM source succeeds.
fn simulated_backends(config: &BuildConfig, source_image_id: &ResourceId) -> (Arc<dyn RemoteProvider>, Arc<dyn TrackingStore>) {
    let provider = InMemoryProvider::new(config.region.clone()).with_image(ResourceMetadata {
        id: source_image_id.clone(),
        name: format!("{}-source", config.image_name),
        status: ResourceStatus::Available,
        virtualization_type: VirtualizationType::Hvm.to_string(),
        block_devices: Vec::new(),
        created_at: None,
    });
    let tag = config.classification.tag_for(VirtualizationType::Hvm);
    let tracking_store = InMemoryTrackingStore::new().with_record(TrackingKey::new(config.region.as_str(), tag));
    (Arc::new(provider), Arc::new(tracking_store))
}

fn finish(report: &RunReport) -> Result<()> {
    if report.succeeded() {
        info!(steps = report.steps.len(), "bake finished");
        return Ok(());
    }
    match &report.error {
        Some(error) => bail!("bake aborted ({:?}): {error}", report.abort_reason),
        None => bail!("bake aborted ({:?})", report.abort_reason),
    }
}
