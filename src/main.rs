//! IronPress CLI - parallel batch image optimizer
//!
//! Optimizes JPEG, PNG and WebP images in bulk: converts wide-gamut sources to
//! sRGB, downsizes them to a preset and re-encodes them, writing
//! `<name>-optimized.<ext>` next to the originals or into an output folder.

use std::path::{Path, PathBuf};
use std::process;

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand, ValueEnum};
use console::style;
use crossbeam::channel::unbounded;
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{debug, warn};

use ironpress::config::Profiles;
use ironpress::parallel::IngestEvent;
use ironpress::processing::OutputPlan;
use ironpress::{
    init_with_config, ingest_with_events, BatchEvent, BatchHandle, BatchScheduler, BatchSummary,
    ColorIntent, CompressionProfile, Config, Destination, IngestOptions, OutputFormat,
    ResizePreset, ThumbnailCache,
};

/// IronPress - parallel batch image optimizer
#[derive(Parser)]
#[command(
    name = "ironpress",
    version,
    about = "Parallel batch image optimizer with color management",
    long_about = "IronPress converts, downsizes and recompresses JPEG, PNG and WebP images in \
                  bulk. Wide-gamut sources are converted to sRGB, originals are never \
                  overwritten and previews are kept in a persistent thumbnail cache."
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path (TOML or YAML)
    #[arg(short, long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Thumbnail cache directory
    #[arg(long, global = true, value_name = "DIR", env = "IRONPRESS_CACHE_DIR")]
    cache_dir: Option<PathBuf>,

    /// Output events and reports as JSON lines
    #[arg(long, global = true)]
    json: bool,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Quiet mode (errors only)
    #[arg(short = 'Q', long, global = true, conflicts_with = "verbose")]
    quiet: bool,
}

/// Available subcommands
#[derive(Subcommand)]
enum Commands {
    /// Optimize images and write `-optimized` copies
    Optimize(OptimizeArgs),
    /// Inspect images and generate previews without optimizing
    Scan {
        /// Files or directories
        #[arg(required = true, value_name = "PATH")]
        inputs: Vec<PathBuf>,
        /// Skip preview generation
        #[arg(long)]
        no_previews: bool,
    },
    /// Fetch the cached preview of one image
    Thumbnail {
        /// Source image
        input: PathBuf,
        /// Copy the preview to this file
        #[arg(short, long, value_name = "FILE")]
        output: Option<PathBuf>,
    },
    /// Maintain the thumbnail cache
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },
    /// List available option profiles
    Profiles {
        /// Show detailed profile information
        #[arg(long)]
        detailed: bool,
    },
    /// Generate example configuration file
    ExampleConfig {
        /// Output file path
        #[arg(short, long, default_value = "ironpress.toml")]
        output: PathBuf,
        /// Use YAML format instead of TOML
        #[arg(long)]
        yaml: bool,
    },
    /// Show system information and capabilities
    Info,
}

#[derive(Subcommand, Clone, Copy)]
enum CacheAction {
    /// Remove entries past the retention window
    Clean,
    /// Remove every entry
    Clear,
    /// Show entry count and size
    Stats,
}

#[derive(Args)]
struct OptimizeArgs {
    /// Files or directories
    #[arg(required = true, value_name = "PATH")]
    inputs: Vec<PathBuf>,

    /// Named profile to start from
    #[arg(short, long, value_name = "NAME")]
    profile: Option<String>,

    /// Output format
    #[arg(short, long, value_enum)]
    format: Option<CliFormat>,

    /// Compression profile
    #[arg(short = 'C', long, value_enum)]
    compression: Option<CliCompression>,

    /// Resize preset: none, 4k, 2k, fullhd, hd, sd or WIDTHxHEIGHT
    #[arg(short, long, value_name = "PRESET")]
    resize: Option<ResizePreset>,

    /// Write outputs into this folder instead of beside the originals
    #[arg(short, long, value_name = "DIR")]
    output_dir: Option<PathBuf>,

    /// Rendering intent for sRGB conversion
    #[arg(long, value_enum)]
    intent: Option<CliIntent>,

    /// Number of worker threads (default: logical cores)
    #[arg(short = 'j', long, value_name = "COUNT")]
    workers: Option<usize>,

    /// Drop GPS location from the copied EXIF
    #[arg(long)]
    strip_gps: bool,

    /// Write outputs without any EXIF
    #[arg(long, conflicts_with = "strip_gps")]
    no_exif: bool,

    /// Show what would be processed without actually processing
    #[arg(long)]
    dry_run: bool,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum CliFormat {
    Jpeg,
    Png,
    Webp,
}

impl From<CliFormat> for OutputFormat {
    fn from(format: CliFormat) -> Self {
        match format {
            CliFormat::Jpeg => OutputFormat::Jpeg,
            CliFormat::Png => OutputFormat::Png,
            CliFormat::Webp => OutputFormat::WebP,
        }
    }
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum CliCompression {
    Smallest,
    Balanced,
    BestQuality,
    Lossless,
}

impl From<CliCompression> for CompressionProfile {
    fn from(profile: CliCompression) -> Self {
        match profile {
            CliCompression::Smallest => CompressionProfile::Smallest,
            CliCompression::Balanced => CompressionProfile::Balanced,
            CliCompression::BestQuality => CompressionProfile::BestQuality,
            CliCompression::Lossless => CompressionProfile::Lossless,
        }
    }
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum CliIntent {
    Perceptual,
    RelativeColorimetric,
    Saturation,
    AbsoluteColorimetric,
}

impl From<CliIntent> for ColorIntent {
    fn from(intent: CliIntent) -> Self {
        match intent {
            CliIntent::Perceptual => ColorIntent::Perceptual,
            CliIntent::RelativeColorimetric => ColorIntent::RelativeColorimetric,
            CliIntent::Saturation => ColorIntent::Saturation,
            CliIntent::AbsoluteColorimetric => ColorIntent::AbsoluteColorimetric,
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match run(cli).await {
        Ok(code) => process::exit(code),
        Err(e) => {
            eprintln!("{}: {:#}", style("Error").red().bold(), e);
            process::exit(1);
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<i32> {
    let mut config = load_config(cli.config.as_deref())?;
    if let Some(dir) = &cli.cache_dir {
        config.cache.directory = Some(dir.clone());
    }
    if cli.quiet {
        config.logging.level = "error".to_string();
    } else if cli.verbose {
        config.logging.level = "debug".to_string();
    }

    init_with_config(&config).context("Failed to initialize IronPress")?;

    match cli.command {
        Commands::Optimize(args) => optimize(args, config, cli.json).await,
        Commands::Scan { inputs, no_previews } => scan(&inputs, no_previews, &config, cli.json),
        Commands::Thumbnail { input, output } => thumbnail(&input, output.as_deref(), &config),
        Commands::Cache { action } => cache(action, &config, cli.json),
        Commands::Profiles { detailed } => {
            show_profiles(&config, detailed);
            Ok(0)
        }
        Commands::ExampleConfig { output, yaml } => generate_example_config(&output, yaml),
        Commands::Info => show_system_info(cli.json),
    }
}

/// Built-in profiles stay available next to the ones a file defines
fn load_config(path: Option<&Path>) -> anyhow::Result<Config> {
    let Some(path) = path else {
        return Ok(Config::default());
    };

    let mut config = Config::from_file(path)
        .with_context(|| format!("Failed to load configuration from {}", path.display()))?;
    for (name, profile) in Profiles::all() {
        config.profiles.entry(name).or_insert(profile);
    }
    config.validate()?;
    debug!("Loaded configuration from: {:?}", path);
    Ok(config)
}

async fn optimize(args: OptimizeArgs, config: Config, json: bool) -> anyhow::Result<i32> {
    let mut options = config.resolve_options(args.profile.as_deref())?;
    if let Some(format) = args.format {
        options.output_format = format.into();
    }
    if let Some(compression) = args.compression {
        options.compression_profile = compression.into();
    }
    if let Some(resize) = args.resize {
        options.resize_preset = resize;
    }
    if let Some(intent) = args.intent {
        options.color_intent = intent.into();
    }
    if args.strip_gps {
        options.exif.strip_gps = true;
    }
    if args.no_exif {
        options.exif.preserve_all = false;
    }
    if let Some(dir) = &args.output_dir {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create output directory {}", dir.display()))?;
        options.destination = Destination::CustomFolder(dir.clone());
    }

    let mut engine = config.engine.clone();
    if args.workers.is_some() {
        engine.workers = args.workers;
    }
    let scheduler = BatchScheduler::with_engine(engine.clone());
    let options = scheduler.prepare_options(options)?;

    let inputs = args.inputs;
    let ingest_options = IngestOptions {
        engine,
        previews: false,
    };
    let (ingested, rejected) = tokio::task::spawn_blocking(move || {
        let (tx, rx) = unbounded();
        let report = ingest_with_events(&inputs, &ingest_options, None, Some(&tx));
        drop(tx);
        let rejected: Vec<IngestEvent> = rx
            .try_iter()
            .filter(|event| matches!(event, IngestEvent::Rejected { .. }))
            .collect();
        report.map(|report| (report, rejected))
    })
    .await??;

    for event in &rejected {
        if json {
            println!("{}", serde_json::to_string(event)?);
        } else if let IngestEvent::Rejected { error, .. } = event {
            eprintln!("{} {}", style("skipped").yellow(), error);
        }
    }

    let tasks = ingested.tasks();
    if tasks.is_empty() && rejected.is_empty() {
        bail!("No image files found in the given paths");
    }

    if args.dry_run {
        println!("{} files would be processed:", style(tasks.len()).bold());
        let plan = OutputPlan::new(&tasks, &options);
        for task in &tasks {
            let output = match plan.output_for(&task.source_path) {
                Some(output) => output.to_path_buf(),
                None => options.output_path_for(&task.source_path)?,
            };
            println!("  {} -> {}", task.source_path.display(), output.display());
        }
        return Ok(0);
    }

    let handle = scheduler.dispatch(tasks, options)?;

    let token = handle.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("{}: finishing in-flight files, skipping the rest", style("Cancelling").yellow().bold());
            token.cancel();
        }
    });

    let summary = tokio::task::spawn_blocking(move || drain_events(handle, json)).await??;

    if !json {
        print_summary(&summary, rejected.len());
    }

    let clean = summary.failed == 0 && summary.cancelled == 0 && rejected.is_empty();
    Ok(if clean { 0 } else { 1 })
}

/// Follow the event stream until `Finished`
fn drain_events(handle: BatchHandle, json: bool) -> anyhow::Result<BatchSummary> {
    let progress = if json {
        None
    } else {
        let pb = ProgressBar::new(handle.progress().total as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {pos}/{len} ({per_sec}, {eta}) {msg}")?
                .progress_chars("#>-"),
        );
        Some(pb)
    };

    for event in handle.events().iter() {
        if json {
            println!("{}", serde_json::to_string(&event)?);
        }

        match &event {
            BatchEvent::TaskStarted { path } => {
                if let Some(pb) = &progress {
                    pb.set_message(file_name(path));
                }
            }
            BatchEvent::TaskCompleted { .. } => {
                if let Some(pb) = &progress {
                    pb.inc(1);
                }
            }
            BatchEvent::TaskFailed { error, .. } => {
                if let Some(pb) = &progress {
                    pb.println(format!("{} {}", style("failed").red(), error));
                    pb.inc(1);
                }
            }
            BatchEvent::Finished(_) => break,
            BatchEvent::Started { .. } => {}
        }
    }

    if let Some(pb) = &progress {
        pb.finish_and_clear();
    }

    Ok(handle.wait()?)
}

fn scan(inputs: &[PathBuf], no_previews: bool, config: &Config, json: bool) -> anyhow::Result<i32> {
    let cache = if config.cache.enabled && !no_previews {
        Some(ThumbnailCache::open(&config.cache)?)
    } else {
        None
    };
    let options = IngestOptions {
        engine: config.engine.clone(),
        previews: cache.is_some(),
    };

    let (tx, rx) = unbounded();
    let report = std::thread::scope(|scope| {
        let ingestion = scope.spawn({
            let (options, cache) = (&options, cache.as_ref());
            move || ingest_with_events(inputs, options, cache, Some(&tx))
        });

        for event in rx.iter() {
            if json {
                match serde_json::to_string(&event) {
                    Ok(line) => println!("{line}"),
                    Err(e) => warn!("Could not serialize event: {}", e),
                }
            } else {
                print_ingest_event(&event);
            }
        }

        ingestion.join()
    })
    .map_err(|_| anyhow::anyhow!("Ingestion thread panicked"))??;

    if !json {
        println!();
        println!(
            "{} accepted, {} rejected",
            style(report.accepted.len()).green().bold(),
            style(report.rejected.len()).red().bold()
        );
    }
    Ok(0)
}

fn print_ingest_event(event: &IngestEvent) {
    match event {
        IngestEvent::Scanned { file, current, total } => {
            let task = &file.task;
            let dimensions = task
                .dimensions
                .map(|(w, h)| format!("{w}x{h}"))
                .unwrap_or_else(|| "?x?".to_string());
            println!(
                "[{current}/{total}] {} {} {} {}{}",
                style("ok").green(),
                task.source_path.display(),
                style(&task.detected_mimetype).dim(),
                dimensions,
                if task.needs_color_conversion {
                    format!(" ({})", task.detected_color_profile)
                } else {
                    String::new()
                }
            );
            if let Some(capture) = &file.capture {
                let camera = [capture.make.as_deref(), capture.model.as_deref()]
                    .into_iter()
                    .flatten()
                    .collect::<Vec<_>>()
                    .join(" ");
                if !camera.is_empty() {
                    println!("    camera: {camera}");
                }
            }
            if let Some(preview) = &file.preview_path {
                println!("    preview: {}", preview.display());
            }
        }
        IngestEvent::Rejected { error, current, total, .. } => {
            println!("[{current}/{total}] {} {}", style("rejected").red(), error);
        }
    }
}

fn thumbnail(input: &Path, output: Option<&Path>, config: &Config) -> anyhow::Result<i32> {
    let cache = ThumbnailCache::open(&config.cache)?;
    let bytes = cache.thumbnail_for(input)?;

    match output {
        Some(output) => {
            std::fs::write(output, &bytes)
                .with_context(|| format!("Failed to write {}", output.display()))?;
            println!("{}", output.display());
        }
        None => {
            let source = std::fs::canonicalize(input)?;
            let modified = std::fs::metadata(&source)?.modified()?;
            println!("{}", cache.entry_path(&source, modified).display());
        }
    }
    Ok(0)
}

fn cache(action: CacheAction, config: &Config, json: bool) -> anyhow::Result<i32> {
    let (cache, evicted) = ThumbnailCache::open_with_eviction(&config.cache)?;

    match action {
        CacheAction::Clean => {
            println!("Removed {} expired thumbnails", evicted);
        }
        CacheAction::Clear => {
            let removed = cache.clear()?;
            println!("Removed {} thumbnails", removed);
        }
        CacheAction::Stats => {
            let stats = cache.stats()?;
            if json {
                println!("{}", serde_json::to_string(&stats)?);
            } else {
                println!("{}: {}", style("Directory").bold(), stats.directory.display());
                println!("{}: {}", style("Entries").bold(), stats.entries);
                println!("{}: {:.1} KB", style("Size").bold(), stats.total_bytes as f64 / 1024.0);
            }
        }
    }
    Ok(0)
}

/// Show available profiles
fn show_profiles(config: &Config, detailed: bool) {
    println!("{}", style("Available Profiles:").bold());
    println!();

    let mut names: Vec<_> = config.profiles.keys().collect();
    names.sort();

    for name in names {
        println!("{}", style(name).cyan().bold());
        if detailed {
            println!("  {}", Profiles::describe(&config.profiles[name]));
            println!();
        }
    }

    if !detailed {
        println!();
        println!("Use {} for detailed information", style("--detailed").dim());
    }
}

/// Generate example configuration file
fn generate_example_config(output: &Path, yaml: bool) -> anyhow::Result<i32> {
    let is_yaml_path = matches!(
        output.extension().and_then(|ext| ext.to_str()),
        Some("yaml" | "yml")
    );
    let output = if yaml && !is_yaml_path {
        output.with_extension("yaml")
    } else {
        output.to_path_buf()
    };

    Config::default().to_file(&output)?;

    let format = if yaml || is_yaml_path { "YAML" } else { "TOML" };
    println!(
        "{}: Generated example {} configuration: {}",
        style("Success").green().bold(),
        format,
        output.display()
    );
    Ok(0)
}

/// Show system information
fn show_system_info(json: bool) -> anyhow::Result<i32> {
    let info = ironpress::system::system_info();

    if json {
        println!("{}", serde_json::to_string(&info)?);
        return Ok(0);
    }

    println!("{}", style("IronPress System Information").bold());
    println!();
    println!("{}: {}", style("Version").bold(), ironpress::VERSION);
    println!();

    println!("{}", style("System:").bold());
    match &info.os_version {
        Some(version) => println!("  OS: {} {}", info.os_name, version),
        None => println!("  OS: {}", info.os_name),
    }
    println!("  CPUs: {} logical", info.cpu_cores);
    if let Some(brand) = &info.cpu_brand {
        println!("  CPU: {brand}");
    }
    println!(
        "  Memory: {:.2} GB total, {:.2} GB available",
        info.total_memory_gb, info.available_memory_gb
    );
    println!();

    println!("{}", style("Supported Formats:").bold());
    println!("  Input: JPEG, PNG, WebP");
    println!("  Output: JPEG, PNG (quantized + optimized), WebP (lossy and lossless)");
    println!("  Color: Adobe RGB, Display P3 and ProPhoto RGB converted to sRGB");
    Ok(0)
}

/// Print processing summary
fn print_summary(summary: &BatchSummary, rejected: usize) {
    println!();
    println!("{}", style("Processing Summary:").bold());
    println!("  {}: {}", style("Optimized").green(), summary.succeeded);
    if summary.failed > 0 {
        println!("  {}: {}", style("Failed").red(), summary.failed);
    }
    if rejected > 0 {
        println!("  {}: {}", style("Skipped").yellow(), rejected);
    }
    if summary.cancelled > 0 {
        println!("  {}: {}", style("Cancelled").yellow(), summary.cancelled);
    }
    println!("  {}: {:.2}s", style("Duration").blue(), summary.elapsed.as_secs_f64());

    if summary.succeeded > 0 {
        println!(
            "  {}: {:.1}KB → {:.1}KB ({:.1}% reduction)",
            style("Size").cyan(),
            summary.total_original_kb,
            summary.total_optimized_kb,
            summary.average_reduction_percentage
        );
        println!("  {}: {}", style("Speed").cyan(), summary.speed_text());
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}
