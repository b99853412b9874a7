use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

use tilesr_core::backend::{InferenceBackend, OrtModelLoader};
use tilesr_core::catalog::{ModelCatalog, ModelEntry};
use tilesr_core::config::{config_path, data_dir, initialize_data_dir, resolve_relative_to, AppConfig, UpscaleConfig};
use tilesr_core::logging::{self, FileSinkPlan, LoggingInitOptions, RedactingMakeWriter, DEFAULT_LOG_FILTER};
use tilesr_core::model_registry::ModelRegistry;
use tilesr_core::{PixelBuffer, SourceKind, TensorLayout, TileProgress, UpscalePipeline};

#[derive(Parser, Debug)]
#[command(name = "tilesr", about = "Tiled image super-resolution with ONNX models")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(
        short = 'v',
        long = "verbose",
        action = ArgAction::Count,
        global = true,
        help = "Increase log verbosity (-v: debug, -vv: trace)"
    )]
    verbose: u8,

    #[arg(
        long = "log-filter",
        value_name = "FILTER",
        global = true,
        help = "Explicit tracing filter (overrides RUST_LOG and -v)"
    )]
    log_filter: Option<String>,

    #[arg(long, global = true, help = "Data directory (config, models, logs)")]
    data_dir: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Upscale one image.
    Upscale(UpscaleArgs),
    /// List or download catalog models.
    Models(ModelsArgs),
}

#[derive(Args, Debug)]
struct UpscaleArgs {
    #[arg(help = "Input image path")]
    input: PathBuf,
    #[arg(short = 'o', long, help = "Output image path (format from extension)")]
    output: PathBuf,
    #[arg(long, help = "Model id used to cache the open session")]
    model: Option<String>,
    #[arg(long, value_name = "LOCATION", help = "Catalog name, URL or path of the ONNX model")]
    model_path: Option<String>,
    #[arg(long)]
    tile_width: Option<u32>,
    #[arg(long)]
    tile_height: Option<u32>,
    #[arg(long, help = "Pixels shared between neighbouring tiles")]
    overlap: Option<u32>,
    #[arg(long, help = "Upscale factor of the model")]
    scale: Option<u32>,
    #[arg(long, value_parser = parse_layout)]
    layout: Option<TensorLayout>,
    #[arg(long, value_parser = parse_backend)]
    backend: Option<InferenceBackend>,
}

#[derive(Args, Debug)]
struct ModelsArgs {
    #[command(subcommand)]
    action: Option<ModelsAction>,
    #[arg(long, help = "Print the catalog as JSON")]
    json: bool,
}

#[derive(Subcommand, Debug)]
enum ModelsAction {
    /// Download a catalog model into the models directory.
    Download { name: String },
    /// Print catalog entries in the format read from `<models_dir>/catalog.json`.
    Export,
}

fn parse_layout(value: &str) -> std::result::Result<TensorLayout, String> {
    TensorLayout::parse(value)
        .ok_or_else(|| format!("unknown layout '{value}' (expected planar or interleaved)"))
}

fn parse_backend(value: &str) -> std::result::Result<InferenceBackend, String> {
    match value.to_ascii_lowercase().as_str() {
        "cpu" | "cuda" | "tensorrt" | "trt" => Ok(InferenceBackend::from_str_lossy(value)),
        _ => Err(format!(
            "unknown backend '{value}' (expected cpu, cuda or tensorrt)"
        )),
    }
}

pub async fn run_from_env() -> Result<()> {
    let cli = Cli::parse();
    let resolved_data_dir = data_dir(cli.data_dir.as_deref());

    let preloaded = tilesr_core::runtime::setup_runtime_libs();
    init_logging(
        Some(resolved_data_dir.as_path()),
        cli.verbose,
        cli.log_filter.as_deref(),
    );
    tilesr_core::runtime::log_runtime_lib_status(preloaded);
    log_startup_metadata(&resolved_data_dir);

    if let Err(e) = initialize_data_dir(&resolved_data_dir) {
        warn!(error = %e, "Failed to initialize data directory");
    }
    let config = match AppConfig::load_from_path(&config_path(&resolved_data_dir)) {
        Ok(config) => config,
        Err(err) => {
            warn!(error = %format!("{err:#}"), "Failed to load config file, using defaults");
            AppConfig::default()
        }
    };
    let models_dir = resolve_relative_to(&resolved_data_dir, &config.paths.models_dir);

    match cli.command {
        Commands::Upscale(args) => run_upscale(args, config, &resolved_data_dir).await,
        Commands::Models(args) => run_models(args, models_dir).await,
    }
}

fn init_logging(data_dir: Option<&Path>, verbose: u8, cli_log_filter: Option<&str>) {
    let init_options = LoggingInitOptions {
        data_dir: data_dir.map(Path::to_path_buf),
        verbose,
        cli_log_filter: cli_log_filter.map(ToString::to_string),
        rust_log_env: std::env::var("RUST_LOG").ok(),
        ..Default::default()
    };
    let init_plan = logging::compose_logging_init_plan(&init_options);
    let filter = init_plan.filters.effective_filter;

    let console_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(parse_env_filter_with_fallback(&filter, "console"));

    match init_plan.file_sink {
        FileSinkPlan::Ready { appender, .. } => {
            let subscriber = tracing_subscriber::registry().with(console_layer).with(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(RedactingMakeWriter::new(appender))
                    .with_filter(parse_env_filter_with_fallback(&filter, "file")),
            );

            if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
                eprintln!(
                    "Failed to initialize tracing subscriber: {error}. Continuing without structured tracing."
                );
            }
        }
        FileSinkPlan::Fallback {
            attempted_log_dir,
            reason,
        } => {
            let attempted_log_dir = attempted_log_dir
                .as_ref()
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "<none>".to_string());

            let subscriber = tracing_subscriber::registry().with(console_layer);
            if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
                eprintln!(
                    "Failed to initialize tracing subscriber: {error}. Continuing without structured tracing."
                );
                return;
            }

            warn!(
                attempted_log_dir = %attempted_log_dir,
                reason = %reason,
                "Persistent file logging unavailable; continuing with console-only logging"
            );
        }
    }
}

fn parse_env_filter_with_fallback(filter: &str, sink_name: &str) -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::try_new(filter).unwrap_or_else(|error| {
        eprintln!(
            "Invalid {sink_name} log filter '{filter}': {error}. Falling back to '{DEFAULT_LOG_FILTER}'."
        );
        tracing_subscriber::EnvFilter::new(DEFAULT_LOG_FILTER)
    })
}

fn log_startup_metadata(data_dir: &Path) {
    info!(
        version = env!("CARGO_PKG_VERSION"),
        pid = std::process::id(),
        data_dir = %data_dir.display(),
        config_path = %config_path(data_dir).display(),
        "Runtime startup metadata"
    );
}

/// Model id and location for an upscale run.
///
/// `--model-path` wins over the config; with only `--model` given the id
/// doubles as the location (a catalog name).
fn resolve_model(args: &UpscaleArgs, config: &UpscaleConfig) -> (String, String) {
    let location = args
        .model_path
        .clone()
        .or_else(|| args.model.clone())
        .unwrap_or_else(|| config.model_path.clone());
    let model_id = args.model.clone().unwrap_or_else(|| location.clone());
    (model_id, location)
}

/// Layer CLI flags over the config file, filling gaps from catalog metadata.
fn apply_overrides(
    args: &UpscaleArgs,
    mut config: UpscaleConfig,
    entry: Option<&ModelEntry>,
    location: String,
) -> UpscaleConfig {
    config.model_path = location;

    if let Some(entry) = entry {
        if let Some(scale) = entry.scale {
            config.upscale_factor = scale;
        }
        if let Some(tile) = entry.tile_size {
            config.tile_width = tile;
            config.tile_height = tile;
        }
        if let Some(layout) = entry.layout {
            config.layout = layout;
        }
    }

    if let Some(tile_width) = args.tile_width {
        config.tile_width = tile_width;
    }
    if let Some(tile_height) = args.tile_height {
        config.tile_height = tile_height;
    }
    if let Some(overlap) = args.overlap {
        config.overlap_px = overlap;
    }
    if let Some(scale) = args.scale {
        config.upscale_factor = scale;
    }
    if let Some(layout) = args.layout {
        config.layout = layout;
    }
    config
}

async fn run_upscale(args: UpscaleArgs, app_config: AppConfig, data_dir: &Path) -> Result<()> {
    if !args.input.is_file() {
        bail!("Input image does not exist: {}", args.input.display());
    }

    let models_dir = resolve_relative_to(data_dir, &app_config.paths.models_dir);
    let trt_cache_dir = resolve_relative_to(data_dir, &app_config.paths.trt_cache_dir);
    let backend = args.backend.unwrap_or(app_config.inference.backend);

    let catalog = load_catalog(models_dir)?;

    let (model_id, location) = resolve_model(&args, &app_config.upscale);
    let config = apply_overrides(&args, app_config.upscale, catalog.get(&model_id), location);
    config.validate()?;

    info!(
        input = %args.input.display(),
        output = %args.output.display(),
        model = %model_id,
        backend = %backend,
        tile_width = config.tile_width,
        tile_height = config.tile_height,
        overlap = config.overlap_px,
        scale = config.upscale_factor,
        layout = %config.layout,
        "Upscaling image"
    );

    let loader = OrtModelLoader::new(catalog, backend, Some(trt_cache_dir));
    let source = SourceKind::File(args.input.clone());
    let started = Instant::now();

    let pixels = tokio::task::spawn_blocking(move || -> Result<PixelBuffer> {
        let mut registry = ModelRegistry::new(loader);
        let engine = registry.open(&model_id, &config.model_path)?;
        let mut pipeline = UpscalePipeline::new(config)?.with_progress(make_progress_callback());
        Ok(pipeline.run(&source, engine)?)
    })
    .await
    .context("Upscale task panicked")??;

    eprintln!();
    write_output(&pixels, &args.output)?;
    info!(
        output = %args.output.display(),
        width = pixels.width(),
        height = pixels.height(),
        elapsed = %format_duration(started.elapsed().as_secs_f64()),
        "Upscale complete"
    );
    Ok(())
}

fn write_output(pixels: &PixelBuffer, path: &Path) -> Result<()> {
    let format = image::ImageFormat::from_path(path)
        .with_context(|| format!("Cannot infer image format from {}", path.display()))?;
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create output directory: {}", parent.display()))?;
    }

    let rgba = pixels.to_rgba_image();
    let result = if format == image::ImageFormat::Jpeg {
        image::DynamicImage::ImageRgba8(rgba).to_rgb8().save_with_format(path, format)
    } else {
        rgba.save_with_format(path, format)
    };
    result.with_context(|| format!("Failed to write output image: {}", path.display()))
}

/// Builtin models, then `catalog.json`, then unknown `*.onnx` files.
///
/// The catalog file is merged before the directory scan so its metadata
/// wins over placeholder entries for the same file.
fn load_catalog(models_dir: PathBuf) -> Result<ModelCatalog> {
    let mut catalog = ModelCatalog::with_builtin_models(models_dir);
    catalog.load_catalog_file()?;
    if let Err(e) = catalog.discover() {
        warn!(error = %format!("{e:#}"), "Failed to scan models directory");
    }
    Ok(catalog)
}

async fn run_models(args: ModelsArgs, models_dir: PathBuf) -> Result<()> {
    let catalog = load_catalog(models_dir)?;

    match args.action {
        Some(ModelsAction::Download { name }) => {
            let path = tokio::task::spawn_blocking(move || catalog.download(&name))
                .await
                .context("Download task panicked")??;
            println!("{}", path.display());
        }
        Some(ModelsAction::Export) => {
            println!("{}", catalog.to_json()?);
        }
        None if args.json => {
            println!("{}", serde_json::to_string_pretty(&catalog_listing(&catalog))?);
        }
        None => {
            for entry in catalog.list() {
                println!("{}", format_model_line(entry, catalog.is_downloaded(&entry.name)));
            }
        }
    }
    Ok(())
}

fn catalog_listing(catalog: &ModelCatalog) -> serde_json::Value {
    let entries = catalog
        .list()
        .iter()
        .map(|entry| {
            serde_json::json!({
                "name": entry.name,
                "scale": entry.scale,
                "layout": entry.layout,
                "fp16": entry.is_fp16,
                "downloadable": entry.url.is_some(),
                "downloaded": catalog.is_downloaded(&entry.name),
                "path": catalog.model_path(&entry.name),
                "description": entry.description,
            })
        })
        .collect();
    serde_json::Value::Array(entries)
}

fn format_model_line(entry: &ModelEntry, downloaded: bool) -> String {
    let status = if downloaded { "downloaded" } else { "missing" };
    let scale = entry
        .scale
        .map(|s| format!("x{s}"))
        .unwrap_or_else(|| "x?".to_string());
    format!(
        "{:<40} {:>3} {:<10} {}",
        entry.name, scale, status, entry.description
    )
}

fn format_duration(secs: f64) -> String {
    let total = secs.round() as u64;
    let h = total / 3600;
    let m = (total % 3600) / 60;
    let s = total % 60;
    format!("{:02}:{:02}:{:02}", h, m, s)
}

const PROGRESS_BAR_WIDTH: usize = 30;

fn format_progress(progress: &TileProgress, elapsed: f64) -> String {
    let fraction = progress.fraction() as f64;
    let filled = (fraction * PROGRESS_BAR_WIDTH as f64).round() as usize;
    let empty = PROGRESS_BAR_WIDTH.saturating_sub(filled);
    let bar: String = "█".repeat(filled) + &"░".repeat(empty);

    let rate = if elapsed > 0.0 {
        progress.completed as f64 / elapsed
    } else {
        0.0
    };
    let eta = if rate > 0.0 {
        let remaining = progress.total.saturating_sub(progress.completed) as f64;
        format!(" | ETA: {}", format_duration(remaining / rate))
    } else {
        String::new()
    };

    format!(
        "\r[{}] {:5.1}% | Tile {}/{} | {:.1} tiles/s | Elapsed: {}{}    ",
        bar,
        fraction * 100.0,
        progress.completed,
        progress.total,
        rate,
        format_duration(elapsed),
        eta,
    )
}

fn make_progress_callback() -> impl FnMut(TileProgress) + Send + 'static {
    let start = Instant::now();
    move |progress| eprint!("{}", format_progress(&progress, start.elapsed().as_secs_f64()))
}

#[cfg(test)]
mod cli_tests {
    use super::*;

    fn upscale_args(argv: &[&str]) -> UpscaleArgs {
        let cli = Cli::try_parse_from(argv).expect("parse cli");
        match cli.command {
            Commands::Upscale(args) => args,
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn parses_upscale_with_overrides() {
        let cli = Cli::try_parse_from([
            "tilesr", "-vv", "upscale", "in.png", "-o", "out.png", "--tile-width", "128",
            "--overlap", "8", "--layout", "interleaved", "--backend", "trt", "--data-dir", "/d",
        ])
        .unwrap();
        assert_eq!(cli.verbose, 2);
        assert_eq!(cli.data_dir, Some(PathBuf::from("/d")));
        let Commands::Upscale(args) = cli.command else {
            panic!("expected upscale");
        };
        assert_eq!(args.input, PathBuf::from("in.png"));
        assert_eq!(args.output, PathBuf::from("out.png"));
        assert_eq!(args.tile_width, Some(128));
        assert_eq!(args.overlap, Some(8));
        assert_eq!(args.layout, Some(TensorLayout::Interleaved));
        assert_eq!(args.backend, Some(InferenceBackend::Tensorrt));
    }

    #[test]
    fn upscale_requires_output() {
        assert!(Cli::try_parse_from(["tilesr", "upscale", "in.png"]).is_err());
    }

    #[test]
    fn rejects_unknown_layout_and_backend() {
        assert!(Cli::try_parse_from([
            "tilesr", "upscale", "in.png", "-o", "o.png", "--layout", "diagonal"
        ])
        .is_err());
        assert!(Cli::try_parse_from([
            "tilesr", "upscale", "in.png", "-o", "o.png", "--backend", "metal"
        ])
        .is_err());
    }

    #[test]
    fn parses_models_subcommands() {
        let cli = Cli::try_parse_from(["tilesr", "models", "--json"]).unwrap();
        let Commands::Models(args) = cli.command else {
            panic!("expected models");
        };
        assert!(args.json);
        assert!(args.action.is_none());

        let cli = Cli::try_parse_from(["tilesr", "models", "download", "RealESRGAN_x4plus_anime_6B"])
            .unwrap();
        let Commands::Models(ModelsArgs {
            action: Some(ModelsAction::Download { name }),
            ..
        }) = cli.command
        else {
            panic!("expected models download");
        };
        assert_eq!(name, "RealESRGAN_x4plus_anime_6B");

        let cli = Cli::try_parse_from(["tilesr", "models", "export"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Models(ModelsArgs {
                action: Some(ModelsAction::Export),
                ..
            })
        ));
    }

    #[test]
    fn model_resolution_precedence() {
        let config = UpscaleConfig::default();

        let args = upscale_args(&["tilesr", "upscale", "a.png", "-o", "b.png"]);
        let (id, location) = resolve_model(&args, &config);
        assert_eq!(id, config.model_path);
        assert_eq!(location, config.model_path);

        let args = upscale_args(&["tilesr", "upscale", "a.png", "-o", "b.png", "--model", "anime"]);
        assert_eq!(
            resolve_model(&args, &config),
            (String::from("anime"), String::from("anime"))
        );

        let args = upscale_args(&[
            "tilesr", "upscale", "a.png", "-o", "b.png", "--model", "anime", "--model-path",
            "/m/anime.onnx",
        ]);
        assert_eq!(
            resolve_model(&args, &config),
            (String::from("anime"), String::from("/m/anime.onnx"))
        );
    }

    #[test]
    fn overrides_layer_cli_over_catalog_over_config() {
        let catalog = ModelCatalog::with_builtin_models(PathBuf::from("models"));
        let entry = catalog.get("AnimeJaNai_V3_L1_Sharp_HD_x2_FP16");

        let args = upscale_args(&["tilesr", "upscale", "a.png", "-o", "b.png"]);
        let config = apply_overrides(&args, UpscaleConfig::default(), entry, "loc".into());
        assert_eq!(config.upscale_factor, 2);
        assert_eq!(config.model_path, "loc");
        assert_eq!(config.tile_width, 64);

        let args = upscale_args(&[
            "tilesr", "upscale", "a.png", "-o", "b.png", "--scale", "3", "--tile-height", "48",
        ]);
        let config = apply_overrides(&args, UpscaleConfig::default(), entry, "loc".into());
        assert_eq!(config.upscale_factor, 3);
        assert_eq!(config.tile_height, 48);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn discovered_model_keeps_configured_layout() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("2x_custom.onnx"), b"x").unwrap();
        let catalog = load_catalog(dir.path().to_path_buf()).unwrap();
        let entry = catalog.get("2x_custom");
        assert!(entry.is_some_and(|e| e.layout.is_none()));

        let configured = UpscaleConfig {
            layout: TensorLayout::Interleaved,
            ..UpscaleConfig::default()
        };
        let args = upscale_args(&["tilesr", "upscale", "a.png", "-o", "b.png"]);
        let config = apply_overrides(&args, configured.clone(), entry, "2x_custom".into());
        assert_eq!(config.layout, TensorLayout::Interleaved);
        assert_eq!(config.upscale_factor, 2);

        let builtin = ModelCatalog::with_builtin_models(PathBuf::from("models"));
        let config = apply_overrides(
            &args,
            configured,
            builtin.get("RealESRGAN_x4plus_anime_6B"),
            "loc".into(),
        );
        assert_eq!(config.layout, TensorLayout::Planar);
    }

    #[test]
    fn exported_catalog_is_read_back_from_models_dir() {
        let dir = tempfile::tempdir().unwrap();
        let exported = load_catalog(dir.path().to_path_buf())
            .unwrap()
            .to_json()
            .unwrap()
            .replace("RealESRGAN_x4plus_anime_6B", "Renamed_x4")
            .replace("\"planar\"", "\"interleaved\"");
        std::fs::write(dir.path().join("catalog.json"), exported).unwrap();

        let catalog = load_catalog(dir.path().to_path_buf()).unwrap();
        let renamed = catalog.get("Renamed_x4").unwrap();
        assert_eq!(renamed.layout, Some(TensorLayout::Interleaved));
        assert_eq!(renamed.scale, Some(4));
        assert_eq!(catalog.list().len(), 3);
    }
}
