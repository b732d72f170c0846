//! Command line client for WMS, WMTS, WMS-C and XYZ map servers.
//!
//! Builds a provider from a data source URI and renders maps to PNG files,
//! queries features at a point, fetches legends or prints what the server
//! offers.

mod config;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use storage::TileMemoryCache;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;
use wms_common::BoundingBox;
use wms_protocol::{IdentifyFormat, ProviderCapabilities};
use wms_provider::{
    CapabilitiesResponseCache, Feedback, IdentifyContext, ProviderContext, StatsRegistry,
    WmsProvider,
};

use config::{ClientConfig, ConfigOverrides};

#[derive(Parser, Debug)]
#[command(name = "wms-client")]
#[command(about = "Render, query and inspect WMS/WMTS/XYZ data sources")]
struct Args {
    /// YAML configuration file
    #[arg(long, env = "WMS_CLIENT_CONFIG")]
    config: Option<PathBuf>,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log as JSON lines
    #[arg(long)]
    json: bool,

    #[command(flatten)]
    overrides: ConfigOverrides,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Render a map image to a PNG file
    Draw {
        /// Data source URI, e.g. "url=https://host/wms&layers=a&styles=&format=image/png&crs=EPSG:3857"
        uri: String,
        /// View extent as minx,miny,maxx,maxy; defaults to the layer extent
        #[arg(long)]
        bbox: Option<String>,
        #[arg(long, default_value = "512")]
        width: u32,
        #[arg(long, default_value = "512")]
        height: u32,
        #[arg(long)]
        dpi: Option<u32>,
        /// Only use cached tiles
        #[arg(long)]
        preview: bool,
        #[arg(short, long, default_value = "map.png")]
        output: PathBuf,
    },
    /// Query the features at a point given in the image CRS
    Identify {
        uri: String,
        x: f64,
        y: f64,
        #[arg(long, value_enum, default_value = "text")]
        format: FormatArg,
        /// Map extent the point was picked in, as minx,miny,maxx,maxy
        #[arg(long, requires_all = ["width", "height"])]
        bbox: Option<String>,
        #[arg(long)]
        width: Option<u32>,
        #[arg(long)]
        height: Option<u32>,
    },
    /// Fetch the legend graphic of the first layer
    Legend {
        uri: String,
        #[arg(long, default_value = "1000000")]
        scale: f64,
        #[arg(long)]
        dpi: Option<u32>,
        #[arg(short, long, default_value = "legend.png")]
        output: PathBuf,
    },
    /// Print extent, CRS, resolutions and capabilities of a data source
    Info { uri: String },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum FormatArg {
    Text,
    Html,
    Feature,
    Value,
}

impl From<FormatArg> for IdentifyFormat {
    fn from(arg: FormatArg) -> Self {
        match arg {
            FormatArg::Text => IdentifyFormat::Text,
            FormatArg::Html => IdentifyFormat::Html,
            FormatArg::Feature => IdentifyFormat::Feature,
            FormatArg::Value => IdentifyFormat::Value,
        }
    }
}

fn parse_bbox(s: &str) -> Result<BoundingBox> {
    BoundingBox::from_wms_string(s).with_context(|| format!("Invalid bbox '{}'", s))
}

fn init_tracing(log_level: &str, json: bool) -> Result<()> {
    let level = match log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let builder = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .with_writer(std::io::stderr);

    if json {
        tracing::subscriber::set_global_default(builder.json().finish())?;
    } else {
        tracing::subscriber::set_global_default(builder.finish())?;
    }
    Ok(())
}

async fn open_provider(uri: &str, config: &ClientConfig, stats: Arc<StatsRegistry>) -> Result<WmsProvider> {
    let (status_tx, mut status_rx) = tokio::sync::mpsc::unbounded_channel::<String>();
    tokio::spawn(async move {
        while let Some(message) = status_rx.recv().await {
            info!(status = %message, "provider status");
        }
    });

    let provider_config = config.provider.clone();
    let ctx = ProviderContext::new(provider_config.clone())
        .with_tile_cache(Arc::new(TileMemoryCache::new(provider_config.tile_cache_mb)))
        .with_capabilities_cache(Arc::new(CapabilitiesResponseCache::new(
            provider_config.capabilities_expiry_secs,
        )))
        .with_stats(stats)
        .with_status(status_tx);

    let provider = WmsProvider::new(uri, ctx).await;
    if !provider.is_valid() {
        bail!(
            "{}: {}",
            provider.last_error_title(),
            provider.last_error()
        );
    }
    Ok(provider)
}

fn describe_capabilities(caps: ProviderCapabilities) -> Vec<&'static str> {
    [
        (ProviderCapabilities::IDENTIFY, "identify"),
        (ProviderCapabilities::IDENTIFY_VALUE, "identify-value"),
        (ProviderCapabilities::IDENTIFY_TEXT, "identify-text"),
        (ProviderCapabilities::IDENTIFY_HTML, "identify-html"),
        (ProviderCapabilities::IDENTIFY_FEATURE, "identify-feature"),
        (ProviderCapabilities::SIZE, "size"),
    ]
    .into_iter()
    .filter(|(bit, _)| caps.contains(*bit))
    .map(|(_, name)| name)
    .collect()
}

async fn run(args: Args, config: ClientConfig) -> Result<()> {
    let stats = Arc::new(StatsRegistry::new());

    let uri = match &args.command {
        Command::Draw { uri, .. }
        | Command::Identify { uri, .. }
        | Command::Legend { uri, .. }
        | Command::Info { uri } => uri.clone(),
    };
    let mut provider = open_provider(&uri, &config, stats.clone()).await?;

    match args.command {
        Command::Draw {
            bbox,
            width,
            height,
            dpi,
            preview,
            output,
            ..
        } => {
            let view = match bbox {
                Some(b) => parse_bbox(&b)?,
                None => provider.extent(),
            };
            provider.set_dpi(dpi);
            let feedback = if preview {
                Feedback::preview()
            } else {
                Feedback::new()
            };

            let image = provider
                .draw(&view, width, height, Some(&feedback))
                .await
                .context("Draw failed")?;
            image
                .save(&output)
                .with_context(|| format!("Failed to write {}", output.display()))?;

            let error = provider.last_error();
            if !error.is_empty() {
                info!(error = %error, "some requests failed");
            }
            info!(path = %output.display(), width, height, "Map written");
        }
        Command::Identify {
            x,
            y,
            format,
            bbox,
            width,
            height,
            ..
        } => {
            let context = match (bbox, width, height) {
                (Some(b), Some(width), Some(height)) => Some(IdentifyContext {
                    extent: parse_bbox(&b)?,
                    width,
                    height,
                }),
                _ => None,
            };
            let result = provider
                .identify((x, y), format.into(), context)
                .await
                .context("Identify failed")?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Command::Legend {
            scale, dpi, output, ..
        } => {
            let image = provider
                .legend_graphic(scale, dpi, None)
                .await
                .context("Legend download failed")?;
            image
                .save(&output)
                .with_context(|| format!("Failed to write {}", output.display()))?;
            info!(path = %output.display(), "Legend written");
        }
        Command::Info { .. } => {
            let extent = provider.extent();
            let info = serde_json::json!({
                "uri": provider.uri(),
                "crs": provider.image_crs(),
                "tiled": provider.settings().tiled,
                "extent": [extent.min_x, extent.min_y, extent.max_x, extent.max_y],
                "tile_matrix_set": provider.tile_matrix_set().map(|tms| tms.identifier.clone()),
                "resolutions": provider.resolutions(),
                "capabilities": describe_capabilities(provider.capabilities()),
                "layers": provider.settings().active_sub_layers,
            });
            println!("{}", serde_json::to_string_pretty(&info)?);
        }
    }

    if config.print_stats {
        let s = stats.stat_for_uri(&uri);
        println!(
            "cache hits: {}, cache misses: {}, errors: {}",
            s.cache_hits(),
            s.cache_misses(),
            s.errors()
        );
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment from .env file if present
    dotenvy::dotenv().ok();

    let args = Args::parse();
    init_tracing(&args.log_level, args.json)?;

    let mut config = ClientConfig::load_or_default(args.config.as_deref())?;
    config.apply_overrides(&args.overrides);
    info!(?config, "Starting wms-client");

    run(args, config).await
}
