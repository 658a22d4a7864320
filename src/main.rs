use anyhow::{anyhow, Result};
use clap::{ArgAction, Parser};
use cms_media_pipeline::server::{router, AppState};
use cms_media_pipeline::{
    BatchCompressor, CancelFlag, CompressionSettings, PipelineConfig, UploadSchema,
};
use std::path::PathBuf;
use tokio::net::TcpListener;

/// CLI options
#[derive(Parser, Debug)]
#[command(author, version, about = "Upload ingestion and WebP compression for CMS media")]
struct Args {
    /// Compress the legacy directory once and exit instead of serving
    #[arg(long, action = ArgAction::SetTrue)]
    batch: bool,

    /// Address to bind the HTTP server to
    #[arg(long, default_value = "127.0.0.1")]
    bind: String,

    /// Port for web server (default: 3030)
    #[arg(long, default_value = "3030")]
    port: u16,

    /// Directory compressed uploads are written to
    #[arg(long, default_value = "public/uploads")]
    upload_root: PathBuf,

    /// Directory accepted parts are staged in before decoding
    #[arg(long, default_value = "tmp/uploads")]
    staging_dir: PathBuf,

    /// Legacy upload directory processed by the batch job
    #[arg(long, default_value = "public/uploads/legacy")]
    legacy_dir: PathBuf,

    /// Prefix of the relative paths returned for persistence
    #[arg(long, default_value = "uploads")]
    public_prefix: String,

    /// Byte budget for uploaded images, in KiB
    #[arg(long, default_value = "25")]
    target_kb: u64,

    /// Bounding box (width and height) for uploaded images
    #[arg(long, default_value = "800")]
    max_dimension: u32,

    /// Number of batch workers (defaults to CPU count)
    #[arg(short, long)]
    jobs: Option<usize>,

    /// Quality the search starts from (0-100)
    #[arg(long, default_value = "50")]
    initial_quality: u8,

    /// Lowest quality the search may reach
    #[arg(long, default_value = "10")]
    quality_floor: u8,
}

impl Args {
    fn to_config(&self) -> PipelineConfig {
        PipelineConfig {
            upload_root: self.upload_root.clone(),
            staging_dir: self.staging_dir.clone(),
            legacy_dir: self.legacy_dir.clone(),
            public_prefix: self.public_prefix.clone(),
            upload_target_bytes: self.target_kb.saturating_mul(1024),
            upload_max_width: self.max_dimension,
            upload_max_height: self.max_dimension,
            jobs: self.jobs.unwrap_or_else(num_cpus::get),
            compression: CompressionSettings {
                initial_quality: self.initial_quality,
                floor: self.quality_floor,
                ..CompressionSettings::default()
            },
        }
    }
}

async fn start_web_server(config: PipelineConfig, bind: &str, port: u16) -> Result<()> {
    let state = AppState::new(config, UploadSchema::project())?;
    let app = router(state);

    let addr = format!("{}:{}", bind, port);
    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|e| anyhow!("Failed to bind to {}: {}", addr, e))?;

    log::info!("🚀 Media pipeline listening on http://{}", addr);

    axum::serve(listener, app)
        .await
        .map_err(|e| anyhow!("Server error: {}", e))?;

    Ok(())
}

fn run_batch_mode(config: &PipelineConfig) -> Result<()> {
    let batch = BatchCompressor::new(config)?;
    let summary = batch
        .run(&config.legacy_dir, &CancelFlag::new())
        .map_err(|e| anyhow!("Batch run failed: {}", e))?;

    println!("{}", serde_json::to_string_pretty(&summary)?);
    if summary.failed > 0 {
        eprintln!("{} file(s) failed; originals were kept.", summary.failed);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let config = args.to_config();
    config.compression.validate()?;

    if args.batch {
        return tokio::task::spawn_blocking(move || run_batch_mode(&config)).await?;
    }

    start_web_server(config, &args.bind, args.port).await
}
