//! CARP daemon binary

use carpd::Config;
use common::LogFormat;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration first (needed for logging settings)
    let config = match Config::load() {
        Ok(cfg) => cfg,
        Err(e) => {
            // Can't use tracing yet - not initialized
            eprintln!("Configuration error: {}", e);
            eprintln!("Using default configuration");
            Config::default()
        }
    };

    let level = config.logging.level.as_deref().unwrap_or("info");
    let format = match config.logging.format.as_deref().map(str::parse::<LogFormat>) {
        Some(Ok(format)) => format,
        Some(Err(e)) => {
            eprintln!("{}, using text", e);
            LogFormat::Text
        }
        None => LogFormat::Text,
    };
    common::logging::init(format, level);

    tracing::info!("carpd starting");

    carpd::run(config).await?;

    Ok(())
}
