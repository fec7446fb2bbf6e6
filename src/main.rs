use std::io::BufRead;

use clap::Parser;
use person_heatmap::{config, train};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("person_heatmap=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if cfg!(debug_assertions) {
        warn!(
            "running a debug build. Training can be much slower. Use `cargo run --release ...`."
        );
    }
    let cfg = config::TrainConfig::parse();
    let summary = train::run_training(&cfg)?;

    if cfg.pause {
        info!(
            "Sample prediction written to {}; press Enter to exit",
            summary.output_dir.display()
        );
        let mut line = String::new();
        std::io::stdin().lock().read_line(&mut line)?;
    }
    Ok(())
}
