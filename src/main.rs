use std::path::PathBuf;

use activity_tracker::daemon;
use activity_tracker::storage::config::{default_config_path, Config};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(default_config_path);
    let config = Config::load(&config_path);

    if let Err(e) = daemon::run(config).await {
        log::error!("Fatal: {e}");
        return Err(e);
    }
    Ok(())
}
