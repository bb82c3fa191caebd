use anyhow::{Context, Result};
use std::{path::PathBuf, sync::Arc};
use structopt::StructOpt;
use train::config::Config;

#[derive(Debug, Clone, StructOpt)]
/// Train a YOLOv1 grid detector.
struct Args {
    #[structopt(long, default_value = "train.json5")]
    /// configuration file
    config_file: PathBuf,
}

fn main() -> Result<()> {
    pretty_env_logger::init();
    let Args { config_file } = Args::from_args();
    let config = Arc::new(
        Config::open(&config_file)
            .with_context(|| format!("failed to load config file {}", config_file.display()))?,
    );
    train::start(config)?;
    Ok(())
}
