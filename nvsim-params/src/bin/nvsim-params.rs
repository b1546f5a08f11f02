use std::path::PathBuf;

use anyhow::{Context as _, Result};
use clap::Parser;
use nvsim_params::NandCell;
use tracing::{info, level_filters::LevelFilter};
use tracing_subscriber::EnvFilter;

/// Computes the parasitic RC parameters of a 3D NAND cell and writes them as NVSim
/// configuration files.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// INI file describing the cell geometry and materials
    config: PathBuf,

    /// directory receiving the generated .cfg files
    #[arg(short, long, env = "NVSIM_PARAMS_OUT_DIR", default_value = "./config")]
    out_dir: PathBuf,
}

fn main() -> Result<()> {
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("failed to set global subscriber")?;
    let args = Args::parse();

    let cell = NandCell::load(&args.config)
        .with_context(|| format!("reading cell description {}", args.config.display()))?;
    let written = cell
        .write_all(&args.out_dir)
        .with_context(|| format!("writing configuration to {}", args.out_dir.display()))?;
    info!("{} configuration files written", written.len());
    Ok(())
}
