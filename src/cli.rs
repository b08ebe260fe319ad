use std::path::PathBuf;

use clap::Parser;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config;
use crate::supervisor::Supervisor;

#[derive(Debug, Parser)]
#[command(
    name = "warden",
    version,
    about = "process supervisor driven by kernel process events"
)]
pub struct Args {
    /// Path to the watch configuration YAML
    pub config: PathBuf,

    /// Override the PID-file directory
    #[arg(long = "pid-dir")]
    pub pid_dir: Option<PathBuf>,

    /// Only log warnings and errors
    #[arg(short = 'q', long = "quiet")]
    pub quiet: bool,
}

pub fn run() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(args.quiet);

    let mut config = config::load_config(&args.config)?;
    if let Some(pid_dir) = args.pid_dir {
        config.pid_dir = Some(pid_dir);
    }

    let mut supervisor = Supervisor::new(&config)?;
    supervisor.init_watches()?;

    info!(watches = supervisor.watches().len(), "warden starting");
    supervisor.run()?;
    info!("warden exiting");
    Ok(())
}

fn init_logging(quiet: bool) {
    let default = if quiet { "warn" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();
}
