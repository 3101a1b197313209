//! Command-line entry point for the WAL archive streamer.

use anyhow::Context;
use camino::Utf8PathBuf;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use walarchiver::error::ArchiveError;
use walarchiver::{receive_wal, WalArchiverConf};

#[derive(Parser)]
#[command(
    version,
    about = "Stream WAL from a primary into a local segment archive"
)]
struct Args {
    /// Connection string for the primary. Names the server and
    /// credentials; must not specify a database.
    #[arg(short = 'c', long = "conninfo")]
    conninfo: String,

    /// Archive directory. Must already exist; completed segments are
    /// published here, partial state under its inprogress/ subdirectory.
    #[arg(short = 'D', long = "directory")]
    archive_dir: Utf8PathBuf,

    /// Increase logging: once for lifecycle events, twice for per-frame
    /// detail. RUST_LOG overrides when set.
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let default_directive = match args.verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    if !args.archive_dir.is_dir() {
        return Err(ArchiveError::Config(format!(
            "archive directory '{}' does not exist",
            args.archive_dir
        ))
        .into());
    }

    let conf = WalArchiverConf {
        conninfo: args.conninfo,
        archive_dir: args.archive_dir,
        verbose: args.verbose,
    };

    // The whole receiver is one cooperative task; a single-threaded
    // runtime is all it needs.
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to create runtime")?;
    runtime
        .block_on(receive_wal::run(conf))
        .context("streaming WAL")?;
    Ok(())
}
