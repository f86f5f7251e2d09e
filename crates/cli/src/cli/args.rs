pub use clap::Parser;

use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "atvault")]
#[command(version)]
#[command(about = "Export atproto repositories and blobs into portable archives")]
pub struct Args {
    /// Path to the atvault config directory (defaults to ~/.atvault)
    #[arg(long, global = true)]
    pub config_path: Option<PathBuf>,

    /// Log level override (otherwise taken from config, then RUST_LOG)
    #[arg(long, global = true)]
    pub log_level: Option<tracing::Level>,

    #[command(subcommand)]
    pub command: crate::Command,
}
