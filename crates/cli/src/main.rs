// CLI modules
mod cli;

use anyhow::Context;
use clap::{Parser, Subcommand};
use cli::{args::Args, op::Op, ExportBlobs, ExportRepo, Init, Inspect, Version};

command_enum! {
    (Inspect, Inspect),
    (ExportRepo, ExportRepo),
    (ExportBlobs, ExportBlobs),
    (Init, Init),
    (Version, Version),
}

async fn run(args: Args) -> anyhow::Result<OpOutput> {
    let ctx = cli::op::OpContext::new(args.config_path.clone())
        .context("failed to load configuration")?;

    let output = args.command.execute(&ctx).await?;
    Ok(output)
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // Logging comes from config when it can be read, defaults otherwise;
    // a broken config is reported by `run`
    let config = atvault::AppState::load_or_default(args.config_path.clone())
        .map(|state| state.config)
        .unwrap_or_default();
    let log_level = args.log_level.unwrap_or_else(|| config.log_level());
    let guards = atvault::process::init_logging(log_level, config.log_dir.as_deref());

    let code = match run(args).await {
        Ok(output) => {
            println!("{}", output);
            0
        }
        Err(e) => {
            eprintln!("Error: {:#}", e);
            1
        }
    };

    // flush buffered log lines before exiting
    drop(guards);
    std::process::exit(code);
}
