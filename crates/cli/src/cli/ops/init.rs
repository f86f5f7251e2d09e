use std::path::PathBuf;

use clap::Args;
use url::Url;

use atvault::state::{AppConfig, AppState, StateError};

#[derive(Args, Debug, Clone)]
pub struct Init {
    /// PDS used to resolve handles
    #[arg(long)]
    pub pds_url: Option<Url>,

    /// Default directory for exported bundles
    #[arg(long)]
    pub output_dir: Option<PathBuf>,

    /// Directory for daily rolling log files
    #[arg(long)]
    pub log_dir: Option<PathBuf>,
}

#[derive(Debug, thiserror::Error)]
pub enum InitError {
    #[error("init failed: {0}")]
    StateFailed(#[from] StateError),
}

#[async_trait::async_trait]
impl crate::cli::op::Op for Init {
    type Error = InitError;
    type Output = String;

    async fn execute(&self, ctx: &crate::cli::op::OpContext) -> Result<Self::Output, Self::Error> {
        let mut config = AppConfig {
            output_dir: self.output_dir.clone(),
            log_dir: self.log_dir.clone(),
            ..Default::default()
        };
        if let Some(pds_url) = &self.pds_url {
            config.pds_url = pds_url.clone();
        }

        let state = AppState::init(ctx.config_path.clone(), Some(config))?;

        let output = format!(
            "Initialized atvault directory at: {}\n\
             - Config: {}\n\
             - PDS: {}\n\
             - Exports: {}\n\
             - Concurrency: {}, retries: {}, chunk size: {}",
            state.atvault_dir.display(),
            state.config_path.display(),
            state.config.pds_url,
            state.output_dir().display(),
            state.config.concurrency,
            state.config.max_retries,
            state.config.chunk_threshold,
        );

        Ok(output)
    }
}
