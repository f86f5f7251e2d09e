use std::error::Error;
use std::path::PathBuf;
use std::time::Duration;

use atvault::state::{AppState, StateError};
use atvault::xrpc::{ApiError, XrpcClient};

#[derive(Debug, thiserror::Error)]
pub enum ContextError {
    #[error(transparent)]
    State(#[from] StateError),
    #[error(transparent)]
    Api(#[from] ApiError),
}

#[derive(Debug, Clone)]
pub struct OpContext {
    /// Loaded state, or defaults when `init` was never run
    pub state: AppState,
    /// Optional custom config path (defaults to ~/.atvault)
    pub config_path: Option<PathBuf>,
    /// Client for the configured PDS and PLC directory
    pub client: XrpcClient,
}

impl OpContext {
    pub fn new(config_path: Option<PathBuf>) -> Result<Self, ContextError> {
        let state = AppState::load_or_default(config_path.clone())?;
        let client = XrpcClient::new(
            &state.config.pds_url,
            &state.config.plc_directory,
            Duration::from_millis(state.config.attempt_timeout_ms),
        )?;
        Ok(Self {
            state,
            config_path,
            client,
        })
    }
}

#[async_trait::async_trait]
pub trait Op: Send + Sync {
    type Error: Error + Send + Sync + 'static;
    type Output;

    async fn execute(&self, ctx: &OpContext) -> Result<Self::Output, Self::Error>;
}

#[macro_export]
macro_rules! command_enum {
    ($(($variant:ident, $type:ty)),* $(,)?) => {
        #[derive(Subcommand, Debug, Clone)]
        pub enum Command {
            $($variant($type),)*
        }

        #[derive(Debug)]
        pub enum OpOutput {
            $($variant(<$type as $crate::cli::op::Op>::Output),)*
        }

        #[derive(Debug, thiserror::Error)]
        pub enum OpError {
            $(
                #[error(transparent)]
                $variant(<$type as $crate::cli::op::Op>::Error),
            )*
        }

        #[async_trait::async_trait]
        impl $crate::cli::op::Op for Command {
            type Output = OpOutput;
            type Error = OpError;

            async fn execute(&self, ctx: &$crate::cli::op::OpContext) -> Result<Self::Output, Self::Error> {
                match self {
                    $(
                        Command::$variant(op) => {
                            op.execute(ctx).await
                                .map(OpOutput::$variant)
                                .map_err(OpError::$variant)
                        },
                    )*
                }
            }
        }

        impl std::fmt::Display for OpOutput {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                match self {
                    $(
                        OpOutput::$variant(output) => write!(f, "{}", output),
                    )*
                }
            }
        }
    };
}
