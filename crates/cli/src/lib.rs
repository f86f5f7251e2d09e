/**
 * Config directory and config file
 *  (~/.atvault/config.toml).
 */
pub mod state;
/**
 * XRPC client for identity resolution and the
 *  sync endpoints, plus the HTTP blob fetcher.
 */
pub mod xrpc;
/**
 * Logging setup, panic hook and interrupt handling.
 */
pub mod process;
/**
 * Terminal save prompts and progress output.
 */
pub mod interactive;

pub use state::{AppConfig, AppState, StateError};
pub use xrpc::{ApiError, HttpFetcher, Identity, PdsBlobSource, XrpcClient};
