use std::path::PathBuf;
use thiserror::Error;

/// Error kinds surfaced at the component seams. Internal plumbing uses
/// `anyhow`; these are the categories callers are expected to branch on.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("task store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("broker unavailable: {0}")]
    BrokerUnavailable(String),

    #[error("plugin not available: {0}")]
    PluginNotAvailable(String),

    #[error("invalid parameters: {0}")]
    ParameterInvalid(String),

    #[error("plugin execution failed: {0}")]
    PluginRuntimeError(String),

    #[error("invalid manifest at {path}: {detail}")]
    ManifestInvalid { path: PathBuf, detail: String },

    #[error("cdc stream disconnected: {0}")]
    CdcDisconnected(String),

    #[error("consumer '{0}' failed: {1}")]
    ConsumerError(String, String),
}
