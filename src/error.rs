//! Error types for gateway startup, reload and serving.

use thiserror::Error;

/// Main error type for gateway operations
#[derive(Error, Debug)]
pub enum GatewayError {
    /// The early listener could not be bound
    #[error("binding listener on {0}: {1}")]
    Bind(String, std::io::Error),

    /// The configuration source could not be read or parsed
    #[error("reading configuration '{0}': {1}")]
    ConfigRead(String, String),

    /// Invalid configuration for a named server
    #[error("invalid config for server '{0}': {1}")]
    InvalidConfig(String, String),

    /// Pulling or verifying a server image failed
    #[error("pulling and verifying image '{0}': {1}")]
    PullVerify(String, String),

    /// The gateway could not work out which container networks it is attached to
    #[error("guessing network: {0}")]
    NetworkDiscovery(String),

    /// Capability listing failed as a whole
    #[error("listing resources: {0}")]
    ListCapabilities(String),

    /// An interceptor spec could not be parsed or failed to run
    #[error("interceptor '{0}': {1}")]
    Interceptor(String, String),

    /// A network transport was selected without a port
    #[error("missing 'port' for '{0}' server")]
    MissingPort(String),

    /// The requested transport is not one we know how to serve
    #[error("unknown transport \"{0}\", expected 'stdio', 'sse' or 'streaming'")]
    UnknownTransport(String),

    /// A downstream connection could not be established
    #[error("connecting to server '{0}': {1}")]
    Connect(String, String),

    /// The active transport failed while serving
    #[error("transport '{0}' failed: {1}")]
    Transport(String, String),
}

/// Result type alias for gateway operations
pub type Result<T> = std::result::Result<T, GatewayError>;
