//! MCP gateway runtime.
//!
//! Aggregates the tools, prompts and resources of the enabled downstream MCP
//! servers behind one endpoint, serves it over stdio, stdio-over-TCP, SSE or
//! streamable HTTP, and swaps the served capabilities in place when the
//! configuration changes, without dropping connected sessions.

pub mod capabilities;
pub mod config;
pub mod configurator;
pub mod downstream;
pub mod error;
pub mod gateway;
pub mod health;
pub mod interceptors;
pub mod registry;
pub mod reload;
pub mod runtime;
pub mod server;
pub mod transport;

#[cfg(test)]
mod testing;

pub use capabilities::{Capabilities, CapabilityAggregator, ServerTool};
pub use config::{
    ConfigFile, Configuration, GatewayOptions, IN_CONTAINER_ENV, ServerConfig, parse_env_ref,
    resolve_env_vars,
};
pub use configurator::{
    ConfigurationRead, Configurator, FileConfigurator, StaticConfigurator, StopHandle,
};
pub use downstream::ClientPool;
pub use error::{GatewayError, Result};
pub use gateway::Gateway;
pub use health::{Health, HealthState};
pub use registry::{CapabilityRegistry, SessionHandle};
pub use reload::ReloadLoop;
pub use runtime::{ContainerRuntime, DockerCli};
pub use server::{GatewayServer, ServerFactory};
pub use transport::TransportMode;
