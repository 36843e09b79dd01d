//! Gateway configuration: the TOML server catalog, the per-snapshot
//! `Configuration` value, and the run options chosen on the command line.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::GatewayError;

/// Environment variable that turns on container-network discovery.
pub const IN_CONTAINER_ENV: &str = "MCP_GATEWAY_IN_CONTAINER";

/// Strip an env var reference to its variable name.
///
/// Accepts `${VAR_NAME}` syntax only. Returns `None` for literal values.
pub fn parse_env_ref(value: &str) -> Option<&str> {
    value.strip_prefix("${").and_then(|s| s.strip_suffix('}'))
}

/// Resolve a server's env map: `${VAR}` references are read from the process
/// environment (unset resolves to empty), literals pass through.
pub fn resolve_env_vars(env: &HashMap<String, String>) -> HashMap<String, String> {
    env.iter()
        .map(|(k, v)| {
            let resolved = match parse_env_ref(v) {
                Some(var_name) => std::env::var(var_name).unwrap_or_default(),
                None => v.clone(),
            };
            (k.clone(), resolved)
        })
        .collect()
}

/// Top-level config file, parsed from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub servers: BTreeMap<String, ServerConfig>,
}

/// Catalog entry for one downstream MCP server.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Container image run with `docker run -i`.
    pub image: Option<String>,
    /// Local executable speaking MCP over stdio.
    pub command: Option<String>,
    /// Remote streamable HTTP endpoint.
    pub url: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    /// Literal values or `${VAR}` references (secrets).
    #[serde(default)]
    pub env: HashMap<String, String>,
    pub cwd: Option<PathBuf>,
    #[serde(default = "default_handshake_timeout_secs")]
    pub handshake_timeout_secs: u64,
}

/// Where a server's MCP session comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchSource<'a> {
    Image(&'a str),
    Command(&'a str),
    Remote(&'a str),
}

impl ServerConfig {
    /// The single launch source this entry declares, if exactly one is set.
    pub fn launch_source(&self) -> Option<LaunchSource<'_>> {
        match (&self.image, &self.command, &self.url) {
            (Some(image), None, None) => Some(LaunchSource::Image(image)),
            (None, Some(command), None) => Some(LaunchSource::Command(command)),
            (None, None, Some(url)) => Some(LaunchSource::Remote(url)),
            _ => None,
        }
    }
}

fn default_enabled() -> bool {
    true
}

fn default_handshake_timeout_secs() -> u64 {
    30
}

fn valid_server_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
}

impl ConfigFile {
    /// Validate the catalog, failing fast before anything is pulled or spawned.
    pub fn validate(&self) -> crate::Result<()> {
        for (name, server) in &self.servers {
            if !valid_server_name(name) {
                return Err(GatewayError::InvalidConfig(
                    name.clone(),
                    "name must be non-empty and use only letters, digits, '-', '_' or '.'"
                        .to_string(),
                ));
            }
            if server.launch_source().is_none() {
                return Err(GatewayError::InvalidConfig(
                    name.clone(),
                    "exactly one of 'image', 'command' or 'url' is required".to_string(),
                ));
            }
        }
        Ok(())
    }
}

/// One immutable configuration snapshot.
///
/// Snapshots are independent values: a reload produces a new one, nothing
/// mutates an existing one.
#[derive(Debug, Clone, Default)]
pub struct Configuration {
    servers: BTreeMap<String, ServerConfig>,
    server_names: Vec<String>,
}

impl Configuration {
    /// Build a snapshot from a validated catalog.
    ///
    /// A non-empty `enabled` list wins over the catalog's `enabled` flags and
    /// keeps its order; names missing from the catalog are skipped with a
    /// warning.
    pub fn new(file: ConfigFile, enabled: &[String]) -> crate::Result<Self> {
        file.validate()?;

        let server_names = if enabled.is_empty() {
            file.servers
                .iter()
                .filter(|(_, server)| server.enabled)
                .map(|(name, _)| name.clone())
                .collect()
        } else {
            let mut names: Vec<String> = Vec::with_capacity(enabled.len());
            for name in enabled {
                if !file.servers.contains_key(name) {
                    tracing::warn!(server = %name, "enabled server is not in the catalog, skipping");
                    continue;
                }
                if !names.contains(name) {
                    names.push(name.clone());
                }
            }
            names
        };

        Ok(Self {
            servers: file.servers,
            server_names,
        })
    }

    /// Read, parse and validate a TOML catalog file.
    pub async fn load_async(path: &Path, enabled: &[String]) -> crate::Result<Self> {
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            GatewayError::ConfigRead(path.display().to_string(), e.to_string())
        })?;
        Self::parse(&content, path, enabled)
    }

    fn parse(content: &str, path: &Path, enabled: &[String]) -> crate::Result<Self> {
        let file: ConfigFile = toml::from_str(content).map_err(|e| {
            GatewayError::ConfigRead(path.display().to_string(), e.to_string())
        })?;
        Self::new(file, enabled)
    }

    /// Ordered names of the servers enabled in this snapshot.
    pub fn server_names(&self) -> &[String] {
        &self.server_names
    }

    /// Catalog entry for a server, enabled or not.
    pub fn server(&self, name: &str) -> Option<&ServerConfig> {
        self.servers.get(name)
    }

    /// Container images used by the enabled servers, in server order.
    pub fn images(&self) -> Vec<&str> {
        let mut images: Vec<&str> = Vec::new();
        for name in &self.server_names {
            if let Some(LaunchSource::Image(image)) =
                self.servers.get(name).and_then(ServerConfig::launch_source)
            {
                if !images.contains(&image) {
                    images.push(image);
                }
            }
        }
        images
    }
}

/// Options for one `Gateway::run`, as chosen on the command line.
#[derive(Debug, Clone)]
pub struct GatewayOptions {
    /// `stdio`, `sse` or `streaming`, matched case-insensitively.
    pub transport: String,
    pub host: String,
    /// 0 means no network listener.
    pub port: u16,
    /// Skip image pulls and network discovery.
    pub static_mode: bool,
    /// Initialize everything, then return without serving.
    pub dry_run: bool,
    pub log_calls: bool,
    pub block_secrets: bool,
    pub interceptors: Vec<String>,
    /// Explicit enabled-server list; empty means use the catalog flags.
    pub server_names: Vec<String>,
    pub config_path: PathBuf,
    pub watch: bool,
    pub in_container: bool,
}

impl Default for GatewayOptions {
    fn default() -> Self {
        Self {
            transport: "stdio".to_string(),
            host: "0.0.0.0".to_string(),
            port: 0,
            static_mode: false,
            dry_run: false,
            log_calls: true,
            block_secrets: true,
            interceptors: Vec::new(),
            server_names: Vec::new(),
            config_path: PathBuf::from("gateway.toml"),
            watch: true,
            in_container: false,
        }
    }
}

impl GatewayOptions {
    /// Whether the in-container env flag is set (`1` or `true`).
    pub fn in_container_from_env() -> bool {
        std::env::var(IN_CONTAINER_ENV)
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false)
    }
}
