//! Container runtime seam: image pull/verify and network discovery.
//!
//! `DockerCli` drives the `docker` binary through `tokio::process::Command`
//! with structured arguments (never a shell).

use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::process::Command;

use crate::config::Configuration;
use crate::error::GatewayError;

/// How long a single docker invocation may run before it is killed.
const DOCKER_TIMEOUT: Duration = Duration::from_secs(300);

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Pull every image the snapshot's enabled servers use and verify pinned
    /// digests. Safe to call repeatedly; failure leaves nothing half-applied.
    async fn pull_and_verify(&self, configuration: &Configuration) -> crate::Result<()>;

    /// Names of the container networks the gateway itself is attached to.
    async fn guess_networks(&self) -> crate::Result<Vec<String>>;
}

/// `ContainerRuntime` backed by the docker CLI.
pub struct DockerCli {
    binary: String,
}

impl Default for DockerCli {
    fn default() -> Self {
        Self::new("docker")
    }
}

impl DockerCli {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    /// Run `docker <args>` and return trimmed stdout, failing on non-zero exit.
    async fn docker(&self, args: &[&str]) -> std::result::Result<String, String> {
        let mut cmd = Command::new(&self.binary);
        cmd.args(args);
        cmd.stdin(std::process::Stdio::null());
        cmd.kill_on_drop(true);

        let output = tokio::time::timeout(DOCKER_TIMEOUT, cmd.output())
            .await
            .map_err(|_| format!("docker {} timed out", args.join(" ")))?
            .map_err(|e| format!("failed to spawn '{}': {}", self.binary, e))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(format!(
                "docker {} exited with {}: {}",
                args.join(" "),
                output.status,
                stderr.trim()
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    async fn pull(&self, image: &str) -> crate::Result<()> {
        self.docker(&["pull", "--quiet", image])
            .await
            .map(|_| ())
            .map_err(|e| GatewayError::PullVerify(image.to_string(), e))
    }

    async fn verify(&self, image: &str) -> crate::Result<()> {
        let Some(digest) = pinned_digest(image) else {
            return Ok(());
        };
        let repo_digests = self
            .docker(&["image", "inspect", "--format", "{{json .RepoDigests}}", image])
            .await
            .map_err(|e| GatewayError::PullVerify(image.to_string(), e))?;
        let digests: Vec<String> = serde_json::from_str(&repo_digests)
            .map_err(|e| GatewayError::PullVerify(image.to_string(), e.to_string()))?;
        if digests.iter().any(|d| d.ends_with(digest)) {
            Ok(())
        } else {
            Err(GatewayError::PullVerify(
                image.to_string(),
                format!("pulled image does not match pinned digest {}", digest),
            ))
        }
    }
}

/// The `sha256:...` part of a digest-pinned reference, if any.
pub fn pinned_digest(image: &str) -> Option<&str> {
    image
        .split_once('@')
        .map(|(_, digest)| digest)
        .filter(|digest| digest.starts_with("sha256:"))
}

/// Network names from `docker inspect --format '{{json .NetworkSettings.Networks}}'`.
pub fn parse_networks(json: &str) -> std::result::Result<Vec<String>, String> {
    let value: serde_json::Value = serde_json::from_str(json).map_err(|e| e.to_string())?;
    let networks = value
        .as_object()
        .ok_or_else(|| "network settings are not an object".to_string())?;
    Ok(networks.keys().cloned().collect())
}

#[async_trait]
impl ContainerRuntime for DockerCli {
    async fn pull_and_verify(&self, configuration: &Configuration) -> crate::Result<()> {
        let images = configuration.images();
        if images.is_empty() {
            return Ok(());
        }

        let start = Instant::now();
        tracing::info!(images = images.len(), "pulling docker images");
        let pulls = images.iter().map(|image| async move {
            self.pull(image).await?;
            self.verify(image).await
        });
        for result in futures::future::join_all(pulls).await {
            result?;
        }
        tracing::info!(
            images = images.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "images pulled and verified"
        );
        Ok(())
    }

    async fn guess_networks(&self) -> crate::Result<Vec<String>> {
        let hostname = std::env::var("HOSTNAME")
            .ok()
            .filter(|h| !h.is_empty())
            .or_else(|| {
                std::fs::read_to_string("/etc/hostname")
                    .ok()
                    .map(|h| h.trim().to_string())
            })
            .ok_or_else(|| GatewayError::NetworkDiscovery("unknown hostname".to_string()))?;

        let json = self
            .docker(&[
                "inspect",
                "--format",
                "{{json .NetworkSettings.Networks}}",
                hostname.as_str(),
            ])
            .await
            .map_err(GatewayError::NetworkDiscovery)?;
        let networks = parse_networks(&json).map_err(GatewayError::NetworkDiscovery)?;
        tracing::info!(networks = %networks.join(", "), "gateway container networks");
        Ok(networks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pinned_digest() {
        assert_eq!(
            pinned_digest("mcp/github@sha256:abc123"),
            Some("sha256:abc123")
        );
        assert_eq!(pinned_digest("mcp/github:latest"), None);
        assert_eq!(pinned_digest("mcp/github"), None);
    }

    #[test]
    fn test_parse_networks() {
        let json = r#"{"bridge":{"NetworkID":"1"},"mcp":{"NetworkID":"2"}}"#;
        let mut networks = parse_networks(json).unwrap();
        networks.sort();
        assert_eq!(networks, vec!["bridge", "mcp"]);
    }

    #[test]
    fn test_parse_networks_rejects_non_object() {
        assert!(parse_networks("[]").is_err());
        assert!(parse_networks("not json").is_err());
    }

    #[tokio::test]
    async fn test_no_images_is_noop() {
        // A binary that cannot exist proves nothing was spawned.
        let runtime = DockerCli::new("/nonexistent/docker");
        let result = runtime.pull_and_verify(&Configuration::default()).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_missing_binary_is_pull_verify_error() {
        let file: crate::config::ConfigFile =
            toml::from_str("[servers.github]\nimage = \"mcp/github\"").unwrap();
        let configuration = Configuration::new(file, &[]).unwrap();
        let runtime = DockerCli::new("/nonexistent/docker");
        let result = runtime.pull_and_verify(&configuration).await;
        assert!(matches!(result, Err(GatewayError::PullVerify(image, _)) if image == "mcp/github"));
    }

    #[cfg(feature = "integration-tests")]
    #[tokio::test]
    async fn test_pull_real_image() {
        let file: crate::config::ConfigFile =
            toml::from_str("[servers.hello]\nimage = \"hello-world\"").unwrap();
        let configuration = Configuration::new(file, &[]).unwrap();
        DockerCli::default()
            .pull_and_verify(&configuration)
            .await
            .expect("docker pull hello-world");
    }
}
