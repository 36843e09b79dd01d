//! Gateway: startup sequencing for one serving run.
//!
//! `run` binds the listener first so clients connecting during a slow startup
//! queue in the backlog instead of being refused, then reads the configuration,
//! pulls images, lists capabilities, builds the middleware and the per-session
//! server factory, starts the reload loop and finally hands over to the chosen
//! transport. Any failure before serving is returned as is; failures during a
//! later reload are only logged.

use std::sync::Arc;
use std::time::Instant;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::capabilities::CapabilityAggregator;
use crate::config::GatewayOptions;
use crate::configurator::{Configurator, ConfigurationRead, FileConfigurator};
use crate::downstream::ClientPool;
use crate::error::GatewayError;
use crate::health::HealthState;
use crate::interceptors;
use crate::registry::CapabilityRegistry;
use crate::reload::{ReloadLoop, aggregate};
use crate::runtime::{ContainerRuntime, DockerCli};
use crate::server::ServerFactory;
use crate::transport::{self, TransportMode};

pub struct Gateway {
    options: GatewayOptions,
    configurator: Arc<dyn Configurator>,
    runtime: Arc<dyn ContainerRuntime>,
    aggregator: Arc<dyn CapabilityAggregator>,
    health: HealthState,
}

impl Gateway {
    pub fn new(
        options: GatewayOptions,
        configurator: Arc<dyn Configurator>,
        runtime: Arc<dyn ContainerRuntime>,
        aggregator: Arc<dyn CapabilityAggregator>,
    ) -> Self {
        Self {
            options,
            configurator,
            runtime,
            aggregator,
            health: HealthState::new(),
        }
    }

    /// File-backed configuration, the docker CLI and a downstream client pool.
    pub fn with_defaults(options: GatewayOptions) -> Self {
        let configurator = FileConfigurator::new(
            options.config_path.clone(),
            options.server_names.clone(),
            options.watch,
        );
        Self::new(
            options,
            Arc::new(configurator),
            Arc::new(DockerCli::default()),
            Arc::new(ClientPool::new()),
        )
    }

    /// Shared health flag, for probes living outside the transports.
    pub fn health(&self) -> HealthState {
        self.health.clone()
    }

    /// Start up and serve until `cancel` fires or the transport fails.
    pub async fn run(&self, cancel: CancellationToken) -> crate::Result<()> {
        let start = Instant::now();
        let options = &self.options;
        let mode = TransportMode::resolve(&options.transport, options.port)?;

        let listener = if options.port != 0 {
            let addr = format!("{}:{}", options.host, options.port);
            let listener = TcpListener::bind(&addr)
                .await
                .map_err(|e| GatewayError::Bind(addr.clone(), e))?;
            tracing::info!(addr = %addr, "listener bound");
            Some(listener)
        } else {
            None
        };

        // `stop` is released on every return path below.
        let ConfigurationRead {
            configuration,
            updates,
            stop: _stop,
        } = self.configurator.read(&cancel).await?;

        let server_names = configuration.server_names();
        if server_names.is_empty() {
            tracing::info!("no server is enabled");
        } else {
            tracing::info!(servers = %server_names.join(", "), "servers enabled");
        }

        if !options.static_mode {
            self.runtime.pull_and_verify(&configuration).await?;

            if options.in_container {
                let networks = self.runtime.guess_networks().await?;
                self.aggregator.set_networks(networks);
            }
        }

        let capabilities = aggregate(self.aggregator.as_ref(), &configuration).await?;

        let custom = interceptors::parse(&options.interceptors)?;
        let middleware = interceptors::callbacks(options.log_calls, options.block_secrets, custom);

        let registry = CapabilityRegistry::new(capabilities);
        let factory = ServerFactory::new(registry.clone(), middleware);

        // Cancelled when `run` returns, whichever way it returns.
        let reload_cancel = cancel.child_token();
        let _reload_guard = reload_cancel.clone().drop_guard();
        if let Some(updates) = updates {
            tracing::info!("watching for configuration updates");
            let reload = ReloadLoop::new(
                self.runtime.clone(),
                self.aggregator.clone(),
                registry,
                self.health.clone(),
                options.static_mode,
            );
            tokio::spawn(reload.run(updates, reload_cancel));
        }

        tracing::info!(
            elapsed_ms = start.elapsed().as_millis() as u64,
            "gateway initialized"
        );
        if options.dry_run {
            tracing::info!("dry run, not starting the server");
            return Ok(());
        }

        self.health.set_healthy();
        transport::launch(mode, listener, factory, self.health.clone(), cancel).await
    }
}
