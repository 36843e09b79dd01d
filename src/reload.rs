//! Reload loop: applies configuration updates one at a time, in arrival order.
//!
//! A cycle pulls and verifies the snapshot's images, aggregates its
//! capabilities and publishes the bundle to every live session. Health drops
//! to unhealthy only while the sessions are being rewritten, so slow pulls and
//! handshakes never fail readiness. A failed cycle is logged and dropped; the
//! previously published capabilities keep serving. Cancellation abandons a
//! cycle at its next await point, before anything is published.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::capabilities::{Capabilities, CapabilityAggregator};
use crate::config::Configuration;
use crate::error::GatewayError;
use crate::health::HealthState;
use crate::registry::{CapabilityRegistry, notify_peers};
use crate::runtime::ContainerRuntime;

pub struct ReloadLoop {
    runtime: Arc<dyn ContainerRuntime>,
    aggregator: Arc<dyn CapabilityAggregator>,
    registry: Arc<CapabilityRegistry>,
    health: HealthState,
    static_mode: bool,
}

impl ReloadLoop {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        aggregator: Arc<dyn CapabilityAggregator>,
        registry: Arc<CapabilityRegistry>,
        health: HealthState,
        static_mode: bool,
    ) -> Self {
        Self {
            runtime,
            aggregator,
            registry,
            health,
            static_mode,
        }
    }

    /// Consume `updates` until cancelled or the sender goes away.
    pub async fn run(self, mut updates: mpsc::Receiver<Configuration>, cancel: CancellationToken) {
        tracing::debug!("reload loop started");
        loop {
            let configuration = tokio::select! {
                update = updates.recv() => match update {
                    Some(configuration) => configuration,
                    None => {
                        tracing::debug!("configuration updates closed, reload loop done");
                        return;
                    }
                },
                _ = cancel.cancelled() => {
                    tracing::debug!("reload loop cancelled");
                    return;
                }
            };

            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tracing::debug!("reload loop cancelled mid-cycle");
                    return;
                }
                result = self.reload(&configuration) => {
                    if let Err(e) = result {
                        tracing::warn!(error = %e, "reload failed, keeping previous capabilities");
                    }
                }
            }
        }
    }

    /// Run one reload cycle and return the published generation.
    pub async fn reload(&self, configuration: &Configuration) -> crate::Result<u64> {
        let start = Instant::now();
        let servers = configuration.server_names();
        tracing::info!(servers = %servers.join(", "), "reloading configuration");

        if !self.static_mode {
            self.runtime.pull_and_verify(configuration).await?;
        }
        let capabilities = self
            .aggregator
            .list_capabilities(configuration, servers)
            .await
            .map_err(listing_failed)?;

        let tools = capabilities.tools.len();
        let prompts = capabilities.prompts.len();
        let report = {
            let _bracket = self.health.reload_bracket();
            self.registry.publish(capabilities)
        };

        tracing::info!(
            generation = report.generation,
            sessions = report.sessions,
            tools,
            prompts,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "configuration reloaded"
        );
        notify_peers(report.peers).await;
        Ok(report.generation)
    }
}

/// Wrap an aggregation failure so it reads as a listing failure.
pub(crate) fn listing_failed(e: GatewayError) -> GatewayError {
    match e {
        GatewayError::ListCapabilities(_) => e,
        other => GatewayError::ListCapabilities(other.to_string()),
    }
}

/// Aggregate, timing the call for the startup log.
pub(crate) async fn aggregate(
    aggregator: &dyn CapabilityAggregator,
    configuration: &Configuration,
) -> crate::Result<Capabilities> {
    let start = Instant::now();
    let capabilities = aggregator
        .list_capabilities(configuration, configuration.server_names())
        .await
        .map_err(listing_failed)?;
    tracing::info!(
        tools = capabilities.tools.len(),
        prompts = capabilities.prompts.len(),
        resources = capabilities.resources.len(),
        elapsed_ms = start.elapsed().as_millis() as u64,
        "capabilities listed"
    );
    Ok(capabilities)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;

    use crate::health::Health;
    use crate::testing::{FakeAggregator, FakeRuntime, configuration, make_capabilities};

    struct Fixture {
        runtime: Arc<FakeRuntime>,
        aggregator: Arc<FakeAggregator>,
        registry: Arc<CapabilityRegistry>,
        health: HealthState,
    }

    impl Fixture {
        fn new() -> Self {
            let health = HealthState::new();
            health.set_healthy();
            Self {
                runtime: Arc::new(FakeRuntime::default()),
                aggregator: Arc::new(FakeAggregator::new(&[
                    ("a", &["x"]),
                    ("b", &["y"]),
                    ("c", &["z"]),
                ])),
                registry: CapabilityRegistry::new(make_capabilities(&["x", "y"], &[])),
                health,
            }
        }

        fn reload_loop(&self, static_mode: bool) -> ReloadLoop {
            ReloadLoop::new(
                self.runtime.clone(),
                self.aggregator.clone(),
                self.registry.clone(),
                self.health.clone(),
                static_mode,
            )
        }
    }

    #[tokio::test]
    async fn test_reload_swaps_live_sessions() {
        let fixture = Fixture::new();
        let session = fixture.registry.register();

        let generation = fixture
            .reload_loop(false)
            .reload(&configuration(&["a", "c"]))
            .await
            .unwrap();

        assert_eq!(generation, 1);
        assert_eq!(session.tool_names(), vec!["x", "z"]);
        assert!(session.tool("y").is_none());
        assert_eq!(fixture.runtime.pulls(), 1);
        assert!(fixture.health.is_healthy());
    }

    #[tokio::test]
    async fn test_failed_listing_keeps_previous_set() {
        let fixture = Fixture::new();
        let session = fixture.registry.register();
        fixture.aggregator.fail.store(true, Ordering::SeqCst);
        let mut health = fixture.health.subscribe();
        health.borrow_and_update();

        let result = fixture
            .reload_loop(false)
            .reload(&configuration(&["a", "c"]))
            .await;

        assert!(matches!(result, Err(GatewayError::ListCapabilities(_))));
        assert_eq!(session.tool_names(), vec!["x", "y"]);
        assert_eq!(fixture.registry.generation(), 0);
        assert!(!health.has_changed().unwrap());
        assert!(fixture.health.is_healthy());
    }

    #[tokio::test]
    async fn test_successful_cycle_brackets_publish() {
        let fixture = Fixture::new();
        let mut health = fixture.health.subscribe();
        health.borrow_and_update();

        fixture
            .reload_loop(false)
            .reload(&configuration(&["c"]))
            .await
            .unwrap();

        assert!(health.has_changed().unwrap());
        assert_eq!(*health.borrow_and_update(), Health::Healthy);
    }

    /// Runtime whose pull takes a while before failing.
    struct SlowRuntime {
        delay: Duration,
    }

    #[async_trait]
    impl ContainerRuntime for SlowRuntime {
        async fn pull_and_verify(&self, _configuration: &Configuration) -> crate::Result<()> {
            tokio::time::sleep(self.delay).await;
            Err(GatewayError::PullVerify("a".to_string(), "timed out".to_string()))
        }

        async fn guess_networks(&self) -> crate::Result<Vec<String>> {
            Ok(vec![])
        }
    }

    #[tokio::test]
    async fn test_stays_healthy_while_pulling() {
        let fixture = Fixture::new();
        let reload_loop = ReloadLoop::new(
            Arc::new(SlowRuntime {
                delay: Duration::from_millis(300),
            }),
            fixture.aggregator.clone(),
            fixture.registry.clone(),
            fixture.health.clone(),
            false,
        );
        let health = fixture.health.clone();
        let observed = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            health.is_healthy()
        });

        let result = reload_loop.reload(&configuration(&["a"])).await;

        assert!(matches!(result, Err(GatewayError::PullVerify(..))));
        assert!(observed.await.unwrap());
        assert!(fixture.health.is_healthy());
    }

    #[tokio::test]
    async fn test_failed_pull_skips_aggregation() {
        let fixture = Fixture::new();
        fixture.runtime.fail_pull.store(true, Ordering::SeqCst);

        let result = fixture
            .reload_loop(false)
            .reload(&configuration(&["a"]))
            .await;

        assert!(matches!(result, Err(GatewayError::PullVerify(..))));
        assert_eq!(fixture.aggregator.calls(), 0);
        assert!(fixture.health.is_healthy());
    }

    #[tokio::test]
    async fn test_static_mode_skips_pull() {
        let fixture = Fixture::new();
        fixture.runtime.fail_pull.store(true, Ordering::SeqCst);

        fixture
            .reload_loop(true)
            .reload(&configuration(&["c"]))
            .await
            .unwrap();

        assert_eq!(fixture.runtime.pulls(), 0);
        assert_eq!(fixture.registry.current().tool_names(), vec!["z"]);
    }

    #[tokio::test]
    async fn test_run_applies_updates_in_order() {
        let fixture = Fixture::new();
        let session = fixture.registry.register();
        let (tx, rx) = mpsc::channel(4);
        tx.send(configuration(&["b"])).await.unwrap();
        tx.send(configuration(&["a", "c"])).await.unwrap();
        drop(tx);

        fixture
            .reload_loop(false)
            .run(rx, CancellationToken::new())
            .await;

        assert_eq!(fixture.registry.generation(), 2);
        assert_eq!(session.tool_names(), vec!["x", "z"]);
    }

    #[tokio::test]
    async fn test_run_survives_failed_cycle() {
        let fixture = Fixture::new();
        let (tx, rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();
        let running = tokio::spawn(fixture.reload_loop(false).run(rx, cancel.clone()));

        fixture.aggregator.fail.store(true, Ordering::SeqCst);
        tx.send(configuration(&["c"])).await.unwrap();
        while fixture.aggregator.calls() < 1 {
            tokio::task::yield_now().await;
        }
        fixture.aggregator.fail.store(false, Ordering::SeqCst);
        tx.send(configuration(&["c"])).await.unwrap();
        while fixture.registry.generation() < 1 {
            tokio::task::yield_now().await;
        }

        assert_eq!(fixture.registry.current().tool_names(), vec!["z"]);
        cancel.cancel();
        running.await.unwrap();
    }

    /// Aggregator that takes a while to list, counting finished listings.
    struct SlowAggregator {
        inner: FakeAggregator,
        delay: Duration,
        finished: AtomicUsize,
    }

    #[async_trait]
    impl CapabilityAggregator for SlowAggregator {
        async fn list_capabilities(
            &self,
            configuration: &Configuration,
            server_names: &[String],
        ) -> crate::Result<Capabilities> {
            tokio::time::sleep(self.delay).await;
            let capabilities = self.inner.list_capabilities(configuration, server_names).await;
            self.finished.fetch_add(1, Ordering::SeqCst);
            capabilities
        }

        fn set_networks(&self, _networks: Vec<String>) {}
    }

    #[tokio::test]
    async fn test_cancel_abandons_cycle_in_flight() {
        let fixture = Fixture::new();
        let aggregator = Arc::new(SlowAggregator {
            inner: FakeAggregator::new(&[("c", &["z"])]),
            delay: Duration::from_millis(500),
            finished: AtomicUsize::new(0),
        });
        let reload_loop = ReloadLoop::new(
            fixture.runtime.clone(),
            aggregator.clone(),
            fixture.registry.clone(),
            fixture.health.clone(),
            false,
        );
        let (tx, rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();
        let running = tokio::spawn(reload_loop.run(rx, cancel.clone()));

        tx.send(configuration(&["c"])).await.unwrap();
        while fixture.runtime.pulls() < 1 {
            tokio::task::yield_now().await;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();

        tokio::time::timeout(Duration::from_millis(200), running)
            .await
            .expect("loop exits promptly")
            .unwrap();
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(aggregator.finished.load(Ordering::SeqCst), 0);
        assert_eq!(fixture.registry.generation(), 0);
        assert_eq!(fixture.registry.current().tool_names(), vec!["x", "y"]);
        assert!(fixture.health.is_healthy());
    }
}
