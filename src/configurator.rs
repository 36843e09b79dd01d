//! Configuration sources: the first snapshot, an optional stream of later
//! snapshots, and a stop handle for whatever produces them.
//!
//! `FileConfigurator` watches the TOML catalog with the `notify` crate. Each
//! detected change (100ms debounce) re-parses the file; valid snapshots are
//! queued on a bounded channel in arrival order, invalid ones are logged and
//! skipped so the gateway keeps serving what it has.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use notify::{RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::Configuration;

/// Snapshots queued between the watcher and the reload loop.
const UPDATE_QUEUE: usize = 16;

/// Debounce window for bursts of file-system events.
const DEBOUNCE: Duration = Duration::from_millis(100);

/// Stops a configuration watcher. Stopping twice is a no-op, and dropping the
/// handle stops it too.
#[derive(Debug, Default)]
pub struct StopHandle {
    token: CancellationToken,
}

impl StopHandle {
    pub fn new(token: CancellationToken) -> Self {
        Self { token }
    }

    pub fn stop(&self) {
        if !self.token.is_cancelled() {
            tracing::debug!("stopping configuration watcher");
        }
        self.token.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.token.is_cancelled()
    }
}

impl Drop for StopHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Result of reading a configuration source.
pub struct ConfigurationRead {
    pub configuration: Configuration,
    /// `None` when the source cannot be watched or watching is off.
    pub updates: Option<mpsc::Receiver<Configuration>>,
    pub stop: StopHandle,
}

#[async_trait]
pub trait Configurator: Send + Sync {
    async fn read(&self, cancel: &CancellationToken) -> crate::Result<ConfigurationRead>;
}

/// Reads the TOML catalog from disk and optionally watches it.
pub struct FileConfigurator {
    pub path: PathBuf,
    /// Explicit enabled-server list; empty defers to the catalog.
    pub server_names: Vec<String>,
    pub watch: bool,
}

impl FileConfigurator {
    pub fn new(path: PathBuf, server_names: Vec<String>, watch: bool) -> Self {
        Self {
            path,
            server_names,
            watch,
        }
    }
}

#[async_trait]
impl Configurator for FileConfigurator {
    async fn read(&self, cancel: &CancellationToken) -> crate::Result<ConfigurationRead> {
        let configuration = Configuration::load_async(&self.path, &self.server_names).await?;
        let token = cancel.child_token();

        let updates = if self.watch {
            let (tx, rx) = mpsc::channel(UPDATE_QUEUE);
            tokio::spawn(watch_config(
                self.path.clone(),
                self.server_names.clone(),
                tx,
                token.clone(),
            ));
            Some(rx)
        } else {
            None
        };

        Ok(ConfigurationRead {
            configuration,
            updates,
            stop: StopHandle::new(token),
        })
    }
}

/// Watch `path` and push a fresh snapshot after every settled change.
async fn watch_config(
    path: PathBuf,
    server_names: Vec<String>,
    updates: mpsc::Sender<Configuration>,
    cancel: CancellationToken,
) {
    let (tx, mut rx) = mpsc::unbounded_channel::<notify::Result<notify::Event>>();

    // notify's EventHandler is implemented for FnMut, not for tokio senders.
    let mut watcher = match notify::recommended_watcher(move |event| {
        let _ = tx.send(event);
    }) {
        Ok(w) => w,
        Err(e) => {
            tracing::error!(error = %e, "failed to create configuration watcher");
            return;
        }
    };

    if let Err(e) = watcher.watch(&path, RecursiveMode::NonRecursive) {
        tracing::error!(
            path = %path.display(),
            error = %e,
            "failed to watch configuration file"
        );
        return;
    }

    // Dropping the watcher stops OS-level events.
    let _watcher = watcher;

    tracing::info!(path = %path.display(), "watching configuration for updates");

    loop {
        tokio::select! {
            event = rx.recv() => {
                match event {
                    Some(Ok(_)) => {
                        tokio::time::sleep(DEBOUNCE).await;
                        while rx.try_recv().is_ok() {}

                        match Configuration::load_async(&path, &server_names).await {
                            Ok(configuration) => {
                                tracing::debug!(
                                    path = %path.display(),
                                    servers = configuration.server_names().len(),
                                    "configuration changed"
                                );
                                tokio::select! {
                                    sent = updates.send(configuration) => {
                                        if sent.is_err() {
                                            tracing::debug!("configuration consumer gone, stop watching");
                                            return;
                                        }
                                    }
                                    _ = cancel.cancelled() => return,
                                }
                            }
                            Err(e) => {
                                tracing::warn!(
                                    error = %e,
                                    path = %path.display(),
                                    "ignoring invalid configuration update"
                                );
                            }
                        }
                    }
                    Some(Err(e)) => {
                        tracing::warn!(error = %e, "configuration watcher error");
                    }
                    None => {
                        tracing::debug!("configuration watcher channel closed");
                        return;
                    }
                }
            }
            _ = cancel.cancelled() => {
                tracing::debug!("configuration watcher stopped");
                return;
            }
        }
    }
}

/// In-memory configuration source, optionally fed updates by the caller.
pub struct StaticConfigurator {
    configuration: Configuration,
    updates: std::sync::Mutex<Option<mpsc::Receiver<Configuration>>>,
}

impl StaticConfigurator {
    pub fn new(configuration: Configuration) -> Self {
        Self {
            configuration,
            updates: std::sync::Mutex::new(None),
        }
    }

    /// A source whose updates are whatever the returned sender pushes.
    pub fn with_updates(configuration: Configuration) -> (Self, mpsc::Sender<Configuration>) {
        let (tx, rx) = mpsc::channel(UPDATE_QUEUE);
        let configurator = Self {
            configuration,
            updates: std::sync::Mutex::new(Some(rx)),
        };
        (configurator, tx)
    }
}

#[async_trait]
impl Configurator for StaticConfigurator {
    async fn read(&self, cancel: &CancellationToken) -> crate::Result<ConfigurationRead> {
        let updates = self
            .updates
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        Ok(ConfigurationRead {
            configuration: self.configuration.clone(),
            updates,
            stop: StopHandle::new(cancel.child_token()),
        })
    }
}
