//! CapabilityRegistry: owns the currently served `Capabilities` and every
//! live session's view of it.
//!
//! Registration (on session creation) and publication (on reload) take the same
//! lock, and publication holds it for the whole fan-out. A session created while
//! a reload is in flight therefore registers strictly before or strictly after
//! it, and a published update lands on every session as one event.
//!
//! Each session owns a `SessionHandle`. The registry rewrites the handle's view
//! directly: remove the tool/prompt names the previous bundle contributed, then
//! add or overwrite the new bundle's entries. Resources and resource templates
//! stay as they were when the session registered; reload does not touch them.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock, PoisonError, RwLock, Weak};

use rmcp::model::{Prompt, Tool};
use rmcp::service::{Peer, RoleServer};

use crate::capabilities::{
    Capabilities, ResourceHandler, ServerPrompt, ServerTool, swap_entries,
};

pub type SessionId = u64;

/// What one session currently serves.
pub struct SessionView {
    /// The bundle the served tools/prompts were last synchronized to.
    current: Arc<Capabilities>,
    /// The bundle seen at registration; source of resources and templates.
    seed: Arc<Capabilities>,
    tools: Vec<ServerTool>,
    prompts: Vec<ServerPrompt>,
}

impl SessionView {
    fn new(seed: Arc<Capabilities>) -> Self {
        Self {
            tools: seed.tools.clone(),
            prompts: seed.prompts.clone(),
            current: seed.clone(),
            seed,
        }
    }

    fn apply(&mut self, next: &Arc<Capabilities>) {
        swap_entries(
            &mut self.tools,
            &self.current.tool_names(),
            &next.tools,
            ServerTool::name,
        );
        swap_entries(
            &mut self.prompts,
            &self.current.prompt_names(),
            &next.prompts,
            ServerPrompt::name,
        );
        self.current = next.clone();
    }
}

struct SessionState {
    view: RwLock<SessionView>,
    peer: OnceLock<Peer<RoleServer>>,
}

struct RegistryInner {
    current: Arc<Capabilities>,
    sessions: HashMap<SessionId, Arc<SessionState>>,
    next_id: SessionId,
    generation: u64,
}

/// Registry of live sessions and the latest published capabilities.
pub struct CapabilityRegistry {
    inner: Mutex<RegistryInner>,
}

/// Outcome of one publication.
pub struct PublishReport {
    /// Generation number of the newly published bundle (initial is 0).
    pub generation: u64,
    /// Sessions whose view was rewritten.
    pub sessions: usize,
    /// Peers of initialized sessions, to be told the lists changed.
    pub peers: Vec<Peer<RoleServer>>,
}

impl CapabilityRegistry {
    pub fn new(initial: Capabilities) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(RegistryInner {
                current: Arc::new(initial),
                sessions: HashMap::new(),
                next_id: 0,
                generation: 0,
            }),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RegistryInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a new session seeded with the latest published bundle.
    pub fn register(self: &Arc<Self>) -> SessionHandle {
        let mut inner = self.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        let state = Arc::new(SessionState {
            view: RwLock::new(SessionView::new(inner.current.clone())),
            peer: OnceLock::new(),
        });
        inner.sessions.insert(id, state.clone());
        tracing::debug!(session = id, sessions = inner.sessions.len(), "session registered");
        SessionHandle {
            id,
            state,
            registry: Arc::downgrade(self),
        }
    }

    /// Install `capabilities` into every registered session under one lock.
    pub fn publish(&self, capabilities: Capabilities) -> PublishReport {
        let next = Arc::new(capabilities);
        let mut inner = self.lock();
        let mut peers = Vec::new();
        for state in inner.sessions.values() {
            state
                .view
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .apply(&next);
            if let Some(peer) = state.peer.get() {
                peers.push(peer.clone());
            }
        }
        inner.current = next;
        inner.generation += 1;
        PublishReport {
            generation: inner.generation,
            sessions: inner.sessions.len(),
            peers,
        }
    }

    fn deregister(&self, id: SessionId) {
        let mut inner = self.lock();
        if inner.sessions.remove(&id).is_some() {
            tracing::debug!(session = id, sessions = inner.sessions.len(), "session deregistered");
        }
    }

    /// The latest published bundle; new sessions start from it.
    pub fn current(&self) -> Arc<Capabilities> {
        self.lock().current.clone()
    }

    pub fn generation(&self) -> u64 {
        self.lock().generation
    }

    pub fn session_count(&self) -> usize {
        self.lock().sessions.len()
    }
}

/// One session's registration. Dropping it removes the session from the
/// registry, so finished connections stop receiving updates.
pub struct SessionHandle {
    id: SessionId,
    state: Arc<SessionState>,
    registry: Weak<CapabilityRegistry>,
}

impl SessionHandle {
    pub fn id(&self) -> SessionId {
        self.id
    }

    fn view(&self) -> std::sync::RwLockReadGuard<'_, SessionView> {
        self.state.view.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn tools(&self) -> Vec<Tool> {
        self.view().tools.iter().map(|t| t.tool.clone()).collect()
    }

    pub fn tool(&self, name: &str) -> Option<ServerTool> {
        self.view().tools.iter().find(|t| t.name() == name).cloned()
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.view().tools.iter().map(|t| t.name().to_string()).collect()
    }

    pub fn prompts(&self) -> Vec<Prompt> {
        self.view().prompts.iter().map(|p| p.prompt.clone()).collect()
    }

    pub fn prompt(&self, name: &str) -> Option<ServerPrompt> {
        self.view().prompts.iter().find(|p| p.name() == name).cloned()
    }

    pub fn prompt_names(&self) -> Vec<String> {
        self.view().prompts.iter().map(|p| p.name().to_string()).collect()
    }

    /// Resources and templates as of registration.
    pub fn seed(&self) -> Arc<Capabilities> {
        self.view().seed.clone()
    }

    pub fn resource_handler(&self, uri: &str) -> Option<ResourceHandler> {
        self.seed().resource_handler(uri)
    }

    /// Remember the client peer once it has finished initializing.
    pub fn set_peer(&self, peer: Peer<RoleServer>) {
        if self.state.peer.set(peer).is_err() {
            tracing::debug!(session = self.id, "peer already recorded for session");
        }
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.deregister(self.id);
        }
    }
}

/// Tell each peer that the tool and prompt lists changed.
///
/// Peers whose transport has gone away are only logged; their sessions drop
/// out of the registry on their own when the connection task ends.
pub async fn notify_peers(peers: Vec<Peer<RoleServer>>) {
    for peer in peers {
        if let Err(e) = peer.notify_tool_list_changed().await {
            tracing::debug!(error = %e, "tools-list-changed notification failed");
            continue;
        }
        if let Err(e) = peer.notify_prompt_list_changed().await {
            tracing::debug!(error = %e, "prompts-list-changed notification failed");
        }
    }
}
