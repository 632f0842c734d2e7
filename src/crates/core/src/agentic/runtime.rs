//! Agent runtime
//!
//! One injected instance holding every shared service of the core. Cheap to
//! clone; all per-session state lives behind the `Arc`s.

use crate::agentic::agents::AgentRegistry;
use crate::agentic::events::EventBus;
use crate::agentic::hooks::{HookRegistry, Plugin};
use crate::agentic::permission::PermissionGate;
use crate::agentic::session::{SessionManager, SessionStatusRegistry};
use crate::agentic::tools::{Tool, ToolRegistry};
use crate::infrastructure::ai::ModelProvider;
use crate::infrastructure::snapshot::{NoopSnapshot, SnapshotProvider};
use crate::infrastructure::storage::{KeyedLock, MemoryStorage, Storage};
use crate::service::config::CoreConfig;
use std::sync::Arc;

#[derive(Clone)]
pub struct AgentRuntime {
    pub storage: Arc<dyn Storage>,
    pub events: Arc<EventBus>,
    pub sessions: Arc<SessionManager>,
    pub status: Arc<SessionStatusRegistry>,
    pub permission: Arc<PermissionGate>,
    pub hooks: Arc<HookRegistry>,
    pub tools: Arc<ToolRegistry>,
    pub provider: Arc<dyn ModelProvider>,
    pub snapshot: Arc<dyn SnapshotProvider>,
    pub config: Arc<CoreConfig>,
    pub agents: Arc<AgentRegistry>,
    /// Serializes background jobs that rewrite state of one user turn.
    pub turn_locks: Arc<KeyedLock>,
}

impl AgentRuntime {
    pub fn builder(provider: Arc<dyn ModelProvider>) -> AgentRuntimeBuilder {
        AgentRuntimeBuilder {
            provider,
            storage: None,
            snapshot: None,
            config: CoreConfig::default(),
            plugins: Vec::new(),
            tools: Vec::new(),
        }
    }
}

pub struct AgentRuntimeBuilder {
    provider: Arc<dyn ModelProvider>,
    storage: Option<Arc<dyn Storage>>,
    snapshot: Option<Arc<dyn SnapshotProvider>>,
    config: CoreConfig,
    plugins: Vec<Arc<dyn Plugin>>,
    tools: Vec<Arc<dyn Tool>>,
}

impl AgentRuntimeBuilder {
    /// Defaults to [`MemoryStorage`].
    pub fn storage(mut self, storage: Arc<dyn Storage>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn snapshot(mut self, snapshot: Arc<dyn SnapshotProvider>) -> Self {
        self.snapshot = Some(snapshot);
        self
    }

    pub fn config(mut self, config: CoreConfig) -> Self {
        self.config = config;
        self
    }

    pub fn plugin(mut self, plugin: Arc<dyn Plugin>) -> Self {
        self.plugins.push(plugin);
        self
    }

    pub fn tool(mut self, tool: Arc<dyn Tool>) -> Self {
        self.tools.push(tool);
        self
    }

    pub fn build(self) -> AgentRuntime {
        let storage = self
            .storage
            .unwrap_or_else(|| Arc::new(MemoryStorage::new()));
        let events = Arc::new(EventBus::new());
        let hooks = Arc::new(HookRegistry::new());
        for plugin in self.plugins {
            hooks.register(plugin);
        }
        let tools = Arc::new(ToolRegistry::new());
        for tool in self.tools {
            tools.register(tool);
        }

        AgentRuntime {
            sessions: Arc::new(SessionManager::new(storage.clone(), events.clone())),
            status: Arc::new(SessionStatusRegistry::new(events.clone())),
            permission: Arc::new(PermissionGate::new(events.clone(), hooks.clone())),
            agents: Arc::new(AgentRegistry::from_config(&self.config)),
            config: Arc::new(self.config),
            snapshot: self.snapshot.unwrap_or_else(|| Arc::new(NoopSnapshot)),
            provider: self.provider,
            turn_locks: Arc::new(KeyedLock::new()),
            storage,
            events,
            hooks,
            tools,
        }
    }
}
