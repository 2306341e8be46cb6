//! HTTP and WebSocket surface of the agent

mod alerts;
mod chat_ws;
mod handlers;
mod types;

pub use handlers::create_router;

use crate::db::Database;
use crate::llm::ModelRegistry;
use crate::runtime::{
    DatabaseStorage, ProductionSupervisor, RegistryLlmClient, RuntimeConfig, SafetyPolicy,
    ToolGate,
};
use crate::tools::ToolRegistry;
use std::sync::Arc;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub supervisor: Arc<ProductionSupervisor>,
    pub db: Database,
}

impl AppState {
    pub fn new(
        db: Database,
        llm_registry: Arc<ModelRegistry>,
        tools: ToolRegistry,
        config: RuntimeConfig,
    ) -> Self {
        let llm = RegistryLlmClient::new(
            llm_registry.clone(),
            llm_registry.default_model_id().to_string(),
        );
        let gate = ToolGate::new(Arc::new(tools), SafetyPolicy::default());
        let supervisor = ProductionSupervisor::new(
            Arc::new(DatabaseStorage::new(db.clone())),
            Arc::new(llm),
            Arc::new(gate),
            config,
        );
        Self {
            supervisor: Arc::new(supervisor),
            db,
        }
    }
}
