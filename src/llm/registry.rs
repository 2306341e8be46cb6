//! Model registry for managing configured LLM endpoints

use super::{LlmService, LoggingService, OpenAIService};
use std::collections::HashMap;
use std::sync::Arc;

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_MODEL: &str = "gpt-4-1106-preview";

/// Configuration for the `OpenAI`-compatible endpoint
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub api_key: Option<String>,
    pub base_url: String,
    /// Default model ID
    pub model_name: String,
    /// Additional model IDs served by the same endpoint
    pub extra_models: Vec<String>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: DEFAULT_BASE_URL.to_string(),
            model_name: DEFAULT_MODEL.to_string(),
            extra_models: Vec::new(),
        }
    }
}

impl LlmConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            api_key: std::env::var("OPENAI_API_KEY").ok(),
            base_url: std::env::var("OPENAI_BASE_URL").unwrap_or(defaults.base_url),
            model_name: std::env::var("MODEL_NAME").unwrap_or(defaults.model_name),
            extra_models: std::env::var("EXTRA_MODELS")
                .map(|v| {
                    v.split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(String::from)
                        .collect()
                })
                .unwrap_or_default(),
        }
    }
}

/// Registry of available LLM models
pub struct ModelRegistry {
    services: HashMap<String, Arc<dyn LlmService>>,
    default_model: String,
}

impl ModelRegistry {
    /// Create an empty registry for testing purposes
    #[cfg(test)]
    pub fn new_empty() -> Self {
        Self {
            services: HashMap::new(),
            default_model: "test-model".to_string(),
        }
    }

    pub fn new(config: &LlmConfig) -> Self {
        let mut services: HashMap<String, Arc<dyn LlmService>> = HashMap::new();

        if let Some(api_key) = config.api_key.as_ref().filter(|k| !k.is_empty()) {
            let model_ids = std::iter::once(&config.model_name).chain(config.extra_models.iter());
            for model_id in model_ids {
                match OpenAIService::new(api_key.clone(), &config.base_url, model_id.clone()) {
                    Ok(service) => {
                        services.insert(
                            model_id.clone(),
                            Arc::new(LoggingService::new(Arc::new(service))),
                        );
                    }
                    Err(e) => {
                        tracing::warn!(model = %model_id, error = %e, "Skipping model");
                    }
                }
            }
        }

        Self {
            services,
            default_model: config.model_name.clone(),
        }
    }

    /// Register a service directly (used for alternate providers and tests)
    #[cfg(test)]
    pub fn register(&mut self, service: Arc<dyn LlmService>) {
        self.services
            .insert(service.model_id().to_string(), service);
    }

    /// Get a model by ID
    pub fn get(&self, model_id: &str) -> Option<Arc<dyn LlmService>> {
        self.services.get(model_id).cloned()
    }

    /// Get the default model
    pub fn default(&self) -> Option<Arc<dyn LlmService>> {
        self.get(&self.default_model)
    }

    /// Get the default model ID
    pub fn default_model_id(&self) -> &str {
        &self.default_model
    }

    /// List all available model IDs
    pub fn available_models(&self) -> Vec<String> {
        let mut models: Vec<_> = self.services.keys().cloned().collect();
        models.sort();
        models
    }

    /// Check if any models are available
    pub fn has_models(&self) -> bool {
        !self.services.is_empty()
    }
}
