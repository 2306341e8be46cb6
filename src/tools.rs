//! Tools the agent can call
//!
//! Tools are stateless singletons; every per-call input arrives through
//! `ToolContext`. The runtime depends only on the `Tool` trait, never on how a
//! tool instance was built.

mod k8sgpt;
mod kubectl;

pub use k8sgpt::{K8sGptTool, NAME as K8SGPT_TOOL};
pub use kubectl::{KubectlTool, NAME as KUBECTL_TOOL};

use crate::llm::ToolDefinition;
use async_trait::async_trait;
use serde_json::Value;
use std::path::PathBuf;
use std::process::{Output, Stdio};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

/// Value returned by a tool handler
#[derive(Debug, Clone, PartialEq)]
pub enum ToolOutput {
    /// Plain text, passed to the model untouched
    Text(String),
    /// Structured output, serialized to a JSON string for the model
    Json(Value),
}

impl ToolOutput {
    pub fn text(s: impl Into<String>) -> Self {
        ToolOutput::Text(s.into())
    }

    /// Render the output as the string recorded in the tool-role message.
    pub fn into_content(self) -> String {
        match self {
            ToolOutput::Text(text) | ToolOutput::Json(Value::String(text)) => text,
            ToolOutput::Json(value) => value.to_string(),
        }
    }
}

/// Failure raised by a tool handler
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("failed to launch {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("command timed out after {0:?}")]
    TimedOut(Duration),
    #[error("command cancelled")]
    Cancelled,
    #[error("{0}")]
    Failed(String),
}

/// All context needed for a tool invocation.
#[derive(Clone)]
pub struct ToolContext {
    /// Cancellation signal for long-running operations
    pub cancel: CancellationToken,

    /// The conversation this tool is executing within
    pub conversation_id: String,
}

impl ToolContext {
    pub fn new(cancel: CancellationToken, conversation_id: impl Into<String>) -> Self {
        Self {
            cancel,
            conversation_id: conversation_id.into(),
        }
    }
}

/// Trait for tools that can be executed by the agent
#[async_trait]
pub trait Tool: Send + Sync {
    /// Tool name
    fn name(&self) -> &str;

    /// Tool description for LLM
    fn description(&self) -> String;

    /// JSON schema for tool input
    fn input_schema(&self) -> Value;

    /// Run the tool. Long-running tools should watch `ctx.cancel`.
    async fn invoke(&self, input: Value, ctx: ToolContext) -> Result<ToolOutput, ToolError>;
}

/// Settings for the built-in cluster tools
#[derive(Debug, Clone)]
pub struct ToolsConfig {
    /// Names of the built-in tools to enable
    pub enabled: Vec<String>,
    pub kubectl_path: PathBuf,
    pub k8sgpt_path: PathBuf,
    pub kubeconfig: Option<PathBuf>,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            enabled: vec![kubectl::NAME.to_string(), k8sgpt::NAME.to_string()],
            kubectl_path: PathBuf::from("kubectl"),
            k8sgpt_path: PathBuf::from("k8sgpt"),
            kubeconfig: None,
        }
    }
}

impl ToolsConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            enabled: std::env::var("KUBEOPS_TOOLS")
                .map(|v| {
                    v.split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(String::from)
                        .collect()
                })
                .unwrap_or(defaults.enabled),
            kubectl_path: std::env::var_os("KUBECTL_PATH").map_or(defaults.kubectl_path, PathBuf::from),
            k8sgpt_path: std::env::var_os("K8SGPT_PATH").map_or(defaults.k8sgpt_path, PathBuf::from),
            kubeconfig: std::env::var_os("KUBECONFIG").map(PathBuf::from),
        }
    }
}

/// Collection of tools available to conversations
pub struct ToolRegistry {
    tools: Vec<Arc<dyn Tool>>,
}

impl ToolRegistry {
    /// Registry with no tools
    pub fn empty() -> Self {
        Self { tools: Vec::new() }
    }

    /// Registry with the enabled built-in cluster tools
    pub fn builtin(config: &ToolsConfig) -> Self {
        let mut registry = Self::empty();
        for name in &config.enabled {
            let tool: Arc<dyn Tool> = match name.as_str() {
                kubectl::NAME => Arc::new(KubectlTool::new(
                    config.kubectl_path.clone(),
                    config.kubeconfig.clone(),
                )),
                k8sgpt::NAME => Arc::new(K8sGptTool::new(
                    config.k8sgpt_path.clone(),
                    config.kubeconfig.clone(),
                )),
                other => {
                    tracing::warn!(tool = %other, "Ignoring unknown tool in configuration");
                    continue;
                }
            };
            registry = registry.with_tool(tool);
        }
        registry
    }

    /// Add a tool, replacing any existing tool with the same name
    pub fn with_tool(mut self, tool: Arc<dyn Tool>) -> Self {
        self.tools.retain(|t| t.name() != tool.name());
        self.tools.push(tool);
        self
    }

    /// Schemas for every registered tool, in registration order
    pub fn schemas(&self) -> Vec<ToolDefinition> {
        self.tools
            .iter()
            .map(|t| ToolDefinition {
                name: t.name().to_string(),
                description: t.description(),
                input_schema: t.input_schema(),
            })
            .collect()
    }

    /// Look up a handler by name
    pub fn handler(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.iter().find(|t| t.name() == name).cloned()
    }

    pub fn names(&self) -> Vec<&str> {
        self.tools.iter().map(|t| t.name()).collect()
    }
}

/// Split an argument string like a shell would, honoring single and double quotes.
pub fn split_args(raw: &str) -> Result<Vec<String>, ToolError> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut in_arg = false;
    let mut quote: Option<char> = None;

    for c in raw.chars() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), c) => current.push(c),
            (None, '\'' | '"') => {
                quote = Some(c);
                in_arg = true;
            }
            (None, c) if c.is_whitespace() => {
                if in_arg {
                    args.push(std::mem::take(&mut current));
                    in_arg = false;
                }
            }
            (None, c) => {
                current.push(c);
                in_arg = true;
            }
        }
    }

    if quote.is_some() {
        return Err(ToolError::InvalidInput("unterminated quote in args".to_string()));
    }
    if in_arg {
        args.push(current);
    }
    Ok(args)
}

/// Run an external program to completion, honoring a timeout and cancellation.
///
/// The child is killed if the wait is abandoned.
pub(crate) async fn run_command(
    mut cmd: Command,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<Output, ToolError> {
    let program = cmd.as_std().get_program().to_string_lossy().into_owned();
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    tracing::debug!(program = %program, args = ?cmd.as_std().get_args().collect::<Vec<_>>(), "Running command");

    let child = cmd
        .spawn()
        .map_err(|source| ToolError::Spawn { program, source })?;

    tokio::select! {
        biased;

        () = cancel.cancelled() => Err(ToolError::Cancelled),

        () = tokio::time::sleep(timeout) => Err(ToolError::TimedOut(timeout)),

        result = child.wait_with_output() => {
            result.map_err(|e| ToolError::Failed(format!("failed to collect output: {e}")))
        }
    }
}
