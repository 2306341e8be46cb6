//! k8sgpt tool - scans the cluster for known problems

use super::{run_command, Tool, ToolContext, ToolError, ToolOutput};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::time::Duration;
use tokio::process::Command;

pub const NAME: &str = "run_k8sgpt";

const TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Default, Deserialize)]
struct K8sGptInput {
    #[serde(default)]
    namespace: Option<String>,
    #[serde(default)]
    filters: Option<String>,
    #[serde(default)]
    anonymize: bool,
}

pub struct K8sGptTool {
    binary: PathBuf,
    kubeconfig: Option<PathBuf>,
}

impl K8sGptTool {
    pub fn new(binary: PathBuf, kubeconfig: Option<PathBuf>) -> Self {
        Self { binary, kubeconfig }
    }

    fn build_command(&self, input: &K8sGptInput) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.args(["analyze", "--output", "json", "--explain=false"]);
        if let Some(kubeconfig) = &self.kubeconfig {
            cmd.arg("--kubeconfig").arg(kubeconfig);
        }
        if let Some(namespace) = input.namespace.as_deref().filter(|s| !s.is_empty()) {
            cmd.args(["--namespace", namespace]);
        }
        if let Some(filters) = input.filters.as_deref().filter(|s| !s.is_empty()) {
            cmd.args(["--filter", filters]);
        }
        if input.anonymize {
            cmd.arg("--anonymize");
        }
        cmd
    }
}

#[async_trait]
impl Tool for K8sGptTool {
    fn name(&self) -> &str {
        NAME
    }

    fn description(&self) -> String {
        "Scan the cluster with k8sgpt and return detected problems as JSON. \
         Use this first when the user asks what is wrong with a namespace or workload."
            .to_string()
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "namespace": {
                    "type": "string",
                    "description": "Namespace to scan; all namespaces when omitted"
                },
                "filters": {
                    "type": "string",
                    "description": "Comma separated analyzer filters, e.g. \"Pod,Service\""
                },
                "anonymize": {
                    "type": "boolean",
                    "description": "Mask sensitive names in the output"
                }
            }
        })
    }

    async fn invoke(&self, input: Value, ctx: ToolContext) -> Result<ToolOutput, ToolError> {
        let input: K8sGptInput = if input.is_null() {
            K8sGptInput::default()
        } else {
            serde_json::from_value(input).map_err(|e| ToolError::InvalidInput(e.to_string()))?
        };

        tracing::info!(
            conv_id = %ctx.conversation_id,
            namespace = ?input.namespace,
            filters = ?input.filters,
            "Running k8sgpt analyze"
        );

        let output = run_command(self.build_command(&input), TIMEOUT, &ctx.cancel).await?;
        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();

        // k8sgpt logs to stderr even on success; JSON on stdout wins
        if stdout.trim_start().starts_with('{') {
            return Ok(ToolOutput::Text(stdout));
        }

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let lowered = stderr.to_lowercase();
            if lowered.contains("refused") || lowered.contains("unable to connect") {
                return Err(ToolError::Failed(
                    "Unable to connect to Kubernetes cluster. Check that the cluster is running and the kubeconfig is valid."
                        .to_string(),
                ));
            }
            return Err(ToolError::Failed(format!("k8sgpt failed: {}", stderr.trim())));
        }

        Ok(ToolOutput::Text(stdout))
    }
}
