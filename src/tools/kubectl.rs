//! kubectl tool - runs a kubectl command against the configured cluster

use super::{run_command, split_args, Tool, ToolContext, ToolError, ToolOutput};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::time::Duration;
use tokio::process::Command;

pub const NAME: &str = "run_kubectl";

const TIMEOUT: Duration = Duration::from_secs(30);
const MAX_LINES: usize = 50;

#[derive(Debug, Deserialize)]
struct KubectlInput {
    args: String,
}

pub struct KubectlTool {
    binary: PathBuf,
    kubeconfig: Option<PathBuf>,
}

impl KubectlTool {
    pub fn new(binary: PathBuf, kubeconfig: Option<PathBuf>) -> Self {
        Self { binary, kubeconfig }
    }

    fn build_command(&self, args: &[String]) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.args(args);
        if let Some(kubeconfig) = &self.kubeconfig {
            cmd.arg("--kubeconfig").arg(kubeconfig);
        }
        cmd
    }
}

#[async_trait]
impl Tool for KubectlTool {
    fn name(&self) -> &str {
        NAME
    }

    fn description(&self) -> String {
        "Execute a kubectl command against the cluster. Pass everything after `kubectl` \
         as `args`, for example `get pods -n default` or `describe node worker-1`. \
         Mutating commands (delete, scale, patch, apply, ...) require explicit user confirmation."
            .to_string()
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "required": ["args"],
            "properties": {
                "args": {
                    "type": "string",
                    "description": "Arguments passed to kubectl, without the leading `kubectl`"
                }
            }
        })
    }

    async fn invoke(&self, input: Value, ctx: ToolContext) -> Result<ToolOutput, ToolError> {
        let input: KubectlInput =
            serde_json::from_value(input).map_err(|e| ToolError::InvalidInput(e.to_string()))?;
        let args = split_args(&input.args)?;
        if args.is_empty() {
            return Err(ToolError::InvalidInput("args must not be empty".to_string()));
        }

        tracing::info!(conv_id = %ctx.conversation_id, args = %input.args, "Executing kubectl");

        let output = run_command(self.build_command(&args), TIMEOUT, &ctx.cancel).await?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);

        let text = if output.status.success() {
            let trimmed = stdout.trim();
            if trimmed.is_empty() {
                "Success (No Output)".to_string()
            } else {
                trimmed.to_string()
            }
        } else {
            format!("Error ({}): {}", output.status.code().unwrap_or(-1), stderr.trim())
        };

        Ok(ToolOutput::Text(truncate_lines(&text, MAX_LINES)))
    }
}

fn truncate_lines(text: &str, max_lines: usize) -> String {
    let lines: Vec<&str> = text.split('\n').collect();
    if lines.len() <= max_lines {
        return text.to_string();
    }
    format!(
        "{}\n... (Truncated {} lines)",
        lines[..max_lines].join("\n"),
        lines.len() - max_lines
    )
}
