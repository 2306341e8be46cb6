//! Tool invocation gate
//!
//! Every tool call passes through here. The gate never fails: unknown tools,
//! blocked calls, handler errors and handler panics all become result text.

use super::history::ToolCall;
use crate::llm::LlmMessage;
use crate::tools::{split_args, ToolContext, ToolRegistry, KUBECTL_TOOL};
use futures::FutureExt;
use serde_json::Value;
use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

const DESTRUCTIVE_VERBS: &[&str] = &[
    "delete", "restart", "scale", "edit", "patch", "cordon", "drain", "apply",
];

const CONSENT_KEYWORDS: &[&str] = &["confirm", "yes", "proceed", "ok", "approve", "go ahead"];

/// Tool-role result for one call
#[derive(Debug, Clone, PartialEq)]
pub struct ToolResultMessage {
    pub tool_call_id: String,
    pub content: String,
    pub is_error: bool,
}

/// Which tools need consent, and what counts as destructive or as consent
#[derive(Debug, Clone)]
pub struct SafetyPolicy {
    confirm_tools: HashSet<String>,
    destructive_verbs: HashSet<String>,
    consent_keywords: Vec<Vec<String>>,
}

impl Default for SafetyPolicy {
    fn default() -> Self {
        Self::new([KUBECTL_TOOL])
    }
}

impl SafetyPolicy {
    /// Policy requiring consent for destructive calls to the named tools
    pub fn new<I, N>(confirm_tools: I) -> Self
    where
        I: IntoIterator<Item = N>,
        N: Into<String>,
    {
        Self {
            confirm_tools: confirm_tools.into_iter().map(Into::into).collect(),
            destructive_verbs: DESTRUCTIVE_VERBS.iter().map(|v| (*v).to_string()).collect(),
            consent_keywords: CONSENT_KEYWORDS.iter().map(|k| words(k)).collect(),
        }
    }

    pub fn requires_confirmation(&self, tool_name: &str) -> bool {
        self.confirm_tools.contains(tool_name)
    }

    /// First destructive verb found among the argument tokens
    pub fn destructive_verb(&self, arguments: &Value) -> Option<String> {
        let mut tokens = Vec::new();
        collect_tokens(arguments, &mut tokens);
        tokens
            .into_iter()
            .find(|token| self.destructive_verbs.contains(token))
    }

    /// Whether the text contains any consent keyword as whole words
    pub fn has_consent(&self, text: &str) -> bool {
        let text_words = words(text);
        self.consent_keywords.iter().any(|keyword| {
            !keyword.is_empty()
                && text_words
                    .windows(keyword.len())
                    .any(|window| window == keyword.as_slice())
        })
    }

    /// Returns the block message when the call must not run.
    pub fn check(&self, call: &ToolCall, history: &[LlmMessage]) -> Option<String> {
        if !self.requires_confirmation(&call.name) {
            return None;
        }
        let verb = self.destructive_verb(&call.arguments)?;

        let last_user_text = history
            .iter()
            .rev()
            .find(|m| m.is_human_turn())
            .map(LlmMessage::text)
            .unwrap_or_default();

        if self.has_consent(&last_user_text) {
            tracing::info!(tool = %call.name, verb = %verb, "Destructive call approved by user");
            return None;
        }

        tracing::warn!(tool = %call.name, verb = %verb, "Destructive call blocked pending approval");
        Some(format!(
            "⚠️ SAFETY BLOCK: Operation '{}' requires approval. Please ask user to reply 'confirm' or 'yes'.",
            describe_arguments(&call.arguments)
        ))
    }
}

/// Resolves, screens, and runs tool calls
pub struct ToolGate {
    registry: Arc<ToolRegistry>,
    policy: SafetyPolicy,
}

impl ToolGate {
    pub fn new(registry: Arc<ToolRegistry>, policy: SafetyPolicy) -> Self {
        Self { registry, policy }
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    /// Run one tool call. `history` is the full message list the model saw.
    pub async fn invoke(
        &self,
        call: &ToolCall,
        history: &[LlmMessage],
        ctx: ToolContext,
    ) -> ToolResultMessage {
        let result = |content: String, is_error: bool| ToolResultMessage {
            tool_call_id: call.id.clone(),
            content,
            is_error,
        };

        let Some(handler) = self.registry.handler(&call.name) else {
            tracing::warn!(tool = %call.name, "Model requested unknown tool");
            return result(format!("Error: Tool {} not found.", call.name), true);
        };

        if let Some(blocked) = self.policy.check(call, history) {
            return result(blocked, true);
        }

        tracing::info!(
            conv_id = %ctx.conversation_id,
            tool = %call.name,
            call_id = %call.id,
            "Executing tool"
        );

        let outcome = AssertUnwindSafe(handler.invoke(call.arguments.clone(), ctx))
            .catch_unwind()
            .await;

        match outcome {
            Ok(Ok(output)) => result(output.into_content(), false),
            Ok(Err(e)) => {
                tracing::warn!(tool = %call.name, error = %e, "Tool failed");
                result(format!("Error executing tool {}: {e}", call.name), true)
            }
            Err(_) => {
                tracing::error!(tool = %call.name, "Tool panicked");
                result(
                    format!("Error executing tool {}: tool panicked", call.name),
                    true,
                )
            }
        }
    }
}

/// Lower-cased argument tokens of every string inside `value`.
///
/// Strings are split the way the tools split them, so quoting cannot hide a
/// verb. Strings a tool would reject are split on whitespace with quotes dropped.
fn collect_tokens(value: &Value, out: &mut Vec<String>) {
    match value {
        Value::String(s) => match split_args(s) {
            Ok(args) => out.extend(
                args.iter()
                    .flat_map(|a| a.split_whitespace())
                    .map(str::to_lowercase),
            ),
            Err(_) => out.extend(
                s.split_whitespace()
                    .map(|w| w.replace(['\'', '"'], "").to_lowercase()),
            ),
        },
        Value::Array(items) => items.iter().for_each(|v| collect_tokens(v, out)),
        Value::Object(map) => map.values().for_each(|v| collect_tokens(v, out)),
        _ => {}
    }
}

fn words(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(String::from)
        .collect()
}

fn describe_arguments(arguments: &Value) -> String {
    match arguments.get("args") {
        Some(Value::String(args)) => args.clone(),
        _ => arguments.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{ContentBlock, MessageRole};
    use crate::runtime::testing::MockTool;
    use crate::tools::{ToolError, ToolOutput};
    use proptest::prelude::*;
    use serde_json::json;
    use tokio_util::sync::CancellationToken;

    fn ctx() -> ToolContext {
        ToolContext::new(CancellationToken::new(), "c1")
    }

    fn gate_with(tool: Arc<MockTool>) -> ToolGate {
        let registry = ToolRegistry::empty().with_tool(tool);
        ToolGate::new(Arc::new(registry), SafetyPolicy::default())
    }

    fn delete_call() -> ToolCall {
        ToolCall::new("call-1", "run_kubectl", json!({"args": "delete pod foo"}))
    }

    #[tokio::test]
    async fn test_destructive_call_blocked_without_consent() {
        let tool = Arc::new(MockTool::new("run_kubectl", ToolOutput::text("deleted")));
        let gate = gate_with(tool.clone());
        let history = vec![LlmMessage::user_text("please check status")];

        let result = gate.invoke(&delete_call(), &history, ctx()).await;

        assert!(result.content.starts_with("⚠️ SAFETY BLOCK: Operation 'delete pod foo'"));
        assert_eq!(result.tool_call_id, "call-1");
        assert!(result.is_error);
        assert_eq!(tool.call_count(), 0);
    }

    #[tokio::test]
    async fn test_destructive_call_runs_after_consent() {
        let tool = Arc::new(MockTool::new("run_kubectl", ToolOutput::text("pod \"foo\" deleted")));
        let gate = gate_with(tool.clone());
        let history = vec![
            LlmMessage::user_text("delete pod foo"),
            LlmMessage::user_text("yes, confirm"),
        ];

        let result = gate.invoke(&delete_call(), &history, ctx()).await;

        assert_eq!(result.content, "pod \"foo\" deleted");
        assert!(!result.is_error);
        assert_eq!(tool.call_count(), 1);
        assert_eq!(tool.recorded_inputs(), vec![json!({"args": "delete pod foo"})]);
    }

    #[tokio::test]
    async fn test_consent_looks_at_last_human_message_only() {
        let tool = Arc::new(MockTool::new("run_kubectl", ToolOutput::text("ok")));
        let gate = gate_with(tool.clone());
        let history = vec![
            LlmMessage::user_text("yes"),
            LlmMessage {
                role: MessageRole::Assistant,
                content: vec![ContentBlock::text("Which pod?")],
            },
            LlmMessage::user_text("the broken one"),
            LlmMessage {
                role: MessageRole::User,
                content: vec![ContentBlock::tool_result("x", "approve", false)],
            },
        ];

        let result = gate.invoke(&delete_call(), &history, ctx()).await;
        assert!(result.content.contains("SAFETY BLOCK"));
        assert_eq!(tool.call_count(), 0);
    }

    #[tokio::test]
    async fn test_read_only_and_unflagged_tools_skip_check() {
        let kubectl = Arc::new(MockTool::new("run_kubectl", ToolOutput::text("pods")));
        let gate = gate_with(kubectl.clone());
        let read = ToolCall::new("r", "run_kubectl", json!({"args": "get pods"}));
        gate.invoke(&read, &[], ctx()).await;
        assert_eq!(kubectl.call_count(), 1);

        let other = Arc::new(MockTool::new("notes", ToolOutput::text("saved")));
        let gate = gate_with(other.clone());
        let call = ToolCall::new("n", "notes", json!({"text": "delete everything"}));
        let result = gate.invoke(&call, &[], ctx()).await;
        assert_eq!(result.content, "saved");
        assert_eq!(other.call_count(), 1);
    }

    #[tokio::test]
    async fn test_unknown_tool() {
        let gate = ToolGate::new(Arc::new(ToolRegistry::empty()), SafetyPolicy::default());
        let call = ToolCall::new("u", "run_helm", json!({}));
        let result = gate.invoke(&call, &[], ctx()).await;
        assert_eq!(result.content, "Error: Tool run_helm not found.");
        assert_eq!(result.tool_call_id, "u");
    }

    #[tokio::test]
    async fn test_handler_error_and_panic_become_text() {
        let failing = Arc::new(MockTool::failing("probe", || ToolError::Failed("backend down".into())));
        let gate = gate_with(failing);
        let call = ToolCall::new("e", "probe", json!({}));
        let result = gate.invoke(&call, &[], ctx()).await;
        assert_eq!(result.content, "Error executing tool probe: backend down");

        let panicking = Arc::new(MockTool::panicking("probe"));
        let gate = gate_with(panicking);
        let result = gate.invoke(&call, &[], ctx()).await;
        assert_eq!(result.content, "Error executing tool probe: tool panicked");
        assert!(result.is_error);
    }

    #[tokio::test]
    async fn test_structured_output_is_serialized() {
        let tool = Arc::new(MockTool::new(
            "run_k8sgpt",
            ToolOutput::Json(json!({"problems": 2})),
        ));
        let gate = gate_with(tool);
        let call = ToolCall::new("j", "run_k8sgpt", json!({}));
        let result = gate.invoke(&call, &[], ctx()).await;
        assert_eq!(result.content, r#"{"problems":2}"#);
    }

    #[test]
    fn test_consent_matching_uses_whole_words() {
        let policy = SafetyPolicy::default();
        assert!(policy.has_consent("Yes, confirm"));
        assert!(policy.has_consent("ok"));
        assert!(policy.has_consent("please go ahead."));
        assert!(!policy.has_consent("please check status"));
        assert!(!policy.has_consent("look at the token bucket"));
        assert!(!policy.has_consent("go and then ahead"));
    }

    #[test]
    fn test_destructive_verbs_found_in_nested_arguments() {
        let policy = SafetyPolicy::default();
        assert_eq!(
            policy.destructive_verb(&json!({"args": "Scale deploy/web --replicas=0"})),
            Some("scale".to_string())
        );
        assert_eq!(
            policy.destructive_verb(&json!({"steps": [{"cmd": "drain node-1"}]})),
            Some("drain".to_string())
        );
        assert_eq!(policy.destructive_verb(&json!({"args": "get deletions"})), None);
        assert_eq!(
            policy.destructive_verb(&json!({"args": "'delete' pod foo"})),
            Some("delete".to_string())
        );
        assert_eq!(
            policy.destructive_verb(&json!({"args": "\"drain\" node-1"})),
            Some("drain".to_string())
        );
        assert_eq!(
            policy.destructive_verb(&json!({"args": "de'le'te pod foo"})),
            Some("delete".to_string())
        );
        assert_eq!(
            policy.destructive_verb(&json!({"args": "'apply -f x.yaml"})),
            Some("apply".to_string())
        );
    }

    #[tokio::test]
    async fn test_quoted_verb_still_needs_consent() {
        let tool = Arc::new(MockTool::new("run_kubectl", ToolOutput::text("deleted")));
        let gate = gate_with(tool.clone());
        let history = vec![LlmMessage::user_text("please check status")];
        let call = ToolCall::new("call-2", "run_kubectl", json!({"args": "'delete' pod foo"}));

        let result = gate.invoke(&call, &history, ctx()).await;

        assert!(result.content.starts_with("⚠️ SAFETY BLOCK"));
        assert_eq!(tool.call_count(), 0);
    }

    proptest! {
        #[test]
        fn read_only_arguments_never_blocked(words in prop::collection::vec("[a-z]{1,8}", 0..6)) {
            let policy = SafetyPolicy::default();
            let args = words
                .iter()
                .filter(|w| !DESTRUCTIVE_VERBS.contains(&w.as_str()))
                .cloned()
                .collect::<Vec<_>>()
                .join(" ");
            let call = ToolCall::new("p", "run_kubectl", json!({ "args": args }));
            prop_assert!(policy.check(&call, &[]).is_none());
        }
    }
}
