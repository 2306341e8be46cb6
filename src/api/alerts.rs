//! Alertmanager webhook support
//!
//! Each firing alert gets its own conversation and execution. Nobody is
//! watching those runs live, so a logging subscriber records their progress.

use super::types::Alert;
use crate::runtime::{StreamEvent, Subscriber};
use std::fmt::Write;

/// Longest tool output echoed to the log, in characters
const LOG_PREVIEW_CHARS: usize = 100;

fn label<'a>(alert: &'a Alert, key: &str, default: &'a str) -> &'a str {
    alert.labels.get(key).map_or(default, String::as_str)
}

fn annotation<'a>(alert: &'a Alert, key: &str, default: &'a str) -> &'a str {
    alert.annotations.get(key).map_or(default, String::as_str)
}

pub fn alert_name(alert: &Alert) -> &str {
    label(alert, "alertname", "Unknown Alert")
}

/// Resolved alerts need no investigation
pub fn is_firing(alert: &Alert) -> bool {
    !alert.status.eq_ignore_ascii_case("resolved")
}

/// Opening user message of an alert investigation
pub fn investigation_prompt(alert: &Alert) -> String {
    let name = alert_name(alert);
    let severity = label(alert, "severity", "info");
    let instance = label(alert, "instance", "unknown-instance");
    let namespace = label(alert, "namespace", "default");
    let summary = annotation(alert, "summary", "No summary provided");
    let description = annotation(alert, "description", "");

    let mut hints = Vec::new();
    let lower = summary.to_lowercase();
    if lower.contains("cpu") {
        hints.push("Focus on CPU usage and the top consuming containers.");
    } else if lower.contains("memory") || lower.contains("oom") {
        hints.push("Suspect a memory leak or OOMKilled; check events and the last restart reason.");
    } else if lower.contains("network") || lower.contains("timeout") {
        hints.push("Suspect a network problem; check endpoints and service status.");
    }
    if severity.eq_ignore_ascii_case("critical") {
        hints.push("This is a critical alert; confirm service availability first.");
    }

    let mut prompt = format!(
        "ALERT RECEIVED\n\
         - Name: {name}\n\
         - Severity: {severity}\n\
         - Instance: {instance}\n\
         - Namespace: {namespace}\n\
         - Summary: {summary}\n\
         - Description: {description}\n\n\
         Find the root cause of {name} on {instance} and recommend a fix. \
         Stay within namespace {namespace} and resources related to {instance}; if the pod is gone, \
         look at its owning controller or its replacement pod. Do not perform mutating operations.\n\n\
         Hints:\n"
    );
    if hints.is_empty() {
        prompt.push_str("- None; follow the standard troubleshooting procedure.\n");
    }
    for hint in hints {
        let _ = writeln!(prompt, "- {hint}");
    }
    prompt
}

/// Drain an alert execution's events into the log until it finishes.
pub async fn log_events(conversation_id: String, mut subscriber: Subscriber) {
    while let Some(event) = subscriber.recv().await {
        match event {
            StreamEvent::ToolStart { tool, args } => {
                tracing::info!(conv_id = %conversation_id, tool = %tool, args = %args, "Alert agent tool call");
            }
            StreamEvent::ToolResult { output } => {
                let preview: String = output.chars().take(LOG_PREVIEW_CHARS).collect();
                tracing::info!(conv_id = %conversation_id, output = %preview, "Alert agent tool output");
            }
            StreamEvent::Error { content } => {
                tracing::warn!(conv_id = %conversation_id, error = %content, "Alert investigation failed");
            }
            StreamEvent::Done => {
                tracing::info!(conv_id = %conversation_id, "Alert investigation complete");
            }
            StreamEvent::Token { .. } | StreamEvent::Init { .. } => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn alert(status: &str, labels: &[(&str, &str)], annotations: &[(&str, &str)]) -> Alert {
        let map = |pairs: &[(&str, &str)]| {
            pairs
                .iter()
                .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                .collect::<HashMap<_, _>>()
        };
        Alert {
            status: status.to_string(),
            labels: map(labels),
            annotations: map(annotations),
        }
    }

    #[test]
    fn test_prompt_includes_alert_fields_and_hints() {
        let a = alert(
            "firing",
            &[
                ("alertname", "PodOOM"),
                ("severity", "critical"),
                ("instance", "web-1"),
                ("namespace", "shop"),
            ],
            &[("summary", "Container hit OOM limit")],
        );
        let prompt = investigation_prompt(&a);
        assert!(prompt.contains("- Name: PodOOM"));
        assert!(prompt.contains("- Instance: web-1"));
        assert!(prompt.contains("namespace shop"));
        assert!(prompt.contains("OOMKilled"));
        assert!(prompt.contains("critical alert"));
    }

    #[test]
    fn test_prompt_defaults() {
        let prompt = investigation_prompt(&alert("firing", &[], &[]));
        assert!(prompt.contains("- Name: Unknown Alert"));
        assert!(prompt.contains("No summary provided"));
        assert!(prompt.contains("standard troubleshooting procedure"));
    }

    #[test]
    fn test_resolved_alerts_are_not_firing() {
        assert!(is_firing(&alert("firing", &[], &[])));
        assert!(is_firing(&alert("", &[], &[])));
        assert!(!is_firing(&alert("Resolved", &[], &[])));
    }
}
