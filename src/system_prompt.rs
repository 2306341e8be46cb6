//! System prompt construction
//!
//! The prompt is a pure function of the enabled tool set: a role preamble,
//! the list of capabilities, and numbered behavioral rules. Rules that only
//! make sense for a particular tool are included only when that tool is on.

use crate::tools::{K8SGPT_TOOL, KUBECTL_TOOL};
use std::fmt::Write;

/// Base system prompt establishing the agent's role
const PREAMBLE: &str = "You are a Kubernetes AIOps Agent specialized in troubleshooting cluster problems.";

/// Rules that apply regardless of which tools are enabled
const BASE_RULES: &[&str] = &[
    "FACTUALITY: Do NOT invent, guess, or hallucinate labels, pod names, or error messages. If it is not in tool output, it does not exist.",
    "ADMIT DEFEAT: If you cannot find the information, say \"I cannot find X in the cluster\". Do not make it up.",
    "UNAVAILABLE TOOLS: Only call the tools listed under CAPABILITIES. If a task needs a capability you do not have, say so.",
    "SYNTAX: Use correct command syntax. Request JSON or YAML output only when you need to parse it; plain text is fine for summaries.",
    "RESPOND FIRST: Briefly say what you are about to check before calling a tool, then explain the findings in plain terms.",
];

const KUBECTL_RULES: &[&str] = &[
    "EVIDENCE: Run `run_kubectl` to verify facts before stating them.",
    "CONSENT: Mutating operations (delete, restart, scale, edit, patch, cordon, drain, apply) are blocked until the user explicitly replies 'confirm' or 'yes'. Ask before attempting them.",
    "VERIFICATION: After any mutating action, run `run_kubectl` again to check the new status. Do not assume it worked and do not invent new pod names.",
];

const K8SGPT_RULES: &[&str] = &[
    "DIAGNOSTICS: If the user asks to scan, diagnose, or check health, start with `run_k8sgpt`. It returns raw JSON findings; analyze them and explain the issues. Do not dump the JSON.",
];

fn capability_line(tool: &str) -> String {
    match tool {
        KUBECTL_TOOL => format!("- {tool}: run kubectl commands against the cluster"),
        K8SGPT_TOOL => format!("- {tool}: scan the cluster for problems and return JSON findings"),
        other => format!("- {other}"),
    }
}

/// Build the system prompt for the given enabled tools.
pub fn build_system_prompt(tool_names: &[&str]) -> String {
    let mut prompt = String::from(PREAMBLE);

    prompt.push_str("\n\nCAPABILITIES:\n");
    if tool_names.is_empty() {
        prompt.push_str("- none (answer from the conversation only)\n");
    } else {
        for tool in tool_names {
            prompt.push_str(&capability_line(tool));
            prompt.push('\n');
        }
    }

    let mut rules: Vec<&str> = BASE_RULES.to_vec();
    if tool_names.contains(&KUBECTL_TOOL) {
        rules.extend_from_slice(KUBECTL_RULES);
    }
    if tool_names.contains(&K8SGPT_TOOL) {
        rules.extend_from_slice(K8SGPT_RULES);
    }

    prompt.push_str("\nCRITICAL RULES:\n");
    for (i, rule) in rules.iter().enumerate() {
        let _ = writeln!(prompt, "{}. {rule}", i + 1);
    }

    prompt
}
