//! Prompt assembly: system blocks + cumulative summary + recency
//! window + the new user message, with the tool/skill snapshot
//! attached for discovery.

use dp_domain::message::Message;
use dp_sessions::SessionMeta;

const IDENTITY_BLOCK: &str = "\
You are a data-analysis agent working inside a per-session workspace. \
You plan before acting on multi-step requests: announce the plan as a \
```plan JSON block with a `steps` array of {title, tool} objects, then \
work through it with tool calls. Datasets live under `datasets/`, \
figures and derived files under `artifacts/`, notes and reports under \
`notes/`. Prefer typed tools over code; reach for run_code when the \
analysis needs the scientific stack. When a tool fails, read its error \
and decide: adjust the arguments, try another approach, or explain the \
blocker.";

/// Build the system prompt for one turn.
pub fn system_prompt(
    meta: &SessionMeta,
    tool_snapshot: &str,
    cumulative_summary: &str,
) -> String {
    let mut blocks: Vec<String> = vec![IDENTITY_BLOCK.to_string()];

    if let Some(profile) = &meta.profile_ref {
        blocks.push(format!("Research profile: {profile}"));
    }

    if !meta.datasets.is_empty() {
        let mut bound: Vec<String> = meta
            .datasets
            .iter()
            .map(|(name, path)| format!("- {name} → {path}"))
            .collect();
        bound.sort();
        blocks.push(format!("Bound datasets:\n{}", bound.join("\n")));
    }

    blocks.push(tool_snapshot.to_string());

    if !cumulative_summary.is_empty() {
        blocks.push(format!(
            "Summary of the conversation so far (earlier turns were compressed):\n{cumulative_summary}"
        ));
    }

    blocks.join("\n\n")
}

/// Assemble the full message list for a provider call.
pub fn assemble(
    meta: &SessionMeta,
    tool_snapshot: &str,
    cumulative_summary: &str,
    history: Vec<Message>,
    user_message: Option<Message>,
) -> Vec<Message> {
    let mut messages =
        Vec::with_capacity(history.len() + 2);
    messages.push(Message::system(system_prompt(
        meta,
        tool_snapshot,
        cumulative_summary,
    )));
    messages.extend(history);
    if let Some(user) = user_message {
        messages.push(user);
    }
    messages
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn meta() -> SessionMeta {
        SessionMeta {
            id: "s1".into(),
            title: "t".into(),
            created_at: "now".into(),
            profile_ref: Some("economics".into()),
            datasets: HashMap::from([("sales".to_string(), "datasets/sales.csv".to_string())]),
            prompt_tokens: 0,
            completion_tokens: 0,
            message_count: 0,
        }
    }

    #[test]
    fn system_prompt_carries_all_blocks() {
        let prompt = system_prompt(&meta(), "- load_dataset (tool): ...", "earlier summary");
        assert!(prompt.contains("data-analysis agent"));
        assert!(prompt.contains("economics"));
        assert!(prompt.contains("sales → datasets/sales.csv"));
        assert!(prompt.contains("load_dataset"));
        assert!(prompt.contains("earlier summary"));
    }

    #[test]
    fn assemble_orders_system_history_user() {
        let history = vec![Message::user("old"), Message::assistant("old answer")];
        let messages = assemble(
            &meta(),
            "snapshot",
            "",
            history,
            Some(Message::user("new question")),
        );
        assert_eq!(messages.len(), 4);
        assert!(matches!(messages[0].role, dp_domain::message::Role::System));
        assert_eq!(messages[3].content.all_text(), "new question");
    }
}
