//! Token estimation. A character heuristic, deliberately: estimates
//! gate compression, they are never billed, and provider tokenizers
//! differ anyway.

use dp_domain::message::{Message, MessageContent};

/// Rough chars-per-token ratio for mixed English/code content.
const CHARS_PER_TOKEN: usize = 4;

/// Fixed per-message overhead (role tags, separators).
const MESSAGE_OVERHEAD: u32 = 4;

pub fn estimate_tokens(text: &str) -> u32 {
    (text.len().div_ceil(CHARS_PER_TOKEN)) as u32
}

pub fn estimate_message_tokens(message: &Message) -> u32 {
    let content_len = match &message.content {
        MessageContent::Text(t) => t.len(),
        MessageContent::Parts(parts) => parts
            .iter()
            .map(|p| serde_json::to_string(p).map(|s| s.len()).unwrap_or(0))
            .sum(),
    };
    (content_len.div_ceil(CHARS_PER_TOKEN)) as u32 + MESSAGE_OVERHEAD
}

pub fn estimate_conversation_tokens(messages: &[Message]) -> u32 {
    messages.iter().map(estimate_message_tokens).sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn four_chars_per_token() {
        assert_eq!(estimate_tokens("abcdefgh"), 2);
        assert_eq!(estimate_tokens("abc"), 1);
        assert_eq!(estimate_tokens(""), 0);
    }

    #[test]
    fn message_estimate_includes_overhead() {
        let msg = Message::user("abcd");
        assert_eq!(estimate_message_tokens(&msg), 1 + 4);
    }

    #[test]
    fn conversation_sums() {
        let msgs = vec![Message::user("abcd"), Message::assistant("efgh")];
        assert_eq!(estimate_conversation_tokens(&msgs), 10);
    }
}
