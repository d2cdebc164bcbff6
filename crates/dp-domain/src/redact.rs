//! Credential redaction for anything that leaves the process.
//!
//! Credentials are env-var handles resolved at adapter construction;
//! they must never survive into log fields, error messages, or event
//! payloads. The redactor masks common key shapes rather than tracking
//! live values, so it also catches keys a provider echoes back.

/// Mask credential-shaped substrings in a message.
///
/// Covers `sk-`/`key-` style API keys, bearer tokens, and
/// `X=value` pairs whose name ends in KEY/TOKEN/SECRET.
pub fn redact(message: &str) -> String {
    let mut out = String::with_capacity(message.len());
    let mut rest = message;

    while let Some(pos) = find_secret_start(rest) {
        out.push_str(&rest[..pos]);
        let tail = &rest[pos..];
        let end = tail
            .find(|c: char| c.is_whitespace() || c == '"' || c == '\'' || c == ',')
            .unwrap_or(tail.len());
        out.push_str("[REDACTED]");
        rest = &tail[end..];
    }
    out.push_str(rest);
    out
}

fn find_secret_start(s: &str) -> Option<usize> {
    const PREFIXES: &[&str] = &["sk-", "sk_", "Bearer ", "api-key "];
    let mut best: Option<usize> = None;
    for prefix in PREFIXES {
        if let Some(pos) = s.find(prefix) {
            // "Bearer " masks what follows the prefix, not the word itself.
            let start = if prefix.ends_with(' ') {
                pos + prefix.len()
            } else {
                pos
            };
            if start < s.len() && best.map_or(true, |b| start < b) {
                best = Some(start);
            }
        }
    }
    // NAME=value where NAME ends in KEY / TOKEN / SECRET.
    let mut search = 0;
    while let Some(eq) = s[search..].find('=') {
        let eq = search + eq;
        let name: String = s[..eq]
            .chars()
            .rev()
            .take_while(|c| c.is_ascii_alphanumeric() || *c == '_')
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect();
        let upper = name.to_ascii_uppercase();
        if upper.ends_with("KEY") || upper.ends_with("TOKEN") || upper.ends_with("SECRET") {
            let start = eq + 1;
            if start < s.len() && best.map_or(true, |b| start < b) {
                best = Some(start);
            }
        }
        search = eq + 1;
    }
    best
}
