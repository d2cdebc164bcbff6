use dp_domain::error::Error;
use dp_domain::redact::redact;

/// Map a reqwest error to the domain taxonomy: connect/timeout/body
/// errors are transient, everything else is surfaced as-is.
pub(crate) fn from_reqwest(provider: &str, e: reqwest::Error) -> Error {
    if e.is_timeout() || e.is_connect() || e.is_request() || e.is_body() {
        Error::ProviderTransient {
            provider: provider.to_string(),
            message: redact(&e.to_string()),
        }
    } else {
        Error::ProviderFatal {
            provider: provider.to_string(),
            message: redact(&e.to_string()),
        }
    }
}

/// Classify an HTTP status into the error taxonomy. 429 and 5xx are
/// retryable; other 4xx short-circuit failover.
pub(crate) fn from_status(provider: &str, status: u16, body: &str) -> Error {
    let message = redact(&format!("HTTP {status}: {}", truncate(body, 300)));
    if status == 429 || status >= 500 {
        Error::ProviderTransient {
            provider: provider.to_string(),
            message,
        }
    } else {
        Error::ProviderFatal {
            provider: provider.to_string(),
            message,
        }
    }
}

pub(crate) fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// Resolve a credential env handle. The value itself never enters any
/// error message.
pub(crate) fn resolve_credential(provider: &str, env_var: &str) -> Result<String, Error> {
    match std::env::var(env_var) {
        Ok(v) if !v.is_empty() => Ok(v),
        _ => Err(Error::Config(format!(
            "provider \"{provider}\": credential env var {env_var} is unset"
        ))),
    }
}
