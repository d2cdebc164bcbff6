use serde::Serialize;

/// Shared error type used across all DataPilot crates.
///
/// Variants map onto the runtime's propagation taxonomy via [`Error::kind`]:
/// tool-surfaced kinds (`policy`, `runtime`, `resource`) come back to the
/// model as failed tool results, transient provider errors are retried
/// inside the router, and only cancellation and fatal provider errors
/// terminate a turn outright.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("validation: {0}")]
    Validation(String),

    #[error("policy: {0}")]
    Policy(String),

    #[error("runtime: {0}")]
    Runtime(String),

    #[error("resource: {0}")]
    Resource(String),

    #[error("provider {provider}: {message}")]
    ProviderTransient { provider: String, message: String },

    #[error("provider {provider}: {message}")]
    ProviderFatal { provider: String, message: String },

    #[error("cancelled: {0}")]
    Cancelled(String),

    #[error("skill unavailable: {0}")]
    SkillUnavailable(String),

    #[error("config: {0}")]
    Config(String),

    #[error("internal: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Kind tag for an error — the classification the propagation rules
/// key on. No type hierarchy; the tag travels with tool results and
/// turn-terminal events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    Policy,
    Runtime,
    Resource,
    ProviderTransient,
    ProviderFatal,
    Cancelled,
    Internal,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::Validation => "validation",
            ErrorKind::Policy => "policy",
            ErrorKind::Runtime => "runtime",
            ErrorKind::Resource => "resource",
            ErrorKind::ProviderTransient => "provider_transient",
            ErrorKind::ProviderFatal => "provider_fatal",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Internal => "internal",
        };
        f.write_str(s)
    }
}

/// Disposition hint attached to user-facing error payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Disposition {
    Retryable,
    NeedsConfig,
    Unrecoverable,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Io(_) => ErrorKind::Resource,
            Error::Json(_) => ErrorKind::Validation,
            Error::Validation(_) => ErrorKind::Validation,
            Error::Policy(_) => ErrorKind::Policy,
            Error::Runtime(_) => ErrorKind::Runtime,
            Error::Resource(_) => ErrorKind::Resource,
            Error::ProviderTransient { .. } => ErrorKind::ProviderTransient,
            Error::ProviderFatal { .. } => ErrorKind::ProviderFatal,
            Error::Cancelled(_) => ErrorKind::Cancelled,
            Error::SkillUnavailable(_) => ErrorKind::Validation,
            Error::Config(_) => ErrorKind::Validation,
            Error::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Whether the router may retry this error on another binding.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::ProviderTransient | ErrorKind::Resource
        ) && !matches!(self, Error::Cancelled(_))
    }

    /// Disposition hint for user-facing payloads: the model-facing
    /// message plus this tag is what leaves the process.
    pub fn disposition(&self) -> Disposition {
        match self {
            Error::Config(_) => Disposition::NeedsConfig,
            Error::ProviderFatal { .. } => Disposition::NeedsConfig,
            e if e.is_retryable() => Disposition::Retryable,
            Error::Policy(_) | Error::Validation(_) | Error::Runtime(_) => Disposition::Retryable,
            _ => Disposition::Unrecoverable,
        }
    }
}
