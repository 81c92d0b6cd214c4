/// Shared error type used across all gateway crates.
///
/// Every variant that can surface to a client maps to a stable machine code
/// via [`Error::code`]; the Display string is the human-readable half of the
/// ERROR message contract.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP: {0}")]
    Http(String),

    #[error("cannot decode message: {0}")]
    DecodeInvalid(String),

    #[error("unsupported message content: {0}")]
    DecodeUnsupported(String),

    #[error("authentication did not resolve: {0}")]
    AuthUnresolved(String),

    #[error("denied: {0}")]
    AuthDenied(String),

    #[error("session expired: {0}")]
    SessionExpired(String),

    #[error("capability not found: {0}")]
    CapNotFound(String),

    #[error("capability {capability_id} denied: {reason}")]
    CapDenied {
        capability_id: String,
        reason: String,
    },

    #[error("capability {capability_id} failed: {message}")]
    CapExecutionError {
        capability_id: String,
        message: String,
    },

    #[error("hook cycle involving {0}")]
    HookCycle(String),

    #[error("duplicate capability id: {0}")]
    DuplicateId(String),

    #[error("duplicate command alias: {0}")]
    DuplicateAlias(String),

    #[error("capability {0} is not mutable")]
    MutableViolation(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("no transport available for {0}")]
    NoTransport(String),

    #[error("config: {0}")]
    Config(String),

    #[error("{0}")]
    Internal(String),
}

impl Error {
    /// Stable machine code carried in ERROR messages (`metadata.error_code`).
    pub fn code(&self) -> &'static str {
        match self {
            Error::DecodeInvalid(_) => "DECODE_INVALID",
            Error::DecodeUnsupported(_) => "DECODE_UNSUPPORTED",
            Error::AuthUnresolved(_) => "AUTH_UNRESOLVED",
            Error::AuthDenied(_) => "AUTH_DENIED",
            Error::SessionExpired(_) => "SESSION_EXPIRED",
            Error::CapNotFound(_) => "CAP_NOT_FOUND",
            Error::CapDenied { .. } => "CAP_DENIED",
            Error::CapExecutionError { .. } => "CAP_EXECUTION_ERROR",
            Error::HookCycle(_) => "HOOK_CYCLE",
            Error::DuplicateId(_) => "DUPLICATE_ID",
            Error::DuplicateAlias(_) => "DUPLICATE_ALIAS",
            Error::MutableViolation(_) => "MUTABLE_VIOLATION",
            Error::Timeout(_) => "TIMEOUT",
            Error::NoTransport(_) => "NO_TRANSPORT",
            Error::Io(_) | Error::Json(_) | Error::Http(_) | Error::Config(_) | Error::Internal(_) => {
                "INTERNAL"
            }
        }
    }

    /// The capability this error is about, when it is safe to expose.
    pub fn capability_id(&self) -> Option<&str> {
        match self {
            Error::CapDenied { capability_id, .. }
            | Error::CapExecutionError { capability_id, .. } => Some(capability_id),
            Error::CapNotFound(id) => Some(id),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(Error::DecodeInvalid("x".into()).code(), "DECODE_INVALID");
        assert_eq!(Error::Timeout("x".into()).code(), "TIMEOUT");
        assert_eq!(Error::NoTransport("x".into()).code(), "NO_TRANSPORT");
        assert_eq!(Error::Internal("x".into()).code(), "INTERNAL");
        assert_eq!(
            Error::CapDenied {
                capability_id: "cap.configure".into(),
                reason: "nope".into()
            }
            .code(),
            "CAP_DENIED"
        );
    }

    #[test]
    fn capability_id_only_where_safe() {
        let e = Error::CapExecutionError {
            capability_id: "cmd.version".into(),
            message: "boom".into(),
        };
        assert_eq!(e.capability_id(), Some("cmd.version"));
        assert_eq!(Error::Internal("x".into()).capability_id(), None);
    }
}
