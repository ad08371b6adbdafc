use std::io;

/// Closed failure taxonomy for the tracker core.
///
/// Component boundaries map every failure into one of these kinds; the
/// orchestrator logs and decides. Only `SchemaCorruption` (and
/// `PermissionDenied` during startup) aborts the daemon.
#[derive(Debug, thiserror::Error)]
pub enum TrackerError {
    #[error("transient I/O error: {0}")]
    TransientIo(String),

    #[error("cannot connect to display server")]
    DisplayUnavailable,

    #[error("no monitors detected")]
    NoMonitors,

    #[error("LLM backend unavailable: {0}")]
    LlmUnavailable(String),

    #[error("LLM request timed out after {0}s")]
    LlmTimeout(u64),

    #[error("LLM returned HTTP {0}")]
    LlmHttp(u16),

    #[error("malformed LLM response: {0}")]
    LlmMalformed(String),

    #[error("database schema corruption: {0}")]
    SchemaCorruption(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),
}

impl From<crate::services::llm_client::LlmError> for TrackerError {
    fn from(err: crate::services::llm_client::LlmError) -> Self {
        use crate::services::llm_client::LlmError;
        match err {
            LlmError::Timeout(secs) => TrackerError::LlmTimeout(secs),
            LlmError::Unreachable(msg) => TrackerError::LlmUnavailable(msg),
            LlmError::HttpError(code) => TrackerError::LlmHttp(code),
            LlmError::MalformedResponse(msg) => TrackerError::LlmMalformed(msg),
        }
    }
}

impl TrackerError {
    /// Whether the daemon must exit on this error.
    pub fn is_fatal(&self) -> bool {
        matches!(self, TrackerError::SchemaCorruption(_))
    }

    pub fn from_io(err: &io::Error, context: &str) -> Self {
        if err.kind() == io::ErrorKind::PermissionDenied {
            TrackerError::PermissionDenied(format!("{context}: {err}"))
        } else {
            TrackerError::TransientIo(format!("{context}: {err}"))
        }
    }

    pub fn from_sqlite(err: &rusqlite::Error, context: &str) -> Self {
        use rusqlite::ErrorCode;
        match err {
            rusqlite::Error::SqliteFailure(inner, _) => match inner.code {
                ErrorCode::DatabaseCorrupt | ErrorCode::NotADatabase => {
                    TrackerError::SchemaCorruption(format!("{context}: {err}"))
                }
                ErrorCode::PermissionDenied | ErrorCode::ReadOnly => {
                    TrackerError::PermissionDenied(format!("{context}: {err}"))
                }
                _ => TrackerError::TransientIo(format!("{context}: {err}")),
            },
            _ => TrackerError::TransientIo(format!("{context}: {err}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_schema_corruption_is_fatal() {
        assert!(TrackerError::SchemaCorruption("bad page".into()).is_fatal());
        assert!(!TrackerError::TransientIo("locked".into()).is_fatal());
        assert!(!TrackerError::PermissionDenied("db".into()).is_fatal());
        assert!(!TrackerError::LlmTimeout(120).is_fatal());
    }

    #[test]
    fn io_permission_maps_to_permission_denied() {
        let err = io::Error::new(io::ErrorKind::PermissionDenied, "denied");
        assert!(matches!(
            TrackerError::from_io(&err, "opening data dir"),
            TrackerError::PermissionDenied(_)
        ));

        let err = io::Error::new(io::ErrorKind::Other, "disk hiccup");
        assert!(matches!(
            TrackerError::from_io(&err, "saving file"),
            TrackerError::TransientIo(_)
        ));
    }
}
