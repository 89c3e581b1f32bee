use thiserror::Error;

/// Upper bound for captured process output carried inside an error message.
pub const MAX_OUTPUT_BYTES: usize = 32 * 1024;

#[derive(Error, Debug)]
pub enum Error {
    #[error("not found: {0}")]
    EntityNotFound(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("{message}")]
    OperationFailed {
        message: String,
        /// Captured subprocess output, already truncated.
        output: Option<String>,
    },

    #[error("failed to start {program}: {source}")]
    StartFailed {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// Reserved for network collaborators; nothing in this crate produces it.
    #[error("external api error: {0}")]
    ExternalApi(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn not_found(what: impl Into<String>) -> Self {
        Error::EntityNotFound(what.into())
    }

    pub fn bad_request(what: impl Into<String>) -> Self {
        Error::BadRequest(what.into())
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Error::OperationFailed {
            message: message.into(),
            output: None,
        }
    }

    pub fn failed_with_output(message: impl Into<String>, output: &str) -> Self {
        let output = output.trim();
        Error::OperationFailed {
            message: message.into(),
            output: (!output.is_empty()).then(|| truncate_tail_utf8(output, MAX_OUTPUT_BYTES)),
        }
    }

    /// Text stored in a failed task's `error_message`.
    pub fn user_message(&self) -> String {
        match self {
            Error::OperationFailed {
                message,
                output: Some(output),
            } => format!("{message}\n{output}"),
            Error::Other(err) => format_error_chain(err),
            other => other.to_string(),
        }
    }
}

pub fn format_error_chain(err: &anyhow::Error) -> String {
    let mut parts = Vec::<String>::new();
    for cause in err.chain() {
        let s = cause.to_string();
        if s.is_empty() {
            continue;
        }
        if parts.last() == Some(&s) {
            continue;
        }
        parts.push(s);
    }
    if parts.is_empty() {
        "unknown error".to_string()
    } else {
        parts.join(": ")
    }
}

/// Keeps the last `max_bytes` of `s`; the end of a process log is where the failure is.
pub fn truncate_tail_utf8(s: &str, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s.to_string();
    }

    let prefix = "(truncated)…";
    let keep = max_bytes.saturating_sub(prefix.len()).max(1);
    let mut start = s.len() - keep.min(s.len());
    while start < s.len() && !s.is_char_boundary(start) {
        start += 1;
    }
    let mut out = prefix.to_string();
    out.push_str(&s[start..]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_keeps_tail_within_budget() {
        let long = format!("{}END", "a".repeat(MAX_OUTPUT_BYTES + 1024));
        let s = truncate_tail_utf8(&long, MAX_OUTPUT_BYTES);
        assert!(s.len() <= MAX_OUTPUT_BYTES);
        assert!(s.starts_with("(truncated)…"));
        assert!(s.ends_with("END"));
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        let s = "é".repeat(100);
        let out = truncate_tail_utf8(&s, 31);
        assert!(out.len() <= 31);
        assert!(out.ends_with('é'));
    }

    #[test]
    fn operation_failed_message_includes_output() {
        let err = Error::failed_with_output("git clone failed (exit code 128)", "fatal: repo\n");
        let msg = err.user_message();
        assert!(msg.starts_with("git clone failed (exit code 128)"));
        assert!(msg.contains("fatal: repo"));
    }

    #[test]
    fn empty_output_is_dropped() {
        let err = Error::failed_with_output("boom", "   \n");
        assert_eq!(err.user_message(), "boom");
    }

    #[test]
    fn error_chain_skips_duplicates() {
        let err = anyhow::anyhow!("inner").context("outer").context("outer");
        assert_eq!(format_error_chain(&err), "outer: inner");
    }
}
