//! Error classification.
//!
//! Backends report failures as free text (exception messages, stderr,
//! embedded `error` fields). Everything funnels through [`classify`], which
//! walks one ordered pattern table; the first match wins. New backends extend
//! the table, not the orchestrator.

/// Failure category surfaced in `error` debug info
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    AuthenticationFailed,
    InvalidApiKey,
    RateLimitExceeded,
    Overloaded,
    SessionNotFound,
    ExecutableNotFound,
    ProcessCrashed,
    NetworkError,
    Unknown,
}

/// Lowercase substring → category, checked in order. Backend verdicts come
/// before process and transport symptoms.
const PATTERNS: &[(&str, ErrorCategory)] = &[
    ("authentication_failed", ErrorCategory::AuthenticationFailed),
    ("authentication failed", ErrorCategory::AuthenticationFailed),
    ("not logged in", ErrorCategory::AuthenticationFailed),
    ("please run /login", ErrorCategory::AuthenticationFailed),
    ("oauth token has expired", ErrorCategory::AuthenticationFailed),
    ("invalid_api_key", ErrorCategory::InvalidApiKey),
    ("invalid api key", ErrorCategory::InvalidApiKey),
    ("invalid x-api-key", ErrorCategory::InvalidApiKey),
    ("rate_limit", ErrorCategory::RateLimitExceeded),
    ("rate limit", ErrorCategory::RateLimitExceeded),
    ("too many requests", ErrorCategory::RateLimitExceeded),
    ("overloaded", ErrorCategory::Overloaded),
    ("no conversation found", ErrorCategory::SessionNotFound),
    ("enoent", ErrorCategory::ExecutableNotFound),
    ("no such file or directory", ErrorCategory::ExecutableNotFound),
    ("binary not found", ErrorCategory::ExecutableNotFound),
    ("exited with code", ErrorCategory::ProcessCrashed),
    ("process exited", ErrorCategory::ProcessCrashed),
    ("econnrefused", ErrorCategory::NetworkError),
    ("econnreset", ErrorCategory::NetworkError),
    ("etimedout", ErrorCategory::NetworkError),
    ("enotfound", ErrorCategory::NetworkError),
    ("fetch failed", ErrorCategory::NetworkError),
    ("connection refused", ErrorCategory::NetworkError),
    ("error sending request", ErrorCategory::NetworkError),
    ("network", ErrorCategory::NetworkError),
];

impl ErrorCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCategory::AuthenticationFailed => "authentication_failed",
            ErrorCategory::InvalidApiKey => "invalid_api_key",
            ErrorCategory::RateLimitExceeded => "rate_limit_exceeded",
            ErrorCategory::Overloaded => "overloaded",
            ErrorCategory::SessionNotFound => "session_not_found",
            ErrorCategory::ExecutableNotFound => "executable_not_found",
            ErrorCategory::ProcessCrashed => "process_crashed",
            ErrorCategory::NetworkError => "network_error",
            ErrorCategory::Unknown => "unknown",
        }
    }

    /// Categories that should send the user through re-authentication.
    pub fn is_auth(self) -> bool {
        self == ErrorCategory::AuthenticationFailed
    }

    /// User-facing text. Unknown failures keep the backend's own wording.
    pub fn describe(self, detail: &str) -> String {
        let summary = match self {
            ErrorCategory::AuthenticationFailed => {
                "Authentication failed. Please sign in again."
            }
            ErrorCategory::InvalidApiKey => "Invalid API key. Check your credentials.",
            ErrorCategory::RateLimitExceeded => {
                "Rate limit exceeded. Please wait a moment and try again."
            }
            ErrorCategory::Overloaded => "The model is overloaded. Please try again shortly.",
            ErrorCategory::SessionNotFound => {
                "The previous session could not be resumed. Send the message again to start a new session."
            }
            ErrorCategory::ExecutableNotFound => {
                "Claude Code executable not found. Install Claude Code or configure its path."
            }
            ErrorCategory::ProcessCrashed => "Claude Code process crashed.",
            ErrorCategory::NetworkError => "Network error while contacting the agent backend.",
            ErrorCategory::Unknown => return detail.trim().to_string(),
        };
        summary.to_string()
    }
}

/// Index of the first table entry matching `text`.
fn rank(text: &str) -> Option<usize> {
    let lowered = text.to_ascii_lowercase();
    PATTERNS
        .iter()
        .position(|(pattern, _)| lowered.contains(pattern))
}

/// Classify a single failure text.
pub fn classify(text: &str) -> ErrorCategory {
    rank(text)
        .map(|index| PATTERNS[index].1)
        .unwrap_or(ErrorCategory::Unknown)
}

/// Classify an exception message together with captured stderr. Whichever
/// text matches earlier in the table decides, so an auth failure printed to
/// stderr outranks the "process exited" message it caused.
pub fn classify_with_stderr(message: &str, stderr: Option<&str>) -> ErrorCategory {
    [Some(rank(message)), stderr.map(rank)]
        .into_iter()
        .flatten()
        .flatten()
        .min()
        .map(|index| PATTERNS[index].1)
        .unwrap_or(ErrorCategory::Unknown)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_embedded_sdk_error_codes() {
        assert_eq!(
            classify("authentication_failed"),
            ErrorCategory::AuthenticationFailed
        );
        assert_eq!(
            classify("Invalid API key · Please run /login"),
            ErrorCategory::AuthenticationFailed
        );
        assert_eq!(classify("invalid_api_key"), ErrorCategory::InvalidApiKey);
        assert_eq!(
            classify("API Error: rate_limit_error"),
            ErrorCategory::RateLimitExceeded
        );
        assert_eq!(
            classify("529 {\"type\":\"overloaded_error\"}"),
            ErrorCategory::Overloaded
        );
    }

    #[test]
    fn classifies_process_and_transport_failures() {
        assert_eq!(
            classify("spawn claude ENOENT"),
            ErrorCategory::ExecutableNotFound
        );
        assert_eq!(
            classify("Claude Code process exited with code 1"),
            ErrorCategory::ProcessCrashed
        );
        assert_eq!(
            classify("connect ECONNREFUSED 127.0.0.1:4096"),
            ErrorCategory::NetworkError
        );
    }

    #[test]
    fn backend_verdict_in_stderr_outranks_crash_message() {
        assert_eq!(
            classify_with_stderr("something odd", Some("Error: not logged in")),
            ErrorCategory::AuthenticationFailed
        );
        assert_eq!(
            classify_with_stderr(
                "Claude Code process exited with code 1",
                Some("Invalid API key · Please run /login")
            ),
            ErrorCategory::AuthenticationFailed
        );
        assert_eq!(
            classify_with_stderr("process exited with code 2", Some("rate limit")),
            ErrorCategory::RateLimitExceeded
        );
        assert_eq!(
            classify_with_stderr("rate_limit_error", Some("connect ECONNREFUSED")),
            ErrorCategory::RateLimitExceeded
        );
        assert_eq!(
            classify_with_stderr("process exited with code 2", Some("segfault")),
            ErrorCategory::ProcessCrashed
        );
        assert_eq!(classify_with_stderr("???", None), ErrorCategory::Unknown);
    }

    #[test]
    fn only_authentication_is_auth() {
        assert!(ErrorCategory::AuthenticationFailed.is_auth());
        assert!(!ErrorCategory::InvalidApiKey.is_auth());
        assert!(!ErrorCategory::RateLimitExceeded.is_auth());
    }

    #[test]
    fn unknown_keeps_backend_wording() {
        assert_eq!(ErrorCategory::Unknown.describe("  disk full "), "disk full");
        assert!(ErrorCategory::Overloaded.describe("x").contains("overloaded"));
    }
}
