//! Structured tool-error taxonomy. Tools never get to leak a raw exception
//! string to the LLM — every failure is classified into one of the kinds
//! below and serialized with a human hint so the model can decide retry
//! vs. alternative-tool vs. give-up.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    Transient,
    Permanent,
    Permission,
    Timeout,
    Validation,
    ResourceNotFound,
    RateLimit,
    Dependency,
}

impl ErrorKind {
    /// Human-readable hint bundled into the wire payload so the LLM has a
    /// concrete next action rather than just a category name.
    pub fn hint(&self) -> &'static str {
        match self {
            ErrorKind::Transient => "a transient network error occurred; you may retry",
            ErrorKind::Permanent => "this failure is not retryable; try a different tool or approach",
            ErrorKind::Permission => "access was denied; report this to the user and stop this path",
            ErrorKind::Timeout => "the call timed out; you may retry, possibly with a larger timeout",
            ErrorKind::Validation => "the arguments were invalid; fix them before retrying",
            ErrorKind::ResourceNotFound => "the referenced resource does not exist; confirm the path and retry",
            ErrorKind::RateLimit => "rate limited; wait at least 5 seconds before retrying",
            ErrorKind::Dependency => "a required dependency is missing; install it, then retry",
        }
    }
}

/// A typed tool-execution error, either raised directly by a handler or
/// produced by [`classify_error`] from a generic failure message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolError {
    pub error_type: ErrorKind,
    pub tool_name: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_suggestion: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alternative_tools: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ToolError {
    pub fn new(tool_name: impl Into<String>, error_type: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            error_type,
            tool_name: tool_name.into(),
            message: message.into(),
            retry_suggestion: None,
            alternative_tools: None,
            details: None,
        }
    }

    pub fn with_retry_suggestion(mut self, s: impl Into<String>) -> Self {
        self.retry_suggestion = Some(s.into());
        self
    }

    pub fn with_alternatives(mut self, alts: Vec<String>) -> Self {
        self.alternative_tools = Some(alts);
        self
    }

    /// Wire shape sent to the LLM as the `tool_result` content: the message
    /// plus the error-type hint, so both the literal failure and the
    /// category-level guidance are visible in one JSON blob.
    pub fn to_wire_json(&self) -> serde_json::Value {
        let mut obj = serde_json::json!({
            "error": true,
            "error_type": self.error_type,
            "message": self.message,
            "tool_name": self.tool_name,
            "hint": self.error_type.hint(),
        });
        if let Some(r) = &self.retry_suggestion {
            obj["retry_suggestion"] = serde_json::json!(r);
        }
        if let Some(a) = &self.alternative_tools {
            obj["alternative_tools"] = serde_json::json!(a);
        }
        if let Some(d) = &self.details {
            obj["details"] = d.clone();
        }
        obj
    }
}

/// Fold a generic failure message into a [`ToolError`] by matching known
/// substrings and exception-class names. Order matters: more specific
/// categories (rate limit, dependency) are checked before the generic
/// transient/permanent fallbacks.
pub fn classify_error(tool_name: &str, exception_class: Option<&str>, message: &str) -> ToolError {
    let lower = message.to_lowercase();
    let class = exception_class.unwrap_or("");

    let kind = if class == "TimeoutError" {
        ErrorKind::Timeout
    } else if class == "FileNotFoundError" || lower.contains("no such file") || lower.contains("not found") {
        ErrorKind::ResourceNotFound
    } else if class == "PermissionError" {
        ErrorKind::Permission
    } else if class == "ValueError" {
        ErrorKind::Validation
    } else if lower.contains("rate limit") || lower.contains("too many requests") || lower.contains("429") {
        ErrorKind::RateLimit
    } else if lower.contains("command not found") || lower.contains("not recognized") {
        ErrorKind::Dependency
    } else if class == "ConnectionError" || lower.contains("network") || lower.contains("refused") || lower.contains("dns") {
        ErrorKind::Transient
    } else {
        ErrorKind::Permanent
    };

    ToolError::new(tool_name, kind, message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_known_categories() {
        assert_eq!(classify_error("t", Some("TimeoutError"), "deadline").error_type, ErrorKind::Timeout);
        assert_eq!(classify_error("t", None, "connection refused").error_type, ErrorKind::Transient);
        assert_eq!(classify_error("t", None, "HTTP 429 too many requests").error_type, ErrorKind::RateLimit);
        assert_eq!(classify_error("t", None, "bash: foo: command not found").error_type, ErrorKind::Dependency);
        assert_eq!(classify_error("t", Some("PermissionError"), "denied").error_type, ErrorKind::Permission);
        assert_eq!(classify_error("t", None, "no such file or directory").error_type, ErrorKind::ResourceNotFound);
        assert_eq!(classify_error("t", None, "totally unexpected").error_type, ErrorKind::Permanent);
    }

    #[test]
    fn wire_json_includes_hint() {
        let err = ToolError::new("browser_get_content", ErrorKind::Timeout, "deadline exceeded");
        let wire = err.to_wire_json();
        assert_eq!(wire["error"], true);
        assert_eq!(wire["error_type"], "TIMEOUT");
        assert!(wire["hint"].as_str().unwrap().contains("retry"));
    }
}
