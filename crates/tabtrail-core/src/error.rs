//! Structured errors that survive a trip across the message bus

use serde::{Deserialize, Serialize};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("[{code}] {message}")]
pub struct Error {
    pub code: ErrorCode,
    pub message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub suggestions: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorCode {
    LocatorUnresolvable,
    ElementNotFound,
    AmbiguousMatch,
    UnreachableContext,
    Timeout,
    AlreadyActive,
    ActionFailed,
    InvalidState,
    InvalidSequence,
    WorkflowNotFound,
    Storage,
    UnsupportedVersion,
    InvalidInput,
    Unknown,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LocatorUnresolvable => "locator-unresolvable",
            Self::ElementNotFound => "element-not-found",
            Self::AmbiguousMatch => "ambiguous-match",
            Self::UnreachableContext => "unreachable-context",
            Self::Timeout => "timeout",
            Self::AlreadyActive => "already-active",
            Self::ActionFailed => "action-failed",
            Self::InvalidState => "invalid-state",
            Self::InvalidSequence => "invalid-sequence",
            Self::WorkflowNotFound => "workflow-not-found",
            Self::Storage => "storage",
            Self::UnsupportedVersion => "unsupported-version",
            Self::InvalidInput => "invalid-input",
            Self::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Error {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            suggestions: Vec::new(),
            context: None,
        }
    }

    pub fn with_suggestions(mut self, suggestions: Vec<String>) -> Self {
        self.suggestions = suggestions;
        self
    }

    pub fn with_context(mut self, context: serde_json::Value) -> Self {
        self.context = Some(context);
        self
    }

    pub fn locator_unresolvable(reason: &str) -> Self {
        Self::new(
            ErrorCode::LocatorUnresolvable,
            format!("No usable locator: {}", reason),
        )
    }

    pub fn element_not_found(locator: &str) -> Self {
        Self::new(
            ErrorCode::ElementNotFound,
            format!("No element matching: {}", locator),
        )
    }

    pub fn ambiguous_match(locator: &str, count: usize) -> Self {
        Self::new(
            ErrorCode::AmbiguousMatch,
            format!("Locator '{}' matched {} elements, expected 1", locator, count),
        )
    }

    pub fn unreachable(context: &str, attempts: u32) -> Self {
        Self::new(
            ErrorCode::UnreachableContext,
            format!("Context {} unreachable after {} attempts", context, attempts),
        )
    }

    pub fn timeout(what: &str, timeout_ms: u64) -> Self {
        Self::new(
            ErrorCode::Timeout,
            format!("Timeout after {}ms waiting for: {}", timeout_ms, what),
        )
    }

    pub fn already_active(tab: impl std::fmt::Display, mode: &str) -> Self {
        Self::new(
            ErrorCode::AlreadyActive,
            format!("Tab {} already has an active session ({})", tab, mode),
        )
    }

    pub fn action_failed(action: &str, reason: &str) -> Self {
        Self::new(
            ErrorCode::ActionFailed,
            format!("{} failed: {}", action, reason),
        )
    }

    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidState, message)
    }

    pub fn invalid_sequence(expected: u64, got: u64) -> Self {
        Self::new(
            ErrorCode::InvalidSequence,
            format!("Expected step index {}, got {}", expected, got),
        )
        .with_context(serde_json::json!({ "expected": expected, "got": got }))
    }

    /// Index the receiver wanted, for `invalid-sequence` errors
    pub fn expected_index(&self) -> Option<u64> {
        if self.code != ErrorCode::InvalidSequence {
            return None;
        }
        self.context.as_ref()?.get("expected")?.as_u64()
    }

    pub fn workflow_not_found(id: &str) -> Self {
        Self::new(
            ErrorCode::WorkflowNotFound,
            format!("Workflow not found: {}", id),
        )
    }

    pub fn storage(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Storage, message)
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidInput, message)
    }
}

impl From<anyhow::Error> for Error {
    fn from(e: anyhow::Error) -> Self {
        Self::new(ErrorCode::Unknown, e.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::new(ErrorCode::Storage, e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::new(ErrorCode::Storage, format!("serialization: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_uses_kebab_code() {
        let e = Error::already_active(3, "recording");
        assert_eq!(
            e.to_string(),
            "[already-active] Tab 3 already has an active session (recording)"
        );
    }

    #[test]
    fn serializes_code_as_kebab_case() {
        let e = Error::ambiguous_match("button.primary", 2);
        let json = serde_json::to_value(&e).unwrap();
        assert_eq!(json["code"], "ambiguous-match");
        assert!(json.get("suggestions").is_none());

        let back: Error = serde_json::from_value(json).unwrap();
        assert_eq!(back, e);
    }

    #[test]
    fn sequence_errors_carry_the_expected_index() {
        let e = Error::invalid_sequence(4, 7);
        assert_eq!(e.expected_index(), Some(4));
        let wire: Error = serde_json::from_str(&serde_json::to_string(&e).unwrap()).unwrap();
        assert_eq!(wire.expected_index(), Some(4));
        assert_eq!(Error::invalid_state("x").expected_index(), None);
    }
}
