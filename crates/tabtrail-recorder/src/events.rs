//! Workflow model shared by capture, storage and replay
//!
//! Records serialize to compact JSON lines. A workflow is an ordered list of
//! records whose indices start at 1 and never repeat.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tabtrail_core::{ElementLocator, Error, NodeId, Result};
use url::Url;

/// Current on-disk schema version
pub const WORKFLOW_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ActionKind {
    Click,
    Input,
    Navigate,
    Keypress,
    Wait,
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Click => "click",
            Self::Input => "input",
            Self::Navigate => "navigate",
            Self::Keypress => "keypress",
            Self::Wait => "wait",
        }
    }
}

impl std::fmt::Display for ActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Modifier flags packed into a single byte
/// Bit 0: shift, 1: ctrl, 2: alt, 3: meta
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Modifiers(pub u8);

impl Modifiers {
    pub const SHIFT: u8 = 1 << 0;
    pub const CTRL: u8 = 1 << 1;
    pub const ALT: u8 = 1 << 2;
    pub const META: u8 = 1 << 3;

    pub const NONE: Modifiers = Modifiers(0);

    pub fn new(bits: u8) -> Self {
        Self(bits)
    }

    /// Parse `"ctrl+shift"` style lists; unknown names are ignored
    pub fn parse(s: &str) -> Self {
        let mut m = 0u8;
        for part in s.split('+').map(|p| p.trim().to_ascii_lowercase()) {
            match part.as_str() {
                "shift" => m |= Self::SHIFT,
                "ctrl" | "control" => m |= Self::CTRL,
                "alt" | "option" | "opt" => m |= Self::ALT,
                "meta" | "cmd" | "command" | "super" => m |= Self::META,
                _ => {}
            }
        }
        Self(m)
    }

    pub fn has_shift(&self) -> bool {
        self.0 & Self::SHIFT != 0
    }

    pub fn has_ctrl(&self) -> bool {
        self.0 & Self::CTRL != 0
    }

    pub fn has_alt(&self) -> bool {
        self.0 & Self::ALT != 0
    }

    pub fn has_meta(&self) -> bool {
        self.0 & Self::META != 0
    }

    /// Shift alone only changes the character typed
    pub fn any_modifier(&self) -> bool {
        self.0 & (Self::CTRL | Self::ALT | Self::META) != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

impl std::fmt::Display for Modifiers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = [
            (Self::CTRL, "ctrl"),
            (Self::ALT, "alt"),
            (Self::SHIFT, "shift"),
            (Self::META, "meta"),
        ]
        .iter()
        .filter(|(bit, _)| self.0 & bit != 0)
        .map(|(_, name)| *name)
        .collect();
        f.write_str(&names.join("+"))
    }
}

/// Keys that are recorded as `keypress` even without modifiers
pub fn is_named_key(key: &str) -> bool {
    matches!(
        key,
        "Enter"
            | "Tab"
            | "Escape"
            | "Backspace"
            | "Delete"
            | "ArrowUp"
            | "ArrowDown"
            | "ArrowLeft"
            | "ArrowRight"
            | "Home"
            | "End"
            | "PageUp"
            | "PageDown"
    ) || (key.len() > 1 && key.starts_with('F') && key[1..].parse::<u8>().is_ok())
}

/// What an action needs beyond its target
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ActionPayload {
    Text {
        value: String,
    },
    Key {
        key: String,
        #[serde(default, skip_serializing_if = "Modifiers::is_empty")]
        modifiers: Modifiers,
    },
    Url {
        url: String,
    },
    Wait {
        ms: u64,
    },
}

/// One recorded user action
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRecord {
    /// Position in the workflow, starting at 1
    pub index: u64,
    pub action: ActionKind,
    /// Candidate locators, best first. Empty for navigate and wait.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub locators: Vec<ElementLocator>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<ActionPayload>,
    pub captured_at: DateTime<Utc>,
}

impl ActionRecord {
    fn new(
        index: u64,
        action: ActionKind,
        locators: Vec<ElementLocator>,
        payload: Option<ActionPayload>,
    ) -> Self {
        Self {
            index,
            action,
            locators,
            payload,
            captured_at: Utc::now(),
        }
    }

    pub fn click(index: u64, locators: Vec<ElementLocator>) -> Self {
        Self::new(index, ActionKind::Click, locators, None)
    }

    pub fn input(index: u64, locators: Vec<ElementLocator>, value: impl Into<String>) -> Self {
        Self::new(
            index,
            ActionKind::Input,
            locators,
            Some(ActionPayload::Text { value: value.into() }),
        )
    }

    pub fn keypress(
        index: u64,
        locators: Vec<ElementLocator>,
        key: impl Into<String>,
        modifiers: Modifiers,
    ) -> Self {
        Self::new(
            index,
            ActionKind::Keypress,
            locators,
            Some(ActionPayload::Key {
                key: key.into(),
                modifiers,
            }),
        )
    }

    pub fn navigate(index: u64, url: impl Into<String>) -> Self {
        Self::new(
            index,
            ActionKind::Navigate,
            Vec::new(),
            Some(ActionPayload::Url { url: url.into() }),
        )
    }

    pub fn wait(index: u64, ms: u64) -> Self {
        Self::new(index, ActionKind::Wait, Vec::new(), Some(ActionPayload::Wait { ms }))
    }

    pub fn text(&self) -> Option<&str> {
        match &self.payload {
            Some(ActionPayload::Text { value }) => Some(value),
            _ => None,
        }
    }

    pub fn url(&self) -> Option<&str> {
        match &self.payload {
            Some(ActionPayload::Url { url }) => Some(url),
            _ => None,
        }
    }

    /// Short human description: `input [name="email"] = "a@b.com"`
    pub fn describe(&self) -> String {
        let target = self
            .locators
            .first()
            .map(|l| format!(" {}", l))
            .unwrap_or_default();
        let detail = match &self.payload {
            Some(ActionPayload::Text { value }) => format!(" = {:?}", value),
            Some(ActionPayload::Key { key, modifiers }) if modifiers.is_empty() => {
                format!(" {}", key)
            }
            Some(ActionPayload::Key { key, modifiers }) => format!(" {}+{}", modifiers, key),
            Some(ActionPayload::Url { url }) => format!(" {}", url),
            Some(ActionPayload::Wait { ms }) => format!(" {}ms", ms),
            None => String::new(),
        };
        format!("{}{}{}", self.action, target, detail)
    }
}

/// A recorded workflow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
    pub id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
    /// Site the workflow was recorded on, `scheme://host`
    pub origin: String,
    pub version: u32,
    pub steps: Vec<ActionRecord>,
}

impl Workflow {
    pub fn new(name: impl Into<String>, origin: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            created_at: Utc::now(),
            origin: origin.into(),
            version: WORKFLOW_VERSION,
            steps: Vec::new(),
        }
    }

    /// Index the next appended record must carry
    pub fn next_index(&self) -> u64 {
        self.steps.last().map(|s| s.index + 1).unwrap_or(1)
    }

    /// Append a record, enforcing gap-free increasing indices
    pub fn push(&mut self, record: ActionRecord) -> Result<()> {
        let expected = self.next_index();
        if record.index != expected {
            return Err(Error::invalid_sequence(expected, record.index));
        }
        self.steps.push(record);
        Ok(())
    }

    pub fn step(&self, index: u64) -> Option<&ActionRecord> {
        self.steps.iter().find(|s| s.index == index)
    }
}

/// Serialized origin of a URL (`scheme://host[:port]`, default port dropped).
/// URLs without a tuple origin, such as `about:blank`, are kept as given.
pub fn origin_of(url: &str) -> String {
    match Url::parse(url) {
        Ok(parsed) if parsed.origin().is_tuple() => parsed.origin().ascii_serialization(),
        _ => url.to_string(),
    }
}

/// Raw interaction observed in a page, before it becomes an [`ActionRecord`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum DomEvent {
    Click {
        target: NodeId,
    },
    /// Value of a field after a keystroke, paste or IME commit
    Input {
        target: NodeId,
        value: String,
    },
    Change {
        target: NodeId,
        value: String,
    },
    Blur {
        target: NodeId,
    },
    Key {
        target: NodeId,
        key: String,
        #[serde(default)]
        modifiers: Modifiers,
    },
    Navigate {
        url: String,
    },
}

impl DomEvent {
    pub fn target(&self) -> Option<NodeId> {
        match self {
            Self::Click { target }
            | Self::Input { target, .. }
            | Self::Change { target, .. }
            | Self::Blur { target }
            | Self::Key { target, .. } => Some(*target),
            Self::Navigate { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_rejects_gaps_and_repeats() {
        let mut wf = Workflow::new("login", "https://app.test");
        assert_eq!(wf.next_index(), 1);
        wf.push(ActionRecord::navigate(1, "https://app.test/login")).unwrap();
        wf.push(ActionRecord::wait(2, 50)).unwrap();

        let err = wf.push(ActionRecord::wait(2, 50)).unwrap_err();
        assert_eq!(err.code, tabtrail_core::ErrorCode::InvalidSequence);
        let err = wf.push(ActionRecord::wait(4, 50)).unwrap_err();
        assert_eq!(err.code, tabtrail_core::ErrorCode::InvalidSequence);
        assert_eq!(wf.steps.len(), 2);
        assert_eq!(wf.next_index(), 3);
    }

    #[test]
    fn record_json_is_compact() {
        let rec = ActionRecord::keypress(3, vec![], "Enter", Modifiers::NONE);
        let json = serde_json::to_value(&rec).unwrap();
        assert_eq!(json["action"], "keypress");
        assert_eq!(json["payload"]["type"], "key");
        assert!(json.get("locators").is_none());
        assert!(json["payload"].get("modifiers").is_none());
    }

    #[test]
    fn modifiers_parse_and_print() {
        let m = Modifiers::parse("Shift+cmd");
        assert!(m.has_shift() && m.has_meta());
        assert!(m.any_modifier());
        assert!(!Modifiers::new(Modifiers::SHIFT).any_modifier());
        assert_eq!(m.to_string(), "shift+meta");
    }

    #[test]
    fn named_keys() {
        assert!(is_named_key("Enter"));
        assert!(is_named_key("F5"));
        assert!(!is_named_key("a"));
        assert!(!is_named_key("Fx"));
    }

    #[test]
    fn origin_strips_path() {
        assert_eq!(origin_of("https://app.test:8443/a/b?q=1"), "https://app.test:8443");
        assert_eq!(origin_of("https://app.test"), "https://app.test");
        assert_eq!(origin_of("about:blank"), "about:blank");
    }

    #[test]
    fn origin_drops_credentials_and_default_port() {
        assert_eq!(origin_of("https://user:pw@App.test:443/x"), "https://app.test");
        assert_eq!(origin_of("HTTP://app.test:80/"), "http://app.test");
        assert_eq!(origin_of("not a url"), "not a url");
    }

    #[test]
    fn describe_reads_like_a_step() {
        let rec = ActionRecord::keypress(1, vec![], "s", Modifiers::parse("ctrl"));
        assert_eq!(rec.describe(), "keypress ctrl+s");
        assert_eq!(ActionRecord::wait(2, 250).describe(), "wait 250ms");
    }
}
