//! Execution context identifiers

use serde::{Deserialize, Serialize};

/// Browser tab id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TabId(pub u32);

impl std::fmt::Display for TabId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An isolated execution context. Contexts share nothing but the bus.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "context", content = "id", rename_all = "kebab-case")]
pub enum ContextId {
    /// Background coordinator
    Background,
    /// Script injected into a tab
    Page(TabId),
    /// UI surface: popup, new-tab page, params panel
    Panel(String),
}

impl ContextId {
    pub fn page(tab: u32) -> Self {
        Self::Page(TabId(tab))
    }

    pub fn panel(name: &str) -> Self {
        Self::Panel(name.to_string())
    }

    pub fn is_panel(&self) -> bool {
        matches!(self, Self::Panel(_))
    }
}

impl std::fmt::Display for ContextId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Background => write!(f, "background"),
            Self::Page(tab) => write!(f, "page:{}", tab),
            Self::Panel(name) => write!(f, "panel:{}", name),
        }
    }
}
