//! Element locators
//!
//! A locator is one way of finding a node again. Strategies form a closed set
//! and print in a CSS-like syntax:
//!
//!   [data-testid="submit"]                 - stable identifying attribute
//!   form#login input.field[type=email]     - attribute set, ancestor scoped
//!   nav a:text("Pricing")                  - text anchor
//!   html:nth-of-type(1) > body:nth-of-type(1) > div:nth-of-type(2)
//!                                          - structural path

use crate::dom::{Document, NodeId};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LocatorKind {
    Id,
    AttributeSet,
    TextAnchor,
    StructuralPath,
}

/// Tag plus the attributes that describe one element
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Compound {
    pub tag: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub classes: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "type")]
    pub input_type: Option<String>,
}

impl Compound {
    pub fn tag(tag: &str) -> Self {
        Self {
            tag: tag.to_string(),
            id: None,
            classes: Vec::new(),
            role: None,
            input_type: None,
        }
    }

    pub fn matches(&self, doc: &Document, node: NodeId) -> bool {
        if doc.tag(node) != Some(self.tag.as_str()) {
            return false;
        }
        if let Some(id) = &self.id {
            if doc.attr(node, "id") != Some(id.as_str()) {
                return false;
            }
        }
        if let Some(role) = &self.role {
            if doc.attr(node, "role") != Some(role.as_str()) {
                return false;
            }
        }
        if let Some(t) = &self.input_type {
            if doc.attr(node, "type") != Some(t.as_str()) {
                return false;
            }
        }
        let classes = doc.classes(node);
        self.classes.iter().all(|c| classes.contains(&c.as_str()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathSegment {
    pub tag: String,
    /// 1-based index among same-tag siblings
    pub nth: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum Strategy {
    Id {
        attr: String,
        value: String,
    },
    AttributeSet {
        /// Outermost scope first; the last segment describes the target
        segments: Vec<Compound>,
    },
    TextAnchor {
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        scope: Vec<Compound>,
        tag: String,
        text: String,
    },
    StructuralPath {
        segments: Vec<PathSegment>,
    },
}

impl Strategy {
    pub fn kind(&self) -> LocatorKind {
        match self {
            Self::Id { .. } => LocatorKind::Id,
            Self::AttributeSet { .. } => LocatorKind::AttributeSet,
            Self::TextAnchor { .. } => LocatorKind::TextAnchor,
            Self::StructuralPath { .. } => LocatorKind::StructuralPath,
        }
    }

    /// Every attached node this strategy currently matches, in document order
    pub fn find_all(&self, doc: &Document) -> Vec<NodeId> {
        match self {
            Self::Id { attr, value } => doc.find_by_attr(attr, value),
            Self::AttributeSet { segments } => match segments.split_last() {
                Some((target, scope)) => doc
                    .descendants()
                    .into_iter()
                    .filter(|n| target.matches(doc, *n) && in_scope(doc, *n, scope))
                    .collect(),
                None => Vec::new(),
            },
            Self::TextAnchor { scope, tag, text } => doc
                .descendants()
                .into_iter()
                .filter(|n| {
                    doc.tag(*n) == Some(tag.as_str())
                        && doc.text_content(*n) == *text
                        && in_scope(doc, *n, scope)
                })
                .collect(),
            Self::StructuralPath { segments } => walk_path(doc, segments).into_iter().collect(),
        }
    }

    pub fn count(&self, doc: &Document) -> usize {
        self.find_all(doc).len()
    }
}

/// Descendant-combinator check: each scope compound must match some ancestor,
/// innermost compound nearest to the node.
fn in_scope(doc: &Document, node: NodeId, scope: &[Compound]) -> bool {
    let mut needed = scope.len();
    for ancestor in doc.ancestors(node) {
        if needed == 0 {
            break;
        }
        if scope[needed - 1].matches(doc, ancestor) {
            needed -= 1;
        }
    }
    needed == 0
}

fn walk_path(doc: &Document, segments: &[PathSegment]) -> Option<NodeId> {
    let (first, rest) = segments.split_first()?;
    let root = doc.root();
    if doc.tag(root) != Some(first.tag.as_str()) || first.nth != 1 {
        return None;
    }
    let mut cur = root;
    for seg in rest {
        cur = doc
            .children(cur)
            .iter()
            .copied()
            .filter(|c| doc.tag(*c) == Some(seg.tag.as_str()))
            .nth(seg.nth.checked_sub(1)?)?;
    }
    Some(cur)
}

/// One ranked locator candidate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElementLocator {
    #[serde(flatten)]
    pub strategy: Strategy,
    /// Nodes matched when the locator was synthesized
    pub match_count: usize,
    /// Ranking score, higher is more robust
    pub specificity: u32,
}

impl ElementLocator {
    pub fn new(strategy: Strategy, match_count: usize, specificity: u32) -> Self {
        Self {
            strategy,
            match_count,
            specificity,
        }
    }

    pub fn kind(&self) -> LocatorKind {
        self.strategy.kind()
    }

    /// Only locators that were unique at synthesis are trusted on replay
    pub fn is_usable(&self) -> bool {
        self.match_count == 1
    }
}

impl std::fmt::Display for ElementLocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.strategy.fmt(f)
    }
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Id { attr, value } if attr == "id" => write!(f, "#{}", value),
            Self::Id { attr, value } => write!(f, "[{}=\"{}\"]", attr, value),
            Self::AttributeSet { segments } => {
                let parts: Vec<String> = segments.iter().map(|s| s.to_string()).collect();
                write!(f, "{}", parts.join(" "))
            }
            Self::TextAnchor { scope, tag, text } => {
                for s in scope {
                    write!(f, "{} ", s)?;
                }
                write!(f, "{}:text({:?})", tag, text)
            }
            Self::StructuralPath { segments } => {
                let parts: Vec<String> = segments
                    .iter()
                    .map(|s| format!("{}:nth-of-type({})", s.tag, s.nth))
                    .collect();
                write!(f, "{}", parts.join(" > "))
            }
        }
    }
}

impl std::fmt::Display for Compound {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.tag)?;
        if let Some(id) = &self.id {
            write!(f, "#{}", id)?;
        }
        for c in &self.classes {
            write!(f, ".{}", c)?;
        }
        if let Some(role) = &self.role {
            write!(f, "[role={}]", role)?;
        }
        if let Some(t) = &self.input_type {
            write!(f, "[type={}]", t)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dom::Element;

    fn cards() -> Document {
        let mut doc = Document::new("https://shop.test");
        let body = doc.body();
        for name in ["Basic", "Pro"] {
            doc.append(
                body,
                Element::new("div").class("card").child(
                    Element::new("button")
                        .class("buy")
                        .attr("data-plan", name)
                        .text(&format!("Buy {}", name)),
                ),
            ).unwrap();
        }
        doc
    }

    #[test]
    fn attribute_set_counts_every_match() {
        let doc = cards();
        let s = Strategy::AttributeSet {
            segments: vec![Compound {
                classes: vec!["buy".into()],
                ..Compound::tag("button")
            }],
        };
        assert_eq!(s.count(&doc), 2);
        assert_eq!(s.to_string(), "button.buy");
    }

    #[test]
    fn scope_requires_ancestor_order() {
        let doc = cards();
        let scoped = Strategy::AttributeSet {
            segments: vec![
                Compound::tag("body"),
                Compound {
                    classes: vec!["card".into()],
                    ..Compound::tag("div")
                },
                Compound::tag("button"),
            ],
        };
        assert_eq!(scoped.count(&doc), 2);

        let inverted = Strategy::AttributeSet {
            segments: vec![
                Compound {
                    classes: vec!["card".into()],
                    ..Compound::tag("div")
                },
                Compound::tag("body"),
                Compound::tag("button"),
            ],
        };
        assert_eq!(inverted.count(&doc), 0);
    }

    #[test]
    fn structural_path_resolves_at_most_one() {
        let doc = cards();
        let path = Strategy::StructuralPath {
            segments: vec![
                PathSegment { tag: "html".into(), nth: 1 },
                PathSegment { tag: "body".into(), nth: 1 },
                PathSegment { tag: "div".into(), nth: 2 },
                PathSegment { tag: "button".into(), nth: 1 },
            ],
        };
        let found = path.find_all(&doc);
        assert_eq!(found.len(), 1);
        assert_eq!(doc.attr(found[0], "data-plan"), Some("Pro"));

        let missing = Strategy::StructuralPath {
            segments: vec![
                PathSegment { tag: "html".into(), nth: 1 },
                PathSegment { tag: "body".into(), nth: 1 },
                PathSegment { tag: "div".into(), nth: 3 },
            ],
        };
        assert!(missing.find_all(&doc).is_empty());
    }

    #[test]
    fn text_anchor_matches_collapsed_text() {
        let doc = cards();
        let s = Strategy::TextAnchor {
            scope: vec![],
            tag: "button".into(),
            text: "Buy Pro".into(),
        };
        assert_eq!(s.count(&doc), 1);
        assert_eq!(s.to_string(), "button:text(\"Buy Pro\")");
    }

    #[test]
    fn locator_serializes_kind_tag() {
        let loc = ElementLocator::new(
            Strategy::Id {
                attr: "data-testid".into(),
                value: "submit".into(),
            },
            1,
            100,
        );
        let json = serde_json::to_value(&loc).unwrap();
        assert_eq!(json["kind"], "id");
        assert_eq!(json["value"], "submit");
        let back: ElementLocator = serde_json::from_value(json).unwrap();
        assert_eq!(back, loc);
        assert_eq!(loc.to_string(), "[data-testid=\"submit\"]");
    }
}
