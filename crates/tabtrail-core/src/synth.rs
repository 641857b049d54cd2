//! Locator synthesis
//!
//! Strategies run in a fixed priority order: stable attribute, attribute set,
//! text anchor, structural path. A candidate is kept only when it matches
//! exactly one node; attribute sets and text anchors that match more are
//! retried with the next ancestor prepended as scope until unique or the depth
//! ceiling is hit. The structural path always resolves to the node itself, so
//! an attached node never yields an empty list.

use crate::config::SynthConfig;
use crate::dom::{is_form_control, Document, NodeId};
use crate::selector::{Compound, ElementLocator, PathSegment, Strategy};

pub const ID_SCORE: u32 = 100;
pub const ATTRIBUTE_SET_SCORE: u32 = 80;
pub const TEXT_ANCHOR_SCORE: u32 = 60;
pub const STRUCTURAL_PATH_SCORE: u32 = 10;
const SCOPE_PENALTY: u32 = 5;

pub struct Synthesizer {
    config: SynthConfig,
}

impl Synthesizer {
    pub fn new(config: SynthConfig) -> Self {
        Self { config }
    }

    /// Ranked locators for `node`, best first. Empty only when the node is
    /// detached.
    pub fn synthesize(&self, doc: &Document, node: NodeId) -> Vec<ElementLocator> {
        if !doc.is_attached(node) {
            return Vec::new();
        }

        let mut out = Vec::new();
        if let Some(loc) = self.stable_attribute(doc, node) {
            out.push(loc);
        }
        if let Some(loc) = self.attribute_set(doc, node) {
            out.push(loc);
        }
        if let Some(loc) = self.text_anchor(doc, node) {
            out.push(loc);
        }
        out.push(structural_path(doc, node));

        out.sort_by(|a, b| b.specificity.cmp(&a.specificity));
        tracing::debug!(
            node = %node,
            primary = %out[0],
            candidates = out.len(),
            "synthesized locators"
        );
        out
    }

    fn stable_attribute(&self, doc: &Document, node: NodeId) -> Option<ElementLocator> {
        let tag = doc.tag(node)?;
        let mut attrs: Vec<&str> =
            self.config.stable_attributes.iter().map(String::as_str).collect();
        if is_form_control(tag) {
            attrs.push("name");
        }

        attrs.into_iter().find_map(|attr| {
            let value = doc.attr(node, attr)?;
            if value.is_empty() || looks_generated(value) {
                return None;
            }
            let strategy = Strategy::Id {
                attr: attr.to_string(),
                value: value.to_string(),
            };
            (strategy.count(doc) == 1).then(|| ElementLocator::new(strategy, 1, ID_SCORE))
        })
    }

    fn attribute_set(&self, doc: &Document, node: NodeId) -> Option<ElementLocator> {
        let target = self.compound(doc, node, false)?;
        let (strategy, depth) = self.scope_until_unique(doc, node, |scope| Strategy::AttributeSet {
            segments: scope.iter().cloned().chain(std::iter::once(target.clone())).collect(),
        })?;
        Some(ElementLocator::new(
            strategy,
            1,
            ATTRIBUTE_SET_SCORE.saturating_sub(SCOPE_PENALTY * depth as u32),
        ))
    }

    fn text_anchor(&self, doc: &Document, node: NodeId) -> Option<ElementLocator> {
        let has_element_children = !doc.children(node).is_empty();
        let text = doc.text_content(node);
        if has_element_children
            || text.is_empty()
            || text.chars().count() > self.config.max_text_len
        {
            return None;
        }
        let tag = doc.tag(node)?.to_string();
        let (strategy, depth) = self.scope_until_unique(doc, node, |scope| Strategy::TextAnchor {
            scope: scope.to_vec(),
            tag: tag.clone(),
            text: text.clone(),
        })?;
        Some(ElementLocator::new(
            strategy,
            1,
            TEXT_ANCHOR_SCORE.saturating_sub(SCOPE_PENALTY * depth as u32),
        ))
    }

    /// Prepend ancestors one at a time until `build` yields a unique strategy.
    /// Returns the strategy and how many ancestors it needed.
    fn scope_until_unique<F>(
        &self,
        doc: &Document,
        node: NodeId,
        build: F,
    ) -> Option<(Strategy, usize)>
    where
        F: Fn(&[Compound]) -> Strategy,
    {
        let mut scope: Vec<Compound> = Vec::new();
        let mut ancestors = doc
            .ancestors(node)
            .into_iter()
            .filter(|a| *a != doc.root());

        loop {
            let strategy = build(&scope);
            if strategy.count(doc) == 1 {
                return Some((strategy, scope.len()));
            }
            if scope.len() >= self.config.max_ancestor_depth {
                return None;
            }
            let ancestor = ancestors.next()?;
            scope.insert(0, self.compound(doc, ancestor, true)?);
        }
    }

    fn compound(&self, doc: &Document, node: NodeId, with_id: bool) -> Option<Compound> {
        let tag = doc.tag(node)?.to_string();
        let id = if with_id {
            doc.attr(node, "id")
                .filter(|v| !v.is_empty() && !looks_generated(v))
                .map(String::from)
        } else {
            None
        };
        let classes = doc
            .classes(node)
            .into_iter()
            .filter(|c| !looks_generated(c))
            .take(self.config.max_classes)
            .map(String::from)
            .collect();
        let input_type = if tag == "input" {
            doc.attr(node, "type").map(String::from)
        } else {
            None
        };
        Some(Compound {
            tag,
            id,
            classes,
            role: doc.attr(node, "role").map(String::from),
            input_type,
        })
    }
}

impl Default for Synthesizer {
    fn default() -> Self {
        Self::new(SynthConfig::default())
    }
}

/// Synthesize with default settings
pub fn synthesize(doc: &Document, node: NodeId) -> Vec<ElementLocator> {
    Synthesizer::default().synthesize(doc, node)
}

fn structural_path(doc: &Document, node: NodeId) -> ElementLocator {
    let mut chain = doc.ancestors(node);
    chain.reverse();
    chain.push(node);
    let segments = chain
        .into_iter()
        .map(|n| PathSegment {
            tag: doc.tag(n).unwrap_or_default().to_string(),
            nth: doc.nth_of_type(n),
        })
        .collect();
    let strategy = Strategy::StructuralPath { segments };
    let count = strategy.count(doc);
    ElementLocator::new(strategy, count, STRUCTURAL_PATH_SCORE)
}

/// Framework-generated ids and hashed class names change between builds
fn looks_generated(value: &str) -> bool {
    let longest_digit_run = value
        .split(|c: char| !c.is_ascii_digit())
        .map(str::len)
        .max()
        .unwrap_or(0);
    if longest_digit_run >= 4 {
        return true;
    }
    let hexish = value.len() >= 8
        && value.chars().all(|c| c.is_ascii_hexdigit())
        && value.chars().any(|c| c.is_ascii_digit());
    hexish || value.starts_with("css-") || value.starts_with(':')
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dom::Element;
    use crate::selector::LocatorKind;

    fn page() -> Document {
        let mut doc = Document::new("https://app.test/signup");
        let body = doc.body();
        doc.append(
            body,
            Element::new("form")
                .id("signup")
                .child(Element::new("input").id("email").attr("type", "email"))
                .child(Element::new("input").attr("name", "user-9981234").attr("type", "text"))
                .child(Element::new("button").attr("data-testid", "submit").text("Create")),
        ).unwrap();
        for _ in 0..3 {
            doc.append(
                body,
                Element::new("div")
                    .class("row")
                    .child(Element::new("span").class("label").text("Item")),
            ).unwrap();
        }
        doc
    }

    fn assert_first_unique(doc: &Document, node: NodeId) {
        let locs = synthesize(doc, node);
        assert!(!locs.is_empty());
        let found = locs[0].strategy.find_all(doc);
        assert_eq!(found, vec![node], "first locator {} must be unique", locs[0]);
    }

    #[test]
    fn every_attached_node_gets_a_unique_primary() {
        let doc = page();
        for node in doc.descendants() {
            assert_first_unique(&doc, node);
        }
    }

    #[test]
    fn test_id_outranks_everything() {
        let doc = page();
        let button = doc.find_by_attr("data-testid", "submit")[0];
        let locs = synthesize(&doc, button);
        assert_eq!(locs[0].kind(), LocatorKind::Id);
        assert_eq!(locs[0].to_string(), "[data-testid=\"submit\"]");
        assert_eq!(locs.last().unwrap().kind(), LocatorKind::StructuralPath);
        assert!(locs.iter().all(|l| l.is_usable()));
    }

    #[test]
    fn generated_names_are_skipped() {
        let doc = page();
        let input = doc.find_by_attr("name", "user-9981234")[0];
        let locs = synthesize(&doc, input);
        assert!(locs.iter().all(|l| !matches!(
            &l.strategy,
            Strategy::Id { attr, .. } if attr == "name"
        )));
        assert_eq!(locs[0].kind(), LocatorKind::AttributeSet);
    }

    #[test]
    fn duplicates_fall_back_to_structural_path() {
        let doc = page();
        let spans = doc
            .descendants()
            .into_iter()
            .filter(|n| doc.tag(*n) == Some("span"))
            .collect::<Vec<_>>();
        let locs = synthesize(&doc, spans[1]);
        assert_eq!(locs.len(), 1);
        assert_eq!(locs[0].kind(), LocatorKind::StructuralPath);
        assert_eq!(locs[0].specificity, STRUCTURAL_PATH_SCORE);
        assert_eq!(locs[0].strategy.find_all(&doc), vec![spans[1]]);
    }

    #[test]
    fn ancestor_scope_disambiguates() {
        let mut doc = Document::new("https://app.test");
        let body = doc.body();
        doc.append(
            body,
            Element::new("nav").child(Element::new("a").class("link").text("Home")),
        ).unwrap();
        doc.append(
            body,
            Element::new("footer").child(Element::new("a").class("link").text("Home")),
        ).unwrap();
        let links = doc
            .descendants()
            .into_iter()
            .filter(|n| doc.tag(*n) == Some("a"))
            .collect::<Vec<_>>();

        let locs = synthesize(&doc, links[1]);
        assert_eq!(locs[0].to_string(), "footer a.link");
        assert_eq!(locs[0].specificity, ATTRIBUTE_SET_SCORE - SCOPE_PENALTY);
        assert_eq!(locs[1].to_string(), "footer a:text(\"Home\")");
    }

    #[test]
    fn detached_node_yields_nothing() {
        let mut doc = page();
        let form = doc.by_id("signup").unwrap();
        doc.remove(form);
        assert!(synthesize(&doc, form).is_empty());
    }

    #[test]
    fn generated_value_heuristic() {
        assert!(looks_generated("ember12345"));
        assert!(looks_generated("a3f9c0d1e2"));
        assert!(looks_generated("css-1x2y3z"));
        assert!(!looks_generated("submit"));
        assert!(!looks_generated("step-2"));
    }
}
