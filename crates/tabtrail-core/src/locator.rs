//! Locator resolution - find the one node a ranked candidate list points at

use crate::dom::{Document, NodeId, SharedDocument};
use crate::error::{Error, ErrorCode, Result};
use crate::selector::ElementLocator;
use std::time::Duration;

/// A node resolved from a candidate list, and which candidate found it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolved {
    pub node: NodeId,
    pub locator_index: usize,
}

pub struct Locator {
    candidates: Vec<ElementLocator>,
    retries: u32,
    backoff_ms: u64,
}

impl Locator {
    pub fn new(candidates: Vec<ElementLocator>) -> Self {
        Self {
            candidates,
            retries: 0,
            backoff_ms: 100,
        }
    }

    pub fn retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn backoff(mut self, ms: u64) -> Self {
        self.backoff_ms = ms;
        self
    }

    /// Try candidates best-first. A candidate that matches nothing falls
    /// through to the next; one that matches several stops resolution with
    /// `AmbiguousMatch`.
    pub fn find(&self, doc: &Document) -> Result<Resolved> {
        let usable: Vec<(usize, &ElementLocator)> = self
            .candidates
            .iter()
            .enumerate()
            .filter(|(_, l)| l.is_usable())
            .collect();

        if usable.is_empty() {
            return Err(Error::locator_unresolvable(if self.candidates.is_empty() {
                "no candidates recorded"
            } else {
                "no candidate was unique when recorded"
            }));
        }

        for (index, loc) in &usable {
            let matches = loc.strategy.find_all(doc);
            match matches.len() {
                0 => {
                    tracing::debug!(locator = %loc, "no match, trying next candidate");
                }
                1 => {
                    return Ok(Resolved {
                        node: matches[0],
                        locator_index: *index,
                    })
                }
                n => {
                    return Err(Error::ambiguous_match(&loc.to_string(), n)
                        .with_suggestions(vec![
                            "The page now contains several elements this step could mean"
                                .to_string(),
                            "Re-record the step against the current page".to_string(),
                        ])
                        .with_context(serde_json::json!({
                            "locator_index": index,
                            "matches": n,
                        })));
                }
            }
        }

        Err(Error::element_not_found(&self.describe()).with_context(serde_json::json!({
            "tried": usable.len(),
        })))
    }

    pub fn exists(&self, doc: &Document) -> bool {
        self.find(doc).is_ok()
    }

    /// `find`, retried with backoff while nothing matches. The lock is only
    /// held for each attempt, so the page may keep rendering in between.
    pub fn wait(&self, doc: &SharedDocument) -> Result<Resolved> {
        let mut attempt = 0;
        loop {
            let result = self.find(&doc.lock());
            match result {
                Err(e) if e.code == ErrorCode::ElementNotFound && attempt < self.retries => {
                    attempt += 1;
                    tracing::debug!(attempt, retries = self.retries, "element not found, retrying");
                    std::thread::sleep(Duration::from_millis(self.backoff_ms));
                }
                other => return other,
            }
        }
    }

    fn describe(&self) -> String {
        self.candidates
            .first()
            .map(|l| l.to_string())
            .unwrap_or_else(|| "<none>".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dom::Element;
    use crate::selector::{Compound, Strategy};
    use crate::synth::synthesize;

    fn doc_with_button(class: &str) -> (Document, NodeId) {
        let mut doc = Document::new("https://app.test");
        let body = doc.body();
        let b = doc.append(body, Element::new("button").class(class).text("Save")).unwrap();
        (doc, b)
    }

    #[test]
    fn falls_through_zero_matches() {
        let (mut doc, button) = doc_with_button("save");
        let locs = synthesize(&doc, button);
        doc.set_attr(button, "class", "save-v2");

        let resolved = Locator::new(locs).find(&doc).unwrap();
        assert_eq!(resolved.node, button);
        assert!(resolved.locator_index > 0);
    }

    #[test]
    fn ambiguity_is_reported_not_guessed() {
        let (mut doc, button) = doc_with_button("save");
        let locs = synthesize(&doc, button);
        let body = doc.body();
        doc.append(body, Element::new("button").class("save").text("Save")).unwrap();

        let err = Locator::new(locs).find(&doc).unwrap_err();
        assert_eq!(err.code, ErrorCode::AmbiguousMatch);
    }

    #[test]
    fn non_unique_candidates_are_unusable() {
        let (doc, _) = doc_with_button("save");
        let loose = ElementLocator::new(
            Strategy::AttributeSet {
                segments: vec![Compound::tag("button")],
            },
            2,
            80,
        );
        let err = Locator::new(vec![loose]).find(&doc).unwrap_err();
        assert_eq!(err.code, ErrorCode::LocatorUnresolvable);
    }

    #[test]
    fn wait_picks_up_late_render() {
        let (doc, button) = doc_with_button("save");
        let locs = synthesize(&doc, button);
        let snapshot = doc.snapshot();

        let shared = Document::new("https://app.test").into_shared();
        let writer = shared.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(60));
            writer.lock().replace("https://app.test", &snapshot);
        });

        let resolved = Locator::new(locs).retries(20).backoff(20).wait(&shared).unwrap();
        handle.join().unwrap();
        assert_eq!(shared.lock().tag(resolved.node), Some("button"));
    }

    #[test]
    fn wait_gives_up_after_retries() {
        let (doc, button) = doc_with_button("save");
        let locs = synthesize(&doc, button);
        let empty = Document::new("https://app.test").into_shared();

        let err = Locator::new(locs).retries(2).backoff(5).wait(&empty).unwrap_err();
        assert_eq!(err.code, ErrorCode::ElementNotFound);
    }
}
