//! Action capture - turns page events into workflow records
//!
//! The engine is a plain state machine owned by the page context. It never
//! touches the page: it reads the document to describe targets and hands back
//! the records the page should send to the coordinator, already stamped with
//! consecutive indices.

use crate::events::{is_named_key, ActionRecord, DomEvent};
use std::time::Instant;
use tabtrail_core::config::{CaptureConfig, SynthConfig};
use tabtrail_core::{Document, ElementLocator, NodeId, Synthesizer};

/// Coalesces successive input events on one field
struct InputBuffer {
    target: Option<NodeId>,
    locators: Vec<ElementLocator>,
    value: String,
    last_time: Option<Instant>,
    debounce_ms: u64,
}

impl InputBuffer {
    fn new(debounce_ms: u64) -> Self {
        Self {
            target: None,
            locators: Vec::new(),
            value: String::new(),
            last_time: None,
            debounce_ms,
        }
    }

    fn push(
        &mut self,
        target: NodeId,
        locators: impl FnOnce() -> Vec<ElementLocator>,
        value: String,
    ) {
        let now = Instant::now();
        if self.target != Some(target) {
            self.target = Some(target);
            self.locators = locators();
        }
        self.value = value;
        self.last_time = Some(now);
    }

    fn holds(&self, target: NodeId) -> bool {
        self.target == Some(target)
    }

    fn take(&mut self) -> Option<(Vec<ElementLocator>, String)> {
        self.target.take()?;
        self.last_time = None;
        Some((std::mem::take(&mut self.locators), std::mem::take(&mut self.value)))
    }

    fn should_flush(&self) -> bool {
        if let Some(last) = self.last_time {
            last.elapsed().as_millis() as u64 >= self.debounce_ms
        } else {
            false
        }
    }

    fn clear(&mut self) {
        self.take();
    }
}

struct Capture {
    workflow_id: String,
    next_index: u64,
}

pub struct CaptureEngine {
    synth: Synthesizer,
    input: InputBuffer,
    capture: Option<Capture>,
}

impl CaptureEngine {
    pub fn new(capture: &CaptureConfig, synth: SynthConfig) -> Self {
        Self {
            synth: Synthesizer::new(synth),
            input: InputBuffer::new(capture.input_debounce_ms),
            capture: None,
        }
    }

    /// Start (or resume) capturing; the first record gets `next_index`
    pub fn begin(&mut self, workflow_id: impl Into<String>, next_index: u64) {
        let workflow_id = workflow_id.into();
        tracing::info!(workflow = %workflow_id, next_index, "capture started");
        self.input.clear();
        self.capture = Some(Capture {
            workflow_id,
            next_index,
        });
    }

    /// Stop capturing, returning the flushed input buffer if any
    pub fn end(&mut self) -> Vec<ActionRecord> {
        let mut out = Vec::new();
        self.flush_input(&mut out);
        if let Some(c) = self.capture.take() {
            tracing::info!(workflow = %c.workflow_id, next_index = c.next_index, "capture ended");
        }
        out
    }

    pub fn is_capturing(&self) -> bool {
        self.capture.is_some()
    }

    pub fn workflow_id(&self) -> Option<&str> {
        self.capture.as_ref().map(|c| c.workflow_id.as_str())
    }

    /// Index the next emitted record will carry
    pub fn next_index(&self) -> Option<u64> {
        self.capture.as_ref().map(|c| c.next_index)
    }

    /// Renumber from `next_index` after the coordinator expected a different
    /// index than the one this engine handed out
    pub fn realign(&mut self, next_index: u64) {
        if let Some(c) = self.capture.as_mut() {
            if c.next_index != next_index {
                tracing::info!(from = c.next_index, to = next_index, "capture index realigned");
                c.next_index = next_index;
            }
        }
    }

    pub fn has_pending_input(&self) -> bool {
        self.input.target.is_some()
    }

    pub fn observe(&mut self, doc: &Document, event: DomEvent) -> Vec<ActionRecord> {
        let mut out = Vec::new();
        if self.capture.is_none() {
            return out;
        }

        match event {
            DomEvent::Input { target, value } => {
                if !self.input.holds(target) {
                    self.flush_input(&mut out);
                }
                let synth = &self.synth;
                self.input.push(target, || synth.synthesize(doc, target), value);
            }
            DomEvent::Change { target, value } => {
                if self.input.holds(target) {
                    self.input.value = value;
                    self.flush_input(&mut out);
                } else {
                    self.flush_input(&mut out);
                    if let Some(locators) = self.describe(doc, target) {
                        let index = self.take_index();
                        out.push(ActionRecord::input(index, locators, value));
                    }
                }
            }
            DomEvent::Blur { target } => {
                if self.input.holds(target) {
                    self.flush_input(&mut out);
                }
            }
            DomEvent::Click { target } => {
                self.flush_input(&mut out);
                if let Some(locators) = self.describe(doc, target) {
                    let index = self.take_index();
                    out.push(ActionRecord::click(index, locators));
                }
            }
            DomEvent::Key { target, key, modifiers } => {
                if !is_named_key(&key) && !modifiers.any_modifier() {
                    // typed characters arrive as input events
                    return out;
                }
                self.flush_input(&mut out);
                if let Some(locators) = self.describe(doc, target) {
                    let index = self.take_index();
                    out.push(ActionRecord::keypress(index, locators, key, modifiers));
                }
            }
            DomEvent::Navigate { url } => {
                self.flush_input(&mut out);
                let index = self.take_index();
                out.push(ActionRecord::navigate(index, url));
            }
        }
        out
    }

    /// Flush the input buffer once the debounce window has passed
    pub fn tick(&mut self) -> Vec<ActionRecord> {
        let mut out = Vec::new();
        if self.capture.is_some() && self.input.should_flush() {
            self.flush_input(&mut out);
        }
        out
    }

    fn flush_input(&mut self, out: &mut Vec<ActionRecord>) {
        if self.capture.is_none() {
            self.input.clear();
            return;
        }
        if let Some((locators, value)) = self.input.take() {
            if locators.is_empty() {
                tracing::warn!("dropping input on a detached field");
                return;
            }
            let index = self.take_index();
            out.push(ActionRecord::input(index, locators, value));
        }
    }

    fn describe(&self, doc: &Document, target: NodeId) -> Option<Vec<ElementLocator>> {
        let locators = self.synth.synthesize(doc, target);
        if locators.is_empty() {
            tracing::warn!(node = %target, "event target is not attached, skipping");
            return None;
        }
        Some(locators)
    }

    fn take_index(&mut self) -> u64 {
        match self.capture.as_mut() {
            Some(c) => {
                let index = c.next_index;
                c.next_index += 1;
                index
            }
            None => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{ActionKind, Modifiers};
    use tabtrail_core::Element;

    fn form() -> (Document, NodeId, NodeId, NodeId) {
        let mut doc = Document::new("https://app.test/signup");
        let body = doc.body();
        let email = doc
            .append(body, Element::new("input").id("email").attr("type", "email"))
            .unwrap();
        let name = doc.append(body, Element::new("input").attr("name", "full-name")).unwrap();
        let submit = doc.append(body, Element::new("button").id("submit").text("Go")).unwrap();
        (doc, email, name, submit)
    }

    fn engine(debounce_ms: u64) -> CaptureEngine {
        let config = CaptureConfig {
            input_debounce_ms: debounce_ms,
            ..Default::default()
        };
        let mut engine = CaptureEngine::new(&config, SynthConfig::default());
        engine.begin("wf", 1);
        engine
    }

    fn input(target: NodeId, value: &str) -> DomEvent {
        DomEvent::Input {
            target,
            value: value.to_string(),
        }
    }

    #[test]
    fn keystrokes_coalesce_into_final_value() {
        let (doc, email, _, submit) = form();
        let mut engine = engine(10_000);

        for v in ["a", "a@", "a@b", "a@b.com"] {
            assert!(engine.observe(&doc, input(email, v)).is_empty());
        }
        let records = engine.observe(&doc, DomEvent::Click { target: submit });

        assert_eq!(records.len(), 2);
        assert_eq!(records[0].action, ActionKind::Input);
        assert_eq!(records[0].text(), Some("a@b.com"));
        assert_eq!(records[0].index, 1);
        assert_eq!(records[1].action, ActionKind::Click);
        assert_eq!(records[1].index, 2);
        assert_eq!(records[1].locators[0].to_string(), "#submit");
    }

    #[test]
    fn switching_fields_flushes_previous() {
        let (doc, email, name, _) = form();
        let mut engine = engine(10_000);

        engine.observe(&doc, input(email, "x@y.z"));
        let records = engine.observe(&doc, input(name, "Ada"));
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].text(), Some("x@y.z"));

        let records = engine.observe(&doc, DomEvent::Blur { target: name });
        assert_eq!(records[0].text(), Some("Ada"));
        assert_eq!(records[0].index, 2);
        assert!(!engine.has_pending_input());
    }

    #[test]
    fn debounce_flushes_on_tick() {
        let (doc, email, _, _) = form();
        let mut engine = engine(20);

        engine.observe(&doc, input(email, "slow"));
        assert!(engine.tick().is_empty());
        std::thread::sleep(std::time::Duration::from_millis(40));
        let records = engine.tick();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].text(), Some("slow"));
    }

    #[test]
    fn change_without_input_is_recorded() {
        let (doc, _, name, _) = form();
        let mut engine = engine(10_000);
        let records = engine.observe(
            &doc,
            DomEvent::Change {
                target: name,
                value: "picked".into(),
            },
        );
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].text(), Some("picked"));
    }

    #[test]
    fn plain_characters_are_not_keypresses() {
        let (doc, email, _, _) = form();
        let mut engine = engine(10_000);

        let key = |key: &str, m: Modifiers| DomEvent::Key {
            target: email,
            key: key.to_string(),
            modifiers: m,
        };
        assert!(engine.observe(&doc, key("a", Modifiers::NONE)).is_empty());
        assert!(engine.observe(&doc, key("A", Modifiers::new(Modifiers::SHIFT))).is_empty());

        engine.observe(&doc, input(email, "hi"));
        let records = engine.observe(&doc, key("Enter", Modifiers::NONE));
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].action, ActionKind::Input);
        assert_eq!(records[1].action, ActionKind::Keypress);

        let records = engine.observe(&doc, key("a", Modifiers::parse("ctrl")));
        assert_eq!(records[0].action, ActionKind::Keypress);
        assert_eq!(records[0].index, 3);
    }

    #[test]
    fn navigation_has_no_locators() {
        let (doc, _, _, _) = form();
        let mut engine = engine(10_000);
        let records = engine.observe(
            &doc,
            DomEvent::Navigate {
                url: "https://app.test/next".into(),
            },
        );
        assert!(records[0].locators.is_empty());
        assert_eq!(records[0].url(), Some("https://app.test/next"));
    }

    #[test]
    fn end_flushes_and_resume_continues_numbering() {
        let (doc, email, _, submit) = form();
        let mut engine = engine(10_000);

        engine.observe(&doc, input(email, "pending"));
        let flushed = engine.end();
        assert_eq!(flushed.len(), 1);
        assert!(!engine.is_capturing());
        assert!(engine.observe(&doc, DomEvent::Click { target: submit }).is_empty());

        engine.begin("wf", 2);
        let records = engine.observe(&doc, DomEvent::Click { target: submit });
        assert_eq!(records[0].index, 2);
        assert_eq!(engine.next_index(), Some(3));
    }

    #[test]
    fn detached_targets_are_skipped() {
        let (mut doc, _, _, submit) = form();
        let mut engine = engine(10_000);
        doc.remove(submit);
        assert!(engine.observe(&doc, DomEvent::Click { target: submit }).is_empty());
        assert_eq!(engine.next_index(), Some(1));
    }
}
