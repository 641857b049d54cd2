//! Workflow replay against a live document
//!
//! Each step re-resolves its target from the recorded locators, performs the
//! action through an [`InteractionDriver`] and waits for the page to settle.
//! Replay is strict: an ambiguous locator stops the run instead of guessing.

use crate::events::{ActionKind, ActionPayload, ActionRecord, Modifiers, Workflow};
use crate::protocol::{ReplayReport, ReplayStatus, StepOutcome};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tabtrail_core::config::ReplayConfig;
use tabtrail_core::dom::is_form_control;
use tabtrail_core::{Element, Error, ErrorCode, Locator, NodeId, Result, SharedDocument};

const SETTLE_POLL_MS: u64 = 10;

/// Performs user actions on a page
pub trait InteractionDriver: Send {
    fn click(&mut self, node: NodeId) -> Result<()>;
    /// Assign a field's value and signal input/change
    fn input(&mut self, node: NodeId, value: &str) -> Result<()>;
    /// Dispatch a key; `None` targets the document
    fn keypress(&mut self, node: Option<NodeId>, key: &str, modifiers: Modifiers) -> Result<()>;
    fn navigate(&mut self, url: &str) -> Result<()>;
}

/// Drives the in-memory document directly
pub struct DocumentDriver {
    doc: SharedDocument,
    pages: HashMap<String, Element>,
    pressed: Vec<String>,
}

impl DocumentDriver {
    pub fn new(doc: SharedDocument) -> Self {
        Self {
            doc,
            pages: HashMap::new(),
            pressed: Vec::new(),
        }
    }

    /// Content served when navigating to `url`
    pub fn page(mut self, url: impl Into<String>, root: Element) -> Self {
        self.pages.insert(url.into(), root);
        self
    }

    /// Keys dispatched so far, as `modifiers+key`
    pub fn pressed(&self) -> &[String] {
        &self.pressed
    }

    fn attached(&self, node: NodeId, action: &str) -> Result<()> {
        let doc = self.doc.lock();
        if !doc.is_attached(node) {
            return Err(Error::action_failed(action, "element is no longer attached"));
        }
        if doc.attr(node, "disabled").is_some() {
            return Err(Error::action_failed(action, "element is disabled"));
        }
        Ok(())
    }
}

impl InteractionDriver for DocumentDriver {
    fn click(&mut self, node: NodeId) -> Result<()> {
        self.attached(node, "click")?;
        let mut doc = self.doc.lock();
        if doc.tag(node) == Some("input") {
            match doc.attr(node, "type") {
                Some("checkbox") => {
                    let checked = doc.is_checked(node);
                    doc.set_checked(node, !checked);
                }
                Some("radio") => doc.set_checked(node, true),
                _ => {}
            }
        }
        Ok(())
    }

    fn input(&mut self, node: NodeId, value: &str) -> Result<()> {
        self.attached(node, "input")?;
        let mut doc = self.doc.lock();
        let editable = doc.tag(node).map(is_form_control).unwrap_or(false)
            || doc.attr(node, "contenteditable").is_some();
        if !editable {
            return Err(Error::action_failed("input", "element does not accept text"));
        }
        doc.set_value(node, value);
        Ok(())
    }

    fn keypress(&mut self, node: Option<NodeId>, key: &str, modifiers: Modifiers) -> Result<()> {
        if let Some(node) = node {
            self.attached(node, "keypress")?;
        }
        self.pressed.push(if modifiers.is_empty() {
            key.to_string()
        } else {
            format!("{}+{}", modifiers, key)
        });
        Ok(())
    }

    fn navigate(&mut self, url: &str) -> Result<()> {
        let root = self.pages.get(url).cloned().unwrap_or_else(|| {
            tracing::debug!(url, "no content registered, loading a blank page");
            Element::new("html").child(Element::new("body"))
        });
        self.doc.lock().replace(url, &root);
        Ok(())
    }
}

/// Replay recorded workflows
pub struct Replayer<D> {
    doc: SharedDocument,
    driver: D,
    config: ReplayConfig,
}

impl<D: InteractionDriver> Replayer<D> {
    pub fn new(doc: SharedDocument, driver: D) -> Self {
        Self {
            doc,
            driver,
            config: ReplayConfig::default(),
        }
    }

    pub fn config(mut self, config: ReplayConfig) -> Self {
        self.config = config;
        self
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    pub fn document(&self) -> &SharedDocument {
        &self.doc
    }

    pub fn execute_step(&mut self, record: &ActionRecord) -> StepOutcome {
        let start = Instant::now();
        let result = self.perform(record);
        let ms = start.elapsed().as_millis() as u64;
        match result {
            Ok(locator_index) => {
                tracing::debug!(index = record.index, step = %record.describe(), ms, "step done");
                StepOutcome::success(record.index, locator_index, ms)
            }
            Err(e) => {
                tracing::warn!(
                    index = record.index,
                    step = %record.describe(),
                    error = %e,
                    "step failed"
                );
                StepOutcome::failure(record.index, e, ms)
            }
        }
    }

    /// Run a whole workflow, checking `cancel` between steps. Stops at the
    /// first step that does not succeed.
    pub fn play(&mut self, workflow: &Workflow, cancel: &AtomicBool) -> ReplayReport {
        let mut report = ReplayReport::new(workflow.id.as_str(), None, workflow.steps.len());
        tracing::info!(workflow = %workflow.id, steps = workflow.steps.len(), "replay started");

        for step in &workflow.steps {
            if cancel.load(Ordering::SeqCst) {
                tracing::info!(
                    workflow = %workflow.id,
                    last_completed = report.last_completed,
                    "replay cancelled"
                );
                report.finish(ReplayStatus::Aborted);
                return report;
            }
            let outcome = self.execute_step(step);
            let ok = outcome.is_success();
            report.push(outcome);
            if !ok {
                report.finish(ReplayStatus::Failed);
                return report;
            }
        }

        report.finish(ReplayStatus::Completed);
        tracing::info!(workflow = %workflow.id, "replay completed");
        report
    }

    fn perform(&mut self, record: &ActionRecord) -> Result<Option<usize>> {
        match (record.action, &record.payload) {
            (ActionKind::Wait, Some(ActionPayload::Wait { ms })) => {
                std::thread::sleep(Duration::from_millis(*ms));
                Ok(None)
            }
            (ActionKind::Navigate, Some(ActionPayload::Url { url })) => {
                self.driver.navigate(url).map_err(|e| driver_error("navigate", e))?;
                self.settle()?;
                Ok(None)
            }
            (ActionKind::Click, _) => {
                let found = self.resolve(record)?;
                self.driver.click(found.node).map_err(|e| driver_error("click", e))?;
                self.settle()?;
                Ok(Some(found.locator_index))
            }
            (ActionKind::Input, Some(ActionPayload::Text { value })) => {
                let found = self.resolve(record)?;
                self.driver
                    .input(found.node, value)
                    .map_err(|e| driver_error("input", e))?;
                self.settle()?;
                Ok(Some(found.locator_index))
            }
            (ActionKind::Keypress, Some(ActionPayload::Key { key, modifiers })) => {
                if record.locators.is_empty() {
                    self.driver
                        .keypress(None, key, *modifiers)
                        .map_err(|e| driver_error("keypress", e))?;
                    self.settle()?;
                    return Ok(None);
                }
                let found = self.resolve(record)?;
                self.driver
                    .keypress(Some(found.node), key, *modifiers)
                    .map_err(|e| driver_error("keypress", e))?;
                self.settle()?;
                Ok(Some(found.locator_index))
            }
            (action, _) => Err(Error::invalid_input(format!(
                "step {} ({}) is missing its payload",
                record.index, action
            ))),
        }
    }

    fn resolve(&self, record: &ActionRecord) -> Result<tabtrail_core::Resolved> {
        Locator::new(record.locators.clone())
            .retries(self.config.resolve_retries)
            .backoff(self.config.retry_backoff_ms)
            .wait(&self.doc)
    }

    /// Wait until the document revision stops changing for `settle_ms`
    fn settle(&self) -> Result<()> {
        let settle = Duration::from_millis(self.config.settle_ms);
        let max = Duration::from_millis(self.config.max_settle_ms);
        let poll = Duration::from_millis(SETTLE_POLL_MS.min(self.config.settle_ms.max(1)));
        let start = Instant::now();
        let mut revision = self.doc.lock().revision();
        let mut quiet_since = Instant::now();

        loop {
            if quiet_since.elapsed() >= settle {
                return Ok(());
            }
            if start.elapsed() >= max {
                return Err(Error::timeout("page to settle", self.config.max_settle_ms));
            }
            std::thread::sleep(poll);
            let current = self.doc.lock().revision();
            if current != revision {
                revision = current;
                quiet_since = Instant::now();
            }
        }
    }
}

/// Driver failures are reported as `action-failed` whatever the driver said
fn driver_error(action: &str, e: Error) -> Error {
    if e.code == ErrorCode::ActionFailed {
        e
    } else {
        Error::action_failed(action, &e.message).with_suggestions(e.suggestions)
    }
}
