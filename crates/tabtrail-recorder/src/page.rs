//! Page context - the script injected into one tab
//!
//! Runs on its own thread with its own bus endpoint. It owns the capture
//! engine and the replayer for its tab and never shares state with the
//! coordinator: records go out as `record-action` requests, steps come in as
//! `execute-step` requests.

use crate::events::{ActionRecord, DomEvent, Modifiers};
use crate::protocol::{topic, Message};
use crate::recorder::CaptureEngine;
use crate::replay::{InteractionDriver, Replayer};
use crossbeam_channel::{bounded, select, Receiver, Sender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tabtrail_bus::{Bus, ContextId, Endpoint, Envelope, Payload, Reply, Router, TabId};
use tabtrail_core::{Element, EngineConfig, Error, NodeId, Result, SharedDocument};

struct PageState<D> {
    doc: SharedDocument,
    capture: CaptureEngine,
    replayer: Replayer<D>,
}

pub struct PageAgent<D> {
    tab: TabId,
    endpoint: Endpoint<Message>,
    events: Receiver<DomEvent>,
    router: Router<PageState<D>, Message>,
    state: PageState<D>,
    tick: Duration,
}

impl<D: InteractionDriver + 'static> PageAgent<D> {
    /// Attach tab `tab` to the bus and start its context thread
    pub fn spawn(
        bus: &Bus<Message>,
        tab: TabId,
        doc: SharedDocument,
        driver: D,
        config: &EngineConfig,
    ) -> Result<PageHandle> {
        let endpoint = bus.attach(ContextId::Page(tab));
        let (tx, rx) = bounded(config.capture.max_buffer.max(1));
        let stop = Arc::new(AtomicBool::new(false));

        let agent = PageAgent {
            tab,
            endpoint,
            events: rx,
            router: page_router(),
            state: PageState {
                doc: doc.clone(),
                capture: CaptureEngine::new(&config.capture, config.synth.clone()),
                replayer: Replayer::new(doc.clone(), driver).config(config.replay.clone()),
            },
            tick: Duration::from_millis(config.capture.tick_ms.max(1)),
        };

        let stop1 = stop.clone();
        let thread = thread::Builder::new()
            .name(format!("page-{}", tab))
            .spawn(move || agent.run(&stop1))?;

        Ok(PageHandle {
            tab,
            doc,
            events: tx,
            stop,
            thread: Some(thread),
        })
    }

    fn run(mut self, stop: &AtomicBool) {
        tracing::debug!(tab = %self.tab, "page context running");
        let inbox = self.endpoint.inbox().clone();
        let events = self.events.clone();

        while !stop.load(Ordering::Relaxed) {
            select! {
                recv(inbox) -> msg => match msg {
                    Ok(envelope) => {
                        // events the user produced before this message come first
                        self.drain_events();
                        if let Some(envelope) = self.endpoint.accept(envelope) {
                            self.router.dispatch(&mut self.state, &self.endpoint, envelope);
                        }
                    }
                    Err(_) => break,
                },
                recv(events) -> event => match event {
                    Ok(event) => self.observe(event),
                    Err(_) => break,
                },
                default(self.tick) => {}
            }

            let due = self.state.capture.tick();
            submit(&self.endpoint, &mut self.state.capture, due);
        }
        tracing::debug!(tab = %self.tab, "page context stopped");
    }

    fn drain_events(&mut self) {
        while let Ok(event) = self.events.try_recv() {
            self.observe(event);
        }
    }

    fn observe(&mut self, event: DomEvent) {
        let records = {
            let doc = self.state.doc.lock();
            self.state.capture.observe(&doc, event)
        };
        submit(&self.endpoint, &mut self.state.capture, records);
    }
}

fn page_router<D: InteractionDriver + 'static>() -> Router<PageState<D>, Message> {
    Router::new()
        .on(topic::BEGIN_CAPTURE, |state: &mut PageState<D>, _, env: &Envelope<Message>| {
            match env.payload() {
                Some(Message::BeginCapture { workflow_id, next_index }) => {
                    state.capture.begin(workflow_id.clone(), *next_index);
                    Reply::Now(Ok(Message::CaptureStarted {
                        next_index: *next_index,
                    }))
                }
                _ => malformed(env),
            }
        })
        .on(topic::END_CAPTURE, |state: &mut PageState<D>, endpoint, _| {
            let before = state.capture.next_index().unwrap_or(0);
            let records = state.capture.end();
            let next_index = submit(endpoint, &mut state.capture, records).unwrap_or(before);
            Reply::Now(Ok(Message::CaptureEnded { next_index }))
        })
        .on(topic::EXECUTE_STEP, |state: &mut PageState<D>, _, env: &Envelope<Message>| {
            match env.payload() {
                Some(Message::ExecuteStep(record)) if state.capture.is_capturing() => {
                    Reply::Now(Err(Error::invalid_state(format!(
                        "cannot replay step {} while capturing",
                        record.index
                    ))))
                }
                Some(Message::ExecuteStep(record)) => {
                    let outcome = state.replayer.execute_step(record);
                    Reply::Now(Ok(Message::StepOutcome(outcome)))
                }
                _ => malformed(env),
            }
        })
}

fn malformed(env: &Envelope<Message>) -> Reply<Message> {
    Reply::Now(Err(Error::invalid_input(format!(
        "malformed '{}' message",
        env.topic
    ))))
}

/// Send records to the coordinator one at a time, each acknowledged before
/// the next goes out. A record the coordinator wants under another index is
/// renumbered and resent once; later records and the capture engine continue
/// from the last acknowledged index. Returns the index after it.
fn submit(
    endpoint: &Endpoint<Message>,
    capture: &mut CaptureEngine,
    records: Vec<ActionRecord>,
) -> Option<u64> {
    let mut next = None;
    for mut record in records {
        if let Some(index) = next {
            record.index = index;
        }
        if let Err(e) = send_record(endpoint, &record) {
            match e.expected_index() {
                Some(expected) if expected != record.index => {
                    tracing::warn!(got = record.index, expected, "renumbering rejected record");
                    record.index = expected;
                    if let Err(e) = send_record(endpoint, &record) {
                        tracing::warn!(index = record.index, error = %e, "record rejected");
                        continue;
                    }
                }
                _ => {
                    tracing::warn!(index = record.index, error = %e, "record rejected");
                    continue;
                }
            }
        }
        next = Some(record.index + 1);
    }
    if let Some(index) = next {
        capture.realign(index);
    }
    next
}

fn send_record(endpoint: &Endpoint<Message>, record: &ActionRecord) -> Result<()> {
    match endpoint.request(ContextId::Background, Message::RecordAction(record.clone()))? {
        Message::Recorded { index } if index == record.index => {
            tracing::debug!(index, "record acknowledged");
            Ok(())
        }
        other => Err(Error::invalid_state(format!(
            "unexpected '{}' acknowledgement for record {}",
            other.topic(),
            record.index
        ))),
    }
}

/// Handle to a running page context. Its methods play the user: they change
/// the document the way the browser would and report the matching DOM event.
pub struct PageHandle {
    tab: TabId,
    doc: SharedDocument,
    events: Sender<DomEvent>,
    stop: Arc<AtomicBool>,
    thread: Option<thread::JoinHandle<()>>,
}

impl PageHandle {
    pub fn tab(&self) -> TabId {
        self.tab
    }

    pub fn document(&self) -> &SharedDocument {
        &self.doc
    }

    /// Report an event without touching the document
    pub fn dispatch(&self, event: DomEvent) -> Result<()> {
        self.events
            .send(event)
            .map_err(|_| Error::invalid_state(format!("page {} is closed", self.tab)))
    }

    /// Apply an event's effect on form state, then report it
    pub fn perform(&self, event: DomEvent) -> Result<()> {
        match &event {
            DomEvent::Input { target, value } | DomEvent::Change { target, value } => {
                self.doc.lock().set_value(*target, value);
            }
            _ => {}
        }
        self.dispatch(event)
    }

    pub fn click(&self, target: NodeId) -> Result<()> {
        self.perform(DomEvent::Click { target })
    }

    /// Type `value` one character at a time, as keystrokes would
    pub fn type_text(&self, target: NodeId, value: &str) -> Result<()> {
        let mut typed = String::new();
        for c in value.chars() {
            typed.push(c);
            self.perform(DomEvent::Input {
                target,
                value: typed.clone(),
            })?;
        }
        Ok(())
    }

    pub fn change(&self, target: NodeId, value: &str) -> Result<()> {
        self.perform(DomEvent::Change {
            target,
            value: value.to_string(),
        })
    }

    pub fn blur(&self, target: NodeId) -> Result<()> {
        self.perform(DomEvent::Blur { target })
    }

    pub fn key(&self, target: NodeId, key: &str, modifiers: Modifiers) -> Result<()> {
        self.perform(DomEvent::Key {
            target,
            key: key.to_string(),
            modifiers,
        })
    }

    /// Load new content into the tab
    pub fn navigate(&self, url: &str, root: &Element) -> Result<()> {
        self.doc.lock().replace(url, root);
        self.perform(DomEvent::Navigate {
            url: url.to_string(),
        })
    }

    /// Tear the page down. Input still waiting for its debounce is lost.
    pub fn close(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(t) = self.thread.take() {
            let _ = t.join();
        }
    }
}

impl Drop for PageHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::Workflow;
    use crate::replay::DocumentDriver;
    use std::time::Instant;
    use tabtrail_core::config::BusConfig;
    use tabtrail_core::Document;

    fn config() -> EngineConfig {
        EngineConfig {
            bus: BusConfig {
                request_timeout_ms: 1000,
                max_delivery_attempts: 3,
                retry_base_ms: 2,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Background that fails the first record it sees, then enforces order
    fn flaky_background(
        mut endpoint: Endpoint<Message>,
        want: usize,
    ) -> thread::JoinHandle<Workflow> {
        thread::spawn(move || {
            let mut workflow = Workflow::new("flaky", "https://app.test");
            let mut failed_once = false;
            let deadline = Instant::now() + Duration::from_secs(3);
            while workflow.steps.len() < want && Instant::now() < deadline {
                let Some(env) = endpoint.recv_timeout(Duration::from_millis(50)) else {
                    continue;
                };
                let Some(Message::RecordAction(record)) = env.payload().cloned() else {
                    continue;
                };
                if !failed_once {
                    failed_once = true;
                    endpoint.respond(&env, Err(Error::storage("disk full")));
                    continue;
                }
                let index = record.index;
                let result = workflow.push(record).map(|_| Message::Recorded { index });
                endpoint.respond(&env, result);
            }
            workflow
        })
    }

    #[test]
    fn rejected_record_does_not_stall_capture() {
        let config = config();
        let bus = Bus::new(config.bus.clone());
        let background = flaky_background(bus.attach(ContextId::Background), 2);
        let ui = bus.attach(ContextId::panel("test"));

        let mut doc = Document::new("https://app.test");
        let body = doc.body();
        let button = doc.append(body, Element::new("button").id("go").text("Go")).unwrap();
        let doc = doc.into_shared();
        let driver = DocumentDriver::new(doc.clone());
        let page = PageAgent::spawn(&bus, TabId(1), doc, driver, &config).unwrap();

        let started = ui
            .request(
                ContextId::page(1),
                Message::BeginCapture {
                    workflow_id: "flaky".into(),
                    next_index: 1,
                },
            )
            .unwrap();
        assert_eq!(started, Message::CaptureStarted { next_index: 1 });

        for _ in 0..3 {
            page.click(button).unwrap();
        }

        let workflow = background.join().unwrap();
        let indices: Vec<u64> = workflow.steps.iter().map(|s| s.index).collect();
        assert_eq!(indices, vec![1, 2]);
        page.close();
    }
}
