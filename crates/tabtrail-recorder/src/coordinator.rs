//! Background coordinator - the one place session state lives
//!
//! The coordinator owns the workflow store and every tab's session. It never
//! blocks on a page: commands that need a page's cooperation send a deferred
//! request and park it in `pending`; the loop polls those replies between
//! messages and answers the waiting panel once the page has acknowledged.
//! While a `stop` waits on `end-capture`, the page's last `record-action`
//! requests are still served, so flushed input is never lost.

use crate::events::Workflow;
use crate::journal::{JournalEntry, SessionJournal};
use crate::protocol::{
    topic, Message, ReplayReport, ReplayStatus, SessionMode, SessionSnapshot, StepOutcome,
};
use crate::storage::{WorkflowStore, WorkflowSummary};
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tabtrail_bus::{Bus, ContextId, Endpoint, Envelope, PendingReply, Reply, Router, TabId};
use tabtrail_core::{EngineConfig, Error, ErrorCode, Result};

/// How long the loop waits for a message before polling page replies
const POLL_MS: u64 = 5;

/// What startup found in the journal
#[derive(Debug, Clone, Default)]
pub struct RecoveryReport {
    /// Recordings that were cut off and have now been sealed
    pub sealed: Vec<WorkflowSummary>,
    /// Replays that were cut off, reported as aborted
    pub aborted: Vec<ReplayReport>,
}

impl RecoveryReport {
    pub fn is_empty(&self) -> bool {
        self.sealed.is_empty() && self.aborted.is_empty()
    }
}

struct Session {
    tab: TabId,
    mode: SessionMode,
    workflow: Option<Workflow>,
    cursor: usize,
    report: Option<ReplayReport>,
    last_report: Option<ReplayReport>,
    abort_requested: bool,
}

impl Session {
    fn new(tab: TabId) -> Self {
        Self {
            tab,
            mode: SessionMode::Idle,
            workflow: None,
            cursor: 0,
            report: None,
            last_report: None,
            abort_requested: false,
        }
    }

    fn snapshot(&self) -> SessionSnapshot {
        let wf = self.workflow.as_ref();
        SessionSnapshot {
            tab: self.tab,
            mode: self.mode,
            workflow_id: wf.map(|w| w.id.clone()),
            workflow_name: wf.map(|w| w.name.clone()),
            steps: wf.map(|w| w.steps.len()).unwrap_or(0),
            next_index: wf.map(|w| w.next_index()).unwrap_or(1),
            cursor: self.cursor,
            last_report: self.last_report.clone(),
        }
    }

    fn journal_entry(&self) -> JournalEntry {
        JournalEntry::new(
            self.tab,
            self.mode,
            self.workflow.as_ref().map(|w| w.id.clone()),
            self.cursor,
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AfterEnd {
    Pause,
    Stop,
}

/// A page request the coordinator is waiting on
enum Pending {
    /// `begin-capture` for a new recording (`fresh`) or a resume
    Begin {
        tab: TabId,
        reply: PendingReply<Message>,
        request: Envelope<Message>,
        fresh: bool,
    },
    End {
        tab: TabId,
        reply: PendingReply<Message>,
        request: Envelope<Message>,
        then: AfterEnd,
    },
    Step {
        tab: TabId,
        index: u64,
        reply: PendingReply<Message>,
    },
}

impl Pending {
    fn tab(&self) -> TabId {
        match self {
            Self::Begin { tab, .. } | Self::End { tab, .. } | Self::Step { tab, .. } => *tab,
        }
    }

    fn reply(&self) -> &PendingReply<Message> {
        match self {
            Self::Begin { reply, .. } | Self::End { reply, .. } | Self::Step { reply, .. } => reply,
        }
    }

    fn request(&self) -> Option<&Envelope<Message>> {
        match self {
            Self::Begin { request, .. } | Self::End { request, .. } => Some(request),
            Self::Step { .. } => None,
        }
    }
}

struct CoordinatorState {
    store: WorkflowStore,
    journal: SessionJournal,
    config: EngineConfig,
    sessions: HashMap<TabId, Session>,
    pending: Vec<Pending>,
}

impl CoordinatorState {
    fn snapshot(&self, tab: TabId) -> SessionSnapshot {
        self.sessions
            .get(&tab)
            .map(Session::snapshot)
            .unwrap_or_else(|| SessionSnapshot::idle(tab))
    }

    /// Fail a command, carrying the session as it stands
    fn reject(&self, tab: TabId, error: Error) -> Reply<Message> {
        let snapshot = self.snapshot(tab);
        Reply::Now(Err(error.with_context(json!({ "session": snapshot }))))
    }

    fn busy(&self, tab: TabId) -> bool {
        self.pending.iter().any(|p| p.tab() == tab)
    }

    fn mode(&self, tab: TabId) -> SessionMode {
        self.sessions
            .get(&tab)
            .map(|s| s.mode)
            .unwrap_or(SessionMode::Idle)
    }

    fn journal(&self, tab: TabId) {
        let entry = match self.sessions.get(&tab) {
            Some(session) => session.journal_entry(),
            None => JournalEntry::new(tab, SessionMode::Idle, None, 0),
        };
        if let Err(e) = self.journal.record(&entry) {
            tracing::warn!(tab = %tab, error = %e, "failed to journal session");
        }
    }

    /// Shrink the journal to the sessions still running
    fn compact_journal(&self) {
        let live: Vec<JournalEntry> = self
            .sessions
            .values()
            .filter(|s| s.mode != SessionMode::Idle)
            .map(Session::journal_entry)
            .collect();
        if let Err(e) = self.journal.compact(&live) {
            tracing::warn!(error = %e, "failed to compact journal");
        }
    }

    fn page_timeout(&self) -> Duration {
        self.config.bus.request_timeout()
    }

    fn start_record(
        &mut self,
        endpoint: &Endpoint<Message>,
        env: &Envelope<Message>,
    ) -> Reply<Message> {
        let Some(Message::StartRecord { tab, name, origin }) = env.payload() else {
            return malformed(env);
        };
        let tab = *tab;
        if self.busy(tab) || self.mode(tab) != SessionMode::Idle {
            let mode = self.mode(tab);
            return self.reject(tab, Error::already_active(tab, mode.as_str()));
        }

        let workflow = Workflow::new(name.clone(), origin.clone());
        if let Err(e) = self.store.create(&workflow) {
            return self.reject(tab, e);
        }

        let begin = Message::BeginCapture {
            workflow_id: workflow.id.clone(),
            next_index: 1,
        };
        match endpoint.request_deferred(ContextId::Page(tab), begin, self.page_timeout()) {
            Ok(reply) => {
                tracing::info!(
                    tab = %tab,
                    workflow = %workflow.id,
                    name = %workflow.name,
                    "starting recording"
                );
                let session = self.sessions.entry(tab).or_insert_with(|| Session::new(tab));
                session.workflow = Some(workflow);
                session.cursor = 0;
                self.pending.push(Pending::Begin {
                    tab,
                    reply,
                    request: env.clone(),
                    fresh: true,
                });
                Reply::Deferred
            }
            Err(e) => {
                self.discard(&workflow.id);
                self.reject(tab, e)
            }
        }
    }

    fn pause(&mut self, endpoint: &Endpoint<Message>, env: &Envelope<Message>) -> Reply<Message> {
        let Some(Message::Pause { tab }) = env.payload() else {
            return malformed(env);
        };
        let tab = *tab;
        if self.busy(tab) || self.mode(tab) != SessionMode::Recording {
            return self.reject(tab, Error::invalid_state(format!("tab {} is not recording", tab)));
        }
        self.end_capture(endpoint, env, tab, AfterEnd::Pause)
    }

    fn resume(&mut self, endpoint: &Endpoint<Message>, env: &Envelope<Message>) -> Reply<Message> {
        let Some(Message::Resume { tab }) = env.payload() else {
            return malformed(env);
        };
        let tab = *tab;
        if self.busy(tab) || self.mode(tab) != SessionMode::Paused {
            return self.reject(tab, Error::invalid_state(format!("tab {} is not paused", tab)));
        }
        let Some(workflow) = self.sessions.get(&tab).and_then(|s| s.workflow.as_ref()) else {
            return self.reject(tab, Error::invalid_state(format!("tab {} has no workflow", tab)));
        };

        let begin = Message::BeginCapture {
            workflow_id: workflow.id.clone(),
            next_index: workflow.next_index(),
        };
        match endpoint.request_deferred(ContextId::Page(tab), begin, self.page_timeout()) {
            Ok(reply) => {
                self.pending.push(Pending::Begin {
                    tab,
                    reply,
                    request: env.clone(),
                    fresh: false,
                });
                Reply::Deferred
            }
            Err(e) => self.reject(tab, e),
        }
    }

    fn stop(&mut self, endpoint: &Endpoint<Message>, env: &Envelope<Message>) -> Reply<Message> {
        let Some(Message::Stop { tab }) = env.payload() else {
            return malformed(env);
        };
        let tab = *tab;
        if self.busy(tab) {
            let mode = self.mode(tab);
            return self.reject(tab, Error::already_active(tab, mode.as_str()));
        }
        match self.mode(tab) {
            SessionMode::Recording => self.end_capture(endpoint, env, tab, AfterEnd::Stop),
            SessionMode::Paused => match self.finish_recording(tab) {
                Ok(snapshot) => Reply::Now(Ok(Message::Command(snapshot))),
                Err(e) => self.reject(tab, e),
            },
            _ => self.reject(tab, Error::invalid_state(format!("tab {} is not recording", tab))),
        }
    }

    fn end_capture(
        &mut self,
        endpoint: &Endpoint<Message>,
        env: &Envelope<Message>,
        tab: TabId,
        then: AfterEnd,
    ) -> Reply<Message> {
        let timeout = self.page_timeout();
        match endpoint.request_deferred(ContextId::Page(tab), Message::EndCapture, timeout) {
            Ok(reply) => {
                self.pending.push(Pending::End {
                    tab,
                    reply,
                    request: env.clone(),
                    then,
                });
                Reply::Deferred
            }
            Err(e) if then == AfterEnd::Stop => {
                tracing::warn!(tab = %tab, error = %e, "page gone, sealing what was recorded");
                match self.finish_recording(tab) {
                    Ok(snapshot) => Reply::Now(Ok(Message::Command(snapshot))),
                    Err(e) => self.reject(tab, e),
                }
            }
            Err(e) => self.reject(tab, e),
        }
    }

    /// Seal the tab's workflow and end its recording session
    fn finish_recording(&mut self, tab: TabId) -> Result<SessionSnapshot> {
        let Some(session) = self.sessions.get_mut(&tab) else {
            return Err(Error::invalid_state(format!("tab {} is not recording", tab)));
        };
        let mut snapshot = session.snapshot();
        let workflow = session.workflow.take();
        session.mode = SessionMode::Idle;
        session.cursor = 0;
        snapshot.mode = SessionMode::Idle;
        self.journal(tab);
        self.compact_journal();

        if let Some(workflow) = workflow {
            let summary = self.store.seal(&workflow.id)?;
            tracing::info!(
                tab = %tab,
                workflow = %summary.id,
                steps = summary.steps,
                "recording stopped"
            );
        }
        Ok(snapshot)
    }

    fn start_replay(
        &mut self,
        endpoint: &Endpoint<Message>,
        env: &Envelope<Message>,
    ) -> Reply<Message> {
        let Some(Message::StartReplay { workflow_id, tab }) = env.payload() else {
            return malformed(env);
        };
        let tab = *tab;
        if self.busy(tab) || self.mode(tab) != SessionMode::Idle {
            let mode = self.mode(tab);
            return self.reject(tab, Error::already_active(tab, mode.as_str()));
        }

        let stored = match self.store.load_stored(workflow_id) {
            Ok(stored) => stored,
            Err(e) => return self.reject(tab, e),
        };
        if !stored.sealed {
            return self.reject(
                tab,
                Error::invalid_state(format!("workflow {} is still being recorded", workflow_id))
                    .with_suggestions(vec!["Stop the recording before replaying it".into()]),
            );
        }

        let workflow = stored.workflow;
        tracing::info!(
            tab = %tab,
            workflow = %workflow.id,
            steps = workflow.steps.len(),
            "starting replay"
        );
        let session = self.sessions.entry(tab).or_insert_with(|| Session::new(tab));
        session.mode = SessionMode::Replaying;
        session.cursor = 0;
        session.abort_requested = false;
        session.report = Some(ReplayReport::new(
            workflow.id.clone(),
            Some(tab),
            workflow.steps.len(),
        ));
        session.workflow = Some(workflow);
        let snapshot = session.snapshot();
        self.journal(tab);

        self.next_step(endpoint, tab);
        Reply::Now(Ok(Message::Command(snapshot)))
    }

    fn abort_replay(&mut self, env: &Envelope<Message>) -> Reply<Message> {
        let Some(Message::AbortReplay { tab }) = env.payload() else {
            return malformed(env);
        };
        let tab = *tab;
        match self.sessions.get_mut(&tab) {
            Some(session) if session.mode == SessionMode::Replaying => {
                tracing::info!(tab = %tab, "replay abort requested");
                session.abort_requested = true;
                Reply::Now(Ok(Message::Command(session.snapshot())))
            }
            _ => self.reject(tab, Error::invalid_state(format!("tab {} is not replaying", tab))),
        }
    }

    /// Send the step under the cursor, or finish the replay
    fn next_step(&mut self, endpoint: &Endpoint<Message>, tab: TabId) {
        let Some(session) = self.sessions.get(&tab) else {
            return;
        };
        if session.abort_requested {
            self.finish_replay(endpoint, tab, ReplayStatus::Aborted);
            return;
        }
        let Some(record) = session
            .workflow
            .as_ref()
            .and_then(|w| w.steps.get(session.cursor))
            .cloned()
        else {
            self.finish_replay(endpoint, tab, ReplayStatus::Completed);
            return;
        };

        let index = record.index;
        let timeout = Duration::from_millis(self.config.replay.step_timeout_ms);
        let step = Message::ExecuteStep(record);
        match endpoint.request_deferred(ContextId::Page(tab), step, timeout) {
            Ok(reply) => self.pending.push(Pending::Step { tab, index, reply }),
            Err(e) => {
                self.record_outcome(tab, StepOutcome::failure(index, e, 0));
                self.finish_replay(endpoint, tab, ReplayStatus::Failed);
            }
        }
    }

    fn record_outcome(&mut self, tab: TabId, outcome: StepOutcome) {
        if let Some(report) = self.sessions.get_mut(&tab).and_then(|s| s.report.as_mut()) {
            report.push(outcome);
        }
    }

    fn finish_replay(&mut self, endpoint: &Endpoint<Message>, tab: TabId, status: ReplayStatus) {
        let Some(session) = self.sessions.get_mut(&tab) else {
            return;
        };
        let Some(mut report) = session.report.take() else {
            return;
        };
        report.finish(status);
        session.mode = SessionMode::Idle;
        session.workflow = None;
        session.abort_requested = false;
        session.last_report = Some(report.clone());
        self.journal(tab);
        self.compact_journal();

        match report.failure() {
            Some(failed) => tracing::warn!(
                tab = %tab,
                workflow = %report.workflow_id,
                index = failed.index,
                status = ?report.status,
                "replay stopped"
            ),
            None => tracing::info!(
                tab = %tab,
                workflow = %report.workflow_id,
                steps = report.last_completed,
                status = ?report.status,
                "replay finished"
            ),
        }

        let panels = endpoint.broadcast(|c| c.is_panel(), Message::ReplayFinished(report));
        tracing::debug!(tab = %tab, panels, "replay report broadcast");
    }

    fn record_action(&mut self, env: &Envelope<Message>) -> Reply<Message> {
        let Some(Message::RecordAction(record)) = env.payload() else {
            return malformed(env);
        };
        let ContextId::Page(tab) = env.source else {
            return Reply::Now(Err(Error::invalid_input(format!(
                "record-action from {} is not a page",
                env.source
            ))));
        };

        let mode = self.mode(tab);
        let Some(workflow) = self
            .sessions
            .get_mut(&tab)
            .filter(|s| s.mode == SessionMode::Recording)
            .and_then(|s| s.workflow.as_mut())
        else {
            return Reply::Now(Err(Error::invalid_state(format!(
                "tab {} is not recording ({})",
                tab, mode
            ))));
        };

        let expected = workflow.next_index();
        if record.index != expected {
            tracing::warn!(tab = %tab, expected, got = record.index, "out-of-sequence record");
            return Reply::Now(Err(Error::invalid_sequence(expected, record.index)));
        }
        if let Err(e) = self.store.append(&workflow.id, record) {
            return Reply::Now(Err(e));
        }
        if let Err(e) = workflow.push(record.clone()) {
            return Reply::Now(Err(e));
        }
        tracing::debug!(tab = %tab, index = record.index, action = %record.action, "recorded");
        Reply::Now(Ok(Message::Recorded { index: record.index }))
    }

    fn tab_closed(
        &mut self,
        endpoint: &Endpoint<Message>,
        env: &Envelope<Message>,
    ) -> Reply<Message> {
        let Some(Message::TabClosed { tab }) = env.payload() else {
            return malformed(env);
        };
        let tab = *tab;
        tracing::info!(tab = %tab, mode = %self.mode(tab), "tab closed");

        let (closed, kept): (Vec<_>, Vec<_>) = self.pending.drain(..).partition(|p| p.tab() == tab);
        self.pending = kept;
        for op in &closed {
            if let Some(request) = op.request() {
                let closed = Error::invalid_state(format!("tab {} was closed", tab));
                endpoint.respond(request, Err(closed));
            }
        }

        match self.mode(tab) {
            SessionMode::Recording | SessionMode::Paused => {
                if let Err(e) = self.finish_recording(tab) {
                    tracing::warn!(
                        tab = %tab,
                        error = %e,
                        "failed to seal recording of closed tab"
                    );
                }
            }
            SessionMode::Replaying => self.finish_replay(endpoint, tab, ReplayStatus::Aborted),
            SessionMode::Idle => {
                // a recording whose page never acknowledged
                let orphan = self
                    .sessions
                    .get_mut(&tab)
                    .and_then(|s| s.workflow.take());
                if let Some(workflow) = orphan {
                    self.discard(&workflow.id);
                }
            }
        }

        self.sessions.remove(&tab);
        self.journal(tab);
        self.compact_journal();
        Reply::Now(Ok(Message::Command(SessionSnapshot::idle(tab))))
    }

    /// Remove a workflow file that never received a step
    fn discard(&self, id: &str) {
        if let Err(e) = self.store.delete(id) {
            tracing::warn!(workflow = %id, error = %e, "failed to discard empty workflow");
        }
    }

    fn poll_pending(&mut self, endpoint: &Endpoint<Message>) {
        let mut i = 0;
        while i < self.pending.len() {
            match self.pending[i].reply().poll() {
                None => i += 1,
                Some(result) => {
                    let op = self.pending.remove(i);
                    self.complete(endpoint, op, result);
                }
            }
        }
    }

    fn complete(&mut self, endpoint: &Endpoint<Message>, op: Pending, result: Result<Message>) {
        match op {
            Pending::Begin {
                tab,
                request,
                fresh,
                ..
            } => {
                let result = match result {
                    Ok(Message::CaptureStarted { next_index }) => {
                        if let Some(session) = self.sessions.get_mut(&tab) {
                            session.mode = SessionMode::Recording;
                        }
                        self.journal(tab);
                        tracing::info!(tab = %tab, next_index, "recording");
                        Ok(Message::Command(self.snapshot(tab)))
                    }
                    Ok(other) => Err(unexpected(&other)),
                    Err(e) => Err(e),
                };
                if let Err(e) = &result {
                    tracing::warn!(tab = %tab, error = %e, "page did not start capturing");
                    if fresh {
                        let orphan = self.sessions.get_mut(&tab).and_then(|s| s.workflow.take());
                        if let Some(workflow) = orphan {
                            self.discard(&workflow.id);
                        }
                    }
                }
                endpoint.respond(&request, self.with_session(tab, result));
            }
            Pending::End {
                tab,
                request,
                then,
                ..
            } => {
                let ended = match result {
                    Ok(Message::CaptureEnded { next_index }) => {
                        tracing::debug!(tab = %tab, next_index, "capture ended");
                        Ok(())
                    }
                    Ok(other) => Err(unexpected(&other)),
                    Err(e) => Err(e),
                };
                let result = match (then, ended) {
                    (AfterEnd::Pause, Ok(())) => {
                        if let Some(session) = self.sessions.get_mut(&tab) {
                            session.mode = SessionMode::Paused;
                        }
                        self.journal(tab);
                        tracing::info!(tab = %tab, "recording paused");
                        Ok(Message::Command(self.snapshot(tab)))
                    }
                    (AfterEnd::Pause, Err(e)) => Err(e),
                    (AfterEnd::Stop, ended) => {
                        if let Err(e) = ended {
                            tracing::warn!(
                                tab = %tab,
                                error = %e,
                                "page did not end capture, sealing anyway"
                            );
                        }
                        self.finish_recording(tab).map(Message::Command)
                    }
                };
                endpoint.respond(&request, self.with_session(tab, result));
            }
            Pending::Step { tab, index, .. } => {
                let outcome = match result {
                    Ok(Message::StepOutcome(outcome)) => outcome,
                    Ok(other) => StepOutcome::failure(index, unexpected(&other), 0),
                    Err(e) => StepOutcome::failure(index, e, 0),
                };
                let ok = outcome.is_success();
                self.record_outcome(tab, outcome);
                if !ok {
                    self.finish_replay(endpoint, tab, ReplayStatus::Failed);
                    return;
                }
                if let Some(session) = self.sessions.get_mut(&tab) {
                    session.cursor += 1;
                }
                self.journal(tab);
                self.next_step(endpoint, tab);
            }
        }
    }

    fn with_session(&self, tab: TabId, result: Result<Message>) -> Result<Message> {
        result.map_err(|e| {
            let snapshot = self.snapshot(tab);
            e.with_context(json!({ "session": snapshot }))
        })
    }
}

fn malformed(env: &Envelope<Message>) -> Reply<Message> {
    Reply::Now(Err(Error::invalid_input(format!(
        "malformed '{}' message",
        env.topic
    ))))
}

fn unexpected(reply: &Message) -> Error {
    use tabtrail_bus::Payload;
    Error::invalid_state(format!("unexpected '{}' reply from page", reply.topic()))
}

fn coordinator_router() -> Router<CoordinatorState, Message> {
    Router::new()
        .on(topic::START_RECORD, |s: &mut CoordinatorState, ep, env| s.start_record(ep, env))
        .on(topic::PAUSE, |s: &mut CoordinatorState, ep, env| s.pause(ep, env))
        .on(topic::RESUME, |s: &mut CoordinatorState, ep, env| s.resume(ep, env))
        .on(topic::STOP, |s: &mut CoordinatorState, ep, env| s.stop(ep, env))
        .on(topic::START_REPLAY, |s: &mut CoordinatorState, ep, env| s.start_replay(ep, env))
        .on(topic::ABORT_REPLAY, |s: &mut CoordinatorState, _, env| s.abort_replay(env))
        .on(topic::RECORD_ACTION, |s: &mut CoordinatorState, _, env| s.record_action(env))
        .on(topic::TAB_CLOSED, |s: &mut CoordinatorState, ep, env| s.tab_closed(ep, env))
        .on(topic::SESSION, |s: &mut CoordinatorState, _, env: &Envelope<Message>| {
            match env.payload() {
                Some(Message::Session { tab }) => {
                    Reply::Now(Ok(Message::Command(s.snapshot(*tab))))
                }
                _ => malformed(env),
            }
        })
        .on(topic::LIST_WORKFLOWS, |s: &mut CoordinatorState, _, _| {
            Reply::Now(s.store.list().map(Message::Workflows))
        })
}

pub struct Coordinator {
    endpoint: Endpoint<Message>,
    router: Router<CoordinatorState, Message>,
    state: CoordinatorState,
    recovery: RecoveryReport,
}

impl Coordinator {
    /// Attach as the background context. Sessions interrupted by the last
    /// shutdown are resolved before any message is served.
    pub fn new(
        bus: &Bus<Message>,
        store: WorkflowStore,
        journal: SessionJournal,
        config: EngineConfig,
    ) -> Result<Self> {
        let mut state = CoordinatorState {
            store,
            journal,
            config,
            sessions: HashMap::new(),
            pending: Vec::new(),
        };
        let recovery = recover(&mut state)?;
        Ok(Self {
            endpoint: bus.attach(ContextId::Background),
            router: coordinator_router(),
            state,
            recovery,
        })
    }

    /// Store and journal from `config.storage`
    pub fn open(bus: &Bus<Message>, config: EngineConfig) -> Result<Self> {
        let store = WorkflowStore::open(&config.storage)?;
        let journal = SessionJournal::in_dir(store.path())?;
        Self::new(bus, store, journal, config)
    }

    pub fn recovery(&self) -> &RecoveryReport {
        &self.recovery
    }

    /// Handle at most one message, then collect whatever pages have answered
    pub fn turn(&mut self, wait: Duration) {
        if let Some(envelope) = self.endpoint.recv_timeout(wait) {
            self.router.dispatch(&mut self.state, &self.endpoint, envelope);
        }
        self.state.poll_pending(&self.endpoint);
    }

    pub fn run(mut self, stop: &AtomicBool) {
        tracing::info!(store = %self.state.store.path().display(), "coordinator running");
        while !stop.load(Ordering::Relaxed) {
            self.turn(Duration::from_millis(POLL_MS));
        }
        tracing::info!("coordinator stopped");
    }

    pub fn spawn(self) -> Result<CoordinatorHandle> {
        let stop = Arc::new(AtomicBool::new(false));
        let recovery = self.recovery.clone();
        let stop1 = stop.clone();
        let thread = thread::Builder::new()
            .name("coordinator".into())
            .spawn(move || self.run(&stop1))?;
        Ok(CoordinatorHandle {
            stop,
            thread: Some(thread),
            recovery,
        })
    }
}

/// Seal recordings and close out replays the journal shows were cut off
fn recover(state: &mut CoordinatorState) -> Result<RecoveryReport> {
    let mut report = RecoveryReport::default();
    for (tab, entry) in state.journal.latest()? {
        match (entry.mode, entry.workflow_id) {
            (SessionMode::Recording | SessionMode::Paused, Some(id)) => match state
                .store
                .seal(&id)
            {
                Ok(summary) => {
                    tracing::info!(
                        tab = %tab,
                        workflow = %id,
                        steps = summary.steps,
                        "sealed interrupted recording"
                    );
                    report.sealed.push(summary);
                }
                Err(e) if e.code == ErrorCode::WorkflowNotFound => {
                    tracing::warn!(tab = %tab, workflow = %id, "interrupted recording has no file");
                }
                Err(e) => {
                    tracing::warn!(
                        tab = %tab,
                        workflow = %id,
                        error = %e,
                        "failed to seal interrupted recording"
                    );
                }
            },
            (SessionMode::Replaying, Some(id)) => {
                let total = state.store.load(&id).map(|w| w.steps.len()).unwrap_or(0);
                let mut aborted = ReplayReport::new(id.clone(), Some(tab), total);
                aborted.last_completed = entry.cursor as u64;
                aborted.finish(ReplayStatus::Aborted);
                tracing::info!(
                    tab = %tab,
                    workflow = %id,
                    cursor = entry.cursor,
                    "interrupted replay aborted"
                );

                let mut session = Session::new(tab);
                session.last_report = Some(aborted.clone());
                state.sessions.insert(tab, session);
                report.aborted.push(aborted);
            }
            _ => {}
        }
    }
    state.journal.compact(&[])?;
    Ok(report)
}

/// A coordinator running on its own thread
pub struct CoordinatorHandle {
    stop: Arc<AtomicBool>,
    thread: Option<thread::JoinHandle<()>>,
    recovery: RecoveryReport,
}

impl CoordinatorHandle {
    pub fn recovery(&self) -> &RecoveryReport {
        &self.recovery
    }

    pub fn shutdown(mut self) {
        self.stop_thread();
    }

    fn stop_thread(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(t) = self.thread.take() {
            let _ = t.join();
        }
    }
}

impl Drop for CoordinatorHandle {
    fn drop(&mut self) {
        self.stop_thread();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::ActionRecord;
    use tabtrail_core::config::BusConfig;
    use tabtrail_core::{ElementLocator, Strategy};
    use tempfile::TempDir;

    fn setup(dir: &TempDir) -> (Bus<Message>, Coordinator) {
        let bus = Bus::new(BusConfig {
            request_timeout_ms: 500,
            retry_base_ms: 1,
            max_delivery_attempts: 2,
            ..Default::default()
        });
        let store = WorkflowStore::with_dir(dir.path()).unwrap();
        let journal = SessionJournal::in_dir(dir.path()).unwrap();
        let coordinator = Coordinator::new(&bus, store, journal, EngineConfig::default()).unwrap();
        (bus, coordinator)
    }

    fn click(index: u64) -> ActionRecord {
        let by_id = Strategy::Id {
            attr: "id".into(),
            value: "go".into(),
        };
        ActionRecord::click(index, vec![ElementLocator::new(by_id, 1, 100)])
    }

    #[test]
    fn start_record_without_page_fails_and_leaves_nothing() {
        let dir = TempDir::new().unwrap();
        let (bus, mut coordinator) = setup(&dir);
        let panel = bus.attach(ContextId::panel("popup"));

        let pending = panel
            .request_deferred(
                ContextId::Background,
                Message::StartRecord {
                    tab: TabId(9),
                    name: "orphan".into(),
                    origin: "https://a.test".into(),
                },
                Duration::from_secs(2),
            )
            .unwrap();
        coordinator.turn(Duration::from_millis(100));

        let err = pending.wait().unwrap_err();
        assert_eq!(err.code, ErrorCode::UnreachableContext);
        assert!(err.context.is_some());
        assert!(coordinator.state.store.list().unwrap().is_empty());
        assert_eq!(coordinator.state.mode(TabId(9)), SessionMode::Idle);
    }

    fn record(page: &Endpoint<Message>, index: u64) -> PendingReply<Message> {
        page.request_deferred(
            ContextId::Background,
            Message::RecordAction(click(index)),
            Duration::from_secs(1),
        )
        .unwrap()
    }

    #[test]
    fn record_action_checks_mode_and_sequence() {
        let dir = TempDir::new().unwrap();
        let (bus, mut coordinator) = setup(&dir);
        let page = bus.attach(ContextId::page(1));

        // not recording yet
        let pending = record(&page, 1);
        coordinator.turn(Duration::from_millis(100));
        assert_eq!(pending.wait().unwrap_err().code, ErrorCode::InvalidState);

        let workflow = Workflow::new("direct", "https://a.test");
        coordinator.state.store.create(&workflow).unwrap();
        let mut session = Session::new(TabId(1));
        session.mode = SessionMode::Recording;
        session.workflow = Some(workflow);
        coordinator.state.sessions.insert(TabId(1), session);

        let pending = record(&page, 2);
        coordinator.turn(Duration::from_millis(100));
        assert_eq!(pending.wait().unwrap_err().code, ErrorCode::InvalidSequence);

        let pending = record(&page, 1);
        coordinator.turn(Duration::from_millis(100));
        assert_eq!(pending.wait().unwrap(), Message::Recorded { index: 1 });
        assert_eq!(coordinator.state.snapshot(TabId(1)).steps, 1);
    }

    #[test]
    fn ending_a_session_compacts_the_journal() {
        let dir = TempDir::new().unwrap();
        let (_bus, mut coordinator) = setup(&dir);
        let journal = SessionJournal::in_dir(dir.path()).unwrap();

        let mut ids = Vec::new();
        for tab in [TabId(1), TabId(2)] {
            let workflow = Workflow::new("live", "https://a.test");
            coordinator.state.store.create(&workflow).unwrap();
            ids.push(workflow.id.clone());
            let mut session = Session::new(tab);
            session.mode = SessionMode::Recording;
            session.workflow = Some(workflow);
            coordinator.state.sessions.insert(tab, session);
            for _ in 0..3 {
                coordinator.state.journal(tab);
            }
        }
        assert_eq!(journal.entries().unwrap().len(), 6);

        coordinator.state.finish_recording(TabId(1)).unwrap();

        let entries = journal.entries().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].tab, TabId(2));
        assert_eq!(entries[0].mode, SessionMode::Recording);
        assert_eq!(entries[0].workflow_id.as_deref(), Some(ids[1].as_str()));
        assert!(coordinator.state.store.load_stored(&ids[0]).unwrap().sealed);
    }

    #[test]
    fn recovery_seals_recordings_and_aborts_replays() {
        let dir = TempDir::new().unwrap();
        let store = WorkflowStore::with_dir(dir.path()).unwrap();
        let journal = SessionJournal::in_dir(dir.path()).unwrap();

        let mut recorded = Workflow::new("cut off", "https://a.test");
        recorded.push(click(1)).unwrap();
        store.create(&recorded).unwrap();
        let entry =
            JournalEntry::new(TabId(1), SessionMode::Recording, Some(recorded.id.clone()), 0);
        journal.record(&entry).unwrap();

        let mut replayed = Workflow::new("replayed", "https://a.test");
        replayed.push(click(1)).unwrap();
        replayed.push(click(2)).unwrap();
        store.create(&replayed).unwrap();
        store.seal(&replayed.id).unwrap();
        let entry =
            JournalEntry::new(TabId(2), SessionMode::Replaying, Some(replayed.id.clone()), 1);
        journal.record(&entry).unwrap();

        let (_bus, coordinator) = setup(&dir);
        let recovery = coordinator.recovery();
        assert_eq!(recovery.sealed.len(), 1);
        assert_eq!(recovery.sealed[0].id, recorded.id);
        assert!(store.load_stored(&recorded.id).unwrap().sealed);

        assert_eq!(recovery.aborted.len(), 1);
        assert_eq!(recovery.aborted[0].status, ReplayStatus::Aborted);
        assert_eq!(recovery.aborted[0].total_steps, 2);
        assert_eq!(recovery.aborted[0].last_completed, 1);
        assert!(journal.entries().unwrap().is_empty());

        let snapshot = coordinator.state.snapshot(TabId(2));
        assert_eq!(snapshot.mode, SessionMode::Idle);
        assert!(snapshot.last_report.is_some());
    }
}
