//! UI-side client: what the popup and side panels call

use crate::protocol::{Message, ReplayReport, SessionSnapshot};
use crate::storage::WorkflowSummary;
use std::time::{Duration, Instant};
use tabtrail_bus::{Bus, ContextId, Endpoint, Payload, TabId};
use tabtrail_core::{Error, Result};

pub struct PanelClient {
    endpoint: Endpoint<Message>,
    timeout: Duration,
}

impl PanelClient {
    /// Attach a panel context named `name`. Commands wait twice the bus
    /// timeout, so a coordinator waiting on an unresponsive page answers first.
    pub fn attach(bus: &Bus<Message>, name: &str) -> Self {
        Self {
            endpoint: bus.attach(ContextId::panel(name)),
            timeout: bus.config().request_timeout() * 2,
        }
    }

    pub fn start_record(&self, tab: TabId, name: &str, origin: &str) -> Result<SessionSnapshot> {
        self.command(Message::StartRecord {
            tab,
            name: name.to_string(),
            origin: origin.to_string(),
        })
    }

    pub fn pause(&self, tab: TabId) -> Result<SessionSnapshot> {
        self.command(Message::Pause { tab })
    }

    pub fn resume(&self, tab: TabId) -> Result<SessionSnapshot> {
        self.command(Message::Resume { tab })
    }

    pub fn stop(&self, tab: TabId) -> Result<SessionSnapshot> {
        self.command(Message::Stop { tab })
    }

    pub fn start_replay(&self, workflow_id: &str, tab: TabId) -> Result<SessionSnapshot> {
        self.command(Message::StartReplay {
            workflow_id: workflow_id.to_string(),
            tab,
        })
    }

    pub fn abort_replay(&self, tab: TabId) -> Result<SessionSnapshot> {
        self.command(Message::AbortReplay { tab })
    }

    pub fn session(&self, tab: TabId) -> Result<SessionSnapshot> {
        self.command(Message::Session { tab })
    }

    pub fn list_workflows(&self) -> Result<Vec<WorkflowSummary>> {
        match self.request(Message::ListWorkflows)? {
            Message::Workflows(list) => Ok(list),
            other => Err(unexpected(&other)),
        }
    }

    /// Tell the coordinator a tab went away
    pub fn tab_closed(&self, tab: TabId) -> Result<()> {
        self.endpoint.emit(ContextId::Background, Message::TabClosed { tab })
    }

    /// Wait for the next replay report broadcast to panels
    pub fn next_report(&mut self, timeout: Duration) -> Option<ReplayReport> {
        let deadline = Instant::now() + timeout;
        loop {
            let left = deadline.checked_duration_since(Instant::now())?;
            match self.endpoint.recv_timeout(left)?.payload() {
                Some(Message::ReplayFinished(report)) => return Some(report.clone()),
                Some(other) => tracing::debug!(topic = other.topic(), "panel ignoring message"),
                None => {}
            }
        }
    }

    fn request(&self, message: Message) -> Result<Message> {
        self.endpoint
            .request_timeout(ContextId::Background, message, self.timeout)
    }

    fn command(&self, message: Message) -> Result<SessionSnapshot> {
        match self.request(message)? {
            Message::Command(snapshot) => Ok(snapshot),
            other => Err(unexpected(&other)),
        }
    }
}

fn unexpected(reply: &Message) -> Error {
    Error::invalid_state(format!("unexpected '{}' reply from coordinator", reply.topic()))
}
