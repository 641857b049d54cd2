//! Messages exchanged between panels, the coordinator and page contexts

use crate::events::ActionRecord;
use crate::storage::WorkflowSummary;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tabtrail_bus::{Payload, TabId};
use tabtrail_core::{Error, ErrorCode};

pub mod topic {
    pub const START_RECORD: &str = "start-record";
    pub const PAUSE: &str = "pause";
    pub const RESUME: &str = "resume";
    pub const STOP: &str = "stop";
    pub const START_REPLAY: &str = "start-replay";
    pub const ABORT_REPLAY: &str = "abort-replay";
    pub const SESSION: &str = "session";
    pub const LIST_WORKFLOWS: &str = "list-workflows";
    pub const TAB_CLOSED: &str = "tab-closed";
    pub const COMMAND: &str = "command";
    pub const WORKFLOWS: &str = "workflows";
    pub const BEGIN_CAPTURE: &str = "begin-capture";
    pub const END_CAPTURE: &str = "end-capture";
    pub const EXECUTE_STEP: &str = "execute-step";
    pub const CAPTURE_STARTED: &str = "capture-started";
    pub const CAPTURE_ENDED: &str = "capture-ended";
    pub const STEP_OUTCOME: &str = "step-outcome";
    pub const RECORD_ACTION: &str = "record-action";
    pub const RECORDED: &str = "recorded";
    pub const REPLAY_FINISHED: &str = "replay-finished";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "kebab-case")]
pub enum Message {
    // panel -> coordinator
    StartRecord { tab: TabId, name: String, origin: String },
    Pause { tab: TabId },
    Resume { tab: TabId },
    Stop { tab: TabId },
    StartReplay { workflow_id: String, tab: TabId },
    AbortReplay { tab: TabId },
    Session { tab: TabId },
    ListWorkflows,
    TabClosed { tab: TabId },

    // coordinator -> panel
    Command(SessionSnapshot),
    Workflows(Vec<WorkflowSummary>),
    ReplayFinished(ReplayReport),

    // coordinator -> page
    BeginCapture { workflow_id: String, next_index: u64 },
    EndCapture,
    ExecuteStep(ActionRecord),

    // page -> coordinator
    CaptureStarted { next_index: u64 },
    CaptureEnded { next_index: u64 },
    StepOutcome(StepOutcome),
    RecordAction(ActionRecord),
    Recorded { index: u64 },
}

impl Payload for Message {
    fn topic(&self) -> &'static str {
        match self {
            Self::StartRecord { .. } => topic::START_RECORD,
            Self::Pause { .. } => topic::PAUSE,
            Self::Resume { .. } => topic::RESUME,
            Self::Stop { .. } => topic::STOP,
            Self::StartReplay { .. } => topic::START_REPLAY,
            Self::AbortReplay { .. } => topic::ABORT_REPLAY,
            Self::Session { .. } => topic::SESSION,
            Self::ListWorkflows => topic::LIST_WORKFLOWS,
            Self::TabClosed { .. } => topic::TAB_CLOSED,
            Self::Command(_) => topic::COMMAND,
            Self::Workflows(_) => topic::WORKFLOWS,
            Self::ReplayFinished(_) => topic::REPLAY_FINISHED,
            Self::BeginCapture { .. } => topic::BEGIN_CAPTURE,
            Self::EndCapture => topic::END_CAPTURE,
            Self::ExecuteStep(_) => topic::EXECUTE_STEP,
            Self::CaptureStarted { .. } => topic::CAPTURE_STARTED,
            Self::CaptureEnded { .. } => topic::CAPTURE_ENDED,
            Self::StepOutcome(_) => topic::STEP_OUTCOME,
            Self::RecordAction(_) => topic::RECORD_ACTION,
            Self::Recorded { .. } => topic::RECORDED,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionMode {
    Idle,
    Recording,
    Paused,
    Replaying,
}

impl SessionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Recording => "recording",
            Self::Paused => "paused",
            Self::Replaying => "replaying",
        }
    }
}

impl std::fmt::Display for SessionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a panel sees of one tab's session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub tab: TabId,
    pub mode: SessionMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_name: Option<String>,
    /// Records committed so far
    pub steps: usize,
    /// Index the next recorded action will carry
    pub next_index: u64,
    /// 0-based position of the next replay step
    pub cursor: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_report: Option<ReplayReport>,
}

impl SessionSnapshot {
    pub fn idle(tab: TabId) -> Self {
        Self {
            tab,
            mode: SessionMode::Idle,
            workflow_id: None,
            workflow_name: None,
            steps: 0,
            next_index: 1,
            cursor: 0,
            last_report: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StepStatus {
    Success,
    ElementNotFound,
    LocatorUnresolvable,
    AmbiguousMatch,
    ActionFailed,
    Timeout,
}

impl StepStatus {
    pub fn from_code(code: ErrorCode) -> Self {
        match code {
            ErrorCode::ElementNotFound => Self::ElementNotFound,
            ErrorCode::LocatorUnresolvable => Self::LocatorUnresolvable,
            ErrorCode::AmbiguousMatch => Self::AmbiguousMatch,
            ErrorCode::Timeout => Self::Timeout,
            _ => Self::ActionFailed,
        }
    }
}

/// Result of executing one step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepOutcome {
    pub index: u64,
    pub status: StepStatus,
    /// Which candidate locator found the element
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locator_index: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Error>,
    pub duration_ms: u64,
}

impl StepOutcome {
    pub fn success(index: u64, locator_index: Option<usize>, duration_ms: u64) -> Self {
        Self {
            index,
            status: StepStatus::Success,
            locator_index,
            error: None,
            duration_ms,
        }
    }

    pub fn failure(index: u64, error: Error, duration_ms: u64) -> Self {
        Self {
            index,
            status: StepStatus::from_code(error.code),
            locator_index: None,
            error: Some(error),
            duration_ms,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == StepStatus::Success
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReplayStatus {
    Running,
    Completed,
    Failed,
    Aborted,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplayReport {
    pub workflow_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tab: Option<TabId>,
    pub status: ReplayStatus,
    pub total_steps: usize,
    /// Index of the last step that succeeded, 0 if none did
    pub last_completed: u64,
    pub outcomes: Vec<StepOutcome>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl ReplayReport {
    pub fn new(workflow_id: impl Into<String>, tab: Option<TabId>, total_steps: usize) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            tab,
            status: ReplayStatus::Running,
            total_steps,
            last_completed: 0,
            outcomes: Vec::new(),
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    pub fn push(&mut self, outcome: StepOutcome) {
        if outcome.is_success() {
            self.last_completed = outcome.index;
        }
        self.outcomes.push(outcome);
    }

    pub fn finish(&mut self, status: ReplayStatus) {
        self.status = status;
        self.finished_at = Some(Utc::now());
    }

    /// The outcome that stopped the replay, if one did
    pub fn failure(&self) -> Option<&StepOutcome> {
        self.outcomes.iter().find(|o| !o.is_success())
    }

    pub fn succeeded(&self) -> bool {
        self.status == ReplayStatus::Completed
    }
}
