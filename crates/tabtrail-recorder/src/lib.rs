//! tabtrail-recorder - workflow capture, session coordination and replay
//!
//! One background coordinator owns every tab's session and the workflow
//! store. Each tab runs a page context that captures user actions and
//! replays steps against its own document. UI panels drive sessions through
//! [`PanelClient`]. All three talk only over the message bus.
//!
//! ## Modules
//!
//! - **events**: action records and workflows
//! - **protocol**: bus messages, session snapshots and replay reports
//! - **recorder**: action capture with input coalescing
//! - **replay**: step execution with retries and settle detection
//! - **storage**: append-only JSONL workflow files
//! - **journal**: session transitions, for crash recovery
//! - **page**: the per-tab context
//! - **coordinator**: the background context
//! - **panel**: the UI-side client

pub mod coordinator;
pub mod events;
pub mod journal;
pub mod page;
pub mod panel;
pub mod protocol;
pub mod recorder;
pub mod replay;
pub mod storage;

pub use coordinator::{Coordinator, CoordinatorHandle, RecoveryReport};
pub use events::*;
pub use journal::{JournalEntry, SessionJournal};
pub use page::{PageAgent, PageHandle};
pub use panel::PanelClient;
pub use protocol::{
    Message, ReplayReport, ReplayStatus, SessionMode, SessionSnapshot, StepOutcome, StepStatus,
};
pub use recorder::CaptureEngine;
pub use replay::{DocumentDriver, InteractionDriver, Replayer};
pub use storage::{StoredWorkflow, WorkflowStore, WorkflowSummary};

pub mod prelude {
    pub use crate::coordinator::{Coordinator, CoordinatorHandle, RecoveryReport};
    pub use crate::events::*;
    pub use crate::page::{PageAgent, PageHandle};
    pub use crate::panel::PanelClient;
    pub use crate::protocol::{
        Message, ReplayReport, ReplayStatus, SessionMode, SessionSnapshot, StepOutcome,
        StepStatus,
    };
    pub use crate::replay::{DocumentDriver, InteractionDriver, Replayer};
    pub use crate::storage::{WorkflowStore, WorkflowSummary};
}
