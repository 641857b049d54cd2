//! # tabtrail
//!
//! Record what a user does in a browser tab and replay it later, even after
//! the page has changed underneath.
//!
//! ## Features
//!
//! - **Recording**: clicks, coalesced text input, named keys and navigation
//! - **Locators**: several ranked ways to find each element again
//! - **Replay**: strict resolution with retries, stopping at the first failure
//! - **Contexts**: coordinator, pages and panels that only share a message bus
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use tabtrail::prelude::*;
//!
//! let config = EngineConfig::default();
//! let bus = Bus::new(config.bus.clone());
//! let coordinator = Coordinator::open(&bus, config.clone())?.spawn()?;
//!
//! let page = PageSnapshot::load("signup.json")?;
//! let doc = page.to_document().into_shared();
//! let driver = DocumentDriver::new(doc.clone()).page(&page.url, page.root.clone());
//! let tab = PageAgent::spawn(&bus, TabId(1), doc, driver, &config)?;
//!
//! let panel = PanelClient::attach(&bus, "popup");
//! panel.start_record(TabId(1), "signup", "https://app.test")?;
//! let submit = tab.document().lock().by_id("submit").unwrap();
//! tab.click(submit)?;
//! let done = panel.stop(TabId(1))?;
//! println!("{} steps", done.steps);
//! coordinator.shutdown();
//! # Ok::<(), tabtrail::Error>(())
//! ```

// Page model and locators
pub use tabtrail_core::*;

pub use tabtrail_bus as bus;
pub use tabtrail_recorder as recorder;

pub use tabtrail_bus::{Bus, ContextId, TabId};
pub use tabtrail_recorder::{
    ActionKind, ActionRecord, Coordinator, CoordinatorHandle, DocumentDriver, Message, Modifiers,
    PageAgent, PageHandle, PanelClient, ReplayReport, Replayer, SessionSnapshot, Workflow,
    WorkflowStore,
};

/// Prelude - import everything you need
pub mod prelude {
    pub use tabtrail_bus::prelude::*;
    pub use tabtrail_core::prelude::*;
    pub use tabtrail_recorder::prelude::*;
}
