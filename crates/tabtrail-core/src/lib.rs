//! tabtrail-core - page model and locators for browser workflow recording
//!
//! The pure, context-free half of the engine: an in-memory DOM, the locator
//! strategies that point into it, synthesis of ranked locators for a node and
//! strict resolution of those locators against a page that may have changed.
//!
//! ## Modules
//!
//! - **dom**: arena DOM shared by a page context and its driver
//! - **selector**: locator strategies and their match semantics
//! - **synth**: ranked locator synthesis
//! - **locator**: resolution with fallbacks and retries
//! - **config**: engine configuration
//! - **error**: structured, serializable errors

pub mod config;
pub mod dom;
pub mod error;
pub mod locator;
pub mod selector;
pub mod synth;

pub use config::EngineConfig;
pub use dom::{Document, Element, NodeId, PageSnapshot, SharedDocument};
pub use error::{Error, ErrorCode, Result};
pub use locator::{Locator, Resolved};
pub use selector::{ElementLocator, LocatorKind, Strategy};
pub use synth::{synthesize, Synthesizer};

pub mod prelude {
    pub use crate::config::EngineConfig;
    pub use crate::dom::{Document, Element, NodeId, PageSnapshot, SharedDocument};
    pub use crate::error::{Error, ErrorCode, Result};
    pub use crate::locator::{Locator, Resolved};
    pub use crate::selector::{ElementLocator, LocatorKind, Strategy};
    pub use crate::synth::{synthesize, Synthesizer};
}
