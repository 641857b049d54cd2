//! tabtrail-bus - typed messaging between isolated extension contexts
//!
//! The background coordinator, page scripts and UI panels share no memory.
//! They talk through envelopes carrying a topic, a correlation id, source and
//! target context ids and a typed payload.
//!
//! - Requests get exactly one response or a `timeout` failure
//! - Deliveries to a context that is not attached yet are retried with
//!   backoff, then fail with `unreachable-context`
//! - Receivers drop repeats of a correlation id they already processed

pub mod bus;
pub mod context;
pub mod message;
pub mod router;

pub use bus::{Bus, Endpoint, PendingReply};
pub use context::{ContextId, TabId};
pub use message::{Body, CorrelationId, Envelope, MessageKind, Payload};
pub use router::{Reply, Router};

pub mod prelude {
    pub use crate::bus::{Bus, Endpoint, PendingReply};
    pub use crate::context::{ContextId, TabId};
    pub use crate::message::{Body, CorrelationId, Envelope, MessageKind, Payload};
    pub use crate::router::{Reply, Router};
}
