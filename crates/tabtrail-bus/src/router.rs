//! Per-topic message handlers for one context

use crate::bus::Endpoint;
use crate::message::{Envelope, MessageKind, Payload};
use std::collections::HashMap;
use tabtrail_core::{Error, Result};

/// What a handler did with a message. `Deferred` means the handler kept the
/// request and will answer it later through [`Endpoint::respond`].
pub enum Reply<P> {
    Now(Result<P>),
    Deferred,
}

pub type Handler<S, P> = Box<dyn FnMut(&mut S, &Endpoint<P>, &Envelope<P>) -> Reply<P> + Send>;

pub struct Router<S, P: Payload> {
    handlers: HashMap<&'static str, Handler<S, P>>,
}

impl<S, P: Payload> Router<S, P> {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Register the handler for `topic`, replacing any previous one
    pub fn on<F>(mut self, topic: &'static str, handler: F) -> Self
    where
        F: FnMut(&mut S, &Endpoint<P>, &Envelope<P>) -> Reply<P> + Send + 'static,
    {
        self.handlers.insert(topic, Box::new(handler));
        self
    }

    pub fn handles(&self, topic: &str) -> bool {
        self.handlers.contains_key(topic)
    }

    /// Run the handler for `envelope`. Requests always get an answer: the
    /// handler's, or an error when no handler is registered.
    pub fn dispatch(&mut self, state: &mut S, endpoint: &Endpoint<P>, envelope: Envelope<P>) {
        let is_request = envelope.kind() == MessageKind::Request;
        let Some(handler) = self.handlers.get_mut(envelope.topic.as_str()) else {
            tracing::warn!(context = %endpoint.id(), topic = %envelope.topic, "no handler");
            if is_request {
                endpoint.respond(
                    &envelope,
                    Err(Error::invalid_input(format!(
                        "{} has no handler for '{}'",
                        endpoint.id(),
                        envelope.topic
                    ))),
                );
            }
            return;
        };

        match handler(state, endpoint, &envelope) {
            Reply::Now(result) if is_request => endpoint.respond(&envelope, result),
            Reply::Now(Err(e)) => {
                tracing::warn!(topic = %envelope.topic, error = %e, "event handler failed");
            }
            Reply::Now(Ok(_)) | Reply::Deferred => {}
        }
    }
}

impl<S, P: Payload> Default for Router<S, P> {
    fn default() -> Self {
        Self::new()
    }
}
