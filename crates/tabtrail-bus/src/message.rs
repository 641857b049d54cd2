//! Message envelopes

use crate::context::ContextId;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tabtrail_core::Error;
use uuid::Uuid;

/// Pairs a response with its request and deduplicates deliveries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(pub Uuid);

impl CorrelationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Protocol payloads carried by the bus. `topic` is the envelope's type tag.
pub trait Payload: Clone + std::fmt::Debug + Send + Serialize + DeserializeOwned + 'static {
    fn topic(&self) -> &'static str;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Request,
    Response,
    Event,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", content = "body", rename_all = "lowercase")]
pub enum Body<P> {
    Request(P),
    Response(Result<P, Error>),
    Event(P),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope<P> {
    pub topic: String,
    pub correlation_id: CorrelationId,
    pub source: ContextId,
    pub target: ContextId,
    #[serde(flatten)]
    pub body: Body<P>,
}

impl<P: Payload> Envelope<P> {
    pub fn request(source: ContextId, target: ContextId, payload: P) -> Self {
        Self {
            topic: payload.topic().to_string(),
            correlation_id: CorrelationId::new(),
            source,
            target,
            body: Body::Request(payload),
        }
    }

    pub fn event(source: ContextId, target: ContextId, payload: P) -> Self {
        Self {
            topic: payload.topic().to_string(),
            correlation_id: CorrelationId::new(),
            source,
            target,
            body: Body::Event(payload),
        }
    }

    /// Response travelling back to the requester, same correlation id
    pub fn response_to(request: &Envelope<P>, result: Result<P, Error>) -> Self {
        Self {
            topic: request.topic.clone(),
            correlation_id: request.correlation_id,
            source: request.target.clone(),
            target: request.source.clone(),
            body: Body::Response(result),
        }
    }

    pub fn kind(&self) -> MessageKind {
        match self.body {
            Body::Request(_) => MessageKind::Request,
            Body::Response(_) => MessageKind::Response,
            Body::Event(_) => MessageKind::Event,
        }
    }

    /// Request or event payload
    pub fn payload(&self) -> Option<&P> {
        match &self.body {
            Body::Request(p) | Body::Event(p) => Some(p),
            Body::Response(_) => None,
        }
    }

    pub fn into_result(self) -> Result<P, Error> {
        match self.body {
            Body::Response(r) => r,
            Body::Request(p) | Body::Event(p) => Ok(p),
        }
    }
}
