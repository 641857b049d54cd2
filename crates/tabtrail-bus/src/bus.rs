//! Cross-context message bus
//!
//! Each context attaches once and gets an [`Endpoint`] with its own bounded
//! inbox. Requests and events are routed to the target's inbox; responses go
//! straight to the waiting requester through a pending table keyed by
//! correlation id, so a context blocked in `request` never has to pump its own
//! inbox to see the answer.

use crate::context::ContextId;
use crate::message::{CorrelationId, Envelope, MessageKind, Payload};
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tabtrail_core::config::BusConfig;
use tabtrail_core::{Error, Result};

struct Route<P> {
    generation: u64,
    tx: Sender<Envelope<P>>,
}

struct Inner<P> {
    config: BusConfig,
    routes: RwLock<HashMap<ContextId, Route<P>>>,
    pending: Mutex<HashMap<CorrelationId, Sender<Envelope<P>>>>,
    generation: AtomicU64,
}

pub struct Bus<P> {
    inner: Arc<Inner<P>>,
}

impl<P> Clone for Bus<P> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<P: Payload> Bus<P> {
    pub fn new(config: BusConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                routes: RwLock::new(HashMap::new()),
                pending: Mutex::new(HashMap::new()),
                generation: AtomicU64::new(0),
            }),
        }
    }

    pub fn config(&self) -> &BusConfig {
        &self.inner.config
    }

    /// Attach a context. Re-attaching an id (a restarted context) replaces the
    /// previous route; messages still queued for the old endpoint are lost.
    pub fn attach(&self, id: ContextId) -> Endpoint<P> {
        let (tx, rx) = bounded(self.inner.config.inbox_capacity.max(1));
        let generation = self.inner.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let replaced = self
            .inner
            .routes
            .write()
            .insert(id.clone(), Route { generation, tx })
            .is_some();
        if replaced {
            tracing::info!(context = %id, "context re-attached");
        } else {
            tracing::debug!(context = %id, "context attached");
        }
        Endpoint {
            id,
            generation,
            bus: self.clone(),
            inbox: rx,
            seen: Dedup::new(self.inner.config.dedup_window),
        }
    }

    pub fn detach(&self, id: &ContextId) {
        if self.inner.routes.write().remove(id).is_some() {
            tracing::debug!(context = %id, "context detached");
        }
    }

    fn detach_generation(&self, id: &ContextId, generation: u64) {
        let mut routes = self.inner.routes.write();
        if routes.get(id).map(|r| r.generation) == Some(generation) {
            routes.remove(id);
            tracing::debug!(context = %id, "context detached");
        }
    }

    pub fn is_attached(&self, id: &ContextId) -> bool {
        self.inner.routes.read().contains_key(id)
    }

    pub fn contexts(&self) -> Vec<ContextId> {
        self.inner.routes.read().keys().cloned().collect()
    }

    /// Deliver a request or event, retrying with exponential backoff while the
    /// target is not attached or its inbox is full.
    pub fn deliver(&self, envelope: Envelope<P>) -> Result<()> {
        if envelope.kind() == MessageKind::Response {
            return self.complete(envelope);
        }

        let attempts = self.inner.config.max_delivery_attempts.max(1);
        let mut delay = Duration::from_millis(self.inner.config.retry_base_ms);
        let mut envelope = envelope;

        for attempt in 1..=attempts {
            let tx = self
                .inner
                .routes
                .read()
                .get(&envelope.target)
                .map(|r| r.tx.clone());

            if let Some(tx) = tx {
                match tx.try_send(envelope) {
                    Ok(()) => return Ok(()),
                    Err(TrySendError::Full(e)) | Err(TrySendError::Disconnected(e)) => envelope = e,
                }
            }

            if attempt < attempts {
                tracing::warn!(
                    target_context = %envelope.target,
                    topic = %envelope.topic,
                    attempt,
                    "target not ready, retrying in {:?}",
                    delay
                );
                std::thread::sleep(delay);
                delay *= 2;
            }
        }

        Err(Error::unreachable(&envelope.target.to_string(), attempts)
            .with_context(serde_json::json!({ "topic": envelope.topic })))
    }

    /// Hand a response to its waiting requester. A response nobody waits for
    /// (late, or a second answer to the same request) is dropped.
    fn complete(&self, envelope: Envelope<P>) -> Result<()> {
        let waiter = self.inner.pending.lock().remove(&envelope.correlation_id);
        match waiter {
            Some(tx) => {
                let _ = tx.send(envelope);
            }
            None => {
                tracing::warn!(
                    correlation_id = %envelope.correlation_id,
                    topic = %envelope.topic,
                    "dropping response with no pending request"
                );
            }
        }
        Ok(())
    }

    fn register(&self, id: CorrelationId) -> Receiver<Envelope<P>> {
        let (tx, rx) = bounded(1);
        self.inner.pending.lock().insert(id, tx);
        rx
    }

    fn forget(&self, id: &CorrelationId) {
        self.inner.pending.lock().remove(id);
    }

    pub fn pending_requests(&self) -> usize {
        self.inner.pending.lock().len()
    }
}

/// A context's handle on the bus. Dropping it detaches the context.
pub struct Endpoint<P: Payload> {
    id: ContextId,
    generation: u64,
    bus: Bus<P>,
    inbox: Receiver<Envelope<P>>,
    seen: Dedup,
}

impl<P: Payload> Endpoint<P> {
    pub fn id(&self) -> &ContextId {
        &self.id
    }

    pub fn bus(&self) -> &Bus<P> {
        &self.bus
    }

    /// Send a request and block until the response or the configured timeout
    pub fn request(&self, target: ContextId, payload: P) -> Result<P> {
        self.request_timeout(target, payload, self.bus.config().request_timeout())
    }

    pub fn request_timeout(&self, target: ContextId, payload: P, timeout: Duration) -> Result<P> {
        self.request_deferred(target, payload, timeout)?.wait()
    }

    /// Send a request without waiting. Delivery failures surface here; the
    /// response (or its timeout) is collected from the returned handle.
    pub fn request_deferred(
        &self,
        target: ContextId,
        payload: P,
        timeout: Duration,
    ) -> Result<PendingReply<P>> {
        let envelope = Envelope::request(self.id.clone(), target, payload);
        let correlation_id = envelope.correlation_id;
        let topic = envelope.topic.clone();
        let rx = self.bus.register(correlation_id);

        tracing::debug!(
            from = %self.id,
            to = %envelope.target,
            topic = %topic,
            correlation_id = %correlation_id,
            "request"
        );

        if let Err(e) = self.bus.deliver(envelope) {
            self.bus.forget(&correlation_id);
            return Err(e);
        }

        Ok(PendingReply {
            correlation_id,
            topic,
            rx,
            deadline: Instant::now() + timeout,
            timeout,
            bus: self.bus.clone(),
        })
    }

    /// Fire-and-forget event
    pub fn emit(&self, target: ContextId, payload: P) -> Result<()> {
        self.send(Envelope::event(self.id.clone(), target, payload))
    }

    /// Send a prebuilt envelope. Sending the same envelope twice is safe: the
    /// receiver drops the repeat by correlation id.
    pub fn send(&self, envelope: Envelope<P>) -> Result<()> {
        self.bus.deliver(envelope)
    }

    /// Emit an event to every attached context accepted by `filter`.
    /// Returns how many received it.
    pub fn broadcast<F>(&self, filter: F, payload: P) -> usize
    where
        F: Fn(&ContextId) -> bool,
    {
        self.bus
            .contexts()
            .into_iter()
            .filter(|c| *c != self.id && filter(c))
            .filter(|c| match self.emit(c.clone(), payload.clone()) {
                Ok(()) => true,
                Err(e) => {
                    tracing::warn!(context = %c, error = %e, "broadcast delivery failed");
                    false
                }
            })
            .count()
    }

    /// Answer a request. Only the first answer for a correlation id counts.
    pub fn respond(&self, request: &Envelope<P>, result: Result<P>) {
        if request.kind() != MessageKind::Request {
            tracing::warn!(topic = %request.topic, "respond called for a non-request");
            return;
        }
        let _ = self.bus.deliver(Envelope::response_to(request, result));
    }

    /// Next new message, waiting up to `timeout`. Duplicates are skipped.
    pub fn recv_timeout(&mut self, timeout: Duration) -> Option<Envelope<P>> {
        let deadline = Instant::now() + timeout;
        loop {
            let envelope = self.inbox.recv_deadline(deadline).ok()?;
            if let Some(envelope) = self.accept(envelope) {
                return Some(envelope);
            }
        }
    }

    pub fn try_recv(&mut self) -> Option<Envelope<P>> {
        while let Ok(envelope) = self.inbox.try_recv() {
            if let Some(envelope) = self.accept(envelope) {
                return Some(envelope);
            }
        }
        None
    }

    /// Raw inbox, for `select!` alongside other channels. Pass whatever it
    /// yields through [`Endpoint::accept`].
    pub fn inbox(&self) -> &Receiver<Envelope<P>> {
        &self.inbox
    }

    /// Dedup gate: `None` if this correlation id was already processed
    pub fn accept(&mut self, envelope: Envelope<P>) -> Option<Envelope<P>> {
        if self.seen.insert(envelope.correlation_id) {
            Some(envelope)
        } else {
            tracing::warn!(
                context = %self.id,
                topic = %envelope.topic,
                correlation_id = %envelope.correlation_id,
                "duplicate message dropped"
            );
            None
        }
    }
}

impl<P: Payload> Drop for Endpoint<P> {
    fn drop(&mut self) {
        self.bus.detach_generation(&self.id, self.generation);
    }
}

/// A request in flight
pub struct PendingReply<P: Payload> {
    correlation_id: CorrelationId,
    topic: String,
    rx: Receiver<Envelope<P>>,
    deadline: Instant,
    timeout: Duration,
    bus: Bus<P>,
}

impl<P: Payload> PendingReply<P> {
    pub fn correlation_id(&self) -> CorrelationId {
        self.correlation_id
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Block until the response or the deadline
    pub fn wait(self) -> Result<P> {
        match self.rx.recv_deadline(self.deadline) {
            Ok(envelope) => envelope.into_result(),
            Err(_) => Err(self.timeout_error()),
        }
    }

    /// Non-blocking check: `None` while still waiting, otherwise the response
    /// or a timeout failure.
    pub fn poll(&self) -> Option<Result<P>> {
        match self.rx.try_recv() {
            Ok(envelope) => Some(envelope.into_result()),
            Err(_) if Instant::now() >= self.deadline => Some(Err(self.timeout_error())),
            Err(_) => None,
        }
    }

    fn timeout_error(&self) -> Error {
        Error::timeout(
            &format!("response to {} ({})", self.topic, self.correlation_id),
            self.timeout.as_millis() as u64,
        )
    }
}

impl<P: Payload> Drop for PendingReply<P> {
    fn drop(&mut self) {
        self.bus.forget(&self.correlation_id);
    }
}

/// Bounded memory of recently seen correlation ids
struct Dedup {
    order: VecDeque<CorrelationId>,
    set: HashSet<CorrelationId>,
    capacity: usize,
}

impl Dedup {
    fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::new(),
            set: HashSet::new(),
            capacity: capacity.max(1),
        }
    }

    /// True when `id` is new
    fn insert(&mut self, id: CorrelationId) -> bool {
        if !self.set.insert(id) {
            return false;
        }
        self.order.push_back(id);
        if self.order.len() > self.capacity {
            if let Some(old) = self.order.pop_front() {
                self.set.remove(&old);
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};
    use tabtrail_core::ErrorCode;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    enum Ping {
        Ping(u32),
        Pong(u32),
    }

    impl Payload for Ping {
        fn topic(&self) -> &'static str {
            match self {
                Ping::Ping(_) => "ping",
                Ping::Pong(_) => "pong",
            }
        }
    }

    fn fast_bus() -> Bus<Ping> {
        Bus::new(BusConfig {
            request_timeout_ms: 500,
            max_delivery_attempts: 3,
            retry_base_ms: 10,
            ..Default::default()
        })
    }

    fn echo(mut endpoint: Endpoint<Ping>, count: usize) -> std::thread::JoinHandle<()> {
        std::thread::spawn(move || {
            for _ in 0..count {
                let Some(env) = endpoint.recv_timeout(Duration::from_secs(2)) else {
                    return;
                };
                if let Some(Ping::Ping(n)) = env.payload().cloned() {
                    endpoint.respond(&env, Ok(Ping::Pong(n + 1)));
                }
            }
        })
    }

    #[test]
    fn request_gets_matching_response() {
        let bus = fast_bus();
        let ui = bus.attach(ContextId::panel("popup"));
        let page = bus.attach(ContextId::page(1));
        let handle = echo(page, 2);

        assert_eq!(ui.request(ContextId::page(1), Ping::Ping(1)).unwrap(), Ping::Pong(2));
        assert_eq!(ui.request(ContextId::page(1), Ping::Ping(41)).unwrap(), Ping::Pong(42));
        handle.join().unwrap();
        assert_eq!(bus.pending_requests(), 0);
    }

    #[test]
    fn unanswered_request_times_out() {
        let bus = fast_bus();
        let ui = bus.attach(ContextId::panel("popup"));
        let _silent = bus.attach(ContextId::Background);

        let err = ui
            .request_timeout(ContextId::Background, Ping::Ping(1), Duration::from_millis(50))
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::Timeout);
        assert_eq!(bus.pending_requests(), 0);
    }

    #[test]
    fn missing_context_is_unreachable() {
        let bus = fast_bus();
        let ui = bus.attach(ContextId::panel("popup"));
        let err = ui.request(ContextId::page(9), Ping::Ping(1)).unwrap_err();
        assert_eq!(err.code, ErrorCode::UnreachableContext);
    }

    #[test]
    fn late_attach_is_retried() {
        let bus = Bus::new(BusConfig {
            max_delivery_attempts: 6,
            retry_base_ms: 20,
            ..Default::default()
        });
        let ui = bus.attach(ContextId::panel("popup"));
        let late = bus.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            let page = late.attach(ContextId::page(2));
            echo(page, 1).join().unwrap();
        });

        assert_eq!(ui.request(ContextId::page(2), Ping::Ping(0)).unwrap(), Ping::Pong(1));
        handle.join().unwrap();
    }

    #[test]
    fn resent_envelope_is_processed_once() {
        let bus = fast_bus();
        let ui = bus.attach(ContextId::panel("popup"));
        let mut page = bus.attach(ContextId::page(1));

        let env = Envelope::event(ui.id().clone(), ContextId::page(1), Ping::Ping(7));
        ui.send(env.clone()).unwrap();
        ui.send(env).unwrap();
        ui.emit(ContextId::page(1), Ping::Ping(8)).unwrap();

        let first = page.recv_timeout(Duration::from_millis(100)).unwrap();
        let second = page.recv_timeout(Duration::from_millis(100)).unwrap();
        assert_eq!(first.payload(), Some(&Ping::Ping(7)));
        assert_eq!(second.payload(), Some(&Ping::Ping(8)));
        assert!(page.recv_timeout(Duration::from_millis(20)).is_none());
    }

    #[test]
    fn second_response_is_dropped() {
        let bus = fast_bus();
        let ui = bus.attach(ContextId::panel("popup"));
        let mut page = bus.attach(ContextId::page(1));

        let pending = ui
            .request_deferred(ContextId::page(1), Ping::Ping(1), Duration::from_millis(500))
            .unwrap();
        assert!(pending.poll().is_none());

        let req = page.recv_timeout(Duration::from_millis(100)).unwrap();
        page.respond(&req, Ok(Ping::Pong(1)));
        page.respond(&req, Ok(Ping::Pong(99)));

        assert_eq!(pending.wait().unwrap(), Ping::Pong(1));
    }

    #[test]
    fn broadcast_reaches_matching_contexts() {
        let bus = fast_bus();
        let bg = bus.attach(ContextId::Background);
        let mut popup = bus.attach(ContextId::panel("popup"));
        let mut newtab = bus.attach(ContextId::panel("newtab"));
        let mut page = bus.attach(ContextId::page(1));

        assert_eq!(bg.broadcast(ContextId::is_panel, Ping::Ping(3)), 2);
        assert!(popup.recv_timeout(Duration::from_millis(50)).is_some());
        assert!(newtab.recv_timeout(Duration::from_millis(50)).is_some());
        assert!(page.recv_timeout(Duration::from_millis(20)).is_none());
    }

    #[test]
    fn dropping_stale_endpoint_keeps_new_route() {
        let bus = fast_bus();
        let old = bus.attach(ContextId::page(1));
        let _new = bus.attach(ContextId::page(1));
        drop(old);
        assert!(bus.is_attached(&ContextId::page(1)));
    }

    #[test]
    fn envelope_json_shape() {
        let env = Envelope::request(ContextId::Background, ContextId::page(4), Ping::Ping(1));
        let json = serde_json::to_value(&env).unwrap();
        assert_eq!(json["kind"], "request");
        assert_eq!(json["topic"], "ping");
        assert_eq!(json["target"]["context"], "page");
        assert_eq!(json["target"]["id"], 4);
    }
}
