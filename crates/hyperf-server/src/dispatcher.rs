//! Per-connection event dispatch.
//!
//! Each connection gets one worker task that pulls events off a bounded
//! queue and runs them one at a time: resolve, validate, invoke, acknowledge.
//! Events from one connection are therefore handled in arrival order, while
//! different connections' workers run concurrently. A full queue makes
//! [`Dispatcher::on_event`] wait, which pushes back on the transport.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use futures::FutureExt;
use hyperf_core::errors::{EVENT_KEY, INTERNAL_KEY};
use hyperf_core::{validate, ConnectionId, FieldErrors};
use hyperf_telemetry::MetricsRecorder;
use serde_json::Value;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

use crate::ack::{AckHandle, AckResponse};
use crate::gateway::Gateway;
use crate::registry::{ControllerRegistry, HandlerContext};
use crate::session::{Session, SessionStore};

pub const EVENTS_TOTAL: &str = "events_total";
pub const EVENT_ERRORS_TOTAL: &str = "event_errors_total";
pub const HANDLER_DURATION_MS: &str = "handler_duration_ms";
pub const CONNECTIONS_ACTIVE: &str = "connections_active";

/// Label used for event names that resolve to no binding.
const UNKNOWN_EVENT_LABEL: &str = "unknown";

const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// One raw event as received from the transport.
#[derive(Debug)]
pub struct InboundEvent {
    pub event: String,
    pub payload: Value,
    pub ack: Option<AckHandle>,
}

impl InboundEvent {
    pub fn new(event: impl Into<String>, payload: Value) -> Self {
        Self {
            event: event.into(),
            payload,
            ack: None,
        }
    }

    pub fn with_ack(mut self, ack: AckHandle) -> Self {
        self.ack = Some(ack);
        self
    }
}

struct Worker {
    queue: mpsc::Sender<InboundEvent>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// State shared by every worker.
struct DispatchCore {
    registry: Arc<ControllerRegistry>,
    sessions: Arc<SessionStore>,
    gateway: Gateway,
    metrics: Arc<MetricsRecorder>,
}

pub struct Dispatcher {
    core: Arc<DispatchCore>,
    workers: DashMap<ConnectionId, Worker>,
    queue_capacity: usize,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<ControllerRegistry>,
        sessions: Arc<SessionStore>,
        gateway: Gateway,
        metrics: Arc<MetricsRecorder>,
    ) -> Self {
        Self {
            core: Arc::new(DispatchCore {
                registry,
                sessions,
                gateway,
                metrics,
            }),
            workers: DashMap::new(),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }

    /// Events buffered per connection before [`Dispatcher::on_event`] waits.
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity.max(1);
        self
    }

    pub fn registry(&self) -> &Arc<ControllerRegistry> {
        &self.core.registry
    }

    pub fn sessions(&self) -> &Arc<SessionStore> {
        &self.core.sessions
    }

    pub fn gateway(&self) -> &Gateway {
        &self.core.gateway
    }

    pub fn metrics(&self) -> &Arc<MetricsRecorder> {
        &self.core.metrics
    }

    /// Open the session for `id` and start its worker.
    pub fn on_connect(&self, id: &ConnectionId) {
        if self.workers.contains_key(id) {
            warn!(connection_id = %id, "connection already attached to dispatcher");
            return;
        }

        let session = self.core.sessions.open(id);
        let (queue, rx) = mpsc::channel(self.queue_capacity);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_worker(
            Arc::clone(&self.core),
            id.clone(),
            session,
            rx,
            cancel.clone(),
        ));

        self.workers.insert(id.clone(), Worker { queue, cancel, task });
        self.core.metrics.gauge_inc(CONNECTIONS_ACTIVE, &[], 1.0);
        info!(connection_id = %id, "connection attached");
    }

    /// Queue an event for the connection's worker, waiting while its queue
    /// is full.
    ///
    /// Events for unknown or disconnecting connections are dropped, which
    /// discards their acknowledgment slot.
    pub async fn on_event(&self, id: &ConnectionId, event: InboundEvent) -> bool {
        // Clone the sender so no shard lock is held across the await.
        let queue = match self.workers.get(id) {
            Some(worker) if !worker.cancel.is_cancelled() => worker.queue.clone(),
            _ => {
                debug!(connection_id = %id, event = %event.event, "event for detached connection dropped");
                return false;
            }
        };
        queue.send(event).await.is_ok()
    }

    /// Stop dispatch for `id` and release its session.
    ///
    /// An in-flight handler runs to completion; events still queued behind it
    /// are dropped. Controllers' disconnect hooks then see the final session.
    pub async fn disconnect(&self, id: &ConnectionId) {
        let Some((_, worker)) = self.workers.remove(id) else {
            return;
        };
        worker.cancel.cancel();
        drop(worker.queue);
        if let Err(e) = worker.task.await {
            warn!(connection_id = %id, error = %e, "dispatch worker ended abnormally");
        }

        if let Some(session) = self.core.sessions.remove(id).await {
            for controller in self.core.registry.controllers() {
                controller.on_disconnect(&session);
            }
        }

        self.core.metrics.gauge_inc(CONNECTIONS_ACTIVE, &[], -1.0);
        info!(connection_id = %id, "connection detached");
    }

    /// Connections with a running worker.
    pub fn active(&self) -> usize {
        self.workers.len()
    }
}

async fn run_worker(
    core: Arc<DispatchCore>,
    id: ConnectionId,
    session: Arc<Mutex<Session>>,
    mut rx: mpsc::Receiver<InboundEvent>,
    cancel: CancellationToken,
) {
    loop {
        let inbound = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            next = rx.recv() => match next {
                Some(inbound) => inbound,
                None => break,
            },
        };
        core.dispatch(&id, &session, inbound).await;
    }
    debug!(connection_id = %id, "dispatch worker stopped");
}

impl DispatchCore {
    async fn dispatch(&self, id: &ConnectionId, session: &Mutex<Session>, inbound: InboundEvent) {
        let InboundEvent { event, payload, ack } = inbound;
        let span = tracing::info_span!("dispatch", connection_id = %id, event = %event);

        async move {
            let Some(binding) = self.registry.resolve(&event) else {
                warn!("unknown event");
                self.record(UNKNOWN_EVENT_LABEL, Some("unknown_event"));
                respond(ack, AckResponse::failure(FieldErrors::single(EVENT_KEY, "unknown event")));
                return;
            };

            let payload = match validate(binding.schema(), &payload) {
                Ok(payload) => payload,
                Err(errors) => {
                    debug!(%errors, "payload rejected");
                    self.record(&event, Some("validation"));
                    respond(ack, AckResponse::failure(errors));
                    return;
                }
            };

            let started = Instant::now();
            let outcome = {
                let mut guard = session.lock().await;
                let mut ctx = HandlerContext {
                    connection_id: id,
                    session: &mut guard,
                    gateway: &self.gateway,
                };
                AssertUnwindSafe(binding.handler().handle(payload, &mut ctx))
                    .catch_unwind()
                    .await
            };
            let (result, failure_kind) = match outcome {
                Ok(result) => (result, "domain"),
                Err(panic) => {
                    error!(panic = panic_message(panic.as_ref()), "handler panicked");
                    (
                        Err(FieldErrors::single(INTERNAL_KEY, "internal error")),
                        "internal",
                    )
                }
            };
            let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
            self.metrics
                .histogram_observe(HANDLER_DURATION_MS, &[("event", event.as_str())], elapsed_ms);

            match &result {
                Ok(_) => {
                    debug!(elapsed_ms, "event handled");
                    self.record(&event, None);
                }
                Err(errors) => {
                    debug!(elapsed_ms, %errors, "handler refused event");
                    self.record(&event, Some(failure_kind));
                }
            }
            respond(ack, result.into());
        }
        .instrument(span)
        .await
    }

    fn record(&self, event: &str, error_kind: Option<&str>) {
        self.metrics.counter_inc(EVENTS_TOTAL, &[("event", event)], 1);
        if let Some(kind) = error_kind {
            self.metrics
                .counter_inc(EVENT_ERRORS_TOTAL, &[("event", event), ("kind", kind)], 1);
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

fn respond(ack: Option<AckHandle>, response: AckResponse) {
    if let Some(ack) = ack {
        if !ack.fulfill(response) {
            debug!("acknowledgment no longer awaited");
        }
    }
}
