//! Topic-based publish/subscribe transport connecting the workers.
//!
//! Each subscriber gets its own unbounded queue and dispatch loop, and every
//! delivery runs as an independent task, so one pending external call never
//! blocks delivery for other topics or sessions. Handler errors are caught
//! at the bus boundary: logged, counted, and forwarded to the failure sink
//! for the orchestrator to downgrade into a degraded branch. A panicking
//! handler aborts only its own delivery task; the missing branch result is
//! then picked up by the fan-out deadline.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::Result;
use crate::messages::{Envelope, RequestId, SessionId, Topic};
use crate::metrics::get_metrics;

/// A worker-side message handler registered for a topic.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Stable name used in logs and degradation records.
    fn name(&self) -> &'static str;

    /// Handle one delivered envelope.
    async fn on_message(&self, envelope: Envelope) -> Result<()>;
}

/// A handler error surfaced at the bus boundary.
#[derive(Debug, Clone)]
pub struct HandlerFailure {
    pub handler: String,
    pub topic: Topic,
    pub session_id: SessionId,
    pub request_id: RequestId,
    pub reason: String,
}

/// Bus delivery statistics.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct BusStats {
    pub published: u64,
    pub delivered: u64,
    pub handler_errors: u64,
}

struct SubscriberSlot {
    name: String,
    tx: mpsc::UnboundedSender<Envelope>,
}

/// The in-process message bus.
pub struct MessageBus {
    subscriptions: RwLock<HashMap<Topic, Vec<SubscriberSlot>>>,
    failure_sink: Arc<RwLock<Option<mpsc::UnboundedSender<HandlerFailure>>>>,
    stats: Arc<RwLock<BusStats>>,
}

impl MessageBus {
    pub fn new() -> Self {
        Self {
            subscriptions: RwLock::new(HashMap::new()),
            failure_sink: Arc::new(RwLock::new(None)),
            stats: Arc::new(RwLock::new(BusStats::default())),
        }
    }

    /// Register the channel that receives handler failures. The
    /// orchestrator consumes these to mark correlation entries degraded.
    pub fn set_failure_sink(&self, tx: mpsc::UnboundedSender<HandlerFailure>) {
        *self.failure_sink.write() = Some(tx);
    }

    /// Register a handler for every future message on `topic`.
    pub fn subscribe(&self, topic: Topic, handler: Arc<dyn MessageHandler>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<Envelope>();
        let name = handler.name().to_string();

        self.subscriptions
            .write()
            .entry(topic)
            .or_default()
            .push(SubscriberSlot {
                name: name.clone(),
                tx,
            });

        let failure_sink = Arc::clone(&self.failure_sink);
        let stats = Arc::clone(&self.stats);

        tokio::spawn(async move {
            while let Some(envelope) = rx.recv().await {
                let handler = Arc::clone(&handler);
                let failure_sink = Arc::clone(&failure_sink);
                let stats = Arc::clone(&stats);

                // One task per delivery keeps other sessions flowing while
                // this handler awaits an external call.
                tokio::spawn(async move {
                    let topic = envelope.topic();
                    let session_id = envelope.session_id;
                    let request_id = envelope.request_id;

                    if let Err(err) = handler.on_message(envelope).await {
                        warn!(
                            handler = handler.name(),
                            topic = %topic,
                            session_id = %session_id,
                            request_id = %request_id,
                            error = %err,
                            "message handler failed"
                        );
                        stats.write().handler_errors += 1;
                        get_metrics().handler_errors_total.inc();

                        if let Some(sink) = failure_sink.read().as_ref() {
                            let _ = sink.send(HandlerFailure {
                                handler: handler.name().to_string(),
                                topic,
                                session_id,
                                request_id,
                                reason: err.to_string(),
                            });
                        }
                    }
                });
            }
            debug!(subscriber = %name, "dispatch loop ended");
        });
    }

    /// Deliver `envelope` to every current subscriber of its topic.
    ///
    /// Returns the number of subscriber queues the envelope reached.
    /// Publishing never blocks on handler execution.
    pub fn publish(&self, envelope: Envelope) -> usize {
        let topic = envelope.topic();
        let mut delivered = 0usize;

        {
            let subs = self.subscriptions.read();
            if let Some(slots) = subs.get(&topic) {
                for slot in slots {
                    if slot.tx.send(envelope.clone()).is_ok() {
                        delivered += 1;
                    } else {
                        warn!(subscriber = %slot.name, topic = %topic, "subscriber queue closed");
                    }
                }
            }
        }

        let mut stats = self.stats.write();
        stats.published += 1;
        stats.delivered += delivered as u64;
        drop(stats);

        get_metrics().messages_published_total.inc();
        debug!(topic = %topic, delivered, "published");
        delivered
    }

    pub fn subscriber_count(&self, topic: Topic) -> usize {
        self.subscriptions
            .read()
            .get(&topic)
            .map(|s| s.len())
            .unwrap_or(0)
    }

    pub fn stats(&self) -> BusStats {
        *self.stats.read()
    }
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new()
    }
}
