//! Response orchestrator: owns a turn from user text to final response.
//!
//! One turn is: validate, record the user message, open a correlation
//! record, publish `user_query`, then wait for the fan-in. The orchestrator
//! is itself a bus subscriber for the join topics; branch results and
//! degradations are recorded against the correlation map, and whichever
//! entry completes the join triggers composition exactly once. Two
//! deadlines bound every turn: the branch deadline expires the join with
//! degraded markers for missing branches, and the pipeline deadline caps
//! the caller's wait with whatever partial output was collected.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep, timeout, Duration};
use tracing::{debug, info, warn};

use crate::bus::{HandlerFailure, MessageBus, MessageHandler};
use crate::config::PipelineSettings;
use crate::correlation::{BranchEntry, CorrelationMap, CorrelationRecord, RecordOutcome};
use crate::error::{CaliperError, Result};
use crate::messages::{
    AnalysisKind, EnrichedRequest, Envelope, FinalResponse, Intent, Payload, RequestId, SessionId,
    Topic, UserQuery,
};
use crate::metrics::get_metrics;
use crate::services::{InferenceService, QueryService};
use crate::session::{validate_user_text, ChatRole, SessionStore};
use crate::workers::{
    IntentAdvisor, NarrativeComposer, QualityInspector, QueryPlanner, VisualizationPlanner,
};

const PRODUCER: &str = "response_orchestrator";

/// A completed turn, as returned to the conversation channel.
#[derive(Debug)]
pub struct TurnOutput {
    pub session_id: SessionId,
    pub request_id: RequestId,
    pub response: FinalResponse,
}

/// State held while a turn is in flight.
struct PendingTurn {
    reply: oneshot::Sender<FinalResponse>,
    user_text: String,
    /// Filled in when the intent advisor's output passes by on the bus.
    request: Option<EnrichedRequest>,
    started: Instant,
}

pub struct Orchestrator {
    bus: Arc<MessageBus>,
    store: Arc<SessionStore>,
    correlations: Arc<CorrelationMap>,
    composer: NarrativeComposer,
    pending: Mutex<HashMap<RequestId, PendingTurn>>,
    settings: PipelineSettings,
}

/// Wire every worker onto the bus and return the orchestrator.
pub fn build_pipeline(
    bus: Arc<MessageBus>,
    store: Arc<SessionStore>,
    query: Arc<dyn QueryService>,
    inference: Arc<dyn InferenceService>,
    settings: PipelineSettings,
) -> Arc<Orchestrator> {
    let orchestrator = Arc::new(Orchestrator {
        bus: Arc::clone(&bus),
        store: Arc::clone(&store),
        correlations: Arc::new(CorrelationMap::new()),
        composer: NarrativeComposer::new(Arc::clone(&inference), settings.max_follow_ups),
        pending: Mutex::new(HashMap::new()),
        settings: settings.clone(),
    });

    bus.subscribe(
        Topic::UserQuery,
        Arc::new(IntentAdvisor::new(
            Arc::clone(&bus),
            Arc::clone(&store),
            Arc::clone(&inference),
        )),
    );
    bus.subscribe(
        Topic::EnrichedRequest,
        Arc::new(QueryPlanner::new(
            Arc::clone(&bus),
            query,
            settings.query_row_limit,
        )),
    );
    bus.subscribe(
        Topic::DataReady,
        Arc::new(VisualizationPlanner::new(
            Arc::clone(&bus),
            settings.row_limit,
            settings.table_row_limit,
        )),
    );
    bus.subscribe(Topic::DataReady, Arc::new(QualityInspector::new(Arc::clone(&bus))));
    bus.subscribe(Topic::AnomalyAlert, Arc::new(AlertLogger));

    let join_handler: Arc<dyn MessageHandler> = Arc::clone(&orchestrator) as _;
    bus.subscribe(Topic::EnrichedRequest, Arc::clone(&join_handler));
    bus.subscribe(Topic::ClarificationNeeded, Arc::clone(&join_handler));
    bus.subscribe(Topic::ChartReady, Arc::clone(&join_handler));
    bus.subscribe(Topic::InsightsReady, join_handler);

    orchestrator.spawn_failure_watch();
    orchestrator
}

impl Orchestrator {
    /// Run one conversation turn to completion.
    pub async fn handle_turn(
        self: &Arc<Self>,
        session_id: Option<SessionId>,
        text: &str,
    ) -> Result<TurnOutput> {
        validate_user_text(text, self.store.settings().max_message_len)?;
        let session_id = self.store.ensure_session(session_id);
        self.store.append(session_id, ChatRole::User, text)?;

        let request_id = RequestId::new();
        let deadline =
            Utc::now() + chrono::Duration::seconds(self.settings.branch_deadline_secs as i64);
        self.correlations.open(
            request_id,
            session_id,
            vec![Topic::ChartReady, Topic::InsightsReady],
            deadline,
        )?;

        let (tx, mut rx) = oneshot::channel();
        self.pending.lock().insert(
            request_id,
            PendingTurn {
                reply: tx,
                user_text: text.to_string(),
                request: None,
                started: Instant::now(),
            },
        );

        get_metrics().turns_total.inc();
        info!(session_id = %session_id, request_id = %request_id, "turn started");
        self.bus.publish(Envelope::new(
            session_id,
            request_id,
            PRODUCER,
            Payload::UserQuery(UserQuery {
                text: text.to_string(),
            }),
        ));

        // Branch watchdog: a silent branch must not hold the join open.
        let watchdog = Arc::clone(self);
        let branch_wait = Duration::from_secs(self.settings.branch_deadline_secs);
        tokio::spawn(async move {
            sleep(branch_wait).await;
            watchdog
                .expire_turn(request_id, "branch deadline exceeded")
                .await;
        });

        let total = Duration::from_secs(self.settings.pipeline_deadline_secs);
        let response = match timeout(total, &mut rx).await {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => return Err(CaliperError::PipelineDeadline(total.as_millis() as u64)),
            Err(_) => {
                // Total deadline: return whatever partial output exists.
                self.expire_turn(request_id, "pipeline deadline exceeded")
                    .await;
                match rx.await {
                    Ok(response) => response,
                    Err(_) => {
                        return Err(CaliperError::PipelineDeadline(total.as_millis() as u64))
                    }
                }
            }
        };

        Ok(TurnOutput {
            session_id,
            request_id,
            response,
        })
    }

    pub fn in_flight(&self) -> usize {
        self.correlations.in_flight()
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    fn spawn_failure_watch(self: &Arc<Self>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<HandlerFailure>();
        self.bus.set_failure_sink(tx);
        let orchestrator = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(failure) = rx.recv().await {
                orchestrator.absorb_failure(failure).await;
            }
        });
    }

    /// A crashed handler becomes a degraded branch, or expires the whole
    /// join when it sat upstream of the fan-out.
    async fn absorb_failure(&self, failure: HandlerFailure) {
        warn!(
            handler = %failure.handler,
            topic = %failure.topic,
            request_id = %failure.request_id,
            reason = %failure.reason,
            "handler failure absorbed"
        );
        match failure.handler.as_str() {
            "visualization_planner" => {
                self.degrade_branch(failure.request_id, Topic::ChartReady, &failure.reason)
                    .await;
            }
            "quality_inspector" => {
                self.degrade_branch(failure.request_id, Topic::InsightsReady, &failure.reason)
                    .await;
            }
            "intent_advisor" | "query_planner" => {
                self.expire_turn(failure.request_id, &failure.reason).await;
            }
            _ => {}
        }
    }

    async fn degrade_branch(&self, request_id: RequestId, topic: Topic, reason: &str) {
        let entry = BranchEntry::Degraded {
            reason: reason.to_string(),
        };
        match self.correlations.record(request_id, topic, entry) {
            Ok(RecordOutcome::Completed(record)) => self.finalize(*record).await,
            Ok(_) => {}
            Err(err) => debug!(request_id = %request_id, error = %err, "late degradation dropped"),
        }
    }

    /// Deadline path: fill missing branches with degraded markers and
    /// compose from what arrived. No-op when the join already completed.
    async fn expire_turn(&self, request_id: RequestId, reason: &str) {
        if let Some(record) = self.correlations.expire(request_id, reason) {
            warn!(
                request_id = %request_id,
                reason,
                degraded = ?record.degraded_branches(),
                "join expired"
            );
            self.finalize(record).await;
        }
    }

    /// Compose and deliver the final response for a completed join.
    async fn finalize(&self, record: CorrelationRecord) {
        let mut chart = None;
        let mut insights = None;
        for entry in record.received.values() {
            if let BranchEntry::Ready(payload) = entry {
                match payload {
                    Payload::ChartReady(ready) => chart = Some(ready.chart.clone()),
                    Payload::InsightsReady(ready) => insights = Some(ready.clone()),
                    _ => {}
                }
            }
        }

        let degraded = record.degraded_branches();
        if !degraded.is_empty() {
            get_metrics()
                .degraded_branches_total
                .inc_by(degraded.len() as u64);
        }

        let request = {
            let pending = self.pending.lock();
            match pending.get(&record.request_id) {
                Some(turn) => turn
                    .request
                    .clone()
                    .unwrap_or_else(|| placeholder_request(&turn.user_text)),
                None => {
                    debug!(request_id = %record.request_id, "join completed after turn finished");
                    return;
                }
            }
        };

        let entities = self
            .store
            .snapshot(record.session_id)
            .map(|r| r.entities.clone())
            .unwrap_or_default();
        let response = self
            .composer
            .compose(&request, &entities, chart, insights, degraded)
            .await;
        self.finish_turn(record.session_id, record.request_id, response)
            .await;
    }

    async fn finish_turn(
        &self,
        session_id: SessionId,
        request_id: RequestId,
        response: FinalResponse,
    ) {
        if let Err(err) =
            self.store
                .append(session_id, ChatRole::Assistant, response.narrative.clone())
        {
            warn!(session_id = %session_id, error = %err, "assistant message not recorded");
        }

        self.bus.publish(Envelope::new(
            session_id,
            request_id,
            PRODUCER,
            Payload::FinalResponse(response.clone()),
        ));

        let turn = self.pending.lock().remove(&request_id);
        if let Some(turn) = turn {
            get_metrics()
                .turn_duration_seconds
                .observe(turn.started.elapsed().as_secs_f64());
            if turn.reply.send(response).is_err() {
                debug!(request_id = %request_id, "caller went away before the reply");
            }
        }
    }
}

#[async_trait]
impl MessageHandler for Orchestrator {
    fn name(&self) -> &'static str {
        PRODUCER
    }

    async fn on_message(&self, envelope: Envelope) -> Result<()> {
        match &envelope.payload {
            Payload::EnrichedRequest(request) => {
                let conversational = request.intent == Intent::Conversational;
                {
                    let mut pending = self.pending.lock();
                    if let Some(turn) = pending.get_mut(&envelope.request_id) {
                        turn.request = Some(request.clone());
                    }
                }
                if conversational {
                    // No data branch will run for this turn.
                    let _ = self
                        .correlations
                        .expire(envelope.request_id, "conversational turn");
                    let entities = self
                        .store
                        .snapshot(envelope.session_id)
                        .map(|r| r.entities.clone())
                        .unwrap_or_default();
                    let response = self
                        .composer
                        .compose_conversational(request, &entities)
                        .await;
                    self.finish_turn(envelope.session_id, envelope.request_id, response)
                        .await;
                }
            }
            Payload::ClarificationNeeded(clarification) => {
                get_metrics().clarifications_total.inc();
                let _ = self
                    .correlations
                    .expire(envelope.request_id, "clarification short-circuit");
                let response = self.composer.compose_clarification(clarification);
                self.finish_turn(envelope.session_id, envelope.request_id, response)
                    .await;
            }
            Payload::ChartReady(_) | Payload::InsightsReady(_) => {
                let entry = BranchEntry::Ready(envelope.payload.clone());
                match self
                    .correlations
                    .record(envelope.request_id, envelope.topic(), entry)
                {
                    Ok(RecordOutcome::Completed(record)) => self.finalize(*record).await,
                    Ok(RecordOutcome::Progressed(status)) => {
                        debug!(request_id = %envelope.request_id, status = ?status, "branch joined");
                    }
                    Ok(RecordOutcome::Ignored) => {
                        debug!(request_id = %envelope.request_id, topic = %envelope.topic(), "unexpected branch ignored");
                    }
                    Err(err) => {
                        debug!(request_id = %envelope.request_id, error = %err, "late branch dropped");
                    }
                }
            }
            other => debug!(topic = %other.topic(), "unhandled payload"),
        }
        Ok(())
    }
}

fn placeholder_request(user_text: &str) -> EnrichedRequest {
    EnrichedRequest {
        intent: Intent::DataQuery,
        rejected: false,
        rejection_reason: None,
        metrics: Vec::new(),
        dimensions: Vec::new(),
        filters: Vec::new(),
        time_range: None,
        analysis: AnalysisKind::Overview,
        user_text: user_text.to_string(),
    }
}

/// Side channel consumer: critical anomalies are worth a log line even
/// when nobody is watching the response.
struct AlertLogger;

#[async_trait]
impl MessageHandler for AlertLogger {
    fn name(&self) -> &'static str {
        "alert_logger"
    }

    async fn on_message(&self, envelope: Envelope) -> Result<()> {
        if let Payload::AnomalyAlert(alert) = &envelope.payload {
            warn!(
                metric = %alert.insight.metric,
                severity = alert.insight.severity.as_str(),
                entity = alert.insight.entity.as_deref().unwrap_or("-"),
                observed = alert.insight.observed,
                "critical anomaly detected"
            );
        }
        Ok(())
    }
}
