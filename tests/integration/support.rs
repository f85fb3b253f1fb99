//! Shared fixtures for the integration suite: a scripted query service,
//! row builders, and a fully wired engine with no real network behind it.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

use caliper::config::{PipelineSettings, SessionSettings};
use caliper::error::QueryServiceError;
use caliper::messages::Envelope;
use caliper::services::{MetaResponse, NullInference, QueryRequest, QueryResult, QueryService};
use caliper::{build_pipeline, MessageBus, MessageHandler, Orchestrator, SessionStore};

/// What the scripted source does for every query it receives.
pub enum Script {
    /// Answer immediately with these rows.
    Rows(Vec<serde_json::Map<String, Value>>),
    /// Fail every query with this reason.
    Fail(String),
    /// Sleep first, then answer with these rows.
    Delay(Duration, Vec<serde_json::Map<String, Value>>),
}

pub struct ScriptedQuery {
    script: Script,
}

impl ScriptedQuery {
    pub fn new(script: Script) -> Arc<Self> {
        Arc::new(Self { script })
    }
}

#[async_trait]
impl QueryService for ScriptedQuery {
    async fn execute(
        &self,
        _request: QueryRequest,
    ) -> std::result::Result<QueryResult, QueryServiceError> {
        match &self.script {
            Script::Rows(rows) => Ok(QueryResult {
                rows: rows.clone(),
                elapsed_ms: 1,
            }),
            Script::Fail(reason) => Err(QueryServiceError::SourceUnavailable(reason.clone())),
            Script::Delay(wait, rows) => {
                tokio::time::sleep(*wait).await;
                Ok(QueryResult {
                    rows: rows.clone(),
                    elapsed_ms: wait.as_millis() as u64,
                })
            }
        }
    }

    async fn meta(&self) -> std::result::Result<Arc<MetaResponse>, QueryServiceError> {
        Ok(Arc::new(MetaResponse { cubes: Vec::new() }))
    }
}

/// Turn a JSON array literal into query rows.
pub fn rows(fixture: Value) -> Vec<serde_json::Map<String, Value>> {
    fixture
        .as_array()
        .expect("row fixture must be a JSON array")
        .iter()
        .map(|row| {
            row.as_object()
                .expect("each fixture row must be an object")
                .clone()
        })
        .collect()
}

/// A bus tap that forwards every envelope it sees to a channel.
pub struct Probe {
    tx: UnboundedSender<Envelope>,
}

impl Probe {
    pub fn channel() -> (Arc<Self>, UnboundedReceiver<Envelope>) {
        let (tx, rx) = unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }
}

#[async_trait]
impl MessageHandler for Probe {
    fn name(&self) -> &'static str {
        "probe"
    }

    async fn on_message(&self, envelope: Envelope) -> caliper::Result<()> {
        let _ = self.tx.send(envelope);
        Ok(())
    }
}

/// Wire a full engine against a scripted source with default settings.
pub fn engine(script: Script) -> (Arc<Orchestrator>, Arc<MessageBus>) {
    engine_with(script, PipelineSettings::default(), SessionSettings::default())
}

/// Same as [`engine`] but with explicit deadline and session settings.
pub fn engine_with(
    script: Script,
    pipeline: PipelineSettings,
    session: SessionSettings,
) -> (Arc<Orchestrator>, Arc<MessageBus>) {
    let bus = Arc::new(MessageBus::new());
    let store = Arc::new(SessionStore::new(session, None));
    let orchestrator = build_pipeline(
        Arc::clone(&bus),
        store,
        ScriptedQuery::new(script),
        Arc::new(NullInference),
        pipeline,
    );
    (orchestrator, bus)
}
