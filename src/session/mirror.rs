//! Optional on-disk transcript mirror.
//!
//! Mirroring is fire-and-forget: `record` hands the line to an unbounded
//! channel and returns immediately, so a slow or failing disk never blocks
//! a turn. The writer task appends one JSON line per message to
//! `<dir>/<session_id>.jsonl`. Lines that cannot be delivered or written
//! are counted and dropped, never retried.

use std::collections::HashMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::messages::SessionId;
use crate::metrics::get_metrics;
use crate::session::store::{ChatMessage, ChatRole};

/// Open file handles kept by the writer before it starts over. Sessions are
/// short-lived, so reopening after a reset is rare and cheap.
const MAX_OPEN_FILES: usize = 64;

#[derive(Debug, Serialize)]
struct MirrorLine<'a> {
    at: DateTime<Utc>,
    session_id: SessionId,
    role: ChatRole,
    content: &'a str,
}

struct MirrorEvent {
    session_id: SessionId,
    line: String,
}

#[derive(Clone)]
pub struct SessionMirror {
    tx: mpsc::UnboundedSender<MirrorEvent>,
}

impl SessionMirror {
    /// Start the writer task. The handle completes once every sender is
    /// dropped and the queue has drained.
    pub fn spawn(dir: impl Into<PathBuf>) -> (Self, tokio::task::JoinHandle<()>) {
        let dir = dir.into();
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(writer_loop(dir, rx));
        (Self { tx }, handle)
    }

    /// Queue one message for mirroring.
    pub fn record(&self, session_id: SessionId, message: &ChatMessage) {
        let line = MirrorLine {
            at: message.at,
            session_id,
            role: message.role,
            content: &message.content,
        };
        let line = match serde_json::to_string(&line) {
            Ok(line) => line,
            Err(error) => {
                warn!(%error, "failed to encode mirror line");
                get_metrics().mirror_dropped_total.inc();
                return;
            }
        };
        if self.tx.send(MirrorEvent { session_id, line }).is_err() {
            get_metrics().mirror_dropped_total.inc();
        }
    }
}

async fn writer_loop(dir: PathBuf, mut rx: mpsc::UnboundedReceiver<MirrorEvent>) {
    if let Err(error) = tokio::fs::create_dir_all(&dir).await {
        warn!(%error, dir = %dir.display(), "cannot create mirror directory");
    }
    let mut files: HashMap<SessionId, File> = HashMap::new();

    while let Some(event) = rx.recv().await {
        if files.len() >= MAX_OPEN_FILES && !files.contains_key(&event.session_id) {
            files.clear();
        }
        let file = match files.entry(event.session_id) {
            std::collections::hash_map::Entry::Occupied(entry) => entry.into_mut(),
            std::collections::hash_map::Entry::Vacant(entry) => {
                let path = dir.join(format!("{}.jsonl", event.session_id));
                match OpenOptions::new().create(true).append(true).open(&path).await {
                    Ok(file) => entry.insert(file),
                    Err(error) => {
                        warn!(%error, path = %path.display(), "cannot open mirror file");
                        get_metrics().mirror_dropped_total.inc();
                        continue;
                    }
                }
            }
        };

        let mut line = event.line;
        line.push('\n');
        if let Err(error) = file.write_all(line.as_bytes()).await {
            warn!(%error, session_id = %event.session_id, "mirror write failed");
            get_metrics().mirror_dropped_total.inc();
            files.remove(&event.session_id);
            continue;
        }
        if let Err(error) = file.flush().await {
            warn!(%error, session_id = %event.session_id, "mirror flush failed");
            files.remove(&event.session_id);
        }
    }
    debug!("mirror writer drained");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mirrors_messages_to_per_session_files() {
        let dir = tempfile::tempdir().unwrap();
        let (mirror, handle) = SessionMirror::spawn(dir.path());

        let a = SessionId::new();
        let b = SessionId::new();
        mirror.record(a, &ChatMessage::new(ChatRole::User, "scrap rate by line"));
        mirror.record(a, &ChatMessage::new(ChatRole::Assistant, "Scrap rate is 2.4%."));
        mirror.record(b, &ChatMessage::new(ChatRole::User, "oee last week"));

        // Closing the only sender lets the writer drain and exit.
        drop(mirror);
        handle.await.unwrap();

        let contents = std::fs::read_to_string(dir.path().join(format!("{a}.jsonl"))).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["role"], "user");
        assert_eq!(first["content"], "scrap rate by line");

        let other = std::fs::read_to_string(dir.path().join(format!("{b}.jsonl"))).unwrap();
        assert_eq!(other.lines().count(), 1);
    }

    #[tokio::test]
    async fn record_after_writer_gone_is_dropped_quietly() {
        let dir = tempfile::tempdir().unwrap();
        let (mirror, handle) = SessionMirror::spawn(dir.path());
        handle.abort();
        let _ = handle.await;
        // Must not panic or block.
        mirror.record(
            SessionId::new(),
            &ChatMessage::new(ChatRole::User, "hello"),
        );
    }
}
