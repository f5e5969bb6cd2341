//! Context store (C2, `spec.md` §4.2): the append-only conversation history,
//! checkpoints, token accounting, and JSON-lines persistence. Grounded in the
//! teacher's `ConversationContext`/session history file handling; the single
//! `tokio::sync::Mutex` serializing guard matches the teacher's approach of
//! one lock per session rather than fine-grained field locks.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;

use crate::error::AgentError;
use crate::message::Message;

/// Bounded FIFO of short facts the compactor folds into its summary prompt
/// (§4.2 "key insights", default capacity 5).
const KEY_INSIGHTS_CAPACITY: usize = 5;

/// Char-to-token estimator divisor used when the provider doesn't report
/// authoritative usage (§9 "Token estimation divisor").
const TOKEN_ESTIMATE_DIVISOR: usize = 4;

#[derive(Debug)]
struct Inner {
    messages: Vec<Message>,
    checkpoints: Vec<usize>,
    token_count: u64,
    key_insights: Vec<String>,
}

/// Append-only conversation context, persisted as JSON-lines.
#[derive(Debug)]
pub struct Context {
    inner: Mutex<Inner>,
    history_path: Option<PathBuf>,
}

impl Context {
    pub fn new() -> Self {
        Context {
            inner: Mutex::new(Inner {
                messages: Vec::new(),
                checkpoints: vec![0],
                token_count: 0,
                key_insights: Vec::new(),
            }),
            history_path: None,
        }
    }

    pub fn with_history_file(path: impl Into<PathBuf>) -> Self {
        Context {
            history_path: Some(path.into()),
            ..Context::new()
        }
    }

    /// Restore a context from a JSON-lines history file, skipping corrupt
    /// lines individually but failing the whole restore when more than half
    /// of the non-empty lines were unreadable (§4.2 corruption handling).
    pub async fn restore_from_file(path: impl Into<PathBuf>) -> Result<Self, AgentError> {
        let path = path.into();
        let file = tokio::fs::File::open(&path).await?;
        let mut reader = BufReader::new(file).lines();

        let mut messages = Vec::new();
        let mut total = 0usize;
        let mut corrupt = 0usize;
        let mut corrupt_at = None;

        let mut line_no = 0usize;
        while let Some(line) = reader.next_line().await? {
            line_no += 1;
            if line.trim().is_empty() {
                continue;
            }
            total += 1;
            match serde_json::from_str::<Message>(&line) {
                Ok(msg) => messages.push(msg),
                Err(_) => {
                    corrupt += 1;
                    corrupt_at.get_or_insert(line_no);
                }
            }
        }

        if total > 0 && corrupt * 2 >= total {
            return Err(AgentError::HistoryCorrupt {
                path: path.display().to_string(),
                line: corrupt_at.unwrap_or(0),
            });
        }

        let token_count = messages.iter().map(|m| m.char_len() as u64).sum::<u64>()
            / TOKEN_ESTIMATE_DIVISOR as u64;

        Ok(Context {
            inner: Mutex::new(Inner {
                messages,
                checkpoints: vec![0],
                token_count,
                key_insights: Vec::new(),
            }),
            history_path: Some(path),
        })
    }

    /// Append a message, updating the rough token estimate and flushing to
    /// the history file durably before returning.
    pub async fn append(&self, message: Message) -> Result<(), AgentError> {
        let mut guard = self.inner.lock().await;
        guard.token_count += (message.char_len() / TOKEN_ESTIMATE_DIVISOR) as u64;

        if let Some(path) = &self.history_path {
            self.append_line(path, &message).await?;
        }

        guard.messages.push(message);
        Ok(())
    }

    /// Append a batch atomically: all messages land in `messages` (and on
    /// disk) before any reader sees a partial batch (§4.4 "batch-atomic
    /// append of tool results").
    pub async fn append_batch(&self, batch: Vec<Message>) -> Result<(), AgentError> {
        let mut guard = self.inner.lock().await;
        for message in &batch {
            guard.token_count += (message.char_len() / TOKEN_ESTIMATE_DIVISOR) as u64;
            if let Some(path) = &self.history_path {
                self.append_line(path, message).await?;
            }
        }
        guard.messages.extend(batch);
        Ok(())
    }

    async fn append_line(&self, path: &Path, message: &Message) -> Result<(), AgentError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        let mut line = serde_json::to_string(message)?;
        line.push('\n');
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        file.sync_data().await?;
        Ok(())
    }

    /// Record a checkpoint at the current message count; checkpoints are
    /// non-decreasing indices into `messages`.
    pub async fn checkpoint(&self) -> usize {
        let mut guard = self.inner.lock().await;
        let idx = guard.messages.len();
        guard.checkpoints.push(idx);
        guard.checkpoints.len() - 1
    }

    /// Truncate `messages` back to the message count recorded at
    /// `checkpoint_id`, dropping later checkpoints too.
    pub async fn revert_to(&self, checkpoint_id: usize) -> Result<(), AgentError> {
        let mut guard = self.inner.lock().await;
        let idx = *guard
            .checkpoints
            .get(checkpoint_id)
            .ok_or(AgentError::CheckpointGone(checkpoint_id))?;
        guard.messages.truncate(idx);
        guard.checkpoints.truncate(checkpoint_id + 1);
        guard.token_count = guard.messages.iter().map(|m| m.char_len() as u64).sum::<u64>()
            / TOKEN_ESTIMATE_DIVISOR as u64;
        Ok(())
    }

    /// Overwrite the token count with an authoritative value from the
    /// provider's usage report, when available (§3: estimator is a fallback).
    pub async fn update_token_count(&self, token_count: u64) {
        self.inner.lock().await.token_count = token_count;
    }

    pub async fn token_count(&self) -> u64 {
        self.inner.lock().await.token_count
    }

    /// Push a key insight, evicting the oldest once capacity is exceeded.
    pub async fn add_key_insight(&self, insight: impl Into<String>) {
        let mut guard = self.inner.lock().await;
        guard.key_insights.push(insight.into());
        if guard.key_insights.len() > KEY_INSIGHTS_CAPACITY {
            guard.key_insights.remove(0);
        }
    }

    pub async fn key_insights(&self) -> Vec<String> {
        self.inner.lock().await.key_insights.clone()
    }

    /// A cheap, consistent snapshot of the full message list.
    pub async fn snapshot_history(&self) -> Arc<[Message]> {
        let guard = self.inner.lock().await;
        Arc::from(guard.messages.clone().into_boxed_slice())
    }

    pub async fn messages_after(&self, checkpoint_id: usize) -> Result<Vec<Message>, AgentError> {
        let guard = self.inner.lock().await;
        let idx = *guard
            .checkpoints
            .get(checkpoint_id)
            .ok_or(AgentError::CheckpointGone(checkpoint_id))?;
        Ok(guard.messages[idx..].to_vec())
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.messages.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}
