use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::context::RuntimeContent;
use crate::error::AgentError;
use crate::events::InterruptInfo;
use crate::types::{ChatMessage, ToolResult, Usage};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Interrupted,
    Succeeded,
    Failed,
}

impl RunStatus {
    pub fn is_finished(self) -> bool {
        matches!(self, RunStatus::Succeeded | RunStatus::Failed)
    }
}

/// Everything needed to resume a run from a cold start.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunState {
    pub thread_id: String,
    pub run_id: String,
    #[serde(default)]
    pub parent_run_id: Option<String>,
    pub status: RunStatus,
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub interrupt: Option<InterruptInfo>,
    /// Shared agent state, as last emitted.
    #[serde(default)]
    pub state: Value,
    /// Caller scope forwarded to context resolvers.
    #[serde(default)]
    pub scope: Value,
    /// Tool definitions supplied by the caller for this run.
    #[serde(default)]
    pub tools: Vec<Value>,
    /// Results of tool calls executed so far, by tool-call id.
    #[serde(default)]
    pub executed: HashMap<String, ToolResult>,
    /// Tool-supplied content and the injections already made from it.
    #[serde(default, skip_serializing_if = "RuntimeContent::is_empty")]
    pub runtime: RuntimeContent,
    #[serde(default)]
    pub usage: Usage,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub interrupted_at: Option<DateTime<Utc>>,
}

impl RunState {
    pub fn new(thread_id: impl Into<String>, run_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            thread_id: thread_id.into(),
            run_id: run_id.into(),
            parent_run_id: None,
            status: RunStatus::Running,
            messages: Vec::new(),
            interrupt: None,
            state: Value::Object(Default::default()),
            scope: Value::Null,
            tools: Vec::new(),
            executed: HashMap::new(),
            runtime: RuntimeContent::default(),
            usage: Usage::default(),
            created_at: now,
            updated_at: now,
            interrupted_at: None,
        }
    }

    /// Interrupted for longer than `after`.
    pub fn is_stale(&self, after: chrono::Duration, now: DateTime<Utc>) -> bool {
        self.status == RunStatus::Interrupted
            && self.interrupted_at.is_some_and(|at| now - at > after)
    }
}

/// Persists run state so a paused run survives restarts.
#[async_trait]
pub trait RunStore: Send + Sync {
    async fn save(&self, state: &RunState) -> Result<(), AgentError>;

    async fn load(&self, run_id: &str) -> Result<Option<RunState>, AgentError>;

    /// Every run currently waiting on an interrupt.
    async fn interrupted(&self) -> Result<Vec<RunState>, AgentError>;
}

// --- InMemoryRunStore ---

/// Process-local store. Paused runs do not survive a restart.
#[derive(Default)]
pub struct InMemoryRunStore {
    runs: Mutex<HashMap<String, RunState>>,
}

impl InMemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RunStore for InMemoryRunStore {
    async fn save(&self, state: &RunState) -> Result<(), AgentError> {
        self.runs.lock().insert(state.run_id.clone(), state.clone());
        Ok(())
    }

    async fn load(&self, run_id: &str) -> Result<Option<RunState>, AgentError> {
        Ok(self.runs.lock().get(run_id).cloned())
    }

    async fn interrupted(&self) -> Result<Vec<RunState>, AgentError> {
        Ok(self
            .runs
            .lock()
            .values()
            .filter(|r| r.status == RunStatus::Interrupted)
            .cloned()
            .collect())
    }
}

// --- FileRunStore ---

/// Saves run state to disk as one JSON file per run.
pub struct FileRunStore {
    dir: PathBuf,
}

impl FileRunStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path(&self, run_id: &str) -> Result<PathBuf, AgentError> {
        if run_id.is_empty() || run_id.contains(['/', '\\']) || run_id.starts_with('.') {
            return Err(AgentError::Store(format!("invalid run id: {run_id:?}")));
        }
        Ok(self.dir.join(format!("{run_id}.json")))
    }
}

#[async_trait]
impl RunStore for FileRunStore {
    async fn save(&self, state: &RunState) -> Result<(), AgentError> {
        let path = self.path(&state.run_id)?;
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| AgentError::Store(e.to_string()))?;
        let json =
            serde_json::to_string_pretty(state).map_err(|e| AgentError::Store(e.to_string()))?;
        tokio::fs::write(path, json)
            .await
            .map_err(|e| AgentError::Store(e.to_string()))?;
        Ok(())
    }

    async fn load(&self, run_id: &str) -> Result<Option<RunState>, AgentError> {
        let path = self.path(run_id)?;
        match tokio::fs::read_to_string(path).await {
            Ok(json) => {
                let state: RunState =
                    serde_json::from_str(&json).map_err(|e| AgentError::Store(e.to_string()))?;
                Ok(Some(state))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(AgentError::Store(e.to_string())),
        }
    }

    async fn interrupted(&self) -> Result<Vec<RunState>, AgentError> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(AgentError::Store(e.to_string())),
        };

        let mut runs = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| AgentError::Store(e.to_string()))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let json = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| AgentError::Store(e.to_string()))?;
            match serde_json::from_str::<RunState>(&json) {
                Ok(state) if state.status == RunStatus::Interrupted => runs.push(state),
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "skipping unreadable run file");
                }
            }
        }
        Ok(runs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn interrupted_run(id: &str) -> RunState {
        let mut run = RunState::new("thread", id);
        run.status = RunStatus::Interrupted;
        run.messages.push(ChatMessage::user("hello"));
        run.interrupt = Some(InterruptInfo::new("tool_execution", json!({})).with_id("i1"));
        run.interrupted_at = Some(Utc::now());
        run.executed.insert("c1".into(), ToolResult::ok("c1", "done"));
        run
    }

    #[tokio::test]
    async fn file_store_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileRunStore::new(dir.path());

        store.save(&interrupted_run("r1")).await.unwrap();
        let loaded = store.load("r1").await.unwrap().unwrap();

        assert_eq!(loaded.status, RunStatus::Interrupted);
        assert_eq!(loaded.messages[0].content, "hello");
        assert_eq!(loaded.interrupt.unwrap().id.as_deref(), Some("i1"));
        assert_eq!(loaded.executed["c1"].content, "done");
    }

    #[tokio::test]
    async fn file_store_missing_run_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileRunStore::new(dir.path().join("not-created-yet"));
        assert!(store.load("nope").await.unwrap().is_none());
        assert!(store.interrupted().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn file_store_rejects_path_like_ids() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileRunStore::new(dir.path());
        let err = store.load("../etc/passwd").await.unwrap_err();
        assert!(matches!(err, AgentError::Store(_)));
    }

    #[tokio::test]
    async fn lists_only_interrupted_runs() {
        let dir = tempfile::tempdir().unwrap();
        let file = FileRunStore::new(dir.path());
        let memory = InMemoryRunStore::new();

        let mut done = RunState::new("thread", "r2");
        done.status = RunStatus::Succeeded;

        for store in [&file as &dyn RunStore, &memory as &dyn RunStore] {
            store.save(&interrupted_run("r1")).await.unwrap();
            store.save(&done).await.unwrap();
            let paused = store.interrupted().await.unwrap();
            assert_eq!(paused.len(), 1);
            assert_eq!(paused[0].run_id, "r1");
        }
    }

    #[test]
    fn staleness_uses_interrupted_at() {
        let mut run = interrupted_run("r1");
        let now = Utc::now();
        run.interrupted_at = Some(now - chrono::Duration::hours(2));
        assert!(run.is_stale(chrono::Duration::hours(1), now));
        assert!(!run.is_stale(chrono::Duration::hours(3), now));

        run.status = RunStatus::Succeeded;
        assert!(!run.is_stale(chrono::Duration::hours(1), now));
    }
}
