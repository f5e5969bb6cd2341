//! Session wiring (`spec.md` §3 "Lifecycle", §6 "Session working
//! directory"). A session owns one working directory, one history file, one
//! context, one agent, and one event bus; ties the components built
//! elsewhere in this crate into the shape the CLI drives.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::agent_spec::AgentSpec;
use crate::approval::ApprovalGate;
use crate::context::Context;
use crate::event_bus::EventBus;
use crate::executor::{CancelSignal, Executor, ExecutorConfig};
use crate::llm::LlmProvider;
use crate::template::SessionTemplateContext;
use crate::tools::context::ToolContext;
use crate::tools::{Dispatcher, ToolRegistry};

/// Read `AGENTS.md` case-insensitively from `dir`, returning an empty string
/// if absent (§6: "reads an `AGENTS.md` (case-insensitive) on startup").
pub async fn read_agents_md(dir: &Path) -> String {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(_) => return String::new(),
    };

    while let Ok(Some(entry)) = entries.next_entry().await {
        if entry.file_name().to_string_lossy().eq_ignore_ascii_case("agents.md") {
            if let Ok(content) = tokio::fs::read_to_string(entry.path()).await {
                return content;
            }
        }
    }
    String::new()
}

/// Non-recursive directory listing, sorted for determinism (§6 `WORK_DIR_LS`).
pub async fn list_work_dir(dir: &Path) -> Vec<String> {
    let mut names = Vec::new();
    if let Ok(mut entries) = tokio::fs::read_dir(dir).await {
        while let Ok(Some(entry)) = entries.next_entry().await {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    names.sort();
    names
}

pub fn now_iso8601() -> String {
    time::OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_default()
}

/// History file path for a top-level session (§6: "placed under
/// `<workdir>/.jimi/sessions/<session_id>/history.jsonl>`").
pub fn history_path(workdir: &Path, session_id: &str) -> PathBuf {
    workdir
        .join(".jimi")
        .join("sessions")
        .join(session_id)
        .join("history.jsonl")
}

pub struct Session {
    pub session_id: String,
    pub workdir: PathBuf,
    pub bus: Arc<EventBus>,
    pub gate: Arc<ApprovalGate>,
    pub context: Arc<Context>,
    pub cancel_signal: CancelSignal,
    agent_spec: Arc<AgentSpec>,
    provider: Arc<dyn LlmProvider>,
    dispatcher: Arc<Dispatcher>,
    tool_context: Arc<dyn ToolContext>,
    executor_config: ExecutorConfig,
}

impl Session {
    /// Build a session: reads `AGENTS.md`/dir listing/current time, renders
    /// the agent's system prompt template, and restores history from disk
    /// if a history file already exists at the derived path.
    #[allow(clippy::too_many_arguments)]
    pub async fn open(
        session_id: impl Into<String>,
        workdir: PathBuf,
        bus: Arc<EventBus>,
        gate: Arc<ApprovalGate>,
        provider: Arc<dyn LlmProvider>,
        mut agent_spec: AgentSpec,
        dispatcher: Dispatcher,
        tool_context: Arc<dyn ToolContext>,
    ) -> Result<Self, crate::error::AgentError> {
        let session_id = session_id.into();
        let path = history_path(&workdir, &session_id);

        let context = if tokio::fs::metadata(&path).await.is_ok() {
            Arc::new(Context::restore_from_file(&path).await?)
        } else {
            Arc::new(Context::with_history_file(&path))
        };

        let template_ctx = SessionTemplateContext {
            agents_md: read_agents_md(&workdir).await,
            work_dir_ls: list_work_dir(&workdir).await,
            now: now_iso8601(),
            prompt_args: agent_spec.prompt_args.clone(),
        };
        agent_spec.system_prompt_template = template_ctx.render(&agent_spec.system_prompt_template)?;

        Ok(Session {
            session_id,
            workdir,
            bus,
            gate,
            context,
            cancel_signal: CancelSignal::new(),
            agent_spec: Arc::new(agent_spec),
            provider,
            dispatcher: Arc::new(dispatcher),
            tool_context,
            executor_config: ExecutorConfig::default(),
        })
    }

    pub fn executor(&self) -> Executor {
        Executor::new(
            self.session_id.clone(),
            self.bus.clone(),
            self.context.clone(),
            self.gate.clone(),
            self.provider.clone(),
            self.dispatcher.clone(),
            self.tool_context.clone(),
            self.agent_spec.clone(),
            self.cancel_signal.clone(),
            ExecutorConfig {
                max_steps_per_run: self.executor_config.max_steps_per_run,
                force_compaction_next_step: self.executor_config.force_compaction_next_step.clone(),
            },
        )
    }

    /// `/reset` meta-command: drop everything after checkpoint 0.
    pub async fn reset(&self) -> Result<(), crate::error::AgentError> {
        self.context.revert_to(0).await
    }

    /// `/compact` meta-command: force compaction on the next step regardless
    /// of the token-count threshold.
    pub fn force_compact_next_step(&self) {
        self.executor_config
            .force_compaction_next_step
            .store(true, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn registry_mut(&mut self) -> Option<&mut ToolRegistry> {
        Arc::get_mut(&mut self.dispatcher).map(|d| d.registry_mut())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn history_path_matches_the_spec_layout() {
        let path = history_path(Path::new("/work"), "abc123");
        assert_eq!(path, PathBuf::from("/work/.jimi/sessions/abc123/history.jsonl"));
    }

    #[tokio::test]
    async fn read_agents_md_is_case_insensitive() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("Agents.MD"), "be nice").await.unwrap();
        let content = read_agents_md(dir.path()).await;
        assert_eq!(content, "be nice");
    }

    #[tokio::test]
    async fn read_agents_md_defaults_to_empty_when_absent() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(read_agents_md(dir.path()).await, "");
    }

    #[tokio::test]
    async fn list_work_dir_is_sorted_and_non_recursive() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("b.txt"), "").await.unwrap();
        tokio::fs::write(dir.path().join("a.txt"), "").await.unwrap();
        tokio::fs::create_dir(dir.path().join("sub")).await.unwrap();
        tokio::fs::write(dir.path().join("sub/c.txt"), "").await.unwrap();

        let listing = list_work_dir(dir.path()).await;
        assert_eq!(listing, vec!["a.txt", "b.txt", "sub"]);
    }
}
