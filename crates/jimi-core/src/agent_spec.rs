//! Resolved agent spec shape (`spec.md` §3). Only the in-memory shape is
//! specified — YAML parsing is an external collaborator. Grounded in the
//! teacher's `AgentConfig`/`SubagentConfig` split, trimmed to the fields
//! this core actually consumes.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::OnceCell;

use crate::error::AgentError;

/// A sub-agent entry, resolved lazily so the parent never pays to load a
/// sub-agent it doesn't call (§4.7 "Load the child's resolved agent spec
/// (lazily, cached)").
pub struct SubagentSpec {
    pub prompt_path: String,
    pub description: String,
    resolved: OnceCell<Arc<AgentSpec>>,
    loader: Box<dyn Fn(&str) -> Result<AgentSpec, AgentError> + Send + Sync>,
}

impl SubagentSpec {
    pub fn new(
        prompt_path: impl Into<String>,
        description: impl Into<String>,
        loader: impl Fn(&str) -> Result<AgentSpec, AgentError> + Send + Sync + 'static,
    ) -> Self {
        SubagentSpec {
            prompt_path: prompt_path.into(),
            description: description.into(),
            resolved: OnceCell::new(),
            loader: Box::new(loader),
        }
    }

    pub async fn resolve(&self) -> Result<Arc<AgentSpec>, AgentError> {
        self.resolved
            .get_or_try_init(|| async { (self.loader)(&self.prompt_path).map(Arc::new) })
            .await
            .cloned()
    }
}

/// `{ name, system_prompt_template, prompt_args, allowed_tools,
/// excluded_tools, subagents }` (§3 "Agent spec (resolved)").
pub struct AgentSpec {
    pub name: String,
    pub system_prompt_template: String,
    pub prompt_args: HashMap<String, String>,
    pub allowed_tools: Option<HashSet<String>>,
    pub excluded_tools: HashSet<String>,
    pub subagents: HashMap<String, SubagentSpec>,
}

impl AgentSpec {
    pub fn new(name: impl Into<String>, system_prompt_template: impl Into<String>) -> Self {
        AgentSpec {
            name: name.into(),
            system_prompt_template: system_prompt_template.into(),
            prompt_args: HashMap::new(),
            allowed_tools: None,
            excluded_tools: HashSet::new(),
            subagents: HashMap::new(),
        }
    }

    pub fn has_subagents(&self) -> bool {
        !self.subagents.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subagent_spec_resolves_and_caches() {
        let calls = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let calls2 = calls.clone();
        let spec = SubagentSpec::new("reviewer.md", "reviews code", move |path| {
            calls2.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(AgentSpec::new("reviewer", format!("prompt from {path}")))
        });

        let first = spec.resolve().await.unwrap();
        let second = spec.resolve().await.unwrap();
        assert_eq!(first.name, "reviewer");
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[test]
    fn has_subagents_reflects_map_emptiness() {
        let spec = AgentSpec::new("main", "you are jimi");
        assert!(!spec.has_subagents());
    }
}
