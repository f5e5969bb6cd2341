//! System-prompt templater (`SPEC_FULL.md` §3 "System prompt templating").
//! Grounded in the teacher's two-phase MiniJinja templater (`template.rs`):
//! template strings stay unresolved in the agent spec and are rendered once
//! per session against a known-variable allowlist, so a typo in a template
//! fails at resolution time instead of rendering silently as an empty
//! string.

use std::collections::HashMap;

use minijinja::Environment;

use crate::error::AgentError;

/// Variables a system prompt template is allowed to reference. `AGENTS_MD`,
/// `WORK_DIR_LS`, and `NOW` are always session-provided (`spec.md` §6); the
/// rest come from the resolved agent spec's `prompt_args`.
pub const SESSION_TEMPLATE_VARS: &[&str] = &["AGENTS_MD", "WORK_DIR_LS", "NOW"];

/// Reject a template referencing a variable outside `prompt_args` ∪
/// `SESSION_TEMPLATE_VARS`. No-ops on a plain string with no `{{`/`{%`.
pub fn validate_template(content: &str, prompt_arg_names: &[&str]) -> Result<(), AgentError> {
    if !content.contains("{{") && !content.contains("{%") {
        return Ok(());
    }

    let mut env = Environment::new();
    env.add_template("system_prompt", content)
        .map_err(|e| AgentError::Internal(format!("template parse error: {e}")))?;
    let template = env
        .get_template("system_prompt")
        .map_err(|e| AgentError::Internal(e.to_string()))?;

    let undeclared = template
        .undeclared_variables(false)
        .into_iter()
        .collect::<Vec<_>>();

    let known: Vec<&str> = SESSION_TEMPLATE_VARS
        .iter()
        .copied()
        .chain(prompt_arg_names.iter().copied())
        .collect();

    let unknown: Vec<&String> = undeclared
        .iter()
        .filter(|name| !known.contains(&name.as_str()))
        .collect();

    if !unknown.is_empty() {
        return Err(AgentError::Internal(format!(
            "template references unknown variable(s): {}",
            unknown
                .iter()
                .map(|s| s.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        )));
    }

    Ok(())
}

/// Session-scoped values available to every system prompt template (§6).
pub struct SessionTemplateContext {
    pub agents_md: String,
    pub work_dir_ls: Vec<String>,
    pub now: String,
    pub prompt_args: HashMap<String, String>,
}

impl SessionTemplateContext {
    pub fn render(&self, template_src: &str) -> Result<String, AgentError> {
        if !template_src.contains("{{") && !template_src.contains("{%") {
            return Ok(template_src.to_string());
        }

        let mut env = Environment::new();
        env.add_template("system_prompt", template_src)
            .map_err(|e| AgentError::Internal(format!("template parse error: {e}")))?;
        let template = env
            .get_template("system_prompt")
            .map_err(|e| AgentError::Internal(e.to_string()))?;

        let rendered = template
            .render(minijinja::context! {
                AGENTS_MD => self.agents_md.clone(),
                WORK_DIR_LS => self.work_dir_ls.clone(),
                NOW => self.now.clone(),
                ..minijinja::Value::from_serialize(&self.prompt_args)
            })
            .map_err(|e| AgentError::Internal(format!("template render error: {e}")))?;

        Ok(rendered)
    }
}
