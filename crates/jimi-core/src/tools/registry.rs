//! Tool registry (C4, `spec.md` §4.4). Direct port of the teacher's
//! `ToolRegistry` shape (`tools::registry`): a flat name-keyed map plus a
//! lexicographically ordered schema export.

use std::collections::HashMap;
use std::sync::Arc;

use super::context::Tool;

/// An OpenAI-style function-calling schema entry (§4.4 "Schema exposure").
#[derive(Debug, Clone, serde::Serialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        ToolRegistry {
            tools: HashMap::new(),
        }
    }

    pub fn add(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn find(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn remove(&mut self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.remove(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    /// Schemas for `allowed \ excluded`, ordered lexicographically by
    /// `function_name` (§4.4). `allowed == None` means "every registered
    /// tool".
    pub fn schemas_for(
        &self,
        allowed: Option<&std::collections::HashSet<String>>,
        excluded: &std::collections::HashSet<String>,
    ) -> Vec<ToolSchema> {
        let mut names: Vec<&String> = self
            .tools
            .keys()
            .filter(|name| allowed.is_none_or(|a| a.contains(*name)))
            .filter(|name| !excluded.contains(*name))
            .collect();
        names.sort();

        names
            .into_iter()
            .map(|name| {
                let tool = &self.tools[name];
                ToolSchema {
                    name: tool.name().to_string(),
                    description: tool.description().to_string(),
                    parameters: tool.input_schema(),
                }
            })
            .collect()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}
