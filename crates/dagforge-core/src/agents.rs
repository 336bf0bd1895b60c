use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::RwLock;

/// A named system-prompt template the Planner loads by name. Custom
/// templates can be dropped into `.dagforge/agent/<name>.md` to override or
/// extend the built-in ones without a code change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentDefinition {
    pub name: String,
    pub system_prompt: String,
}

#[derive(Debug, Clone, Deserialize)]
struct AgentFrontmatter {
    name: Option<String>,
}

#[derive(Clone)]
pub struct AgentRegistry {
    agents: Arc<RwLock<HashMap<String, AgentDefinition>>>,
    default_agent: String,
}

impl AgentRegistry {
    pub async fn new(workspace_root: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let mut by_name = HashMap::new();
        for agent in default_agents() {
            by_name.insert(agent.name.clone(), agent);
        }

        let root: PathBuf = workspace_root.into();
        let custom = load_custom_agents(root.join(".dagforge").join("agent")).await?;
        for agent in custom {
            by_name.insert(agent.name.clone(), agent);
        }

        Ok(Self {
            agents: Arc::new(RwLock::new(by_name)),
            default_agent: "planner".to_string(),
        })
    }

    pub async fn list(&self) -> Vec<AgentDefinition> {
        let mut agents = self
            .agents
            .read()
            .await
            .values()
            .cloned()
            .collect::<Vec<_>>();
        agents.sort_by(|a, b| a.name.cmp(&b.name));
        agents
    }

    pub async fn get(&self, name: Option<&str>) -> AgentDefinition {
        let wanted = name.unwrap_or(&self.default_agent);
        let agents = self.agents.read().await;
        agents
            .get(wanted)
            .cloned()
            .or_else(|| agents.get(&self.default_agent).cloned())
            .unwrap_or_else(|| AgentDefinition {
                name: self.default_agent.clone(),
                system_prompt: String::new(),
            })
    }
}

fn default_agents() -> Vec<AgentDefinition> {
    vec![
        AgentDefinition {
            name: "planner".to_string(),
            system_prompt: "You decompose a user request into a DAG of sub-tasks. \
Extract the primary intent and any named entities, ground each entity to a concrete \
value where possible, and emit sub-tasks with an explicit `dependencies` list (use the \
literal value `none` for a sub-task with no prerequisites). Each sub-task is either a \
tool call or an inference step, never both. Assess how completely the sub-tasks cover \
the request and report that as `coverage` (`low`, `medium`, or `high`) along with any \
`gaps`. If the request is too ambiguous to plan at all, set `clarification_needed` and \
supply a single concrete `clarification_query` instead of guessing."
                .to_string(),
        },
        AgentDefinition {
            name: "planner_refine".to_string(),
            system_prompt: "Your previous plan was rejected. Revise it to address the \
stated reason without discarding the parts that were already correct. Keep sub-task ids \
stable wherever the sub-task itself is unchanged."
                .to_string(),
        },
        AgentDefinition {
            name: "title".to_string(),
            system_prompt: "Reply with a short, plain-text title (six words or fewer, no \
quotes, no trailing punctuation) summarising the request below. Reply with nothing else."
                .to_string(),
        },
    ]
}

async fn load_custom_agents(dir: PathBuf) -> anyhow::Result<Vec<AgentDefinition>> {
    let mut out = Vec::new();
    let mut entries = match fs::read_dir(&dir).await {
        Ok(rd) => rd,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(out),
        Err(err) => {
            return Err(err).with_context(|| format!("failed to read {}", dir.display()));
        }
    };

    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let Some(ext) = path.extension().and_then(|v| v.to_str()) else {
            continue;
        };
        if ext != "md" {
            continue;
        }
        let raw = fs::read_to_string(&path).await?;
        if let Some(agent) = parse_agent_markdown(&raw, &path) {
            out.push(agent);
        }
    }

    Ok(out)
}

fn parse_agent_markdown(raw: &str, path: &Path) -> Option<AgentDefinition> {
    let trimmed = raw.trim_start();
    if !trimmed.starts_with("---") {
        return None;
    }
    let mut parts = trimmed.splitn(3, "---");
    let _ = parts.next();
    let frontmatter = parts.next()?.trim();
    let body = parts.next()?.trim().to_string();
    let parsed: AgentFrontmatter = serde_yaml::from_str(frontmatter).ok()?;
    let default_name = path.file_stem()?.to_string_lossy().to_string();
    Some(AgentDefinition {
        name: parsed.name.unwrap_or(default_name),
        system_prompt: body,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn get_falls_back_to_the_default_planner_template() {
        let registry = AgentRegistry::new(std::env::temp_dir()).await.unwrap();
        let agent = registry.get(Some("does-not-exist")).await;
        assert_eq!(agent.name, "planner");
    }

    #[tokio::test]
    async fn list_includes_both_built_in_templates() {
        let registry = AgentRegistry::new(std::env::temp_dir()).await.unwrap();
        let names: Vec<String> = registry.list().await.into_iter().map(|a| a.name).collect();
        assert!(names.contains(&"planner".to_string()));
        assert!(names.contains(&"planner_refine".to_string()));
        assert!(names.contains(&"title".to_string()));
    }
}
