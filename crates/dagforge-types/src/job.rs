use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Sentinel dependency value meaning "no prerequisites".
pub const NO_DEPENDENCIES: &str = "none";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Coverage {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entity {
    pub name: String,
    #[serde(rename = "type")]
    pub entity_type: String,
    pub grounded_value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Intent {
    pub primary: String,
    #[serde(default)]
    pub sub_intents: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Validation {
    pub coverage: Coverage,
    #[serde(default)]
    pub gaps: Vec<String>,
    #[serde(default)]
    pub iteration_triggers: Vec<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    Tool,
    Inference,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolOrPrompt {
    pub name: String,
    #[serde(default)]
    pub params: HashMap<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubTask {
    pub id: String,
    pub description: String,
    #[serde(default)]
    pub thought: String,
    #[serde(default)]
    pub expected_output: String,
    pub action_type: ActionType,
    pub tool_or_prompt: ToolOrPrompt,
    #[serde(default = "default_dependencies")]
    pub dependencies: Vec<String>,
}

fn default_dependencies() -> Vec<String> {
    vec![NO_DEPENDENCIES.to_string()]
}

impl SubTask {
    /// A sub-task with no real prerequisites, per the `["none"]` sentinel grammar.
    pub fn has_no_dependencies(&self) -> bool {
        self.dependencies.len() == 1 && self.dependencies[0].eq_ignore_ascii_case(NO_DEPENDENCIES)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub original_request: String,
    pub intent: Intent,
    #[serde(default)]
    pub entities: Vec<Entity>,
    pub sub_tasks: Vec<SubTask>,
    #[serde(default)]
    pub synthesis_plan: String,
    pub validation: Validation,
    #[serde(default)]
    pub clarification_needed: bool,
    #[serde(default)]
    pub clarification_query: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum JobValidationError {
    #[error("clarification_needed is true but clarification_query is empty")]
    MissingClarificationQuery,
    #[error("sub_task `{0}` references unknown dependency `{1}`")]
    UnknownDependency(String, String),
    #[error("dependency graph contains a cycle touching sub_task `{0}`")]
    CyclicDependency(String),
    #[error("duplicate sub_task id `{0}`")]
    DuplicateSubTaskId(String),
    #[error("job has no sub_tasks")]
    Empty,
}

impl Job {
    /// Validates the invariants from spec §3: clarification contract, unique
    /// ids, dependency referential integrity, and acyclicity.
    pub fn validate(&self) -> Result<(), JobValidationError> {
        if self.clarification_needed
            && self
                .clarification_query
                .as_ref()
                .map(|q| q.trim().is_empty())
                .unwrap_or(true)
        {
            return Err(JobValidationError::MissingClarificationQuery);
        }
        if self.clarification_needed {
            // A job asking for clarification is never executed; its sub-task
            // graph is not required to be well-formed.
            return Ok(());
        }
        if self.sub_tasks.is_empty() {
            return Err(JobValidationError::Empty);
        }

        let mut seen = HashSet::new();
        for task in &self.sub_tasks {
            if !seen.insert(task.id.clone()) {
                return Err(JobValidationError::DuplicateSubTaskId(task.id.clone()));
            }
        }

        for task in &self.sub_tasks {
            if task.has_no_dependencies() {
                continue;
            }
            for dep in &task.dependencies {
                if !seen.contains(dep) {
                    return Err(JobValidationError::UnknownDependency(
                        task.id.clone(),
                        dep.clone(),
                    ));
                }
            }
        }

        detect_cycle(&self.sub_tasks)?;
        Ok(())
    }

    /// Renumbers sub-task ids to the dense sequence `1..N` in original order,
    /// rewriting every dependency reference. Per spec §4.F step 8 / §9 note 4
    /// this only happens on the high-coverage path; callers decide when to
    /// invoke it.
    pub fn renumber_sub_tasks(&mut self) {
        let mut remap: HashMap<String, String> = HashMap::new();
        for (idx, task) in self.sub_tasks.iter().enumerate() {
            remap.insert(task.id.clone(), (idx + 1).to_string());
        }
        for task in &mut self.sub_tasks {
            task.id = remap
                .get(&task.id)
                .cloned()
                .unwrap_or_else(|| task.id.clone());
            if task.has_no_dependencies() {
                continue;
            }
            task.dependencies = task
                .dependencies
                .iter()
                .map(|dep| remap.get(dep).cloned().unwrap_or_else(|| dep.clone()))
                .collect();
        }
    }
}

fn detect_cycle(sub_tasks: &[SubTask]) -> Result<(), JobValidationError> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Unvisited,
        Visiting,
        Done,
    }

    let index: HashMap<&str, usize> = sub_tasks
        .iter()
        .enumerate()
        .map(|(i, t)| (t.id.as_str(), i))
        .collect();
    let mut marks = vec![Mark::Unvisited; sub_tasks.len()];

    fn visit(
        i: usize,
        sub_tasks: &[SubTask],
        index: &HashMap<&str, usize>,
        marks: &mut [Mark],
    ) -> Result<(), JobValidationError> {
        match marks[i] {
            Mark::Done => return Ok(()),
            Mark::Visiting => {
                return Err(JobValidationError::CyclicDependency(
                    sub_tasks[i].id.clone(),
                ))
            }
            Mark::Unvisited => {}
        }
        marks[i] = Mark::Visiting;
        if !sub_tasks[i].has_no_dependencies() {
            for dep in &sub_tasks[i].dependencies {
                if let Some(&j) = index.get(dep.as_str()) {
                    visit(j, sub_tasks, index, marks)?;
                }
            }
        }
        marks[i] = Mark::Done;
        Ok(())
    }

    for i in 0..sub_tasks.len() {
        visit(i, sub_tasks, &index, &mut marks)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tool_task(id: &str, deps: Vec<&str>) -> SubTask {
        SubTask {
            id: id.to_string(),
            description: "do a thing".to_string(),
            thought: String::new(),
            expected_output: String::new(),
            action_type: ActionType::Tool,
            tool_or_prompt: ToolOrPrompt {
                name: "webSearch".to_string(),
                params: HashMap::new(),
            },
            dependencies: deps.into_iter().map(str::to_string).collect(),
        }
    }

    fn job_with(sub_tasks: Vec<SubTask>) -> Job {
        Job {
            original_request: "goal".to_string(),
            intent: Intent::default(),
            entities: Vec::new(),
            sub_tasks,
            synthesis_plan: "summarize".to_string(),
            validation: Validation {
                coverage: Coverage::High,
                gaps: Vec::new(),
                iteration_triggers: Vec::new(),
            },
            clarification_needed: false,
            clarification_query: None,
        }
    }

    #[test]
    fn accepts_a_linear_acyclic_graph() {
        let job = job_with(vec![
            tool_task("1", vec!["none"]),
            tool_task("2", vec!["1"]),
        ]);
        assert!(job.validate().is_ok());
    }

    #[test]
    fn rejects_a_cycle() {
        let job = job_with(vec![tool_task("1", vec!["2"]), tool_task("2", vec!["1"])]);
        assert!(matches!(
            job.validate(),
            Err(JobValidationError::CyclicDependency(_))
        ));
    }

    #[test]
    fn rejects_unknown_dependency() {
        let job = job_with(vec![tool_task("1", vec!["none"]), tool_task("2", vec!["9"])]);
        assert!(matches!(
            job.validate(),
            Err(JobValidationError::UnknownDependency(_, _))
        ));
    }

    #[test]
    fn clarification_without_query_is_invalid() {
        let mut job = job_with(vec![tool_task("1", vec!["none"])]);
        job.clarification_needed = true;
        job.clarification_query = Some("   ".to_string());
        assert!(matches!(
            job.validate(),
            Err(JobValidationError::MissingClarificationQuery)
        ));
    }

    #[test]
    fn renumber_produces_dense_ids_and_rewrites_dependencies() {
        let mut job = job_with(vec![
            tool_task("task-a", vec!["none"]),
            tool_task("task-b", vec!["task-a"]),
            tool_task("task-c", vec!["task-a", "task-b"]),
        ]);
        job.renumber_sub_tasks();
        let ids: Vec<&str> = job.sub_tasks.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["1", "2", "3"]);
        assert_eq!(job.sub_tasks[1].dependencies, vec!["1".to_string()]);
        assert_eq!(
            job.sub_tasks[2].dependencies,
            vec!["1".to_string(), "2".to_string()]
        );
    }
}
