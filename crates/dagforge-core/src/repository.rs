use std::collections::HashMap;
use std::path::{Path, PathBuf};

use dagforge_types::{DagRecord, Execution};
use tokio::fs;
use tokio::sync::RwLock;

#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    #[error("dag `{0}` not found")]
    DagNotFound(String),
    #[error("execution `{0}` not found")]
    ExecutionNotFound(String),
    #[error("storage io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("storage serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// File-backed store for DAG records and executions: an in-memory map
/// mirrored to disk after every mutation, the same shape as the engine's
/// session store.
pub struct Repository {
    base: PathBuf,
    dags: RwLock<HashMap<String, DagRecord>>,
    executions: RwLock<HashMap<String, Execution>>,
}

impl Repository {
    pub async fn new(base: impl AsRef<Path>) -> Result<Self, RepositoryError> {
        let base = base.as_ref().to_path_buf();
        fs::create_dir_all(&base).await?;

        let dags = read_json_map(&base.join("dags.json")).await?;
        let executions = read_json_map(&base.join("executions.json")).await?;

        Ok(Self {
            base,
            dags: RwLock::new(dags),
            executions: RwLock::new(executions),
        })
    }

    pub async fn save_dag(&self, dag: DagRecord) -> Result<(), RepositoryError> {
        self.dags.write().await.insert(dag.dag_id.clone(), dag);
        self.flush_dags().await
    }

    pub async fn get_dag(&self, dag_id: &str) -> Result<DagRecord, RepositoryError> {
        self.dags
            .read()
            .await
            .get(dag_id)
            .cloned()
            .ok_or_else(|| RepositoryError::DagNotFound(dag_id.to_string()))
    }

    /// SPEC_FULL §C.1: the natural companion to `find_scheduled`.
    pub async fn list_dags(&self) -> Vec<DagRecord> {
        self.dags.read().await.values().cloned().collect()
    }

    /// SPEC_FULL §C.1 / spec.md §4.D: DAGs with an active schedule, read by
    /// the Scheduler at startup to rebuild its cron registrations.
    pub async fn find_scheduled(&self) -> Vec<DagRecord> {
        self.dags
            .read()
            .await
            .values()
            .filter(|d| d.schedule_active())
            .cloned()
            .collect()
    }

    pub async fn save_execution(&self, execution: Execution) -> Result<(), RepositoryError> {
        self.executions
            .write()
            .await
            .insert(execution.execution_id.clone(), execution);
        self.flush_executions().await
    }

    pub async fn get_execution(&self, execution_id: &str) -> Result<Execution, RepositoryError> {
        self.executions
            .read()
            .await
            .get(execution_id)
            .cloned()
            .ok_or_else(|| RepositoryError::ExecutionNotFound(execution_id.to_string()))
    }

    pub async fn list_executions_for_dag(&self, dag_id: &str) -> Vec<Execution> {
        self.executions
            .read()
            .await
            .values()
            .filter(|e| e.dag_id == dag_id)
            .cloned()
            .collect()
    }

    async fn flush_dags(&self) -> Result<(), RepositoryError> {
        let snapshot = self.dags.read().await.clone();
        let payload = serde_json::to_string_pretty(&snapshot)?;
        fs::write(self.base.join("dags.json"), payload).await?;
        Ok(())
    }

    async fn flush_executions(&self) -> Result<(), RepositoryError> {
        let snapshot = self.executions.read().await.clone();
        let payload = serde_json::to_string_pretty(&snapshot)?;
        fs::write(self.base.join("executions.json"), payload).await?;
        Ok(())
    }
}

async fn read_json_map<T>(path: &Path) -> Result<HashMap<String, T>, RepositoryError>
where
    T: serde::de::DeserializeOwned,
{
    if !path.exists() {
        return Ok(HashMap::new());
    }
    let raw = fs::read_to_string(path).await?;
    Ok(serde_json::from_str(&raw).unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use dagforge_types::{
        ActionType, Coverage, Intent, Job, SubTask, ToolOrPrompt, Validation, NO_DEPENDENCIES,
    };

    fn sample_job() -> Job {
        Job {
            original_request: "summarize the news".to_string(),
            intent: Intent {
                primary: "summarize".to_string(),
                sub_intents: Vec::new(),
            },
            entities: Vec::new(),
            sub_tasks: vec![SubTask {
                id: "1".to_string(),
                description: "search for news".to_string(),
                thought: String::new(),
                expected_output: String::new(),
                action_type: ActionType::Tool,
                tool_or_prompt: ToolOrPrompt {
                    name: "webSearch".to_string(),
                    params: Default::default(),
                },
                dependencies: vec![NO_DEPENDENCIES.to_string()],
            }],
            synthesis_plan: "summarize the search results".to_string(),
            validation: Validation {
                coverage: Coverage::High,
                gaps: Vec::new(),
                iteration_triggers: Vec::new(),
            },
            clarification_needed: false,
            clarification_query: None,
        }
    }

    #[tokio::test]
    async fn round_trips_a_dag_record_through_a_fresh_repository() {
        let dir = tempfile::tempdir().unwrap();
        let repo = Repository::new(dir.path()).await.unwrap();
        let record = DagRecord::new(sample_job());
        let dag_id = record.dag_id.clone();
        repo.save_dag(record).await.unwrap();

        let reopened = Repository::new(dir.path()).await.unwrap();
        let loaded = reopened.get_dag(&dag_id).await.unwrap();
        assert_eq!(loaded.dag_id, dag_id);
    }

    #[tokio::test]
    async fn find_scheduled_only_returns_active_schedules() {
        let dir = tempfile::tempdir().unwrap();
        let repo = Repository::new(dir.path()).await.unwrap();

        let mut active = DagRecord::new(sample_job());
        active.status = dagforge_types::DagStatus::ScheduleActive;
        let draft = DagRecord::new(sample_job());

        repo.save_dag(active.clone()).await.unwrap();
        repo.save_dag(draft).await.unwrap();

        let scheduled = repo.find_scheduled().await;
        assert_eq!(scheduled.len(), 1);
        assert_eq!(scheduled[0].dag_id, active.dag_id);
    }

    #[tokio::test]
    async fn get_dag_reports_not_found_for_unknown_id() {
        let dir = tempfile::tempdir().unwrap();
        let repo = Repository::new(dir.path()).await.unwrap();
        let err = repo.get_dag("missing").await.unwrap_err();
        assert!(matches!(err, RepositoryError::DagNotFound(_)));
    }
}
