use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::job::Job;
use crate::provider::TokenUsage;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DagStatus {
    Draft,
    ScheduleActive,
    ScheduleDisabled,
}

/// A persisted DAG: the planner's output plus scheduling metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DagRecord {
    pub dag_id: String,
    pub job: Job,
    pub status: DagStatus,
    pub dag_title: Option<String>,
    pub agent_name: String,
    pub cron_expression: Option<String>,
    pub timezone: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub planning_attempts: Vec<PlanningAttempt>,
    pub last_run_at: Option<DateTime<Utc>>,
}

impl DagRecord {
    pub fn new(job: Job) -> Self {
        Self {
            dag_id: Uuid::new_v4().to_string(),
            job,
            status: DagStatus::Draft,
            dag_title: None,
            agent_name: "planner".to_string(),
            cron_expression: None,
            timezone: None,
            created_at: Utc::now(),
            planning_attempts: Vec::new(),
            last_run_at: None,
        }
    }

    pub fn schedule_active(&self) -> bool {
        self.status == DagStatus::ScheduleActive
    }
}

/// Additive: a retained record of one planning attempt, per SPEC_FULL §C.2.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanningAttempt {
    pub attempt: u32,
    pub reason: Option<String>,
    pub usage: Option<TokenUsage>,
    pub cost_usd: Option<f64>,
    pub error: Option<String>,
    pub at: DateTime<Utc>,
}

/// Execution status per spec §3: `pending` and `waiting` are transient,
/// non-terminal states the wave loop passes through; `completed`, `partial`,
/// `failed`, `suspended` are terminal and monotone — only an explicit resume
/// may move an execution out of one.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Waiting,
    Completed,
    Partial,
    Failed,
    Suspended,
}

impl ExecutionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed
                | ExecutionStatus::Partial
                | ExecutionStatus::Failed
                | ExecutionStatus::Suspended
        )
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SubStepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Blocked,
    Waiting,
}

/// Per-task record within an execution; the `id` mirrors the owning
/// SubTask's id (sub_step and sub_task share an id space in this service,
/// so `sub_step_id` and `task_id` are always equal in practice).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubStep {
    pub id: String,
    pub execution_id: String,
    pub task_id: String,
    pub description: String,
    pub status: SubStepStatus,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub usage: Option<TokenUsage>,
    pub cost_usd: Option<f64>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub wave: u32,
}

impl SubStep {
    pub fn pending(execution_id: impl Into<String>, task_id: impl Into<String>, description: impl Into<String>) -> Self {
        let task_id = task_id.into();
        Self {
            id: task_id.clone(),
            execution_id: execution_id.into(),
            task_id,
            description: description.into(),
            status: SubStepStatus::Pending,
            result: None,
            error: None,
            usage: None,
            cost_usd: None,
            started_at: None,
            finished_at: None,
            duration_ms: None,
            wave: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    pub execution_id: String,
    pub dag_id: String,
    pub original_request: String,
    pub primary_intent: String,
    pub status: ExecutionStatus,
    pub sub_steps: HashMap<String, SubStep>,
    pub total_tasks: u32,
    pub completed_tasks: u32,
    pub failed_tasks: u32,
    pub waiting_tasks: u32,
    pub synthesis_result: Option<String>,
    pub final_result: Option<Value>,
    pub error: Option<String>,
    pub suspended_reason: Option<String>,
    pub suspended_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub last_retry_at: Option<DateTime<Utc>>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
}

impl Execution {
    pub fn new(dag_id: impl Into<String>, job: &Job) -> Self {
        let execution_id = Uuid::new_v4().to_string();
        let dag_id = dag_id.into();
        let sub_steps = job
            .sub_tasks
            .iter()
            .map(|t| {
                (
                    t.id.clone(),
                    SubStep::pending(execution_id.clone(), t.id.clone(), t.description.clone()),
                )
            })
            .collect();
        Self {
            total_tasks: job.sub_tasks.len() as u32,
            execution_id,
            dag_id,
            original_request: job.original_request.clone(),
            primary_intent: job.intent.primary.clone(),
            status: ExecutionStatus::Pending,
            sub_steps,
            completed_tasks: 0,
            failed_tasks: 0,
            waiting_tasks: 0,
            synthesis_result: None,
            final_result: None,
            error: None,
            suspended_reason: None,
            suspended_at: None,
            retry_count: 0,
            last_retry_at: None,
            started_at: Utc::now(),
            completed_at: None,
            duration_ms: None,
        }
    }

    /// Rebuilds the executor's in-memory progress sets from persisted
    /// SubStep rows, per spec §4.G resume semantics: only already-`completed`
    /// steps count, so previously successful work is never repeated.
    pub fn completed_task_ids(&self) -> std::collections::HashSet<String> {
        self.sub_steps
            .values()
            .filter(|s| s.status == SubStepStatus::Completed)
            .map(|s| s.task_id.clone())
            .collect()
    }

    pub fn completed_results(&self) -> HashMap<String, Value> {
        self.sub_steps
            .values()
            .filter(|s| s.status == SubStepStatus::Completed)
            .filter_map(|s| s.result.clone().map(|r| (s.task_id.clone(), r)))
            .collect()
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Recomputes `completed_tasks`/`failed_tasks`/`waiting_tasks` from the
    /// current SubStep rows; called after every wave so counters stay an
    /// honest reflection of `sub_steps` rather than hand-incremented state.
    pub fn recompute_counters(&mut self) {
        self.completed_tasks = self
            .sub_steps
            .values()
            .filter(|s| s.status == SubStepStatus::Completed)
            .count() as u32;
        self.failed_tasks = self
            .sub_steps
            .values()
            .filter(|s| matches!(s.status, SubStepStatus::Failed | SubStepStatus::Blocked))
            .count() as u32;
        self.waiting_tasks = self
            .sub_steps
            .values()
            .filter(|s| matches!(s.status, SubStepStatus::Pending | SubStepStatus::Waiting))
            .count() as u32;
    }
}
