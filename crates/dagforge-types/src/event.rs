use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The Event Bus's wire envelope (§4.A). Every lifecycle transition the
/// Executor publishes rides in one of the eleven tagged variants named by
/// the event taxonomy; the Planner and Scheduler publish a few additional
/// variants of their own (DAG creation, planning attempts, cron firings)
/// that sit outside that taxonomy but ride the same bus and envelope shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DagEvent {
    #[serde(rename = "dag.created")]
    DagCreated { dag_id: String, timestamp_ms: i64 },
    #[serde(rename = "planning.attempt_started")]
    PlanningAttemptStarted {
        dag_id: String,
        attempt: u32,
        timestamp_ms: i64,
    },
    #[serde(rename = "planning.attempt_failed")]
    PlanningAttemptFailed {
        dag_id: String,
        attempt: u32,
        reason: String,
        timestamp_ms: i64,
    },
    #[serde(rename = "execution.created")]
    ExecutionCreated {
        execution_id: String,
        dag_id: String,
        timestamp_ms: i64,
    },
    /// Emitted after each wave (and on the pending->running transition),
    /// carrying up-to-date progress counters per spec.
    #[serde(rename = "execution.updated")]
    ExecutionUpdated {
        execution_id: String,
        status: String,
        total_tasks: u32,
        completed_tasks: u32,
        failed_tasks: u32,
        waiting_tasks: u32,
        timestamp_ms: i64,
    },
    #[serde(rename = "execution.completed")]
    ExecutionCompleted {
        execution_id: String,
        synthesis: Option<String>,
        timestamp_ms: i64,
    },
    #[serde(rename = "execution.failed")]
    ExecutionFailed {
        execution_id: String,
        error: String,
        timestamp_ms: i64,
    },
    #[serde(rename = "execution.suspended")]
    ExecutionSuspended {
        execution_id: String,
        reason: String,
        timestamp_ms: i64,
    },
    #[serde(rename = "substep.started")]
    SubStepStarted {
        execution_id: String,
        task_id: String,
        sub_step_id: String,
        timestamp_ms: i64,
    },
    #[serde(rename = "substep.completed")]
    SubStepCompleted {
        execution_id: String,
        task_id: String,
        sub_step_id: String,
        duration_ms: i64,
        result: Option<Value>,
        timestamp_ms: i64,
    },
    #[serde(rename = "substep.failed")]
    SubStepFailed {
        execution_id: String,
        task_id: String,
        sub_step_id: String,
        duration_ms: i64,
        error: String,
        timestamp_ms: i64,
    },
    #[serde(rename = "tool.progress")]
    ToolProgress {
        execution_id: String,
        task_id: String,
        sub_step_id: String,
        message: String,
        timestamp_ms: i64,
    },
    #[serde(rename = "tool.completed")]
    ToolCompleted {
        execution_id: String,
        task_id: String,
        sub_step_id: String,
        timestamp_ms: i64,
    },
    #[serde(rename = "schedule.fired")]
    ScheduleFired {
        dag_id: String,
        execution_id: String,
        timestamp_ms: i64,
    },
    #[serde(rename = "schedule.missed")]
    ScheduleMissed {
        dag_id: String,
        scheduled_for_ms: i64,
        timestamp_ms: i64,
    },
}

impl DagEvent {
    /// Current time in epoch milliseconds, used to stamp every event.
    pub fn now_ms() -> i64 {
        Utc::now().timestamp_millis()
    }

    /// The dag/execution identifier this event concerns, used for log fields
    /// and for filtering an SSE subscription to one run.
    pub fn subject_id(&self) -> &str {
        match self {
            DagEvent::DagCreated { dag_id, .. }
            | DagEvent::PlanningAttemptStarted { dag_id, .. }
            | DagEvent::PlanningAttemptFailed { dag_id, .. }
            | DagEvent::ScheduleMissed { dag_id, .. } => dag_id,
            DagEvent::ExecutionCreated { execution_id, .. }
            | DagEvent::ExecutionUpdated { execution_id, .. }
            | DagEvent::ExecutionCompleted { execution_id, .. }
            | DagEvent::ExecutionFailed { execution_id, .. }
            | DagEvent::ExecutionSuspended { execution_id, .. }
            | DagEvent::SubStepStarted { execution_id, .. }
            | DagEvent::SubStepCompleted { execution_id, .. }
            | DagEvent::SubStepFailed { execution_id, .. }
            | DagEvent::ToolProgress { execution_id, .. }
            | DagEvent::ToolCompleted { execution_id, .. }
            | DagEvent::ScheduleFired { execution_id, .. } => execution_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_with_a_type_tag_matching_the_taxonomy() {
        let event = DagEvent::SubStepStarted {
            execution_id: "e1".into(),
            task_id: "1".into(),
            sub_step_id: "1".into(),
            timestamp_ms: 0,
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "substep.started");
    }

    #[test]
    fn subject_id_prefers_execution_id_over_dag_id() {
        let event = DagEvent::ExecutionCreated {
            execution_id: "e1".into(),
            dag_id: "d1".into(),
            timestamp_ms: 0,
        };
        assert_eq!(event.subject_id(), "e1");
    }
}
