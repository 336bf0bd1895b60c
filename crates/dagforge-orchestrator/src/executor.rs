use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{error, Level};

use dagforge_core::{CancellationRegistry, EventBus, Repository};
use dagforge_observability::{emit_event, ObservabilityEvent, ProcessKind};
use dagforge_providers::{ChatOptions, ProviderRegistry};
use dagforge_tools::{validate_input, ToolRegistry};
use dagforge_types::{
    ActionType, DagEvent, Execution, ExecutionStatus, Job, SubStep, SubStepStatus, SubTask,
};

use crate::resolver::{has_unresolved_placeholder, resolve_params, stringify};

/// The result of one sub-task's `tool` or `inference` action.
type TaskOutcome = Result<(Value, Option<dagforge_types::TokenUsage>, Option<f64>), (&'static str, String)>;

/// The DAG Executor: a wave scheduler that resolves inter-task placeholders,
/// dispatches ready tasks concurrently, and carries an Execution through to
/// a terminal state. Grounded on the teacher's event-driven state-transition
/// idiom (`tandem-orchestrator::reducer`), restructured around dependency
/// waves instead of an approval gate.
#[derive(Clone)]
pub struct Executor {
    tools: ToolRegistry,
    providers: ProviderRegistry,
    repository: Arc<Repository>,
    events: EventBus,
    cancellations: CancellationRegistry,
}

impl Executor {
    pub fn new(
        tools: ToolRegistry,
        providers: ProviderRegistry,
        repository: Arc<Repository>,
        events: EventBus,
        cancellations: CancellationRegistry,
    ) -> Self {
        Self {
            tools,
            providers,
            repository,
            events,
            cancellations,
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// SPEC_FULL §C.3: signals the `CancellationToken` created for this
    /// execution's `drive` loop. Returns `false` when the execution isn't
    /// currently running (already terminal, or never started).
    pub async fn cancel_execution(&self, execution_id: &str) -> bool {
        self.cancellations.cancel(execution_id).await
    }

    /// Entry point for a fresh Execution: the caller (engine or Scheduler)
    /// has already persisted the Execution and its `pending` SubSteps.
    pub async fn run(&self, execution_id: String, _dag_id: String, job: Job) {
        let execution = match self.repository.get_execution(&execution_id).await {
            Ok(execution) => execution,
            Err(err) => {
                error!(execution_id = %execution_id, error = %err, "executor: execution not found");
                return;
            }
        };
        self.drive(job, execution).await;
    }

    /// Resume semantics (§4.G): increments `retry_count`/`last_retry_at`,
    /// resets previously-`failed` SubSteps back to `pending` so they are
    /// re-dispatched, and re-enters the wave loop preserving `completed`
    /// SubStep results.
    pub async fn resume(&self, execution_id: &str) -> anyhow::Result<()> {
        let mut execution = self.repository.get_execution(execution_id).await?;
        let dag = self.repository.get_dag(&execution.dag_id).await?;

        execution.retry_count += 1;
        execution.last_retry_at = Some(Utc::now());
        execution.suspended_reason = None;
        execution.suspended_at = None;
        execution.error = None;
        for step in execution.sub_steps.values_mut() {
            if step.status == SubStepStatus::Failed {
                step.status = SubStepStatus::Pending;
                step.error = None;
            }
        }
        self.repository.save_execution(execution.clone()).await?;

        self.drive(dag.job, execution).await;
        Ok(())
    }

    async fn drive(&self, job: Job, mut execution: Execution) {
        let cancel = self.cancellations.create(execution.execution_id.clone()).await;
        execution.status = ExecutionStatus::Running;
        execution.recompute_counters();
        self.persist_and_emit_updated(&mut execution).await;

        let mut executed_ids: HashSet<String> = execution.completed_task_ids();
        let mut processed_ids: HashSet<String> = executed_ids.clone();
        let mut task_results: HashMap<String, Value> = execution.completed_results();

        loop {
            if cancel.is_cancelled() {
                self.suspend(&mut execution, "cancelled".to_string()).await;
                break;
            }

            let ready: Vec<SubTask> = job
                .sub_tasks
                .iter()
                .filter(|t| !processed_ids.contains(&t.id))
                .filter(|t| {
                    t.has_no_dependencies()
                        || t.dependencies.iter().all(|d| executed_ids.contains(d))
                })
                .cloned()
                .collect();

            if ready.is_empty() {
                if processed_ids.len() == job.sub_tasks.len() {
                    self.finish(&mut execution, &job, &task_results, cancel.clone()).await;
                } else {
                    let blocked: Vec<&str> = job
                        .sub_tasks
                        .iter()
                        .map(|t| t.id.as_str())
                        .filter(|id| !processed_ids.contains(*id))
                        .collect();
                    self.suspend(
                        &mut execution,
                        format!("deadlock: tasks {{{}}} blocked", blocked.join(", ")),
                    )
                    .await;
                }
                break;
            }

            let wave_number = execution
                .sub_steps
                .values()
                .map(|s| s.wave)
                .max()
                .unwrap_or(0)
                + 1;

            for task in &ready {
                if let Some(step) = execution.sub_steps.get_mut(&task.id) {
                    step.status = SubStepStatus::Running;
                    step.started_at = Some(Utc::now());
                    step.wave = wave_number;
                }
                self.events.publish(DagEvent::SubStepStarted {
                    execution_id: execution.execution_id.clone(),
                    task_id: task.id.clone(),
                    sub_step_id: task.id.clone(),
                    timestamp_ms: DagEvent::now_ms(),
                });
            }
            self.repository
                .save_execution(execution.clone())
                .await
                .ok();

            let outcomes = futures::future::join_all(ready.iter().map(|task| {
                self.run_sub_task(&execution.execution_id, task, &task_results, cancel.clone())
            }))
            .await;

            for (task, outcome) in ready.iter().zip(outcomes) {
                let started_at = execution
                    .sub_steps
                    .get(&task.id)
                    .and_then(|s| s.started_at)
                    .unwrap_or_else(Utc::now);
                let finished_at = Utc::now();
                let duration_ms = (finished_at - started_at).num_milliseconds();

                match outcome {
                    Ok((value, usage, cost_usd)) => {
                        executed_ids.insert(task.id.clone());
                        processed_ids.insert(task.id.clone());
                        task_results.insert(task.id.clone(), value.clone());
                        if let Some(step) = execution.sub_steps.get_mut(&task.id) {
                            step.status = SubStepStatus::Completed;
                            step.result = Some(value.clone());
                            step.usage = usage;
                            step.cost_usd = cost_usd;
                            step.finished_at = Some(finished_at);
                            step.duration_ms = Some(duration_ms);
                        }
                        self.events.publish(DagEvent::SubStepCompleted {
                            execution_id: execution.execution_id.clone(),
                            task_id: task.id.clone(),
                            sub_step_id: task.id.clone(),
                            duration_ms,
                            result: Some(value),
                            timestamp_ms: DagEvent::now_ms(),
                        });
                    }
                    Err((kind, message)) => {
                        processed_ids.insert(task.id.clone());
                        let error = format!("{kind}: {message}");
                        if let Some(step) = execution.sub_steps.get_mut(&task.id) {
                            step.status = if kind == "blocked" {
                                SubStepStatus::Blocked
                            } else {
                                SubStepStatus::Failed
                            };
                            step.error = Some(error.clone());
                            step.finished_at = Some(finished_at);
                            step.duration_ms = Some(duration_ms);
                        }
                        emit_event(
                            Level::WARN,
                            ProcessKind::Engine,
                            ObservabilityEvent {
                                event: "sub_step_failed",
                                component: "executor",
                                correlation_id: None,
                                dag_id: Some(execution.dag_id.as_str()),
                                execution_id: Some(execution.execution_id.as_str()),
                                task_id: Some(task.id.as_str()),
                                provider_id: None,
                                model_id: None,
                                status: Some(kind),
                                error_code: Some(kind),
                                detail: Some(message.as_str()),
                            },
                        );
                        self.events.publish(DagEvent::SubStepFailed {
                            execution_id: execution.execution_id.clone(),
                            task_id: task.id.clone(),
                            sub_step_id: task.id.clone(),
                            duration_ms,
                            error,
                            timestamp_ms: DagEvent::now_ms(),
                        });
                    }
                }
            }

            execution.recompute_counters();
            self.persist_and_emit_updated(&mut execution).await;
        }

        self.cancellations.remove(&execution.execution_id).await;
    }

    /// Runs one sub-task's tool or inference action, racing it against the
    /// execution's cancellation signal per spec §5's cooperative-cancellation
    /// model.
    async fn run_sub_task(
        &self,
        execution_id: &str,
        task: &SubTask,
        task_results: &HashMap<String, Value>,
        cancel: CancellationToken,
    ) -> TaskOutcome {
        let body = self.run_sub_task_body(execution_id, task, task_results, cancel.clone());
        tokio::select! {
            _ = cancel.cancelled() => Err(("cancelled", "execution was cancelled".to_string())),
            outcome = body => outcome,
        }
    }

    async fn run_sub_task_body(
        &self,
        execution_id: &str,
        task: &SubTask,
        task_results: &HashMap<String, Value>,
        cancel: CancellationToken,
    ) -> TaskOutcome {
        match task.action_type {
            ActionType::Tool => {
                let tool_name = &task.tool_or_prompt.name;
                let Some(tool) = self.tools.get(tool_name).await else {
                    return Err(("tool_not_found", format!("no tool registered as `{tool_name}`")));
                };
                let resolved = resolve_params(tool_name, &task.tool_or_prompt.params, task_results);
                if has_unresolved_placeholder(&resolved) {
                    return Err(("blocked", "a referenced task result is missing".to_string()));
                }
                let schema = tool.schema();
                let input = Value::Object(resolved.into_iter().collect());
                if let Err(err) = validate_input(&schema, &input) {
                    return Err(("input_invalid", err.to_string()));
                }
                self.events.publish(DagEvent::ToolProgress {
                    execution_id: execution_id.to_string(),
                    task_id: task.id.clone(),
                    sub_step_id: task.id.clone(),
                    message: format!("invoking `{tool_name}`"),
                    timestamp_ms: DagEvent::now_ms(),
                });
                match tool.execute_with_cancel(input, cancel).await {
                    Ok(result) => {
                        self.events.publish(DagEvent::ToolCompleted {
                            execution_id: execution_id.to_string(),
                            task_id: task.id.clone(),
                            sub_step_id: task.id.clone(),
                            timestamp_ms: DagEvent::now_ms(),
                        });
                        Ok((result.output, None, None))
                    }
                    Err(err) => Err(("tool_error", err.to_string())),
                }
            }
            ActionType::Inference => {
                let resolved = resolve_params(
                    &task.tool_or_prompt.name,
                    &task.tool_or_prompt.params,
                    task_results,
                );
                let prompt_text = resolved
                    .get("prompt")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| task.description.clone());

                let context_block = if task.has_no_dependencies() {
                    String::new()
                } else {
                    task.dependencies
                        .iter()
                        .filter_map(|dep| task_results.get(dep))
                        .map(stringify)
                        .collect::<Vec<_>>()
                        .join("\n\n")
                };

                let full_prompt = if context_block.is_empty() {
                    prompt_text
                } else {
                    format!("{prompt_text}\n\n{context_block}")
                };

                match self
                    .providers
                    .chat_for_provider(None, &full_prompt, None, &ChatOptions::default())
                    .await
                {
                    Ok(result) => Ok((Value::String(result.content), result.usage, result.cost_usd)),
                    Err(err) => Err(("chat_error", err.to_string())),
                }
            }
        }
    }

    /// All ready-or-failed tasks have been processed with no deadlock.
    /// Attempts synthesis; `completed` iff every task succeeded and
    /// synthesis succeeded, else `partial`.
    async fn finish(
        &self,
        execution: &mut Execution,
        job: &Job,
        task_results: &HashMap<String, Value>,
        cancel: CancellationToken,
    ) {
        let context = job
            .sub_tasks
            .iter()
            .map(|t| match task_results.get(&t.id) {
                Some(value) => format!("{}: {}", t.id, stringify(value)),
                None => format!("{}: <failed>", t.id),
            })
            .collect::<Vec<_>>()
            .join("\n\n");
        let prompt = format!("{}\n\n{context}", job.synthesis_plan);

        let default_chat_options = ChatOptions::default();
        let synthesis = tokio::select! {
            _ = cancel.cancelled() => None,
            result = self.providers.chat_for_provider(None, &prompt, None, &default_chat_options) => result.ok(),
        };

        let any_failed = execution.failed_tasks > 0;
        match synthesis {
            Some(result) => {
                execution.synthesis_result = Some(result.content.clone());
                execution.final_result = Some(Value::String(result.content));
                execution.status = if any_failed {
                    ExecutionStatus::Partial
                } else {
                    ExecutionStatus::Completed
                };
            }
            None => {
                execution.error = Some("executor.synthesis_error: final synthesis call failed".to_string());
                execution.status = ExecutionStatus::Partial;
            }
        }

        let now = Utc::now();
        execution.completed_at = Some(now);
        execution.duration_ms = Some((now - execution.started_at).num_milliseconds());
        self.finalize(execution).await;
    }

    async fn suspend(&self, execution: &mut Execution, reason: String) {
        execution.status = ExecutionStatus::Suspended;
        execution.suspended_reason = Some(reason.clone());
        execution.suspended_at = Some(Utc::now());
        self.events.publish(DagEvent::ExecutionSuspended {
            execution_id: execution.execution_id.clone(),
            reason,
            timestamp_ms: DagEvent::now_ms(),
        });
        self.finalize(execution).await;
    }

    async fn persist_and_emit_updated(&self, execution: &mut Execution) {
        if let Err(err) = self.repository.save_execution(execution.clone()).await {
            error!(execution_id = %execution.execution_id, error = %err, "failed to persist execution");
        }
        self.events.publish(DagEvent::ExecutionUpdated {
            execution_id: execution.execution_id.clone(),
            status: status_label(execution.status).to_string(),
            total_tasks: execution.total_tasks,
            completed_tasks: execution.completed_tasks,
            failed_tasks: execution.failed_tasks,
            waiting_tasks: execution.waiting_tasks,
            timestamp_ms: DagEvent::now_ms(),
        });
    }

    async fn finalize(&self, execution: &mut Execution) {
        execution.recompute_counters();
        if let Err(err) = self.repository.save_execution(execution.clone()).await {
            error!(execution_id = %execution.execution_id, error = %err, "failed to persist terminal execution state");
        }
        match execution.status {
            ExecutionStatus::Completed => {
                emit_event(
                    Level::INFO,
                    ProcessKind::Engine,
                    ObservabilityEvent {
                        event: "execution_completed",
                        component: "executor",
                        correlation_id: None,
                        dag_id: Some(execution.dag_id.as_str()),
                        execution_id: Some(execution.execution_id.as_str()),
                        task_id: None,
                        provider_id: None,
                        model_id: None,
                        status: Some("completed"),
                        error_code: None,
                        detail: None,
                    },
                );
                self.events.publish(DagEvent::ExecutionCompleted {
                    execution_id: execution.execution_id.clone(),
                    synthesis: execution.synthesis_result.clone(),
                    timestamp_ms: DagEvent::now_ms(),
                });
            }
            ExecutionStatus::Failed | ExecutionStatus::Partial => {
                let error = execution.error.clone().unwrap_or_default();
                emit_event(
                    Level::ERROR,
                    ProcessKind::Engine,
                    ObservabilityEvent {
                        event: "execution_failed",
                        component: "executor",
                        correlation_id: None,
                        dag_id: Some(execution.dag_id.as_str()),
                        execution_id: Some(execution.execution_id.as_str()),
                        task_id: None,
                        provider_id: None,
                        model_id: None,
                        status: Some(status_label(execution.status)),
                        error_code: None,
                        detail: Some(error.as_str()),
                    },
                );
                self.events.publish(DagEvent::ExecutionFailed {
                    execution_id: execution.execution_id.clone(),
                    error,
                    timestamp_ms: DagEvent::now_ms(),
                });
            }
            ExecutionStatus::Suspended => {
                emit_event(
                    Level::WARN,
                    ProcessKind::Engine,
                    ObservabilityEvent {
                        event: "execution_suspended",
                        component: "executor",
                        correlation_id: None,
                        dag_id: Some(execution.dag_id.as_str()),
                        execution_id: Some(execution.execution_id.as_str()),
                        task_id: None,
                        provider_id: None,
                        model_id: None,
                        status: Some("suspended"),
                        error_code: None,
                        detail: execution.suspended_reason.as_deref(),
                    },
                );
            }
            _ => {}
        }
    }
}

fn status_label(status: ExecutionStatus) -> &'static str {
    match status {
        ExecutionStatus::Pending => "pending",
        ExecutionStatus::Running => "running",
        ExecutionStatus::Waiting => "waiting",
        ExecutionStatus::Completed => "completed",
        ExecutionStatus::Partial => "partial",
        ExecutionStatus::Failed => "failed",
        ExecutionStatus::Suspended => "suspended",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dagforge_core::AppConfig as CoreAppConfig;
    use dagforge_types::job::Validation;
    use dagforge_types::{Coverage, Intent, ToolOrPrompt, NO_DEPENDENCIES};
    use std::collections::HashMap as StdHashMap;

    fn sample_task(id: &str, deps: Vec<&str>) -> SubTask {
        SubTask {
            id: id.to_string(),
            description: format!("task {id}"),
            thought: String::new(),
            expected_output: String::new(),
            action_type: ActionType::Tool,
            tool_or_prompt: ToolOrPrompt {
                name: "webSearch".to_string(),
                params: StdHashMap::new(),
            },
            dependencies: if deps.is_empty() {
                vec![NO_DEPENDENCIES.to_string()]
            } else {
                deps.into_iter().map(str::to_string).collect()
            },
        }
    }

    fn sample_job(tasks: Vec<SubTask>) -> Job {
        Job {
            original_request: "demo".to_string(),
            intent: Intent {
                primary: "demo".to_string(),
                sub_intents: Vec::new(),
            },
            entities: Vec::new(),
            sub_tasks: tasks,
            synthesis_plan: "summarize the results".to_string(),
            validation: Validation {
                coverage: Coverage::High,
                gaps: Vec::new(),
                iteration_triggers: Vec::new(),
            },
            clarification_needed: false,
            clarification_query: None,
        }
    }

    async fn executor_with_tempdir() -> (Executor, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let repository = Arc::new(Repository::new(dir.path()).await.unwrap());
        let providers = ProviderRegistry::new(CoreAppConfig::default().into());
        let tools = ToolRegistry::new();
        let events = EventBus::new();
        let cancellations = CancellationRegistry::new();
        (
            Executor::new(tools, providers, repository, events, cancellations),
            dir,
        )
    }

    #[tokio::test]
    async fn cancel_execution_reports_false_for_an_execution_that_never_started() {
        let (executor, _dir) = executor_with_tempdir().await;
        assert!(!executor.cancel_execution("no-such-execution").await);
    }

    #[tokio::test]
    async fn deadlock_on_a_dependency_cycle_suspends_the_execution() {
        let (executor, _dir) = executor_with_tempdir().await;
        let job = sample_job(vec![sample_task("1", vec!["2"]), sample_task("2", vec!["1"])]);
        let mut execution = Execution::new("dag-1", &job);
        execution.execution_id = "exec-cycle".to_string();
        executor
            .repository
            .save_execution(execution.clone())
            .await
            .unwrap();

        executor.run(execution.execution_id.clone(), "dag-1".to_string(), job).await;

        let reloaded = executor
            .repository
            .get_execution(&execution.execution_id)
            .await
            .unwrap();
        assert_eq!(reloaded.status, ExecutionStatus::Suspended);
        assert!(reloaded
            .suspended_reason
            .as_deref()
            .unwrap_or_default()
            .contains("deadlock"));
    }

    #[tokio::test]
    async fn unknown_tool_fails_the_task_and_leaves_dependents_suspended() {
        let (executor, _dir) = executor_with_tempdir().await;
        let mut independent = sample_task("1", vec![]);
        independent.tool_or_prompt.name = "doesNotExist".to_string();
        let dependent = sample_task("2", vec!["1"]);
        let job = sample_job(vec![independent, dependent]);
        let mut execution = Execution::new("dag-2", &job);
        execution.execution_id = "exec-unknown-tool".to_string();
        executor
            .repository
            .save_execution(execution.clone())
            .await
            .unwrap();

        executor.run(execution.execution_id.clone(), "dag-2".to_string(), job).await;

        let reloaded = executor
            .repository
            .get_execution(&execution.execution_id)
            .await
            .unwrap();
        assert_eq!(reloaded.status, ExecutionStatus::Suspended);
        assert_eq!(reloaded.failed_tasks, 1);
        assert_eq!(
            reloaded.sub_steps["1"].error.as_deref().unwrap_or_default(),
            "tool_not_found: no tool registered as `doesNotExist`"
        );
    }

    #[tokio::test]
    async fn resume_does_not_re_run_a_completed_sub_step() {
        let (executor, _dir) = executor_with_tempdir().await;
        let job = sample_job(vec![sample_task("1", vec![])]);
        let mut execution = Execution::new("dag-3", &job);
        execution.execution_id = "exec-resume".to_string();
        execution.status = ExecutionStatus::Suspended;
        if let Some(step) = execution.sub_steps.get_mut("1") {
            step.status = SubStepStatus::Completed;
            step.result = Some(Value::String("cached result".to_string()));
        }
        executor
            .repository
            .save_dag(dagforge_types::DagRecord {
                dag_id: "dag-3".to_string(),
                job: job.clone(),
                status: dagforge_types::DagStatus::Draft,
                dag_title: None,
                agent_name: "planner".to_string(),
                cron_expression: None,
                timezone: None,
                created_at: Utc::now(),
                planning_attempts: Vec::new(),
                last_run_at: None,
            })
            .await
            .unwrap();
        executor
            .repository
            .save_execution(execution.clone())
            .await
            .unwrap();

        executor.resume(&execution.execution_id).await.unwrap();

        let reloaded = executor
            .repository
            .get_execution(&execution.execution_id)
            .await
            .unwrap();
        assert_eq!(reloaded.retry_count, 1);
        assert_eq!(
            reloaded.sub_steps["1"].result,
            Some(Value::String("cached result".to_string()))
        );
    }
}
