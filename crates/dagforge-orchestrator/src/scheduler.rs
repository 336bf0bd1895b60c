use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use dagforge_core::Repository;
use dagforge_types::{DagEvent, DagRecord};

use crate::executor::Executor;

struct Registration {
    handle: JoinHandle<()>,
}

/// A read-only snapshot of one registered schedule, per SPEC_FULL §C.4,
/// mirroring `mofa`'s `CronScheduler::list()`.
#[derive(Debug, Clone)]
pub struct ScheduleInfo {
    pub dag_id: String,
    pub cron_expression: String,
    pub timezone: String,
    pub active: bool,
    pub last_run_at: Option<DateTime<Utc>>,
}

/// The external interface takes standard 5-field cron (per spec §6); the
/// `cron` crate requires a leading seconds field. A bare 5-field expression
/// is widened to 6 fields by fixing seconds at `0`; anything else (6 or 7
/// fields already, or malformed) passes through untouched for `Schedule`
/// to accept or reject.
fn normalize_cron_expression(expression: &str) -> String {
    if expression.split_whitespace().count() == 5 {
        format!("0 {expression}")
    } else {
        expression.to_string()
    }
}

/// Cron-driven trigger for DAGs with an active schedule, per spec §4.H.
/// Grounded on `mofa-foundation`'s `CronScheduler`: one detached tokio task
/// per registration, woken at each cron-computed instant.
#[derive(Clone)]
pub struct Scheduler {
    repository: Arc<Repository>,
    executor: Arc<Executor>,
    registrations: Arc<RwLock<HashMap<String, Registration>>>,
}

impl Scheduler {
    pub fn new(repository: Arc<Repository>, executor: Arc<Executor>) -> Self {
        Self {
            repository,
            executor,
            registrations: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Startup recovery: load every `schedule_active` DAG, check for a
    /// missed run since `last_run_at` (or `created_at`), and register a
    /// live cron task for each. Per spec §4.H step 1, a missed run fires
    /// immediately exactly once, regardless of how many firings were missed.
    pub async fn restore(&self) {
        for dag in self.repository.find_scheduled().await {
            let (Some(expression), Some(timezone)) = (dag.cron_expression.clone(), dag.timezone.clone())
            else {
                continue;
            };
            if let Err(err) = self.register(dag.dag_id.clone(), expression, timezone).await {
                warn!(dag_id = %dag.dag_id, error = %err, "failed to restore cron schedule");
                continue;
            }
            self.check_missed_run(&dag).await;
        }
    }

    async fn check_missed_run(&self, dag: &DagRecord) {
        let (Some(expression), Some(timezone)) = (&dag.cron_expression, &dag.timezone) else {
            return;
        };
        let Ok(schedule) = Schedule::from_str(&normalize_cron_expression(expression)) else {
            return;
        };
        let Ok(tz): Result<Tz, _> = timezone.parse() else {
            return;
        };
        let reference = dag.last_run_at.unwrap_or(dag.created_at);
        let reference_in_tz = reference.with_timezone(&tz);
        let Some(next) = schedule.after(&reference_in_tz).next() else {
            return;
        };
        let next_utc = next.with_timezone(&Utc);
        if next_utc <= Utc::now() {
            info!(dag_id = %dag.dag_id, "missed run detected, firing immediately");
            self.events_missed(dag.dag_id.clone(), next_utc);
            self.fire(dag.dag_id.clone()).await;
        }
    }

    fn events_missed(&self, dag_id: String, scheduled_for: DateTime<Utc>) {
        self.executor.events().publish(DagEvent::ScheduleMissed {
            dag_id,
            scheduled_for_ms: scheduled_for.timestamp_millis(),
            timestamp_ms: DagEvent::now_ms(),
        });
    }

    /// Validates the cron expression and timezone, then spawns a detached
    /// task that sleeps until each scheduled instant and fires the DAG.
    /// Replaces any existing registration for the same `dag_id`.
    pub async fn register(
        &self,
        dag_id: String,
        expression: String,
        timezone: String,
    ) -> anyhow::Result<()> {
        let schedule = Schedule::from_str(&normalize_cron_expression(&expression))
            .map_err(|err| anyhow::anyhow!("invalid cron expression `{expression}`: {err}"))?;
        let tz: Tz = timezone
            .parse()
            .map_err(|_| anyhow::anyhow!("invalid timezone `{timezone}`"))?;

        self.unregister(&dag_id).await;

        let scheduler = self.clone();
        let task_dag_id = dag_id.clone();
        let handle = tokio::spawn(async move {
            loop {
                let now_in_tz = Utc::now().with_timezone(&tz);
                let Some(next) = schedule.after(&now_in_tz).next() else {
                    break;
                };
                let next_utc = next.with_timezone(&Utc);
                let delay = (next_utc - Utc::now())
                    .to_std()
                    .unwrap_or(std::time::Duration::ZERO);
                tokio::time::sleep(delay).await;
                scheduler.fire(task_dag_id.clone()).await;
            }
        });

        self.registrations
            .write()
            .await
            .insert(dag_id, Registration { handle });
        Ok(())
    }

    /// Read-only snapshot of every DAG that has ever carried a cron
    /// expression, for the composition root to surface (SPEC_FULL §C.4).
    /// `active` reflects whether a live task is currently registered for it,
    /// not just the persisted `schedule_active` flag, so a schedule that
    /// failed to restore shows up as inactive rather than silently missing.
    pub async fn list(&self) -> Vec<ScheduleInfo> {
        let registrations = self.registrations.read().await;
        self.repository
            .list_dags()
            .await
            .into_iter()
            .filter_map(|dag| {
                let (expression, timezone) = (dag.cron_expression?, dag.timezone?);
                Some(ScheduleInfo {
                    active: registrations.contains_key(&dag.dag_id),
                    dag_id: dag.dag_id,
                    cron_expression: expression,
                    timezone,
                    last_run_at: dag.last_run_at,
                })
            })
            .collect()
    }

    /// Stops and forgets the task registered for `dag_id`, if any. Idempotent.
    pub async fn unregister(&self, dag_id: &str) {
        if let Some(registration) = self.registrations.write().await.remove(dag_id) {
            registration.handle.abort();
        }
    }

    /// Re-registers `dag_id` with a new expression/active flag: unregisters,
    /// then registers again only if `active`.
    pub async fn update(
        &self,
        dag_id: String,
        expression: String,
        timezone: String,
        active: bool,
    ) -> anyhow::Result<()> {
        self.unregister(&dag_id).await;
        if active {
            self.register(dag_id, expression, timezone).await?;
        }
        Ok(())
    }

    /// Cron-fire callback: updates `last_run_at`, creates a fresh Execution,
    /// and hands off to the Executor without waiting for completion.
    async fn fire(&self, dag_id: String) {
        let mut dag = match self.repository.get_dag(&dag_id).await {
            Ok(dag) => dag,
            Err(err) => {
                error!(dag_id = %dag_id, error = %err, "cron fire: dag no longer exists");
                self.unregister(&dag_id).await;
                return;
            }
        };
        dag.last_run_at = Some(Utc::now());
        if let Err(err) = self.repository.save_dag(dag.clone()).await {
            error!(dag_id = %dag_id, error = %err, "cron fire: failed to record last_run_at");
            return;
        }

        let execution = dagforge_types::Execution::new(dag_id.clone(), &dag.job);
        let execution_id = execution.execution_id.clone();
        if let Err(err) = self.repository.save_execution(execution).await {
            error!(dag_id = %dag_id, error = %err, "cron fire: failed to create execution");
            return;
        }
        self.executor.events().publish(DagEvent::ScheduleFired {
            dag_id: dag_id.clone(),
            execution_id: execution_id.clone(),
            timestamp_ms: DagEvent::now_ms(),
        });

        let executor = self.executor.clone();
        tokio::spawn(async move {
            executor.run(execution_id, dag_id, dag.job).await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dagforge_core::{AppConfig as CoreAppConfig, CancellationRegistry, EventBus};
    use dagforge_providers::ProviderRegistry;
    use dagforge_tools::ToolRegistry;
    use dagforge_types::job::Validation;
    use dagforge_types::{Coverage, DagStatus, Intent, Job, ToolOrPrompt, NO_DEPENDENCIES};

    fn sample_job() -> Job {
        Job {
            original_request: "demo".to_string(),
            intent: Intent {
                primary: "demo".to_string(),
                sub_intents: Vec::new(),
            },
            entities: Vec::new(),
            sub_tasks: vec![dagforge_types::SubTask {
                id: "1".to_string(),
                description: "search".to_string(),
                thought: String::new(),
                expected_output: String::new(),
                action_type: dagforge_types::ActionType::Tool,
                tool_or_prompt: ToolOrPrompt {
                    name: "webSearch".to_string(),
                    params: Default::default(),
                },
                dependencies: vec![NO_DEPENDENCIES.to_string()],
            }],
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

    async fn scheduler_with_tempdir() -> (Scheduler, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let repository = Arc::new(Repository::new(dir.path()).await.unwrap());
        let providers = ProviderRegistry::new(CoreAppConfig::default().into());
        let tools = ToolRegistry::new();
        let events = EventBus::new();
        let cancellations = CancellationRegistry::new();
        let executor = Arc::new(Executor::new(tools, providers, repository.clone(), events, cancellations));
        (Scheduler::new(repository, executor), dir)
    }

    #[tokio::test]
    async fn list_reports_every_dag_that_has_ever_carried_a_schedule() {
        let (scheduler, _dir) = scheduler_with_tempdir().await;

        let mut scheduled = DagRecord::new(sample_job());
        scheduled.status = DagStatus::ScheduleActive;
        scheduled.cron_expression = Some("0 9 * * MON-FRI".to_string());
        scheduled.timezone = Some("UTC".to_string());
        scheduler.repository.save_dag(scheduled.clone()).await.unwrap();

        let unscheduled = DagRecord::new(sample_job());
        scheduler.repository.save_dag(unscheduled).await.unwrap();

        scheduler
            .register(scheduled.dag_id.clone(), "0 9 * * MON-FRI".to_string(), "UTC".to_string())
            .await
            .unwrap();

        let schedules = scheduler.list().await;
        assert_eq!(schedules.len(), 1, "only the DAG carrying a cron expression is listed");
        assert_eq!(schedules[0].dag_id, scheduled.dag_id);
        assert_eq!(schedules[0].cron_expression, "0 9 * * MON-FRI");
        assert!(schedules[0].active, "a registered schedule reports active");
    }

    #[tokio::test]
    async fn list_reports_inactive_for_a_schedule_with_no_live_registration() {
        let (scheduler, _dir) = scheduler_with_tempdir().await;

        let mut scheduled = DagRecord::new(sample_job());
        scheduled.status = DagStatus::ScheduleActive;
        scheduled.cron_expression = Some("0 9 * * MON-FRI".to_string());
        scheduled.timezone = Some("UTC".to_string());
        scheduler.repository.save_dag(scheduled.clone()).await.unwrap();

        let schedules = scheduler.list().await;
        assert_eq!(schedules.len(), 1);
        assert!(!schedules[0].active, "no task was ever registered for this dag");
    }

    #[test]
    fn rejects_an_invalid_cron_expression() {
        assert!(Schedule::from_str("not a cron expression").is_err());
    }

    #[test]
    fn rejects_an_invalid_timezone() {
        let parsed: Result<Tz, _> = "Not/A_Zone".parse();
        assert!(parsed.is_err());
    }

    #[test]
    fn normalizes_a_standard_five_field_expression_by_fixing_seconds_at_zero() {
        assert_eq!(normalize_cron_expression("0 9 * * MON-FRI"), "0 0 9 * * MON-FRI");
        assert!(Schedule::from_str(&normalize_cron_expression("0 9 * * MON-FRI")).is_ok());
    }

    #[test]
    fn leaves_an_already_six_field_expression_untouched() {
        assert_eq!(normalize_cron_expression("0 0 9 * * *"), "0 0 9 * * *");
    }
}
