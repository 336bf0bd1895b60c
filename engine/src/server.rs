use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::stream::Stream;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::warn;

use dagforge_core::Repository;
use dagforge_orchestrator::{Executor, Planner, ScheduleRequest, Scheduler};
use dagforge_types::Execution;

/// Shared handles for the HTTP surface, per spec.md §6's request surface.
#[derive(Clone)]
pub struct AppState {
    pub repository: Arc<Repository>,
    pub planner: Planner,
    pub executor: Arc<Executor>,
    pub scheduler: Scheduler,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/dags", post(create_dag))
        .route("/dags/{dag_id}/execute", post(execute_dag))
        .route("/executions/{execution_id}/resume", post(resume_dag))
        .route("/executions/{execution_id}/cancel", post(cancel_execution))
        .route("/dags/create_and_execute", post(create_and_execute_dag))
        .route("/schedules", get(list_schedules))
        .route("/events", get(events))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[derive(Debug, Deserialize)]
pub struct CreateDagRequest {
    pub goal_text: String,
    #[serde(default)]
    pub agent_name: Option<String>,
    #[serde(default)]
    pub cron_expression: Option<String>,
    #[serde(default)]
    pub timezone: Option<String>,
}

impl CreateDagRequest {
    fn schedule(&self) -> Option<ScheduleRequest> {
        let expression = self.cron_expression.clone()?;
        Some(ScheduleRequest {
            expression,
            timezone: self.timezone.clone().unwrap_or_else(|| "UTC".to_string()),
        })
    }
}

async fn create_dag(
    State(state): State<AppState>,
    Json(request): Json<CreateDagRequest>,
) -> impl IntoResponse {
    let dag_id = uuid::Uuid::new_v4().to_string();
    let result = state
        .planner
        .plan(
            &dag_id,
            &request.goal_text,
            request.agent_name.as_deref(),
            request.schedule(),
        )
        .await;
    Json(plan_result_body(result))
}

async fn create_and_execute_dag(
    State(state): State<AppState>,
    Json(request): Json<CreateDagRequest>,
) -> impl IntoResponse {
    let dag_id = uuid::Uuid::new_v4().to_string();
    let result = state
        .planner
        .plan(
            &dag_id,
            &request.goal_text,
            request.agent_name.as_deref(),
            request.schedule(),
        )
        .await;

    let Some(new_dag_id) = result.dag_id.clone() else {
        return Json(plan_result_body(result));
    };
    let Some(job) = result.job.clone() else {
        return Json(plan_result_body(result));
    };

    let execution = Execution::new(new_dag_id.clone(), &job);
    let execution_id = execution.execution_id.clone();
    if let Err(err) = state.repository.save_execution(execution).await {
        warn!(dag_id = %new_dag_id, error = %err, "create_and_execute_dag: failed to persist execution");
        return Json(json!({"status": "error", "message": err.to_string()}));
    }

    let executor = state.executor.clone();
    let spawn_dag_id = new_dag_id.clone();
    let spawn_execution_id = execution_id.clone();
    tokio::spawn(async move {
        executor.run(spawn_execution_id, spawn_dag_id, job).await;
    });

    Json(json!({
        "status": "executing",
        "dag_id": new_dag_id,
        "execution_id": execution_id,
    }))
}

async fn execute_dag(
    State(state): State<AppState>,
    Path(dag_id): Path<String>,
) -> impl IntoResponse {
    let dag = match state.repository.get_dag(&dag_id).await {
        Ok(dag) => dag,
        Err(err) => return Json(json!({"status": "error", "message": err.to_string()})),
    };

    let execution = Execution::new(dag_id.clone(), &dag.job);
    let execution_id = execution.execution_id.clone();
    let total_tasks = execution.total_tasks;
    if let Err(err) = state.repository.save_execution(execution).await {
        return Json(json!({"status": "error", "message": err.to_string()}));
    }

    let executor = state.executor.clone();
    let spawn_execution_id = execution_id.clone();
    let job = dag.job;
    tokio::spawn(async move {
        executor.run(spawn_execution_id, dag_id, job).await;
    });

    Json(json!({
        "status": "started",
        "execution_id": execution_id,
        "total_tasks": total_tasks,
    }))
}

async fn resume_dag(
    State(state): State<AppState>,
    Path(execution_id): Path<String>,
) -> impl IntoResponse {
    let executor = state.executor.clone();
    let resume_execution_id = execution_id.clone();
    tokio::spawn(async move {
        if let Err(err) = executor.resume(&resume_execution_id).await {
            warn!(execution_id = %resume_execution_id, error = %err, "resume_dag failed");
        }
    });

    let retry_count = state
        .repository
        .get_execution(&execution_id)
        .await
        .map(|e| e.retry_count + 1)
        .unwrap_or(0);

    Json(json!({
        "status": "resumed",
        "execution_id": execution_id,
        "retry_count": retry_count,
    }))
}

async fn cancel_execution(
    State(state): State<AppState>,
    Path(execution_id): Path<String>,
) -> impl IntoResponse {
    let cancelled = state.executor.cancel_execution(&execution_id).await;
    Json(json!({
        "status": if cancelled { "cancelling" } else { "not_running" },
        "execution_id": execution_id,
    }))
}

async fn list_schedules(State(state): State<AppState>) -> impl IntoResponse {
    let schedules = state
        .scheduler
        .list()
        .await
        .into_iter()
        .map(|s| {
            json!({
                "dag_id": s.dag_id,
                "cron_expression": s.cron_expression,
                "timezone": s.timezone,
                "active": s.active,
                "last_run_at": s.last_run_at,
            })
        })
        .collect::<Vec<_>>();
    Json(json!({ "schedules": schedules }))
}

fn plan_result_body(result: dagforge_orchestrator::PlanResult) -> Value {
    use dagforge_orchestrator::PlanOutcome;
    match result.outcome {
        PlanOutcome::SuccessHighCoverage | PlanOutcome::SuccessLowCoverage => json!({
            "status": "created",
            "dag_id": result.dag_id,
            "title": result.title,
        }),
        PlanOutcome::ClarificationRequired => json!({
            "status": "clarification_required",
            "query": result.job.as_ref().and_then(|j| j.clarification_query.clone()),
            "job": result.job,
        }),
        PlanOutcome::Failed => json!({
            "status": "failed",
            "attempts": result.attempts,
        }),
    }
}

/// SSE stream per spec §6: every event as `{type, execution_id, timestamp,
/// ...}`, heartbeats every 15s while the subscription is open. Subscribers
/// filter by `execution_id` client-side; there's no server-side filtering
/// or back-pressure handling here, matching the core's documented stance
/// that back-pressure is the subscriber's responsibility.
async fn events(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let rx = state.executor.events().subscribe();
    let event_stream = BroadcastStream::new(rx).filter_map(|item| match item {
        Ok(event) => serde_json::to_string(&event)
            .ok()
            .map(|payload| Ok(Event::default().data(payload))),
        Err(_lagged) => None,
    });

    Sse::new(event_stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("heartbeat"),
    )
}
