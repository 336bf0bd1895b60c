use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tracing::{warn, Level};

use dagforge_core::{AgentRegistry, EventBus, PlannerConfig, Repository};
use dagforge_observability::{emit_event, redact_text, ObservabilityEvent, ProcessKind};
use dagforge_providers::{ChatOptions, ProviderRegistry};
use dagforge_tools::ToolRegistry;
use dagforge_types::{Coverage, DagEvent, DagRecord, DagStatus, Job, PlanningAttempt, TokenUsage};

use crate::scheduler::Scheduler;

/// A cron registration requested alongside planning, per spec §4.F step 10.
#[derive(Debug, Clone)]
pub struct ScheduleRequest {
    pub expression: String,
    pub timezone: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanOutcome {
    SuccessHighCoverage,
    SuccessLowCoverage,
    ClarificationRequired,
    Failed,
}

#[derive(Debug, Clone)]
pub struct PlanResult {
    pub outcome: PlanOutcome,
    pub dag_id: Option<String>,
    pub job: Option<Job>,
    pub title: Option<String>,
    pub planning_usage: TokenUsage,
    pub planning_cost: f64,
    pub attempts: Vec<PlanningAttempt>,
}

const MAX_RESPONSE_BYTES: usize = 100 * 1024;

#[derive(Clone)]
pub struct Planner {
    providers: ProviderRegistry,
    agents: AgentRegistry,
    tools: ToolRegistry,
    repository: Arc<Repository>,
    events: EventBus,
    scheduler: Scheduler,
    config: PlannerConfig,
}

impl Planner {
    pub fn new(
        providers: ProviderRegistry,
        agents: AgentRegistry,
        tools: ToolRegistry,
        repository: Arc<Repository>,
        events: EventBus,
        scheduler: Scheduler,
        config: PlannerConfig,
    ) -> Self {
        Self {
            providers,
            agents,
            tools,
            repository,
            events,
            scheduler,
            config,
        }
    }

    /// `plan(goal_text, agent) → {outcome, job?, title?, planning_usage,
    /// planning_cost, attempts}` per spec §4.F. `dag_id` is pre-allocated by
    /// the caller so `planning.attempt_started` events can reference it
    /// before a DagRecord exists.
    pub async fn plan(
        &self,
        dag_id: &str,
        goal_text: &str,
        agent_name: Option<&str>,
        schedule: Option<ScheduleRequest>,
    ) -> PlanResult {
        let agent = self.agents.get(agent_name).await;
        let current_date = Utc::now().format("%Y-%m-%d").to_string();
        let tools_json = serde_json::to_string(&self.tools.list().await).unwrap_or_default();

        let system_prompt = substitute(&agent.system_prompt, &tools_json, &current_date);
        let mut user_prompt = substitute(goal_text, &tools_json, &current_date);

        let mut attempts = Vec::new();
        let mut usage_total = TokenUsage::default();
        let mut cost_total = 0.0_f64;
        let options = ChatOptions {
            temperature: Some(self.config.temperature),
            max_tokens: Some(self.config.max_tokens),
            seed: None,
            reasoning_effort: None,
        };

        let mut outcome_job: Option<(PlanOutcome, Job)> = None;

        for attempt_number in 1..=self.config.max_attempts {
            self.events.publish(DagEvent::PlanningAttemptStarted {
                dag_id: dag_id.to_string(),
                attempt: attempt_number,
                timestamp_ms: DagEvent::now_ms(),
            });

            let full_prompt = format!("{system_prompt}\n\n{user_prompt}");
            let chat = self
                .providers
                .chat_for_provider(None, &full_prompt, None, &options)
                .await;

            let chat = match chat {
                Ok(result) => result,
                Err(err) => {
                    self.record_attempt_failure(dag_id, &mut attempts, attempt_number, err.to_string());
                    continue;
                }
            };

            accumulate_usage(&mut usage_total, chat.usage);
            cost_total += chat.cost_usd.unwrap_or(0.0);

            if chat.content.len() > MAX_RESPONSE_BYTES {
                self.record_attempt_failure(
                    dag_id,
                    &mut attempts,
                    attempt_number,
                    format!(
                        "response of {} bytes exceeds the {}-byte limit",
                        chat.content.len(),
                        MAX_RESPONSE_BYTES
                    ),
                );
                continue;
            }

            let extracted = extract_job_json(&chat.content);
            let Some(raw) = extracted else {
                self.record_attempt_failure(
                    dag_id,
                    &mut attempts,
                    attempt_number,
                    "no fenced `json` code block found in the model response".to_string(),
                );
                continue;
            };

            let parsed: Result<Job, _> = serde_json::from_str(&raw);
            let job = match parsed {
                Ok(job) => job,
                Err(err) => {
                    let diagnostic = diagnostic_context(&raw, err.line(), err.column());
                    self.record_attempt_failure(
                        dag_id,
                        &mut attempts,
                        attempt_number,
                        format!("{err} near:\n{diagnostic}"),
                    );
                    continue;
                }
            };

            if let Err(err) = job.validate() {
                self.record_attempt_failure(dag_id, &mut attempts, attempt_number, err.to_string());
                continue;
            }

            if job.clarification_needed {
                attempts.push(PlanningAttempt {
                    attempt: attempt_number,
                    reason: Some("clarification_needed".to_string()),
                    usage: chat.usage,
                    cost_usd: chat.cost_usd,
                    error: None,
                    at: Utc::now(),
                });
                return PlanResult {
                    outcome: PlanOutcome::ClarificationRequired,
                    dag_id: None,
                    job: Some(job),
                    title: None,
                    planning_usage: usage_total,
                    planning_cost: cost_total,
                    attempts,
                };
            }

            if job.validation.coverage == Coverage::High {
                outcome_job = Some((PlanOutcome::SuccessHighCoverage, job));
                attempts.push(PlanningAttempt {
                    attempt: attempt_number,
                    reason: None,
                    usage: chat.usage,
                    cost_usd: chat.cost_usd,
                    error: None,
                    at: Utc::now(),
                });
                break;
            }

            if !job.validation.gaps.is_empty() {
                attempts.push(PlanningAttempt {
                    attempt: attempt_number,
                    reason: Some(format!("coverage gaps: {}", job.validation.gaps.join("; "))),
                    usage: chat.usage,
                    cost_usd: chat.cost_usd,
                    error: None,
                    at: Utc::now(),
                });
                user_prompt = augment_with_gaps(&user_prompt, &job.validation.gaps);
                continue;
            }

            outcome_job = Some((PlanOutcome::SuccessLowCoverage, job));
            attempts.push(PlanningAttempt {
                attempt: attempt_number,
                reason: None,
                usage: chat.usage,
                cost_usd: chat.cost_usd,
                error: None,
                at: Utc::now(),
            });
            break;
        }

        let Some((outcome, mut job)) = outcome_job else {
            return PlanResult {
                outcome: PlanOutcome::Failed,
                dag_id: None,
                job: None,
                title: None,
                planning_usage: usage_total,
                planning_cost: cost_total,
                attempts,
            };
        };

        if outcome == PlanOutcome::SuccessHighCoverage {
            job.renumber_sub_tasks();
            job.original_request = goal_text.to_string();
        }

        let title = self.generate_title(goal_text).await;

        let mut record = DagRecord::new(job.clone());
        record.dag_title = title.clone();
        record.agent_name = agent.name.clone();
        record.planning_attempts = attempts.clone();
        if let Some(schedule) = &schedule {
            record.cron_expression = Some(schedule.expression.clone());
            record.timezone = Some(schedule.timezone.clone());
            record.status = DagStatus::ScheduleActive;
        }

        let new_dag_id = record.dag_id.clone();
        if let Err(err) = self.repository.save_dag(record).await {
            warn!(dag_id = %new_dag_id, error = %err, "failed to persist planned DAG");
        } else {
            self.events.publish(DagEvent::DagCreated {
                dag_id: new_dag_id.clone(),
                timestamp_ms: DagEvent::now_ms(),
            });
        }

        if let Some(schedule) = schedule {
            if let Err(err) = self
                .scheduler
                .register(new_dag_id.clone(), schedule.expression, schedule.timezone)
                .await
            {
                warn!(dag_id = %new_dag_id, error = %err, "failed to register cron schedule");
            }
        }

        PlanResult {
            outcome,
            dag_id: Some(new_dag_id),
            job: Some(job),
            title,
            planning_usage: usage_total,
            planning_cost: cost_total,
            attempts,
        }
    }

    async fn generate_title(&self, goal_text: &str) -> Option<String> {
        let agent = self.agents.get(Some("title")).await;
        let prompt = format!("{}\n\n{}", agent.system_prompt, goal_text);
        match self
            .providers
            .chat_for_provider(None, &prompt, None, &ChatOptions::default())
            .await
        {
            Ok(result) => {
                let title = result.content.trim().trim_matches('"').to_string();
                if title.is_empty() {
                    None
                } else {
                    Some(title)
                }
            }
            Err(err) => {
                warn!(error = %err, "title generation failed; leaving dag_title empty");
                None
            }
        }
    }

    fn record_attempt_failure(
        &self,
        dag_id: &str,
        attempts: &mut Vec<PlanningAttempt>,
        attempt_number: u32,
        reason: String,
    ) {
        let redacted_reason = redact_text(&reason);
        emit_event(
            Level::WARN,
            ProcessKind::Engine,
            ObservabilityEvent {
                event: "planning_attempt_failed",
                component: "planner",
                correlation_id: None,
                dag_id: Some(dag_id),
                execution_id: None,
                task_id: None,
                provider_id: None,
                model_id: None,
                status: None,
                error_code: None,
                detail: Some(redacted_reason.as_str()),
            },
        );
        self.events.publish(DagEvent::PlanningAttemptFailed {
            dag_id: dag_id.to_string(),
            attempt: attempt_number,
            reason: reason.clone(),
            timestamp_ms: DagEvent::now_ms(),
        });
        attempts.push(PlanningAttempt {
            attempt: attempt_number,
            reason: None,
            usage: None,
            cost_usd: None,
            error: Some(reason),
            at: Utc::now(),
        });
    }
}

fn substitute(template: &str, tools_json: &str, current_date: &str) -> String {
    template
        .replace("{{tools}}", tools_json)
        .replace("{{currentDate}}", current_date)
}

fn augment_with_gaps(user_prompt: &str, gaps: &[String]) -> String {
    let numbered = gaps
        .iter()
        .enumerate()
        .map(|(idx, gap)| format!("{}. {}", idx + 1, gap))
        .collect::<Vec<_>>()
        .join("\n");
    format!(
        "{user_prompt}\n\nThe previous plan left these gaps uncovered; revise the plan to address them:\n{numbered}"
    )
}

fn accumulate_usage(total: &mut TokenUsage, usage: Option<TokenUsage>) {
    let Some(usage) = usage else {
        return;
    };
    total.prompt_tokens += usage.prompt_tokens;
    total.completion_tokens += usage.completion_tokens;
    total.total_tokens += usage.total_tokens;
}

/// Strict extractor: requires a fenced ```json code block, per spec §4.F
/// step 4. Returns the block's inner text, untrimmed of surrounding JSON
/// whitespace (serde_json tolerates it).
fn extract_job_json(content: &str) -> Option<String> {
    let marker = "```json";
    let start = content.find(marker)? + marker.len();
    let rest = &content[start..];
    let end = rest.find("```")?;
    Some(rest[..end].trim().to_string())
}

/// Diagnostic extractor: given a parse failure's line/column, returns a
/// 5-line context window centred on the failure for attempt-log readability.
fn diagnostic_context(source: &str, line: usize, column: usize) -> String {
    let lines: Vec<&str> = source.lines().collect();
    if lines.is_empty() {
        return String::new();
    }
    let failing = line.saturating_sub(1).min(lines.len() - 1);
    let start = failing.saturating_sub(2);
    let end = (failing + 2).min(lines.len() - 1);
    let mut out = String::new();
    for (idx, text) in lines[start..=end].iter().enumerate() {
        let lineno = start + idx + 1;
        let marker = if lineno == line { ">" } else { " " };
        out.push_str(&format!("{marker} {lineno:>4} | {text}\n"));
    }
    out.push_str(&format!("{}^ column {column}\n", " ".repeat(8 + column.saturating_sub(1))));
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn substitute_replaces_both_placeholders() {
        let out = substitute("tools: {{tools}} date: {{currentDate}}", "[]", "2026-08-01");
        assert_eq!(out, "tools: [] date: 2026-08-01");
    }

    #[test]
    fn extract_job_json_requires_a_fenced_block() {
        assert_eq!(extract_job_json("no fences here"), None);
    }

    #[test]
    fn extract_job_json_returns_the_fenced_contents() {
        let content = "preamble\n```json\n{\"a\": 1}\n```\ntrailer";
        assert_eq!(extract_job_json(content), Some("{\"a\": 1}".to_string()));
    }

    #[test]
    fn augment_with_gaps_numbers_each_entry() {
        let out = augment_with_gaps("plan this", &["missing weather".to_string(), "missing date".to_string()]);
        assert!(out.contains("1. missing weather"));
        assert!(out.contains("2. missing date"));
    }

    #[test]
    fn accumulate_usage_sums_across_calls() {
        let mut total = TokenUsage::default();
        accumulate_usage(&mut total, Some(TokenUsage { prompt_tokens: 10, completion_tokens: 5, total_tokens: 15 }));
        accumulate_usage(&mut total, Some(TokenUsage { prompt_tokens: 1, completion_tokens: 1, total_tokens: 2 }));
        accumulate_usage(&mut total, None);
        assert_eq!(total.total_tokens, 17);
    }

    #[test]
    fn diagnostic_context_marks_the_failing_line() {
        let source = "line1\nline2\nline3 bad\nline4\nline5";
        let out = diagnostic_context(source, 3, 7);
        assert!(out.contains("> "));
        assert!(out.contains("line3 bad"));
    }
}
