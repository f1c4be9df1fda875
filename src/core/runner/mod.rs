pub mod retry;

use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::config::RunnerConfig;
use crate::core::agent::Agent;
use crate::core::llm::{
    ChatMessage, Completion, CompletionRequest, LlmProvider, ProviderError, ProviderSource,
    StopReason, TokenUsage, ToolCall, ToolResult, ToolSpec,
};
use crate::core::store::{EventType, RunCompletion, RunStore, StoreError};
use crate::core::tools::ToolRegistry;
use retry::RetryPolicy;

/// Appended to the output when the model stopped at its token limit.
pub const TRUNCATION_SUFFIX: &str =
    "\n\n[Output truncated: the model reached its maximum output length.]";

/// Output of a run that used every iteration without a final answer.
pub const ITERATION_LIMIT_OUTPUT: &str =
    "[Run stopped: reached the iteration limit before the model produced a final answer.]";

pub const MANUAL_RUN_MESSAGE: &str = "Manual run requested.";

#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone)]
pub struct RunnerSettings {
    pub max_iterations: usize,
    pub max_tokens: u32,
    pub result_preview_chars: usize,
    pub retry: RetryPolicy,
}

impl From<&RunnerConfig> for RunnerSettings {
    fn from(config: &RunnerConfig) -> Self {
        Self {
            max_iterations: config.max_iterations.max(1),
            max_tokens: config.max_tokens,
            result_preview_chars: config.result_preview_chars,
            retry: RetryPolicy::from(&config.retry),
        }
    }
}

fn preview(text: &str, limit: usize) -> String {
    if text.chars().count() <= limit {
        return text.to_string();
    }
    let cut: String = text.chars().take(limit).collect();
    format!("{}...", cut)
}

fn elapsed_ms(since: Instant) -> u64 {
    since.elapsed().as_millis() as u64
}

/// Executes agent runs: the tool-calling loop, retries and the single
/// terminal write per run.
pub struct AgentRunner {
    store: Arc<RunStore>,
    tools: Arc<ToolRegistry>,
    providers: Arc<dyn ProviderSource>,
    settings: RunnerSettings,
    agent_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl AgentRunner {
    pub fn new(
        store: Arc<RunStore>,
        tools: Arc<ToolRegistry>,
        providers: Arc<dyn ProviderSource>,
        settings: RunnerSettings,
    ) -> Self {
        Self {
            store,
            tools,
            providers,
            settings,
            agent_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Create a run and execute it in the background. Returns as soon as
    /// the run record exists.
    pub async fn trigger(self: &Arc<Self>, agent: Agent, message: Option<String>) -> Result<String, RunError> {
        let run_id = self.store.create_run(&agent.name).await?;
        info!("Triggered run {} for agent [{}]", run_id, agent.name);

        let runner = Arc::clone(self);
        let id = run_id.clone();
        tokio::spawn(async move {
            let message = message.unwrap_or_else(|| MANUAL_RUN_MESSAGE.to_string());
            // Failures are already recorded on the run.
            let _ = runner.execute(&id, &agent, &message).await;
        });
        Ok(run_id)
    }

    /// Drive an existing run to its terminal state. Any error is recorded
    /// as an `error` event and a failed run before being returned.
    ///
    /// Runs of the same agent execute one at a time; `duration_ms` counts
    /// from the moment this run holds the agent's lock.
    pub async fn execute(&self, run_id: &str, agent: &Agent, message: &str) -> Result<String, RunError> {
        let lock = self.agent_lock(&agent.name).await;
        let result = {
            let _serialised = lock.lock().await;
            self.execute_locked(run_id, agent, message).await
        };
        self.release_agent_lock(&agent.name, lock).await;
        result
    }

    async fn execute_locked(&self, run_id: &str, agent: &Agent, message: &str) -> Result<String, RunError> {
        let started = Instant::now();
        match self.drive(run_id, agent, message, started).await {
            Ok(output) => {
                info!("Run {} for agent [{}] completed", run_id, agent.name);
                Ok(output)
            }
            Err(e) => {
                let message = e.to_string();
                error!("Run {} for agent [{}] failed: {}", run_id, agent.name, message);
                let data = json!({ "message": message, "detail": format!("{:?}", e) });
                if let Err(log_err) = self.store.log_event(run_id, EventType::Error, &data).await {
                    error!("Failed to record error event for run {}: {}", run_id, log_err);
                }
                if let Err(fail_err) = self.store.fail_run(run_id, &message, elapsed_ms(started)).await {
                    error!("Failed to mark run {} as failed: {}", run_id, fail_err);
                }
                Err(e)
            }
        }
    }

    /// One lock per agent, so runs of the same agent execute one at a time.
    async fn agent_lock(&self, agent: &str) -> Arc<Mutex<()>> {
        self.agent_locks
            .lock()
            .await
            .entry(agent.to_string())
            .or_default()
            .clone()
    }

    /// Forget the agent's lock once no other run holds or waits on it.
    async fn release_agent_lock(&self, agent: &str, lock: Arc<Mutex<()>>) {
        let mut locks = self.agent_locks.lock().await;
        // The map and `lock` are the only owners left.
        if Arc::strong_count(&lock) == 2 {
            locks.remove(agent);
        }
    }

    async fn drive(
        &self,
        run_id: &str,
        agent: &Agent,
        message: &str,
        started: Instant,
    ) -> Result<String, RunError> {
        let provider = self.providers.provider_for(&agent.model)?;

        let tools = self.tools.resolve(agent.tool_refs()).await;
        let allowed: HashSet<String> = tools.iter().map(|t| t.name.clone()).collect();
        let specs: Vec<ToolSpec> = tools
            .into_iter()
            .map(|t| ToolSpec {
                name: t.name,
                description: t.description,
                input_schema: t.input_schema,
            })
            .collect();

        let mut messages = vec![ChatMessage::User(message.to_string())];
        let mut usage = TokenUsage::default();
        let mut tool_calls = 0u32;
        let mut output = None;

        for iteration in 1..=self.settings.max_iterations {
            let request = CompletionRequest {
                system: &agent.prompt,
                messages: &messages,
                tools: &specs,
                max_tokens: self.settings.max_tokens,
            };
            let call_started = Instant::now();
            let completion = self
                .complete_with_retry(run_id, provider.as_ref(), &request)
                .await?;
            usage.input_tokens += completion.usage.input_tokens;
            usage.output_tokens += completion.usage.output_tokens;

            self.store
                .log_event(
                    run_id,
                    EventType::LlmCall,
                    &json!({
                        "iteration": iteration,
                        "provider": provider.kind().as_str(),
                        "input_tokens": completion.usage.input_tokens,
                        "output_tokens": completion.usage.output_tokens,
                        "stop_reason": completion.stop_reason.as_str(),
                        "tool_calls": completion.tool_calls.len(),
                        "latency_ms": elapsed_ms(call_started),
                    }),
                )
                .await?;

            let Completion {
                text,
                tool_calls: calls,
                stop_reason,
                ..
            } = completion;

            if calls.is_empty() {
                let mut text = text;
                if stop_reason == StopReason::Length {
                    text.push_str(TRUNCATION_SUFFIX);
                }
                output = Some(text);
                break;
            }

            let mut results = Vec::with_capacity(calls.len());
            for call in &calls {
                results.push(self.invoke_tool(run_id, call, &allowed).await?);
                tool_calls += 1;
            }
            messages.push(ChatMessage::Assistant {
                text,
                tool_calls: calls,
            });
            messages.push(ChatMessage::ToolResults(results));
        }

        let output = output.unwrap_or_else(|| {
            warn!(
                "Run {} for agent [{}] hit the iteration limit ({})",
                run_id, agent.name, self.settings.max_iterations
            );
            ITERATION_LIMIT_OUTPUT.to_string()
        });

        self.store
            .complete_run(
                run_id,
                &RunCompletion {
                    model: agent.model.clone(),
                    output: output.clone(),
                    input_tokens: usage.input_tokens,
                    output_tokens: usage.output_tokens,
                    tool_calls,
                    duration_ms: elapsed_ms(started),
                },
            )
            .await?;
        Ok(output)
    }

    async fn complete_with_retry(
        &self,
        run_id: &str,
        provider: &dyn LlmProvider,
        request: &CompletionRequest<'_>,
    ) -> Result<Completion, RunError> {
        let policy = &self.settings.retry;
        let mut attempt = 1;
        loop {
            match provider.complete(request).await {
                Ok(completion) => return Ok(completion),
                Err(e) if retry::should_retry(policy, &e, attempt) => {
                    let delay = retry::compute_delay(policy, &e);
                    warn!(
                        "Run {}: attempt {}/{} failed ({}); retrying in {}ms",
                        run_id,
                        attempt,
                        policy.max_attempts,
                        e,
                        delay.as_millis()
                    );
                    self.store
                        .log_event(
                            run_id,
                            EventType::Retry,
                            &json!({
                                "attempt": attempt,
                                "max_attempts": policy.max_attempts,
                                "delay_ms": delay.as_millis() as u64,
                                "error": e.to_string(),
                            }),
                        )
                        .await?;
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Tool failures become error-flagged results; only store errors escape.
    async fn invoke_tool(
        &self,
        run_id: &str,
        call: &ToolCall,
        allowed: &HashSet<String>,
    ) -> Result<ToolResult, RunError> {
        let started = Instant::now();
        let outcome = if allowed.contains(&call.name) {
            self.tools
                .call_tool(&call.name, call.arguments.clone())
                .await
                .map_err(|e| e.to_string())
        } else {
            Err(format!("tool '{}' is not available to this agent", call.name))
        };
        let (content, is_error) = match outcome {
            Ok(response) => (response.to_text(), response.is_error),
            Err(message) => {
                warn!("Run {}: tool '{}' failed: {}", run_id, call.name, message);
                (format!("Error: {}", message), true)
            }
        };

        self.store
            .log_event(
                run_id,
                EventType::ToolCall,
                &json!({
                    "tool": call.name,
                    "arguments": call.arguments,
                    "result_preview": preview(&content, self.settings.result_preview_chars),
                    "is_error": is_error,
                    "latency_ms": elapsed_ms(started),
                }),
            )
            .await?;

        Ok(ToolResult {
            call_id: call.id.clone(),
            content,
            is_error,
        })
    }
}
