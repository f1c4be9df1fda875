pub mod cron_expr;

use anyhow::Result;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::core::agent::Trigger;
use crate::core::lifecycle::LifecycleComponent;
use crate::core::runner::AgentRunner;
use crate::core::store::RunStore;

/// Earliest next fire across all cron triggers after `now`, or `None`
/// when there are none.
pub fn compute_next_run_at(triggers: &[Trigger], now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    triggers
        .iter()
        .filter_map(Trigger::cron_expression)
        .filter_map(|expr| cron_expr::next_fire(expr, now))
        .min()
}

pub fn compute_next_run(triggers: &[Trigger]) -> Option<DateTime<Utc>> {
    compute_next_run_at(triggers, Utc::now())
}

type TimerMap = HashMap<String, Vec<Uuid>>;

/// Live cron timers per agent. Owns every agent's `next_run` field.
///
/// The `timers` lock is held across every timer change and every
/// `next_run` write.
pub struct Scheduler {
    jobs: JobScheduler,
    store: Arc<RunStore>,
    runner: Arc<AgentRunner>,
    timers: Arc<Mutex<TimerMap>>,
}

impl Scheduler {
    pub async fn new(store: Arc<RunStore>, runner: Arc<AgentRunner>) -> Result<Self> {
        Ok(Self {
            jobs: JobScheduler::new().await?,
            store,
            runner,
            timers: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// Replace the agent's timers with one per cron trigger and persist its
    /// next fire time. Returns the number of live timers.
    pub async fn schedule_agent(&self, name: &str, triggers: &[Trigger]) -> Result<usize> {
        let mut timers = self.timers.lock().await;
        self.remove_timers(&mut timers, name).await;

        let mut ids = Vec::new();
        for expr in triggers.iter().filter_map(Trigger::cron_expression) {
            let job = match self.cron_job(name, expr) {
                Ok(job) => job,
                Err(e) => {
                    error!(
                        "Failed to create cron job '{}' for agent [{}]: {}",
                        expr, name, e
                    );
                    continue;
                }
            };
            match self.jobs.add(job).await {
                Ok(id) => ids.push(id),
                Err(e) => error!(
                    "Failed to register cron job '{}' for agent [{}]: {}",
                    expr, name, e
                ),
            }
        }

        let count = ids.len();
        if !ids.is_empty() {
            timers.insert(name.to_string(), ids);
        }
        let next_run = compute_next_run(triggers);
        self.store.set_agent_next_run(name, next_run).await?;
        if count > 0 {
            info!(
                "Agent [{}] scheduled with {} cron timer(s), next run {}",
                name,
                count,
                next_run.map(|t| t.to_rfc3339()).unwrap_or_else(|| "-".to_string())
            );
        }
        Ok(count)
    }

    /// Stop the agent's timers and clear its next fire time.
    pub async fn unschedule_agent(&self, name: &str) -> Result<()> {
        let mut timers = self.timers.lock().await;
        self.remove_timers(&mut timers, name).await;
        self.store.set_agent_next_run(name, None).await?;
        Ok(())
    }

    #[cfg(test)]
    pub async fn timer_count(&self, name: &str) -> usize {
        self.timers.lock().await.get(name).map_or(0, Vec::len)
    }

    /// Schedule every persisted agent and start the timer loop.
    pub async fn init(&self) -> Result<()> {
        let agents = self.store.list_agents().await?;
        for agent in &agents {
            if let Err(e) = self.schedule_agent(&agent.name, &agent.triggers).await {
                error!("Failed to schedule agent [{}]: {}", agent.name, e);
            }
        }
        self.jobs.start().await?;
        info!("Scheduler started for {} agent(s)", agents.len());
        Ok(())
    }

    pub async fn stop(&self) -> Result<()> {
        self.timers.lock().await.clear();
        let mut jobs = self.jobs.clone();
        jobs.shutdown().await?;
        info!("Scheduler stopped");
        Ok(())
    }

    async fn remove_timers(&self, timers: &mut TimerMap, name: &str) {
        let ids = timers.remove(name).unwrap_or_default();
        for id in ids {
            if let Err(e) = self.jobs.remove(&id).await {
                warn!("Failed to remove cron job {} for agent [{}]: {}", id, name, e);
            }
        }
    }

    fn cron_job(&self, name: &str, expr: &str) -> Result<Job> {
        let store = self.store.clone();
        let runner = self.runner.clone();
        let timers = self.timers.clone();
        let agent_name = name.to_string();
        let expression = expr.to_string();
        let job = Job::new_async(cron_expr::normalize(expr).as_str(), move |_uuid, mut _l| {
            let store = store.clone();
            let runner = runner.clone();
            let timers = timers.clone();
            let agent_name = agent_name.clone();
            let expression = expression.clone();
            Box::pin(async move {
                fire(store, runner, timers, agent_name, expression).await;
            })
        })?;
        Ok(job)
    }
}

/// One timer firing: run the agent, then refresh its next fire time.
async fn fire(
    store: Arc<RunStore>,
    runner: Arc<AgentRunner>,
    timers: Arc<Mutex<TimerMap>>,
    agent_name: String,
    expr: String,
) {
    let agent = match store.get_agent(&agent_name).await {
        Ok(Some(agent)) => agent,
        Ok(None) => {
            warn!("Cron fired for unknown agent [{}]; skipping", agent_name);
            return;
        }
        Err(e) => {
            error!("Failed to load agent [{}] for cron run: {}", agent_name, e);
            return;
        }
    };

    let now = Utc::now();
    match store.create_run(&agent.name).await {
        Ok(run_id) => {
            info!("Cron '{}' fired run {} for agent [{}]", expr, run_id, agent.name);
            let message = format!("Scheduled run (cron: {}) at {}", expr, now.to_rfc3339());
            if let Err(e) = runner.execute(&run_id, &agent, &message).await {
                warn!("Scheduled run {} for agent [{}] failed: {}", run_id, agent.name, e);
            }
        }
        Err(e) => error!("Failed to create cron run for agent [{}]: {}", agent.name, e),
    }

    refresh_next_run(&store, &timers, &agent.name).await;
}

/// Recompute `next_run` from the agent as stored now. Agents without live
/// timers are left alone: whoever removed the timers already wrote the field.
async fn refresh_next_run(store: &RunStore, timers: &Mutex<TimerMap>, name: &str) {
    let timers = timers.lock().await;
    if !timers.contains_key(name) {
        return;
    }
    let next_run = match store.get_agent(name).await {
        Ok(Some(agent)) => compute_next_run(&agent.triggers),
        Ok(None) => return,
        Err(e) => {
            error!("Failed to reload agent [{}] after cron run: {}", name, e);
            return;
        }
    };
    if let Err(e) = store.set_agent_next_run(name, next_run).await {
        error!("Failed to update next run for agent [{}]: {}", name, e);
    }
}

#[async_trait::async_trait]
impl LifecycleComponent for Scheduler {
    fn name(&self) -> &'static str {
        "scheduler"
    }

    async fn on_start(&self) -> Result<()> {
        self.init().await
    }

    async fn on_shutdown(&self) -> Result<()> {
        self.stop().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::agent::Agent;
    use crate::core::llm::{
        Completion, CompletionRequest, LlmProvider, ProviderError, ProviderKind, ProviderSource,
        StopReason, TokenUsage,
    };
    use crate::core::runner::RunnerSettings;
    use crate::core::tools::{AdapterConnector, ServerConfig, ToolAdapter, ToolRegistry};
    use crate::core::store::types::RunStatus;
    use chrono::{Datelike, TimeZone, Timelike, Weekday};
    use std::time::Duration;
    use tokio::sync::Notify;

    struct NoProviders;

    impl ProviderSource for NoProviders {
        fn provider_for(&self, model: &str) -> Result<Box<dyn LlmProvider>, ProviderError> {
            Err(ProviderError::UnsupportedModel(model.to_string()))
        }
    }

    /// Answers once the gate opens.
    struct GatedProviders(Arc<Notify>);

    struct GatedProvider(Arc<Notify>);

    impl ProviderSource for GatedProviders {
        fn provider_for(&self, _model: &str) -> Result<Box<dyn LlmProvider>, ProviderError> {
            Ok(Box::new(GatedProvider(self.0.clone())))
        }
    }

    #[async_trait::async_trait]
    impl LlmProvider for GatedProvider {
        fn kind(&self) -> ProviderKind {
            ProviderKind::OpenAi
        }

        async fn complete(&self, _request: &CompletionRequest<'_>) -> Result<Completion, ProviderError> {
            self.0.notified().await;
            Ok(Completion {
                text: "Nightly done.".to_string(),
                tool_calls: vec![],
                stop_reason: StopReason::Stop,
                usage: TokenUsage {
                    input_tokens: 10,
                    output_tokens: 5,
                },
            })
        }
    }

    struct NoSubprocesses;

    #[async_trait::async_trait]
    impl AdapterConnector for NoSubprocesses {
        async fn connect(&self, _name: &str, _config: &ServerConfig) -> Result<Arc<dyn ToolAdapter>> {
            anyhow::bail!("no subprocess servers in tests")
        }
    }

    async fn scheduler() -> (Scheduler, Arc<RunStore>) {
        scheduler_with(Arc::new(NoProviders)).await
    }

    async fn scheduler_with(providers: Arc<dyn ProviderSource>) -> (Scheduler, Arc<RunStore>) {
        let store = Arc::new(RunStore::open_in_memory().unwrap());
        let runner = Arc::new(AgentRunner::new(
            store.clone(),
            Arc::new(ToolRegistry::new(Arc::new(NoSubprocesses))),
            providers,
            RunnerSettings::from(&crate::config::RunnerConfig::default()),
        ));
        (Scheduler::new(store.clone(), runner).await.unwrap(), store)
    }

    fn cron(expr: &str) -> Trigger {
        format!("cron:{}", expr).parse().unwrap()
    }

    async fn add_agent(store: &RunStore, name: &str, triggers: Vec<Trigger>) -> Agent {
        let agent = Agent {
            name: name.to_string(),
            model: "gpt-4o".to_string(),
            prompt: "p".to_string(),
            tools: vec![],
            triggers,
            next_run: None,
        };
        store.upsert_agent(&agent).await.unwrap();
        agent
    }

    #[test]
    fn weekday_morning_trigger_fires_same_day() {
        // Monday 2026-10-12, 08:15 UTC
        let now = Utc.with_ymd_and_hms(2026, 10, 12, 8, 15, 0).unwrap();
        let next = compute_next_run_at(&[cron("0 9 * * 1-5")], now).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 10, 12, 9, 0, 0).unwrap());
        assert!(next > now);
        assert_eq!(next.weekday(), Weekday::Mon);
    }

    #[test]
    fn next_run_is_earliest_across_triggers() {
        let now = Utc.with_ymd_and_hms(2026, 10, 16, 12, 0, 0).unwrap();
        let triggers = vec![Trigger::Manual, cron("0 9 * * 1-5"), cron("30 12 * * *")];
        let next = compute_next_run_at(&triggers, now).unwrap();
        for expr in triggers.iter().filter_map(Trigger::cron_expression) {
            assert!(next <= cron_expr::next_fire(expr, now).unwrap());
        }
        assert_eq!((next.hour(), next.minute()), (12, 30));
    }

    #[test]
    fn manual_only_has_no_next_run() {
        assert_eq!(compute_next_run(&[Trigger::Manual]), None);
        assert_eq!(compute_next_run(&[]), None);
    }

    #[tokio::test]
    async fn manual_agent_gets_no_timer() {
        let (scheduler, store) = scheduler().await;
        let agent = add_agent(&store, "manual", vec![Trigger::Manual]).await;

        assert_eq!(scheduler.schedule_agent(&agent.name, &agent.triggers).await.unwrap(), 0);
        assert_eq!(scheduler.timer_count("manual").await, 0);
        let stored = store.get_agent("manual").await.unwrap().unwrap();
        assert_eq!(stored.next_run, None);
    }

    #[tokio::test]
    async fn scheduling_is_idempotent_and_unschedule_clears_next_run() {
        let (scheduler, store) = scheduler().await;
        let triggers = vec![cron("0 9 * * 1-5"), cron("0 18 * * *")];
        add_agent(&store, "digest", triggers.clone()).await;

        let before = Utc::now();
        assert_eq!(scheduler.schedule_agent("digest", &triggers).await.unwrap(), 2);
        assert_eq!(scheduler.schedule_agent("digest", &triggers).await.unwrap(), 2);
        assert_eq!(scheduler.timer_count("digest").await, 2);

        let next_run = store.get_agent("digest").await.unwrap().unwrap().next_run;
        assert!(next_run.unwrap() > before);

        scheduler.unschedule_agent("digest").await.unwrap();
        assert_eq!(scheduler.timer_count("digest").await, 0);
        assert_eq!(store.get_agent("digest").await.unwrap().unwrap().next_run, None);
        // Safe to repeat.
        scheduler.unschedule_agent("digest").await.unwrap();
    }

    #[tokio::test]
    async fn init_schedules_persisted_agents() {
        let (scheduler, store) = scheduler().await;
        add_agent(&store, "a", vec![cron("*/5 * * * *")]).await;
        add_agent(&store, "b", vec![Trigger::Manual]).await;

        scheduler.init().await.unwrap();
        assert_eq!(scheduler.timer_count("a").await, 1);
        assert_eq!(scheduler.timer_count("b").await, 0);
        assert!(store.get_agent("a").await.unwrap().unwrap().next_run.is_some());
        scheduler.stop().await.unwrap();
    }

    async fn fire_now(scheduler: &Scheduler, store: &Arc<RunStore>, name: &str, expr: &str) {
        fire(
            store.clone(),
            scheduler.runner.clone(),
            scheduler.timers.clone(),
            name.to_string(),
            expr.to_string(),
        )
        .await;
    }

    #[tokio::test]
    async fn fire_records_a_run_and_refreshes_next_run() {
        let (scheduler, store) = scheduler().await;
        let triggers = vec![cron("0 3 * * *")];
        add_agent(&store, "nightly", triggers.clone()).await;
        scheduler.schedule_agent("nightly", &triggers).await.unwrap();
        store.set_agent_next_run("nightly", None).await.unwrap();

        fire_now(&scheduler, &store, "nightly", "0 3 * * *").await;

        let runs = store.list_runs(Some("nightly"), 10).await.unwrap();
        assert_eq!(runs.len(), 1);
        // `gpt-4o` is rejected by the test provider source, so the run fails.
        assert_eq!(runs[0].status, RunStatus::Error);
        assert!(store.get_agent("nightly").await.unwrap().unwrap().next_run.is_some());

        // Unknown agents are skipped without creating a run.
        fire_now(&scheduler, &store, "ghost", "0 3 * * *").await;
        assert!(store.list_runs(Some("ghost"), 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn reschedule_during_a_cron_run_wins_over_the_refresh() {
        let gate = Arc::new(Notify::new());
        let (scheduler, store) = scheduler_with(Arc::new(GatedProviders(gate.clone()))).await;
        let scheduler = Arc::new(scheduler);
        let triggers = vec![cron("0 3 * * *")];
        add_agent(&store, "nightly", triggers.clone()).await;
        scheduler.schedule_agent("nightly", &triggers).await.unwrap();

        let in_flight = {
            let scheduler = scheduler.clone();
            let store = store.clone();
            tokio::spawn(async move { fire_now(&scheduler, &store, "nightly", "0 3 * * *").await })
        };
        for _ in 0..200 {
            if !store.list_runs(Some("nightly"), 1).await.unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        // The agent becomes manual-only while its cron run is in flight.
        add_agent(&store, "nightly", vec![Trigger::Manual]).await;
        assert_eq!(scheduler.schedule_agent("nightly", &[Trigger::Manual]).await.unwrap(), 0);
        assert_eq!(store.get_agent("nightly").await.unwrap().unwrap().next_run, None);

        gate.notify_one();
        in_flight.await.unwrap();

        let stored = store.get_agent("nightly").await.unwrap().unwrap();
        assert_eq!(stored.triggers, vec![Trigger::Manual]);
        assert_eq!(stored.next_run, None);
        let runs = store.list_runs(Some("nightly"), 10).await.unwrap();
        assert_eq!(runs[0].status, RunStatus::Completed);
    }

    #[tokio::test]
    async fn concurrent_scheduling_leaves_no_untracked_timers() {
        let (scheduler, store) = scheduler().await;
        let every_second = vec![cron("* * * * * *")];
        add_agent(&store, "busy", every_second.clone()).await;
        scheduler.init().await.unwrap();

        let (a, b) = tokio::join!(
            scheduler.schedule_agent("busy", &every_second),
            scheduler.schedule_agent("busy", &every_second)
        );
        assert_eq!((a.unwrap(), b.unwrap()), (1, 1));
        assert_eq!(scheduler.timer_count("busy").await, 1);

        scheduler.unschedule_agent("busy").await.unwrap();
        assert_eq!(scheduler.timer_count("busy").await, 0);
        // Let a fire that was already under way finish.
        tokio::time::sleep(Duration::from_millis(1500)).await;
        let settled = store.list_runs(Some("busy"), 100).await.unwrap().len();

        tokio::time::sleep(Duration::from_millis(2500)).await;
        let later = store.list_runs(Some("busy"), 100).await.unwrap().len();
        assert_eq!(settled, later, "a timer kept firing after unschedule");
        assert_eq!(store.get_agent("busy").await.unwrap().unwrap().next_run, None);
        scheduler.stop().await.unwrap();
    }
}
