use anyhow::{Context, Result};
use console::style;
use std::path::Path;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::config::{self, DaemonConfig};
use crate::core::lifecycle::LifecycleManager;
use crate::core::llm::ConfiguredProviders;
use crate::core::mcp::McpConnector;
use crate::core::runner::{AgentRunner, RunnerSettings};
use crate::core::scheduler::Scheduler;
use crate::core::store::RunStore;
use crate::core::terminal::{GuideSection, print_goodbye, print_success};
use crate::core::tools::local::{CLOCK_SERVER, clock_tools};
use crate::core::tools::{RegisterOptions, ToolRegistry, ToolSource};
use crate::interfaces::web::{ApiServer, AppState};
use crate::logging;
use crate::platform::{NativePlatform, Platform};

pub const DB_FILE: &str = "agentd.db";

const ABANDONED_RUN_ERROR: &str = "daemon stopped before the run finished";

fn prepare_data_dir(data_dir: &Path) -> Result<()> {
    if !data_dir.exists() {
        std::fs::create_dir_all(data_dir)
            .with_context(|| format!("failed to create {}", data_dir.display()))?;
        NativePlatform::restrict_dir_permissions(data_dir);
    }
    Ok(())
}

/// Builtin tools plus every configured server. A server that fails to
/// start is logged and skipped.
async fn build_registry(config: &DaemonConfig) -> Arc<ToolRegistry> {
    let registry = Arc::new(ToolRegistry::new(Arc::new(McpConnector)));

    if let Err(e) = registry
        .register_local_server(CLOCK_SERVER, clock_tools(), ToolSource::Builtin)
        .await
    {
        error!("Failed to register builtin tools: {}", e);
    }

    for entry in &config.servers {
        match registry
            .register_server(
                &entry.name,
                &entry.server,
                ToolSource::Config,
                RegisterOptions::default(),
            )
            .await
        {
            Ok(tools) => info!(
                "Tool server [{}] registered with {} tool(s)",
                entry.name,
                tools.len()
            ),
            Err(e) => warn!("Skipping tool server [{}]: {}", entry.name, e),
        }
    }
    registry
}

fn build_runner(
    config: &DaemonConfig,
    store: Arc<RunStore>,
    registry: Arc<ToolRegistry>,
) -> Arc<AgentRunner> {
    Arc::new(AgentRunner::new(
        store,
        registry,
        Arc::new(ConfiguredProviders::new(config.providers.clone())),
        RunnerSettings::from(&config.runner),
    ))
}

/// Foreground daemon: tools, scheduler and HTTP API until Ctrl+C.
pub async fn run_daemon(quiet: bool) -> Result<()> {
    let data_dir = config::data_dir();
    prepare_data_dir(&data_dir)?;
    logging::init_daemon(&data_dir, quiet)?;
    let config = DaemonConfig::load(&data_dir)?;

    let store = Arc::new(RunStore::open(data_dir.join(DB_FILE)).await?);
    let abandoned = store.abandon_running_runs(ABANDONED_RUN_ERROR).await?;
    if abandoned > 0 {
        warn!("Marked {} unfinished run(s) from a previous daemon as failed", abandoned);
    }

    let registry = build_registry(&config).await;
    let runner = build_runner(&config, store.clone(), registry.clone());
    let scheduler = Arc::new(Scheduler::new(store.clone(), runner.clone()).await?);
    let api = Arc::new(ApiServer::new(
        AppState::new(store.clone(), registry.clone(), scheduler.clone(), runner),
        config.api.host.clone(),
        config.api.port,
    ));

    let mut lifecycle = LifecycleManager::new();
    lifecycle.attach(registry.clone());
    lifecycle.attach(scheduler);
    lifecycle.attach(api);
    lifecycle.start().await?;

    if !quiet {
        let agents = store.list_agents().await.map(|a| a.len()).unwrap_or(0);
        GuideSection::new("Daemon Running")
            .status(
                "Status",
                &format!(
                    "{} (PID {})",
                    style("RUNNING").green().bold(),
                    style(std::process::id()).dim()
                ),
            )
            .status("API Endpoint", &config.api.base_url())
            .status("Data Dir", &data_dir.display().to_string())
            .status("Agents", &agents.to_string())
            .status("Tool Servers", &registry.server_names().await.join(", "))
            .blank()
            .info(&format!("Press {} to stop.", style("Ctrl+C").bold().yellow()))
            .print();
        println!();
    }

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");
    lifecycle.shutdown().await;
    if !quiet {
        print_goodbye();
    }
    Ok(())
}

/// Execute one run in this process and wait for it, without the daemon.
pub async fn run_once(agent_name: &str, message: Option<String>) -> Result<()> {
    logging::init_cli();
    let data_dir = config::data_dir();
    prepare_data_dir(&data_dir)?;
    let config = DaemonConfig::load(&data_dir)?;

    let store = Arc::new(RunStore::open(data_dir.join(DB_FILE)).await?);
    let Some(agent) = store.get_agent(agent_name).await? else {
        anyhow::bail!("agent '{}' not found", agent_name);
    };

    let registry = build_registry(&config).await;
    let runner = build_runner(&config, store.clone(), registry.clone());

    let run_id = store.create_run(&agent.name).await?;
    let message = message.unwrap_or_else(|| crate::core::runner::MANUAL_RUN_MESSAGE.to_string());
    let outcome = runner.execute(&run_id, &agent, &message).await;
    registry.disconnect_all().await;

    match outcome {
        Ok(output) => {
            print_success(&format!("Run {} completed", &run_id));
            println!("\n{}\n", output);
            Ok(())
        }
        Err(e) => Err(anyhow::anyhow!("run {} failed: {}", run_id, e)),
    }
}
