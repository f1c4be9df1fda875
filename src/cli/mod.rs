mod agent_cmd;
mod daemon;
mod runs_cmd;

use anyhow::{Context, Result};
use console::style;

use crate::config::{self, DaemonConfig};
use crate::core::terminal::{self, GuideSection};
use crate::logging;

fn print_help() {
    terminal::print_banner();

    GuideSection::new("Daemon")
        .command("daemon-run", "Run the scheduler and HTTP API in the foreground")
        .command("run <agent>", "Execute one run in-process and wait for it")
        .print();

    GuideSection::new("Runs")
        .command("trigger <agent>", "Start a run on the daemon (--message <text>)")
        .command("runs <agent>", "List recent runs, newest first (--limit <n>)")
        .command("show <run-id>", "Show a run and its event timeline")
        .print();

    GuideSection::new("Management")
        .command("agent", "Add, remove or list agents")
        .command("tools", "List tools, or add/remove a tool server at runtime")
        .print();

    println!(
        "\n {} {} <command> [args] [--api-url <url>]\n",
        style("Usage:").bold(),
        style("agentd").green()
    );
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RunCommandArgs {
    pub agent: String,
    pub message: Option<String>,
    pub limit: usize,
}

/// Positional agent name plus `--message` and `--limit`.
pub(crate) fn parse_run_command_args(args: &[String], start: usize) -> RunCommandArgs {
    let mut agent = String::new();
    let mut message = None;
    let mut limit = 20;
    let mut i = start;
    while i < args.len() {
        match args[i].as_str() {
            "--message" | "-m" => {
                if i + 1 < args.len() {
                    message = Some(args[i + 1].clone());
                    i += 2;
                } else {
                    i += 1;
                }
            }
            "--limit" | "-n" => {
                if i + 1 < args.len() {
                    limit = args[i + 1].parse().unwrap_or(20);
                    i += 2;
                } else {
                    i += 1;
                }
            }
            "--api-url" => i += 2,
            other => {
                if agent.is_empty() && !other.starts_with('-') {
                    agent = other.to_string();
                }
                i += 1;
            }
        }
    }
    RunCommandArgs {
        agent,
        message,
        limit,
    }
}

/// `--api-url` wins, then the configured API address.
pub(crate) fn parse_api_url(args: &[String], default_url: String) -> String {
    let mut i = 0;
    while i < args.len() {
        if args[i] == "--api-url" && i + 1 < args.len() {
            return args[i + 1].trim_end_matches('/').to_string();
        }
        i += 1;
    }
    default_url
}

/// Send a request to the daemon and unwrap its `{success, error}` envelope.
pub(crate) async fn send(request: reqwest::RequestBuilder, api_url: &str) -> Result<serde_json::Value> {
    let response = request.send().await.with_context(|| {
        format!(
            "could not reach the daemon at {}. Is `agentd daemon-run` running?",
            api_url
        )
    })?;
    let body: serde_json::Value = response
        .json()
        .await
        .context("the daemon returned an unreadable response")?;
    if body.get("success").and_then(|v| v.as_bool()) == Some(true) {
        Ok(body)
    } else {
        let err = body
            .get("error")
            .and_then(|v| v.as_str())
            .unwrap_or("Unknown error");
        anyhow::bail!("{}", err)
    }
}

fn require_positional(value: &str, usage: &str) -> Result<()> {
    if value.is_empty() {
        anyhow::bail!("usage: agentd {}", usage);
    }
    Ok(())
}

pub async fn run_main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let command = args.get(1).map(String::as_str).unwrap_or("help");

    match command {
        "daemon-run" => {
            let quiet = args.iter().skip(2).any(|a| a == "--quiet" || a == "-q");
            return daemon::run_daemon(quiet).await;
        }
        "run" => {
            let parsed = parse_run_command_args(&args, 2);
            require_positional(&parsed.agent, "run <agent> [--message <text>]")?;
            return daemon::run_once(&parsed.agent, parsed.message).await;
        }
        "help" | "--help" | "-h" => {
            print_help();
            return Ok(());
        }
        _ => {}
    }

    logging::init_cli();
    let config = DaemonConfig::load(&config::data_dir())?;
    let api_url = parse_api_url(&args, config.api.base_url());

    match command {
        "trigger" => {
            let parsed = parse_run_command_args(&args, 2);
            require_positional(&parsed.agent, "trigger <agent> [--message <text>]")?;
            runs_cmd::trigger_run(&api_url, &parsed.agent, parsed.message).await
        }
        "runs" => {
            let parsed = parse_run_command_args(&args, 2);
            require_positional(&parsed.agent, "runs <agent> [--limit <n>]")?;
            runs_cmd::list_runs(&api_url, &parsed.agent, parsed.limit).await
        }
        "show" => {
            let parsed = parse_run_command_args(&args, 2);
            require_positional(&parsed.agent, "show <run-id>")?;
            runs_cmd::show_run(&api_url, &parsed.agent).await
        }
        "agent" | "agents" => agent_cmd::run_agent_command(&args, &api_url).await,
        "tools" => agent_cmd::run_tools_command(&args, &api_url).await,
        _ => {
            terminal::print_error(&format!("Unknown command: {}", command));
            print_help();
            Ok(())
        }
    }
}
