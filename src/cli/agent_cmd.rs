use anyhow::{Context, Result};
use console::style;
use serde_json::{Value, json};

use super::send;
use crate::core::terminal::{GuideSection, print_info, print_success};

#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct AgentAddArgs {
    pub name: String,
    pub model: String,
    pub prompt: String,
    pub prompt_file: Option<String>,
    pub tools: Vec<String>,
    pub triggers: Vec<String>,
}

pub(crate) fn parse_agent_add_args(args: &[String], start: usize) -> AgentAddArgs {
    let mut parsed = AgentAddArgs::default();
    let mut i = start;
    while i < args.len() {
        match args[i].as_str() {
            "--model" | "-m" => {
                if i + 1 < args.len() {
                    parsed.model = args[i + 1].clone();
                    i += 2;
                } else {
                    i += 1;
                }
            }
            "--prompt" | "-p" => {
                if i + 1 < args.len() {
                    parsed.prompt = args[i + 1].clone();
                    i += 2;
                } else {
                    i += 1;
                }
            }
            "--prompt-file" => {
                if i + 1 < args.len() {
                    parsed.prompt_file = Some(args[i + 1].clone());
                    i += 2;
                } else {
                    i += 1;
                }
            }
            "--tool" | "-t" => {
                if i + 1 < args.len() {
                    parsed.tools.push(args[i + 1].clone());
                    i += 2;
                } else {
                    i += 1;
                }
            }
            "--trigger" => {
                if i + 1 < args.len() {
                    parsed.triggers.push(args[i + 1].clone());
                    i += 2;
                } else {
                    i += 1;
                }
            }
            "--api-url" => i += 2,
            other => {
                // First positional arg after the subcommand is the agent name
                if parsed.name.is_empty() && !other.starts_with('-') {
                    parsed.name = other.to_string();
                }
                i += 1;
            }
        }
    }
    parsed
}

fn print_usage() {
    GuideSection::new("agentd agent")
        .command("add <name>", "Create or replace an agent")
        .text(
            &style("--model <id> --prompt <text> | --prompt-file <path>")
                .dim()
                .to_string(),
        )
        .text(
            &style("--tool <server[.tool]>... --trigger <manual|cron:expr>...")
                .dim()
                .to_string(),
        )
        .command("remove <name>", "Delete an agent and its timers")
        .command("list", "List agents and their next scheduled run")
        .print();
    println!();
}

pub async fn run_agent_command(args: &[String], api_url: &str) -> Result<()> {
    let sub_cmd = args.get(2).map(String::as_str).unwrap_or("");
    let client = reqwest::Client::new();

    match sub_cmd {
        "add" | "set" => {
            let parsed = parse_agent_add_args(args, 3);
            if parsed.name.is_empty() || parsed.model.is_empty() {
                print_usage();
                anyhow::bail!("an agent name and --model are required");
            }
            let prompt = match &parsed.prompt_file {
                Some(path) => std::fs::read_to_string(path)
                    .with_context(|| format!("failed to read prompt file {}", path))?,
                None => parsed.prompt.clone(),
            };
            let mut body = json!({
                "model": parsed.model,
                "prompt": prompt,
                "tools": parsed.tools,
            });
            if !parsed.triggers.is_empty() {
                body["triggers"] = json!(parsed.triggers);
            }

            let url = format!("{}/api/agents/{}", api_url, parsed.name);
            let response = send(client.put(&url).json(&body), api_url).await?;
            print_success(&format!("Agent '{}' saved.", parsed.name));
            if let Some(next) = response["agent"]["next_run"].as_str() {
                print_info(&format!("Next scheduled run: {}", next));
            }
        }
        "remove" | "delete" => {
            let name = parse_agent_add_args(args, 3).name;
            if name.is_empty() {
                print_usage();
                anyhow::bail!("an agent name is required");
            }
            let url = format!("{}/api/agents/{}", api_url, name);
            send(client.delete(&url), api_url).await?;
            print_success(&format!("Agent '{}' removed.", name));
        }
        "list" | "ls" => {
            let url = format!("{}/api/agents", api_url);
            let response = send(client.get(&url), api_url).await?;
            print_agents(response["agents"].as_array().map(Vec::as_slice).unwrap_or(&[]));
        }
        _ => print_usage(),
    }
    Ok(())
}

fn print_agents(agents: &[Value]) {
    if agents.is_empty() {
        print_info("No agents defined yet.");
        return;
    }
    let mut section = GuideSection::new("Agents");
    for agent in agents {
        let name = agent["name"].as_str().unwrap_or("?");
        let model = agent["model"].as_str().unwrap_or("?");
        let next = agent["next_run"].as_str().unwrap_or("manual only");
        section = section.status(name, &format!("{}  next: {}", style(model).cyan(), next));
    }
    section.print();
    println!();
}

/// `tools add <name> <command> [args...]`: everything after the command
/// belongs to the server, except a trailing `--api-url <url>`.
pub(crate) fn parse_server_args(args: &[String], start: usize) -> (String, Value) {
    let mut rest: Vec<String> = Vec::new();
    let mut i = start;
    while i < args.len() {
        if args[i] == "--api-url" {
            i += 2;
            continue;
        }
        rest.push(args[i].clone());
        i += 1;
    }
    let mut rest = rest.into_iter();
    let name = rest.next().unwrap_or_default();
    let command = rest.next().unwrap_or_default();
    let server_args: Vec<String> = rest.collect();
    (name, json!({ "command": command, "args": server_args }))
}

pub async fn run_tools_command(args: &[String], api_url: &str) -> Result<()> {
    let client = reqwest::Client::new();
    match args.get(2).map(String::as_str).unwrap_or("list") {
        "add" => {
            let (name, body) = parse_server_args(args, 3);
            if name.is_empty() || body["command"] == "" {
                anyhow::bail!("usage: agentd tools add <name> <command> [args...]");
            }
            let url = format!("{}/api/tools/servers/{}", api_url, name);
            let response = send(client.put(&url).json(&body), api_url).await?;
            let count = response["tools"].as_array().map_or(0, Vec::len);
            print_success(&format!("Tool server '{}' connected with {} tool(s).", name, count));
        }
        "remove" | "rm" => {
            let (name, _) = parse_server_args(args, 3);
            if name.is_empty() {
                anyhow::bail!("usage: agentd tools remove <name>");
            }
            let url = format!("{}/api/tools/servers/{}", api_url, name);
            send(client.delete(&url), api_url).await?;
            print_success(&format!("Tool server '{}' disconnected.", name));
        }
        _ => {
            let url = format!("{}/api/tools", api_url);
            let response = send(client.get(&url), api_url).await?;
            print_tools(response["tools"].as_array().map(Vec::as_slice).unwrap_or(&[]));
        }
    }
    Ok(())
}

fn print_tools(tools: &[Value]) {
    if tools.is_empty() {
        print_info("No tools registered.");
        return;
    }
    let mut section = GuideSection::new("Tools");
    for tool in tools {
        section = section.command(
            tool["name"].as_str().unwrap_or("?"),
            tool["description"].as_str().unwrap_or(""),
        );
    }
    section.print();
    println!();
}
