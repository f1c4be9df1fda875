use anyhow::Result;
use console::style;
use serde_json::{Value, json};

use super::send;
use crate::core::terminal::{GuideSection, print_info, print_success};

pub async fn trigger_run(api_url: &str, agent: &str, message: Option<String>) -> Result<()> {
    let url = format!("{}/api/agents/{}/runs", api_url, agent);
    let mut request = reqwest::Client::new().post(&url);
    if let Some(message) = message {
        request = request.json(&json!({ "message": message }));
    }
    let response = send(request, api_url).await?;
    let run_id = response["run_id"].as_str().unwrap_or("?");
    print_success(&format!("Run {} started for agent '{}'.", run_id, agent));
    print_info(&format!(
        "Follow it with {}",
        style(format!("agentd show {}", short_id(run_id))).cyan().bold()
    ));
    Ok(())
}

pub async fn list_runs(api_url: &str, agent: &str, limit: usize) -> Result<()> {
    let url = format!("{}/api/agents/{}/runs?limit={}", api_url, agent, limit);
    let response = send(reqwest::Client::new().get(&url), api_url).await?;
    let runs = response["runs"].as_array().map(Vec::as_slice).unwrap_or(&[]);
    if runs.is_empty() {
        print_info(&format!("No runs recorded for agent '{}'.", agent));
        return Ok(());
    }

    let mut section = GuideSection::new(&format!("Runs of {}", agent));
    for run in runs {
        let id = short_id(run["id"].as_str().unwrap_or("?"));
        section = section.status(
            id,
            &format!(
                "{}  {}  {}  {} tok  ${:.4}",
                status_label(&run["status"]),
                run["started_at"].as_str().unwrap_or("-"),
                duration_label(&run["duration_ms"]),
                run["input_tokens"].as_u64().unwrap_or(0) + run["output_tokens"].as_u64().unwrap_or(0),
                run["cost"].as_f64().unwrap_or(0.0)
            ),
        );
    }
    section.print();
    println!();
    Ok(())
}

pub async fn show_run(api_url: &str, id: &str) -> Result<()> {
    let url = format!("{}/api/runs/{}", api_url, id);
    let response = send(reqwest::Client::new().get(&url), api_url).await?;
    let run = &response["run"];

    let mut section = GuideSection::new(&format!("Run {}", run["id"].as_str().unwrap_or(id)))
        .status("Agent", run["agent_name"].as_str().unwrap_or("?"))
        .status("Status", &status_label(&run["status"]))
        .status("Started", run["started_at"].as_str().unwrap_or("-"))
        .status("Duration", &duration_label(&run["duration_ms"]))
        .status(
            "Tokens",
            &format!(
                "{} in / {} out",
                run["input_tokens"].as_u64().unwrap_or(0),
                run["output_tokens"].as_u64().unwrap_or(0)
            ),
        )
        .status("Cost", &format!("${:.4}", run["cost"].as_f64().unwrap_or(0.0)))
        .status("Tool Calls", &run["tool_calls"].as_u64().unwrap_or(0).to_string());

    let events = run["events"].as_array().map(Vec::as_slice).unwrap_or(&[]);
    if !events.is_empty() {
        section = section.blank();
        for event in events {
            section = section.text(&event_line(event));
        }
    }
    section.print();

    if let Some(error) = run["error"].as_str() {
        println!("\n {}\n   {}", style("Error").bold().red(), error);
    }
    if let Some(output) = run["output"].as_str() {
        println!("\n {}\n{}", style("Output").bold().underlined(), output);
    }
    println!();
    Ok(())
}

fn short_id(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}

fn status_label(status: &Value) -> String {
    match status.as_str().unwrap_or("?") {
        "completed" => style("COMPLETED").green().bold().to_string(),
        "error" => style("ERROR").red().bold().to_string(),
        "running" => style("RUNNING").yellow().bold().to_string(),
        other => other.to_uppercase(),
    }
}

fn duration_label(duration_ms: &Value) -> String {
    match duration_ms.as_u64() {
        Some(ms) if ms >= 1000 => format!("{:.1}s", ms as f64 / 1000.0),
        Some(ms) => format!("{}ms", ms),
        None => "-".to_string(),
    }
}

/// One compact line per event for `agentd show`.
fn event_line(event: &Value) -> String {
    let data = &event["data"];
    let kind = event["event_type"].as_str().unwrap_or("?");
    let detail = match kind {
        "llm_call" => format!(
            "#{} {} {}+{} tok, {} ({}ms)",
            data["iteration"],
            data["provider"].as_str().unwrap_or("?"),
            data["input_tokens"],
            data["output_tokens"],
            data["stop_reason"].as_str().unwrap_or("?"),
            data["latency_ms"]
        ),
        "tool_call" => format!(
            "{}{} ({}ms)",
            data["tool"].as_str().unwrap_or("?"),
            if data["is_error"].as_bool() == Some(true) {
                " failed"
            } else {
                ""
            },
            data["latency_ms"]
        ),
        "retry" => format!(
            "attempt {}/{} in {}ms: {}",
            data["attempt"],
            data["max_attempts"],
            data["delay_ms"],
            data["error"].as_str().unwrap_or("?")
        ),
        "error" => data["message"].as_str().unwrap_or("?").to_string(),
        _ => data.to_string(),
    };
    format!("{:<9} {}", style(kind).cyan(), detail)
}
