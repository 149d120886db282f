//! Workflow commands: list, run, show and purge.
//!
//! `run` executes a built-in definition on an engine backed by the SQLite
//! store in the data directory, so `show` can read the snapshot back later.

use std::path::Path;

use anyhow::{Context, Result, anyhow, bail};
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;
use hostelry_core::storage::kv_store::KvStore;
use hostelry_core::workflow::engine::{ExecutionOptions, WorkflowEngine};
use hostelry_infra::config::load_engine_config;
use hostelry_infra::sqlite::kv::SqliteKvStore;
use hostelry_infra::sqlite::pool::{DatabasePool, database_url};
use hostelry_types::workflow::{ExecutionSnapshot, ExecutionState, snapshot_key};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::demo;

/// Open (creating if needed) the snapshot store under `data_dir`.
async fn open_store(data_dir: &Path) -> Result<SqliteKvStore> {
    tokio::fs::create_dir_all(data_dir)
        .await
        .with_context(|| format!("Failed to create data directory {}", data_dir.display()))?;
    let pool = DatabasePool::new(&database_url(data_dir))
        .await
        .context("Failed to open workflow database")?;
    Ok(SqliteKvStore::new(pool))
}

fn parse_context(raw: Option<&str>) -> Result<Map<String, Value>> {
    let Some(raw) = raw else {
        return Ok(Map::new());
    };
    match serde_json::from_str::<Value>(raw).context("--context is not valid JSON")? {
        Value::Object(map) => Ok(map),
        other => bail!("--context must be a JSON object, got {other}"),
    }
}

// ---------------------------------------------------------------------------
// List
// ---------------------------------------------------------------------------

pub fn handle_workflows(json: bool) -> Result<()> {
    let defs = demo::definitions(None)?;

    if json {
        let out: Vec<_> = defs
            .iter()
            .map(|d| {
                serde_json::json!({
                    "workflow_type": d.workflow_type(),
                    "name": d.name(),
                    "priority": d.priority().to_string(),
                    "steps": d.steps().iter().map(|s| s.name()).collect::<Vec<_>>(),
                    "required_steps": d.required_steps().len(),
                    "max_concurrent_executions": d.max_concurrent_executions(),
                    "max_execution_time_secs": d.max_execution_time().as_secs(),
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Type").fg(Color::Cyan),
            Cell::new("Name"),
            Cell::new("Priority"),
            Cell::new("Steps"),
            Cell::new("Concurrency"),
            Cell::new("Time limit"),
        ]);

    for d in &defs {
        let steps: Vec<String> = d
            .steps()
            .iter()
            .map(|s| {
                if s.is_required() {
                    s.name().to_string()
                } else {
                    format!("{}?", s.name())
                }
            })
            .collect();
        let concurrency = d
            .max_concurrent_executions()
            .map(|n| n.to_string())
            .unwrap_or_else(|| "unlimited".to_string());

        table.add_row(vec![
            Cell::new(d.workflow_type()),
            Cell::new(d.name()),
            Cell::new(d.priority()),
            Cell::new(steps.join(" > ")),
            Cell::new(concurrency),
            Cell::new(format!("{}s", d.max_execution_time().as_secs())),
        ]);
    }

    println!();
    println!("{table}");
    println!("  {} optional steps are marked with ?", style("Note:").dim());
    println!();

    Ok(())
}

// ---------------------------------------------------------------------------
// Run
// ---------------------------------------------------------------------------

pub async fn handle_run(
    data_dir: &Path,
    workflow_type: &str,
    context: Option<&str>,
    fail: Option<&str>,
    initiated_by: Option<String>,
    json: bool,
) -> Result<()> {
    let input = parse_context(context)?;
    let config = load_engine_config(data_dir).await;
    if !config.enable_persistence {
        tracing::warn!("persistence is disabled in config.toml; `show` will not find this run");
    }

    let engine = WorkflowEngine::with_persistence(config, open_store(data_dir).await?);
    for definition in demo::definitions(fail)? {
        engine.register_workflow(definition)?;
    }

    let execution_id = Uuid::now_v7();
    let mut options = ExecutionOptions::new().execution_id(execution_id).tag("cli");
    if let Some(who) = initiated_by {
        options = options.initiated_by(who);
    }

    let outcome = engine.execute_workflow(workflow_type, &input, options).await;

    if let Some(exec) = engine.get_execution(execution_id).await {
        display_snapshot(&exec.snapshot(), json)?;
    }

    outcome.map(|_| ()).map_err(|e| anyhow!(e))
}

// ---------------------------------------------------------------------------
// Show
// ---------------------------------------------------------------------------

pub async fn handle_show(data_dir: &Path, execution_id: &str, json: bool) -> Result<()> {
    let id: Uuid = execution_id
        .parse()
        .with_context(|| format!("Invalid execution ID: '{execution_id}'"))?;

    let store = open_store(data_dir).await?;
    let stored = store
        .get(&snapshot_key(&id))
        .await
        .map_err(|e| anyhow!("Failed to read snapshot: {e}"))?
        .ok_or_else(|| anyhow!("No snapshot stored for execution {id} (it may have expired)"))?;

    let snapshot: ExecutionSnapshot =
        serde_json::from_value(stored).context("Stored snapshot is malformed")?;
    display_snapshot(&snapshot, json)
}

// ---------------------------------------------------------------------------
// Purge
// ---------------------------------------------------------------------------

pub async fn handle_purge(data_dir: &Path, json: bool) -> Result<()> {
    let store = open_store(data_dir).await?;
    let purged = store
        .purge_expired()
        .await
        .map_err(|e| anyhow!("Failed to purge snapshots: {e}"))?;

    if json {
        println!("{}", serde_json::json!({ "purged": purged }));
    } else {
        println!();
        println!("  {} Purged {purged} expired snapshot(s)", style("✓").green().bold());
        println!();
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Rendering
// ---------------------------------------------------------------------------

fn styled_state(state: ExecutionState) -> console::StyledObject<ExecutionState> {
    match state {
        ExecutionState::Completed => style(state).green(),
        ExecutionState::Failed | ExecutionState::RolledBack => style(state).red(),
        ExecutionState::Cancelled | ExecutionState::Queued => style(state).yellow(),
        _ => style(state),
    }
}

/// One row per step the execution reached: completed, then failed, then skipped.
fn step_rows(snapshot: &ExecutionSnapshot) -> Vec<(&str, &'static str)> {
    let mut rows: Vec<(&str, &'static str)> = snapshot
        .executed_steps
        .iter()
        .map(|s| (s.as_str(), "completed"))
        .collect();
    for step in &snapshot.failed_steps {
        rows.push((step.as_str(), "failed"));
    }
    for step in &snapshot.skipped_steps {
        if !snapshot.failed_steps.contains(step) {
            rows.push((step.as_str(), "skipped"));
        }
    }
    rows
}

fn display_snapshot(snapshot: &ExecutionSnapshot, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(snapshot)?);
        return Ok(());
    }

    println!();
    println!(
        "  {} {} {}",
        style("Execution:").bold(),
        style(snapshot.execution_id).cyan(),
        style(format!("({})", snapshot.workflow_type)).dim()
    );
    println!("  Workflow: {}", style(&snapshot.workflow_name).cyan());
    println!(
        "  State: {} ({:.0}%)",
        styled_state(snapshot.state).bold(),
        snapshot.progress_percentage
    );
    if let Some(ref who) = snapshot.initiated_by {
        println!("  Initiated by: {who}");
    }
    if let Some(duration) = snapshot.duration_secs {
        println!("  Duration: {duration:.3}s");
    }

    let rows = step_rows(snapshot);
    if !rows.is_empty() {
        let mut table = Table::new();
        table
            .load_preset(presets::UTF8_FULL_CONDENSED)
            .set_content_arrangement(ContentArrangement::Dynamic)
            .set_header(vec![
                Cell::new("Step").fg(Color::Cyan),
                Cell::new("Status"),
                Cell::new("Attempts"),
                Cell::new("Time (ms)"),
            ]);

        for (name, status) in rows {
            let metrics = snapshot.metrics.step_metrics.get(name);
            let color = match status {
                "completed" => Color::Green,
                "failed" => Color::Red,
                _ => Color::Yellow,
            };
            table.add_row(vec![
                Cell::new(name),
                Cell::new(status).fg(color),
                Cell::new(metrics.map_or(0, |m| m.attempts)),
                Cell::new(metrics.map_or(0, |m| m.execution_time_ms)),
            ]);
        }
        println!();
        println!("{table}");
    }

    for err in &snapshot.errors {
        let step = err.step.as_deref().unwrap_or("-");
        println!("  {} [{step}] {}", style("Error:").red().bold(), err.message);
    }
    for warning in &snapshot.warnings {
        let step = warning.step.as_deref().unwrap_or("-");
        println!("  {} [{step}] {}", style("Warning:").yellow(), warning.message);
    }
    println!();

    Ok(())
}
