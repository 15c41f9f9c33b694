//! Workflow subcommands: register, start, run, inspect, history, list,
//! definitions, cancel, timers.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use localflow_core::repository::workflow::WorkflowStore;
use localflow_core::workflow::definition::{DefinitionError, discover_workflows, load_workflow_file};
use localflow_core::workflow::executor::RunOutcome;
use localflow_core::workflow::runtime::RunReport;
use localflow_infra::filesystem::workflows_dir;
use localflow_types::workflow::{
    EventKind, Step, WorkflowDefinition, WorkflowEvent, WorkflowInstance, WorkflowStatus,
};

use crate::state::AppState;

// ---------------------------------------------------------------------------
// Register
// ---------------------------------------------------------------------------

pub async fn handle_register(state: &AppState, path: Option<PathBuf>, json: bool) -> Result<()> {
    let path = path.unwrap_or_else(|| workflows_dir(&state.data_dir));
    let defs = compile_path(&path)?;
    if defs.is_empty() {
        bail!("No workflow definitions found in {}", path.display());
    }

    for def in &defs {
        state
            .runtime
            .register_definition(def)
            .await
            .with_context(|| format!("Failed to store workflow '{}'", def.name))?;
        warn_unknown_activities(state, def);
    }

    if json {
        let out: Vec<_> = defs
            .iter()
            .map(|d| serde_json::json!({ "name": d.name, "steps": d.steps }))
            .collect();
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!();
    for def in &defs {
        println!(
            "  {} Registered workflow '{}' ({} steps)",
            style("*").green().bold(),
            style(&def.name).cyan(),
            def.steps.len()
        );
        for (index, step) in def.steps.iter().enumerate() {
            println!("    {}. {}", index + 1, step);
        }
    }
    println!();
    Ok(())
}

fn compile_path(path: &Path) -> Result<Vec<WorkflowDefinition>> {
    let describe = |e: DefinitionError| match e {
        DefinitionError::Parse { line, message } => {
            anyhow::anyhow!("{}:{line}: {message}", path.display())
        }
        DefinitionError::ValidationError(msg) => {
            anyhow::anyhow!("Workflow validation failed: {msg}")
        }
        other => anyhow::anyhow!("Failed to load {}: {other}", path.display()),
    };

    if path.is_dir() {
        let found = discover_workflows(path).map_err(describe)?;
        Ok(found.into_iter().map(|(_, def)| def).collect())
    } else {
        Ok(vec![load_workflow_file(path).map_err(describe)?])
    }
}

fn warn_unknown_activities(state: &AppState, def: &WorkflowDefinition) {
    for step in &def.steps {
        if let Step::Activity { name } = step {
            if !state.activities.iter().any(|a| a == name) {
                tracing::warn!(workflow = %def.name, activity = %name, "no handler registered for activity");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Start
// ---------------------------------------------------------------------------

pub async fn handle_start(state: &AppState, name: &str, run: bool, json: bool) -> Result<()> {
    if run {
        state.runtime.recover().await?;
    }
    let instance = state.runtime.start(name).await.with_context(|| {
        format!("Cannot start '{name}' (register it first with `localflow register`)")
    })?;

    let outcome = if run {
        Some(state.runtime.drive(instance.id).await?)
    } else {
        None
    };

    if json {
        let out = serde_json::json!({
            "id": instance.id.to_string(),
            "name": instance.name,
            "outcome": outcome.as_ref().map(outcome_json),
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!();
    println!(
        "  {} Started workflow '{}'",
        style("*").green().bold(),
        style(&instance.name).cyan()
    );
    println!("  ID: {}", instance.id);
    match outcome {
        Some(outcome) => println!("  Outcome: {}", describe_outcome(&outcome)),
        None => println!(
            "  Drive it with: {}",
            style(format!("localflow run {}", instance.id)).dim()
        ),
    }
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// Run
// ---------------------------------------------------------------------------

pub async fn handle_run(state: &AppState, id: Option<&str>, follow: bool, json: bool) -> Result<()> {
    let active = state.runtime.recover().await?;
    let targets = match id {
        Some(raw) => vec![resolve_instance_id(state, raw).await?],
        None => active,
    };

    let mut report = RunReport::default();
    report.absorb(state.runtime.drive_many(targets).await?);
    report.absorb(state.runtime.tick().await?);

    if follow && !state.runtime.scheduler().is_empty() {
        if !json {
            println!(
                "  {} Waiting on {} timer(s), Ctrl+C to stop",
                style("..").dim(),
                state.runtime.scheduler().len()
            );
        }
        let cancel = CancellationToken::new();
        let on_signal = cancel.clone();
        tokio::spawn(async move {
            crate::shutdown_signal().await;
            on_signal.cancel();
        });
        report.merge(state.runtime.run_until_idle(cancel).await?);
    }

    print_report(state, &report, json)
}

fn print_report(state: &AppState, report: &RunReport, json: bool) -> Result<()> {
    let rows: Vec<(Uuid, String, Option<String>)> = report
        .completed
        .iter()
        .map(|id| (*id, "completed".to_string(), None))
        .chain(report.failed.iter().map(|id| {
            let reason = state.runtime.engine().get(id).and_then(|i| i.failure_reason());
            (*id, "failed".to_string(), reason)
        }))
        .chain(report.suspended.iter().map(|id| (*id, "suspended".to_string(), next_wake(state, id))))
        .chain(report.errors.iter().map(|(id, e)| (*id, "error".to_string(), Some(e.clone()))))
        .collect();

    if json {
        let out: Vec<_> = rows
            .iter()
            .map(|(id, result, detail)| {
                serde_json::json!({ "id": id.to_string(), "result": result, "detail": detail })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    if rows.is_empty() {
        println!();
        println!("  Nothing to run.");
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Instance").fg(Color::Cyan),
            Cell::new("Workflow"),
            Cell::new("Result"),
            Cell::new("Detail"),
        ]);

    for (id, result, detail) in &rows {
        let name = state
            .runtime
            .engine()
            .get(id)
            .map(|i| i.name)
            .unwrap_or_else(|| "-".to_string());
        let color = match result.as_str() {
            "completed" => Color::Green,
            "suspended" => Color::Yellow,
            _ => Color::Red,
        };
        table.add_row(vec![
            Cell::new(id),
            Cell::new(name),
            Cell::new(result).fg(color),
            Cell::new(detail.as_deref().unwrap_or("-")),
        ]);
    }

    println!();
    println!("{table}");
    println!();
    Ok(())
}

fn next_wake(state: &AppState, id: &Uuid) -> Option<String> {
    state
        .runtime
        .scheduler()
        .pending()
        .into_iter()
        .find(|t| t.workflow_id == *id)
        .map(|t| format!("wakes at {}", t.fire_at.format("%Y-%m-%d %H:%M:%S")))
}

// ---------------------------------------------------------------------------
// Inspect / History
// ---------------------------------------------------------------------------

pub async fn handle_inspect(state: &AppState, raw_id: &str, json: bool) -> Result<()> {
    let id = resolve_instance_id(state, raw_id).await?;
    let instance = load_instance(state, &id).await?;
    let timers: Vec<_> = state
        .store
        .load_timers()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to load timers: {e}"))?
        .into_iter()
        .filter(|t| t.workflow_id == id)
        .collect();

    if json {
        let out = serde_json::json!({
            "instance": instance,
            "pending_timers": timers,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!();
    println!("  {} {}", style("Instance:").bold(), style(instance.id).cyan());
    println!("  Workflow: {}", style(&instance.name).cyan());
    println!("  Status: {}", styled_status(instance.status));
    println!("  Created: {}", instance.created_at.format("%Y-%m-%d %H:%M:%S"));
    println!("  Events: {} (cursor {})", instance.events.len(), instance.replay_cursor);
    if let Some(last) = instance.last_event() {
        println!("  Last event: {} at {}", last.kind, last.timestamp.format("%H:%M:%S"));
    }
    if let Some(reason) = instance.failure_reason() {
        println!("  Error: {}", style(reason).red());
    }
    for timer in &timers {
        println!(
            "  Timer {}: fires at {} ({}s wait)",
            timer.id,
            timer.fire_at.format("%Y-%m-%d %H:%M:%S"),
            timer.duration_secs
        );
    }
    println!();
    Ok(())
}

pub async fn handle_history(state: &AppState, raw_id: &str, json: bool) -> Result<()> {
    let id = resolve_instance_id(state, raw_id).await?;
    let instance = load_instance(state, &id).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&instance.events)?);
        return Ok(());
    }

    if instance.events.is_empty() {
        println!();
        println!("  No events yet for '{}' (status: {}).", instance.name, instance.status);
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("#").fg(Color::Cyan),
            Cell::new("Seq"),
            Cell::new("Time"),
            Cell::new("Event"),
            Cell::new("Step"),
            Cell::new("Detail"),
        ]);

    for event in &instance.events {
        table.add_row(vec![
            Cell::new(event.position),
            Cell::new(event.sequence),
            Cell::new(event.timestamp.format("%H:%M:%S%.3f").to_string()),
            event_cell(event.kind),
            Cell::new(event.step_index.map(|i| i.to_string()).unwrap_or_else(|| "-".to_string())),
            Cell::new(event_detail(event)),
        ]);
    }

    println!();
    println!(
        "  History of '{}' {}",
        style(&instance.name).cyan(),
        style(instance.id).dim()
    );
    println!();
    println!("{table}");
    println!();
    Ok(())
}

fn event_detail(event: &WorkflowEvent) -> String {
    let field = |key: &str| event.payload.get(key).and_then(|v| v.as_str()).map(str::to_string);
    match event.kind {
        EventKind::ActivityCompleted => format!(
            "{} -> {}",
            field("activity").unwrap_or_default(),
            field("result").unwrap_or_else(|| "ok".to_string())
        ),
        EventKind::ActivityFailed => format!(
            "{}: {}",
            field("activity").unwrap_or_default(),
            field("error").unwrap_or_default()
        ),
        EventKind::TimerScheduled => format!(
            "{}s until {}",
            event.payload.get("duration").and_then(|v| v.as_i64()).unwrap_or_default(),
            field("fire_at").unwrap_or_default()
        ),
        EventKind::WorkflowFailed => field("error").unwrap_or_default(),
        _ => String::new(),
    }
}

// ---------------------------------------------------------------------------
// List
// ---------------------------------------------------------------------------

pub async fn handle_list(state: &AppState, status: Option<&str>, json: bool) -> Result<()> {
    let filter = status
        .map(|s| {
            serde_json::from_value::<WorkflowStatus>(serde_json::Value::String(s.to_lowercase()))
                .with_context(|| format!("Unknown status '{s}' (pending, running, completed, failed)"))
        })
        .transpose()?;

    let instances: Vec<_> = state
        .store
        .list_instances()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to list instances: {e}"))?
        .into_iter()
        .filter(|i| filter.is_none_or(|s| i.status == s))
        .collect();

    if json {
        let out: Vec<_> = instances
            .iter()
            .map(|i| {
                serde_json::json!({
                    "id": i.id.to_string(),
                    "name": i.name,
                    "status": i.status,
                    "events": i.events.len(),
                    "created_at": i.created_at.to_rfc3339(),
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    if instances.is_empty() {
        println!();
        println!("  No workflow instances.");
        println!(
            "  Start one with: {}",
            style("localflow start <name>").dim()
        );
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("ID").fg(Color::Cyan),
            Cell::new("Workflow"),
            Cell::new("Status"),
            Cell::new("Events"),
            Cell::new("Created"),
        ]);

    for i in &instances {
        table.add_row(vec![
            Cell::new(i.id),
            Cell::new(&i.name),
            format_status(i.status),
            Cell::new(i.events.len()),
            Cell::new(i.created_at.format("%Y-%m-%d %H:%M").to_string()),
        ]);
    }

    println!();
    println!("{table}");
    println!();
    Ok(())
}

pub async fn handle_definitions(state: &AppState, json: bool) -> Result<()> {
    let defs = state
        .store
        .list_definitions()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to list definitions: {e}"))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&defs)?);
        return Ok(());
    }

    if defs.is_empty() {
        println!();
        println!("  No workflows registered.");
        println!(
            "  Register one with: {}",
            style("localflow register <file.flow>").dim()
        );
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Name").fg(Color::Cyan),
            Cell::new("Steps"),
            Cell::new("Plan"),
            Cell::new("Registered"),
        ]);

    for d in &defs {
        let plan = d.steps.iter().map(|s| s.to_string()).collect::<Vec<_>>().join(" -> ");
        table.add_row(vec![
            Cell::new(&d.name),
            Cell::new(d.steps.len()),
            Cell::new(plan),
            Cell::new(d.registered_at.format("%Y-%m-%d %H:%M").to_string()),
        ]);
    }

    println!();
    println!("{table}");
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// Cancel
// ---------------------------------------------------------------------------

pub async fn handle_cancel(state: &AppState, raw_id: &str, json: bool) -> Result<()> {
    let id = resolve_instance_id(state, raw_id).await?;
    state.runtime.recover().await?;

    let instance = load_instance(state, &id).await?;
    let status = instance.effective_status();
    if status.is_terminal() {
        bail!("Instance has already finished (status: {status}). Cannot cancel.");
    }

    state.runtime.cancel(id).await?;

    if json {
        println!(
            "{}",
            serde_json::json!({ "cancelled": id.to_string(), "status": "failed" })
        );
    } else {
        println!();
        println!(
            "  {} Cancelled '{}' {}",
            style("*").green().bold(),
            style(&instance.name).cyan(),
            style(id).dim()
        );
        println!();
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Timers
// ---------------------------------------------------------------------------

pub async fn handle_timers(state: &AppState, json: bool) -> Result<()> {
    let timers = state
        .store
        .load_timers()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to load timers: {e}"))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&timers)?);
        return Ok(());
    }

    if timers.is_empty() {
        println!();
        println!("  No pending timers.");
        println!();
        return Ok(());
    }

    let now = chrono::Utc::now();
    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Timer").fg(Color::Cyan),
            Cell::new("Instance"),
            Cell::new("Fires at"),
            Cell::new("Wait"),
            Cell::new("Due"),
        ]);

    for t in &timers {
        let due = if t.is_due(now) {
            Cell::new("yes").fg(Color::Green)
        } else {
            Cell::new("no")
        };
        table.add_row(vec![
            Cell::new(t.id),
            Cell::new(t.workflow_id),
            Cell::new(t.fire_at.format("%Y-%m-%d %H:%M:%S").to_string()),
            Cell::new(format!("{}s", t.duration_secs)),
            due,
        ]);
    }

    println!();
    println!("{table}");
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Accept a full UUID or a unique prefix of one.
async fn resolve_instance_id(state: &AppState, raw: &str) -> Result<Uuid> {
    if let Ok(id) = raw.parse::<Uuid>() {
        return Ok(id);
    }

    let needle = raw.to_lowercase();
    let matches: Vec<Uuid> = state
        .store
        .list_instances()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to list instances: {e}"))?
        .into_iter()
        .map(|i| i.id)
        .filter(|id| id.to_string().starts_with(&needle))
        .collect();

    match matches.as_slice() {
        [id] => Ok(*id),
        [] => bail!("No workflow instance matches '{raw}'"),
        _ => bail!("'{raw}' matches {} instances; use a longer prefix", matches.len()),
    }
}

async fn load_instance(state: &AppState, id: &Uuid) -> Result<WorkflowInstance> {
    state
        .store
        .load_instance(id)
        .await
        .map_err(|e| anyhow::anyhow!("Workflow instance '{id}' not found: {e}"))
}

fn describe_outcome(outcome: &RunOutcome) -> String {
    match outcome {
        RunOutcome::Completed => format!("{}", style("completed").green()),
        RunOutcome::Failed { error, .. } => format!("{} ({error})", style("failed").red()),
        RunOutcome::Suspended { fire_at, .. } => format!(
            "{} until {}",
            style("suspended").yellow(),
            fire_at.format("%Y-%m-%d %H:%M:%S")
        ),
    }
}

fn outcome_json(outcome: &RunOutcome) -> serde_json::Value {
    match outcome {
        RunOutcome::Completed => serde_json::json!({ "result": "completed" }),
        RunOutcome::Failed { step_index, error } => {
            serde_json::json!({ "result": "failed", "step": step_index, "error": error })
        }
        RunOutcome::Suspended { step_index, timer_id, fire_at } => serde_json::json!({
            "result": "suspended",
            "step": step_index,
            "timer_id": timer_id.to_string(),
            "fire_at": fire_at.to_rfc3339(),
        }),
    }
}

fn styled_status(status: WorkflowStatus) -> String {
    match status {
        WorkflowStatus::Pending => style("pending").yellow().to_string(),
        WorkflowStatus::Running => style("running").blue().to_string(),
        WorkflowStatus::Completed => style("completed").green().to_string(),
        WorkflowStatus::Failed => style("failed").red().to_string(),
    }
}

fn format_status(status: WorkflowStatus) -> Cell {
    match status {
        WorkflowStatus::Pending => Cell::new("pending").fg(Color::Yellow),
        WorkflowStatus::Running => Cell::new("running").fg(Color::Blue),
        WorkflowStatus::Completed => Cell::new("completed").fg(Color::Green),
        WorkflowStatus::Failed => Cell::new("failed").fg(Color::Red),
    }
}

fn event_cell(kind: EventKind) -> Cell {
    let cell = Cell::new(kind);
    match kind {
        EventKind::WorkflowCompleted | EventKind::ActivityCompleted => cell.fg(Color::Green),
        EventKind::WorkflowFailed | EventKind::ActivityFailed => cell.fg(Color::Red),
        EventKind::TimerScheduled | EventKind::TimerFired => cell.fg(Color::Yellow),
        EventKind::WorkflowStarted => cell,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compile_path_reads_a_directory_of_definitions() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("a.flow"),
            "workflow alpha {\n    step charge_card;\n}\n",
        )
        .unwrap();
        std::fs::write(
            dir.path().join("b.flow"),
            "workflow beta {\n    wait 5s\n    step send_email;\n}\n",
        )
        .unwrap();
        std::fs::write(dir.path().join("notes.txt"), "not a workflow").unwrap();

        let defs = compile_path(dir.path()).unwrap();
        let names: Vec<_> = defs.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["alpha", "beta"]);
        assert_eq!(defs[1].steps, vec![Step::wait(5), Step::activity("send_email")]);
    }

    #[test]
    fn compile_path_reports_the_file_of_a_broken_definition() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.flow");
        std::fs::write(&path, "workflow broken {\n    step charge_card;\n").unwrap();

        let err = compile_path(&path).unwrap_err().to_string();
        assert!(err.contains("broken.flow"), "unexpected error: {err}");
    }

    #[test]
    fn format_status_colors_each_state() {
        assert_eq!(format_status(WorkflowStatus::Failed).content(), "failed");
        assert_eq!(format_status(WorkflowStatus::Pending).content(), "pending");
    }
}
