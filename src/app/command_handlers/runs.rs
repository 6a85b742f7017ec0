use crate::app::command_support::{map_orchestrator_err, open_runtime, render_json, ParsedArgs};
use crate::blueprint::Blueprint;
use std::fs;
use std::path::Path;

fn single_run_id(args: &[String], usage: &str) -> Result<String, String> {
    match args {
        [run_id] if !run_id.starts_with("--") => Ok(run_id.clone()),
        _ => Err(format!("usage: {usage}")),
    }
}

fn read_blueprint(path: &Path) -> Result<Blueprint, String> {
    let raw = fs::read_to_string(path)
        .map_err(|err| format!("failed to read blueprint {}: {err}", path.display()))?;
    serde_json::from_str(&raw)
        .map_err(|err| format!("invalid blueprint {}: {err}", path.display()))
}

pub fn cmd_submit(args: &[String]) -> Result<String, String> {
    let parsed = ParsedArgs::parse(args, &["--run-id"], &[])?;
    let [path] = parsed.positional.as_slice() else {
        return Err("usage: submit <blueprint.json> [--run-id <id>]".to_string());
    };
    let blueprint = read_blueprint(Path::new(path))?;
    let runtime = open_runtime()?;
    let view = match parsed.value("--run-id") {
        Some(run_id) => runtime.orchestrator.submit_as(run_id, blueprint),
        None => runtime.orchestrator.submit(blueprint),
    }
    .map_err(map_orchestrator_err)?;
    render_json(&view)
}

pub fn cmd_build(args: &[String]) -> Result<String, String> {
    let run_id = single_run_id(args, "build <run>")?;
    let runtime = open_runtime()?;
    let view = runtime
        .orchestrator
        .build(&run_id)
        .map_err(map_orchestrator_err)?;
    render_json(&view)
}

pub fn cmd_plan(args: &[String]) -> Result<String, String> {
    let run_id = single_run_id(args, "plan <run>")?;
    let runtime = open_runtime()?;
    let view = runtime
        .orchestrator
        .run_plan(&run_id)
        .map_err(map_orchestrator_err)?;
    render_json(&view)
}

pub fn cmd_apply(args: &[String]) -> Result<String, String> {
    let run_id = single_run_id(args, "apply <run>")?;
    let runtime = open_runtime()?;
    let view = runtime
        .orchestrator
        .run_apply(&run_id)
        .map_err(map_orchestrator_err)?;
    render_json(&view)
}

pub fn cmd_approve(args: &[String]) -> Result<String, String> {
    let parsed = ParsedArgs::parse(args, &["--change-record"], &[])?;
    let [run_id] = parsed.positional.as_slice() else {
        return Err("usage: approve <run> [--change-record <id>]".to_string());
    };
    let runtime = open_runtime()?;
    let view = runtime
        .orchestrator
        .approve(run_id, parsed.value("--change-record"))
        .map_err(map_orchestrator_err)?;
    render_json(&view)
}

pub fn cmd_cancel(args: &[String]) -> Result<String, String> {
    let run_id = single_run_id(args, "cancel <run>")?;
    let runtime = open_runtime()?;
    let view = runtime
        .orchestrator
        .cancel(&run_id)
        .map_err(map_orchestrator_err)?;
    render_json(&view)
}

pub fn cmd_status(args: &[String]) -> Result<String, String> {
    let run_id = single_run_id(args, "status <run>")?;
    let runtime = open_runtime()?;
    let view = runtime
        .orchestrator
        .status(&run_id)
        .map_err(map_orchestrator_err)?;
    render_json(&view)
}

pub fn cmd_runs(args: &[String]) -> Result<String, String> {
    let parsed = ParsedArgs::parse(args, &["--workspace"], &[])?;
    if !parsed.positional.is_empty() {
        return Err("usage: runs [--workspace <name>]".to_string());
    }
    let runtime = open_runtime()?;
    let mut runs = runtime
        .orchestrator
        .runs(parsed.value("--workspace"))
        .map_err(map_orchestrator_err)?;
    runs.sort_by(|left, right| left.run_id.cmp(&right.run_id));
    render_json(&runs)
}

pub fn cmd_summary(args: &[String]) -> Result<String, String> {
    if !args.is_empty() {
        return Err("usage: summary".to_string());
    }
    let runtime = open_runtime()?;
    let summary = runtime
        .orchestrator
        .summary()
        .map_err(map_orchestrator_err)?;
    render_json(&summary)
}

pub fn cmd_logs(args: &[String]) -> Result<String, String> {
    let run_id = single_run_id(args, "logs <run>")?;
    let runtime = open_runtime()?;
    let events = runtime
        .orchestrator
        .events(&run_id)
        .map_err(map_orchestrator_err)?;
    if events.is_empty() {
        return Ok(format!("no events recorded for run `{run_id}`"));
    }
    events
        .iter()
        .map(|event| serde_json::to_string(event).map_err(|err| err.to_string()))
        .collect::<Result<Vec<_>, _>>()
        .map(|lines| lines.join("\n"))
}

pub fn cmd_import_legacy(args: &[String]) -> Result<String, String> {
    let [dir] = args else {
        return Err("usage: import-legacy <dir>".to_string());
    };
    let runtime = open_runtime()?;
    let report = runtime
        .orchestrator
        .import_legacy(Path::new(dir))
        .map_err(map_orchestrator_err)?;
    render_json(&report)
}
