use crate::app::command_support::{
    load_settings, map_config_err, map_orchestrator_err, open_runtime, render_json, ParsedArgs,
};
use crate::runtime::{
    clear_worker_stop, drain_submitted_once, request_worker_stop, run_worker, watch_stop_file,
    StatePaths, DEFAULT_DRAIN_LIMIT, DEFAULT_WORKER_INTERVAL,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub fn cmd_worker(args: &[String]) -> Result<String, String> {
    if args.first().map(String::as_str) == Some("stop") {
        return cmd_worker_stop(&args[1..]);
    }
    let parsed = ParsedArgs::parse(args, &["--limit", "--interval-secs"], &["--once"])?;
    if let Some(extra) = parsed.positional.first() {
        return Err(format!("unexpected argument `{extra}`"));
    }
    let limit = match parsed.number("--limit")? {
        Some(0) => return Err("`--limit` must be greater than 0".to_string()),
        Some(limit) => usize::try_from(limit).map_err(|err| err.to_string())?,
        None => DEFAULT_DRAIN_LIMIT,
    };
    let interval = match parsed.number("--interval-secs")? {
        Some(0) => return Err("`--interval-secs` must be greater than 0".to_string()),
        Some(secs) => Duration::from_secs(secs),
        None => DEFAULT_WORKER_INTERVAL,
    };

    let runtime = open_runtime()?;
    if parsed.switch("--once") {
        let report =
            drain_submitted_once(&runtime.orchestrator, limit).map_err(map_orchestrator_err)?;
        return render_json(&report);
    }

    clear_worker_stop(&runtime.paths).map_err(|err| err.to_string())?;
    let stop = Arc::new(AtomicBool::new(false));
    let watcher = watch_stop_file(&runtime.paths, Arc::clone(&stop));
    let built = run_worker(&runtime.orchestrator, &runtime.log, &stop, interval, limit);
    stop.store(true, Ordering::Relaxed);
    let _ = watcher.join();
    clear_worker_stop(&runtime.paths).map_err(|err| err.to_string())?;
    Ok(format!("worker stopped\nbuilt={built}"))
}

fn cmd_worker_stop(args: &[String]) -> Result<String, String> {
    if !args.is_empty() {
        return Err("usage: worker stop".to_string());
    }
    let settings = load_settings()?;
    let root = settings.resolve_state_root().map_err(map_config_err)?;
    let path = request_worker_stop(&StatePaths::new(root)).map_err(|err| err.to_string())?;
    Ok(format!("stop requested\nsignal={}", path.display()))
}
