use crate::app::command_support::{map_orchestrator_err, open_runtime, render_json};

pub fn cmd_lock(args: &[String]) -> Result<String, String> {
    match args {
        [action, workspace] if action == "show" => {
            let runtime = open_runtime()?;
            match runtime
                .orchestrator
                .lock_status(workspace)
                .map_err(map_orchestrator_err)?
            {
                Some(lock) => render_json(&lock),
                None => Ok(format!("workspace `{workspace}` is not locked")),
            }
        }
        [action, workspace, run_id] if action == "release" => {
            let runtime = open_runtime()?;
            let released = runtime
                .orchestrator
                .release_lock(workspace, run_id)
                .map_err(map_orchestrator_err)?;
            Ok(format!(
                "workspace={workspace}\nrun_id={run_id}\nreleased={released}"
            ))
        }
        _ => Err("usage: lock show <workspace> | lock release <workspace> <run>".to_string()),
    }
}
