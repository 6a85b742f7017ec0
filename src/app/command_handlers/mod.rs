use crate::app::cli::{help_text, parse_cli_verb, CliVerb};

pub mod locks;
pub mod runs;
pub mod setup;
pub mod worker;

pub fn run_cli(args: Vec<String>) -> Result<String, String> {
    if args.is_empty() {
        return Ok(help_text());
    }

    let rest = &args[1..];
    match parse_cli_verb(args[0].as_str()) {
        CliVerb::Setup => setup::cmd_setup(rest),
        CliVerb::Submit => runs::cmd_submit(rest),
        CliVerb::Build => runs::cmd_build(rest),
        CliVerb::Plan => runs::cmd_plan(rest),
        CliVerb::Apply => runs::cmd_apply(rest),
        CliVerb::Approve => runs::cmd_approve(rest),
        CliVerb::Cancel => runs::cmd_cancel(rest),
        CliVerb::Status => runs::cmd_status(rest),
        CliVerb::Runs => runs::cmd_runs(rest),
        CliVerb::Summary => runs::cmd_summary(rest),
        CliVerb::Logs => runs::cmd_logs(rest),
        CliVerb::ImportLegacy => runs::cmd_import_legacy(rest),
        CliVerb::Lock => locks::cmd_lock(rest),
        CliVerb::Worker => worker::cmd_worker(rest),
        CliVerb::Help => Ok(help_text()),
        CliVerb::Unknown => Err(format!("unknown command `{}`", args[0])),
    }
}
