#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CliVerb {
    Setup,
    Submit,
    Build,
    Plan,
    Apply,
    Approve,
    Cancel,
    Status,
    Runs,
    Summary,
    Logs,
    Lock,
    ImportLegacy,
    Worker,
    Help,
    Unknown,
}

pub fn parse_cli_verb(input: &str) -> CliVerb {
    match input {
        "setup" => CliVerb::Setup,
        "submit" => CliVerb::Submit,
        "build" => CliVerb::Build,
        "plan" => CliVerb::Plan,
        "apply" => CliVerb::Apply,
        "approve" => CliVerb::Approve,
        "cancel" => CliVerb::Cancel,
        "status" => CliVerb::Status,
        "runs" => CliVerb::Runs,
        "summary" => CliVerb::Summary,
        "logs" => CliVerb::Logs,
        "lock" => CliVerb::Lock,
        "import-legacy" => CliVerb::ImportLegacy,
        "worker" => CliVerb::Worker,
        "help" | "--help" | "-h" => CliVerb::Help,
        _ => CliVerb::Unknown,
    }
}

pub fn cli_help_lines() -> Vec<String> {
    [
        "Commands:",
        "  setup --organization <org> [--state-root <dir>] [--storage sqlite|memory] [--force]",
        "                                       Write the settings file and state directories",
        "  submit <blueprint.json> [--run-id <id>]",
        "                                       Register a blueprint as a new run",
        "  build <run>                          Render the blueprint and store its bundle",
        "  plan <run>                           Plan the run against its workspace",
        "  apply <run>                          Apply a planned run",
        "  approve <run> [--change-record <id>] Record approval for a run",
        "  cancel <run>                         Cancel a run and release its workspace lock",
        "  status <run>                         Show a run",
        "  runs [--workspace <name>]            List runs",
        "  summary                              Counts per state, locks, recent runs",
        "  logs <run>                           Print the run's event log",
        "  lock show <workspace>                Show the live lock on a workspace",
        "  lock release <workspace> <run>       Release a lock held by a run",
        "  import-legacy <dir>                  Import legacy JSON run files",
        "  worker [--once] [--limit <n>] [--interval-secs <n>]",
        "                                       Build submitted runs in the background",
        "  worker stop                          Ask a running worker to exit",
    ]
    .into_iter()
    .map(str::to_string)
    .collect()
}

pub(crate) fn help_text() -> String {
    cli_help_lines().join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_listed_verb_parses() {
        for line in cli_help_lines().iter().skip(1) {
            let Some(word) = line.split_whitespace().next() else {
                continue;
            };
            if word.starts_with('[') || word.chars().next().is_some_and(char::is_uppercase) {
                continue;
            }
            if line.starts_with("  ") && !line.starts_with("   ") {
                assert_ne!(parse_cli_verb(word), CliVerb::Unknown, "{word}");
            }
        }
        assert_eq!(parse_cli_verb("deploy"), CliVerb::Unknown);
    }
}
