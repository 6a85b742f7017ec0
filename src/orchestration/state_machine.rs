use serde::{Deserialize, Serialize};
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Submitted,
    Building,
    Built,
    Planning,
    Planned,
    PlanFailed,
    Applying,
    Applied,
    ApplyFailed,
    Cancelled,
}

impl RunState {
    pub const ALL: [RunState; 10] = [
        RunState::Submitted,
        RunState::Building,
        RunState::Built,
        RunState::Planning,
        RunState::Planned,
        RunState::PlanFailed,
        RunState::Applying,
        RunState::Applied,
        RunState::ApplyFailed,
        RunState::Cancelled,
    ];

    /// Pure transition check. A state never transitions to itself.
    pub fn can_transition_to(self, next: Self) -> bool {
        if next == RunState::Cancelled {
            return !self.is_terminal();
        }
        matches!(
            (self, next),
            (RunState::Submitted, RunState::Building)
                | (RunState::Submitted, RunState::Planning)
                | (RunState::Building, RunState::Built)
                | (RunState::Built, RunState::Planning)
                | (RunState::Planning, RunState::Planned)
                | (RunState::Planning, RunState::PlanFailed)
                | (RunState::PlanFailed, RunState::Building)
                | (RunState::Planned, RunState::Applying)
                | (RunState::Applying, RunState::Applied)
                | (RunState::Applying, RunState::ApplyFailed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunState::Applied | RunState::ApplyFailed | RunState::Cancelled
        )
    }

    /// States during which the run must hold its workspace lock.
    pub fn is_workspace_exclusive(self) -> bool {
        matches!(self, RunState::Planning | RunState::Applying)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RunState::Submitted => "submitted",
            RunState::Building => "building",
            RunState::Built => "built",
            RunState::Planning => "planning",
            RunState::Planned => "planned",
            RunState::PlanFailed => "plan_failed",
            RunState::Applying => "applying",
            RunState::Applied => "applied",
            RunState::ApplyFailed => "apply_failed",
            RunState::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunState {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let normalized = raw.trim().to_ascii_lowercase();
        RunState::ALL
            .into_iter()
            .find(|state| state.as_str() == normalized)
            .ok_or_else(|| format!("unknown run state `{raw}`"))
    }
}
