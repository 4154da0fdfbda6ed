//! Workflows, pipeline steps and the per-invocation state machine.

use serde::{Deserialize, Serialize};

/// Operation requested by a pull-request comment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandName {
    Plan,
    Apply,
    Unlock,
}

impl CommandName {
    /// Title used in status descriptions
    pub fn title(&self) -> &'static str {
        match self {
            Self::Plan => "Plan",
            Self::Apply => "Apply",
            Self::Unlock => "Unlock",
        }
    }
}

impl std::fmt::Display for CommandName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Plan => f.write_str("plan"),
            Self::Apply => f.write_str("apply"),
            Self::Unlock => f.write_str("unlock"),
        }
    }
}

/// One stage of a pipeline
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Step {
    Init { extra_args: Vec<String> },
    Plan { extra_args: Vec<String> },
    Apply { extra_args: Vec<String> },
    /// A user-declared shell command
    Run { command: String },
}

impl Step {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Init { .. } => "init",
            Self::Plan { .. } => "plan",
            Self::Apply { .. } => "apply",
            Self::Run { .. } => "run",
        }
    }

    pub fn init() -> Self {
        Self::Init { extra_args: Vec::new() }
    }

    pub fn plan() -> Self {
        Self::Plan { extra_args: Vec::new() }
    }

    pub fn apply() -> Self {
        Self::Apply { extra_args: Vec::new() }
    }
}

/// Ordered steps run for one command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stage {
    pub steps: Vec<Step>,
}

impl Stage {
    pub fn default_plan() -> Self {
        Self {
            steps: vec![Step::init(), Step::plan()],
        }
    }

    pub fn default_apply() -> Self {
        Self {
            steps: vec![Step::apply()],
        }
    }
}

/// A named pair of plan and apply stages
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workflow {
    pub plan: Stage,
    pub apply: Stage,
}

impl Default for Workflow {
    fn default() -> Self {
        Self {
            plan: Stage::default_plan(),
            apply: Stage::default_apply(),
        }
    }
}

impl Workflow {
    /// Stage run for a command; unlock runs no steps
    pub fn stage_for(&self, command: CommandName) -> Option<&Stage> {
        match command {
            CommandName::Plan => Some(&self.plan),
            CommandName::Apply => Some(&self.apply),
            CommandName::Unlock => None,
        }
    }
}

/// Why an invocation was rejected before any step ran
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    LockConflict,
    ConfigError,
    PlanNotFound,
    Unapproved,
}

/// Lifecycle of one project command invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvocationState {
    Received,
    Resolved,
    Locked,
    Running,
    Completed { success: bool },
    Rejected(RejectReason),
}

impl InvocationState {
    /// Move to `next` if the transition is allowed; terminal states never change
    pub fn advance(&mut self, next: InvocationState) -> bool {
        use InvocationState::*;
        let allowed = matches!(
            (&*self, &next),
            (Received, Resolved)
                | (Received, Rejected(_))
                | (Resolved, Locked)
                | (Resolved, Completed { .. })
                | (Resolved, Rejected(_))
                | (Locked, Running)
                | (Locked, Rejected(_))
                | (Running, Completed { .. })
        );
        if allowed {
            *self = next;
        }
        allowed
    }

    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Completed { .. } | Self::Rejected(_))
    }
}

impl Default for InvocationState {
    fn default() -> Self {
        Self::Received
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_workflow() {
        let wf = Workflow::default();
        assert_eq!(wf.plan.steps, vec![Step::init(), Step::plan()]);
        assert_eq!(wf.apply.steps, vec![Step::apply()]);
        assert!(wf.stage_for(CommandName::Unlock).is_none());
    }

    #[test]
    fn test_state_happy_path() {
        let mut state = InvocationState::default();
        assert!(state.advance(InvocationState::Resolved));
        assert!(state.advance(InvocationState::Locked));
        assert!(state.advance(InvocationState::Running));
        assert!(state.advance(InvocationState::Completed { success: true }));
        assert!(state.is_finished());
    }

    #[test]
    fn test_terminal_states_never_change() {
        let mut state = InvocationState::Running;
        assert!(state.advance(InvocationState::Completed { success: false }));
        assert!(!state.advance(InvocationState::Completed { success: true }));
        assert_eq!(state, InvocationState::Completed { success: false });

        let mut rejected = InvocationState::Resolved;
        assert!(rejected.advance(InvocationState::Rejected(RejectReason::LockConflict)));
        assert!(!rejected.advance(InvocationState::Running));
    }

    #[test]
    fn test_cannot_skip_running() {
        let mut state = InvocationState::Locked;
        assert!(!state.advance(InvocationState::Completed { success: true }));
        assert_eq!(state, InvocationState::Locked);
    }
}
