//! The plan model: an ordered list of steps with monotone status
//! transitions. Terminal statuses never regress and at most one step is
//! in progress at a time — both enforced by the tracker, expressed here.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    NotStarted,
    InProgress,
    Done,
    Blocked,
    Failed,
    Skipped,
}

impl StepStatus {
    /// Done, failed, and skipped never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, StepStatus::Done | StepStatus::Failed | StepStatus::Skipped)
    }

    /// Legal forward transitions. Anything out of a terminal state is
    /// rejected; `Blocked` may resume or be skipped.
    pub fn can_transition_to(&self, next: StepStatus) -> bool {
        if *self == next {
            return false;
        }
        match self {
            s if s.is_terminal() => false,
            StepStatus::NotStarted => true,
            StepStatus::InProgress => next != StepStatus::NotStarted,
            StepStatus::Blocked => matches!(
                next,
                StepStatus::InProgress | StepStatus::Failed | StepStatus::Skipped
            ),
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanStep {
    pub id: String,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_hint: Option<String>,
    pub status: StepStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action_id: Option<String>,
}

impl PlanStep {
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            tool_hint: None,
            status: StepStatus::NotStarted,
            action_id: None,
        }
    }
}

/// An ordered plan produced by the model for one turn.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Plan {
    pub steps: Vec<PlanStep>,
}

impl Plan {
    pub fn in_progress_index(&self) -> Option<usize> {
        self.steps
            .iter()
            .position(|s| s.status == StepStatus::InProgress)
    }

    pub fn is_finished(&self) -> bool {
        self.steps.iter().all(|s| s.status.is_terminal())
    }
}
