//! Plan parsing and tracking.
//!
//! The model announces a plan either as a fenced ```plan JSON block or
//! as a leading numbered list. The tracker owns the step table,
//! rejects illegal transitions (terminal states are final, at most one
//! step in progress), sequences its progress events, and counts
//! per-step attempts for the retry-or-replan decision.

use std::collections::HashMap;

use dp_domain::error::{Error, Result};
use dp_domain::event::EventBody;
use dp_domain::plan::{Plan, PlanStep, StepStatus};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Parsing
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Extract a structured plan from assistant text, if one is present.
pub fn parse_plan(text: &str) -> Option<(String, Vec<PlanStep>)> {
    if let Some(steps) = parse_fenced_plan(text) {
        return Some((text.to_string(), steps));
    }
    parse_numbered_plan(text).map(|steps| (text.to_string(), steps))
}

/// ```plan { "steps": [{"title": "...", "tool": "..."}] } ```
fn parse_fenced_plan(text: &str) -> Option<Vec<PlanStep>> {
    let start = text.find("```plan")?;
    let body = &text[start + "```plan".len()..];
    let end = body.find("```")?;
    let json: serde_json::Value = serde_json::from_str(body[..end].trim()).ok()?;

    let steps = json["steps"].as_array()?;
    let parsed: Vec<PlanStep> = steps
        .iter()
        .enumerate()
        .filter_map(|(i, step)| {
            let title = step["title"].as_str()?.to_string();
            let mut plan_step = PlanStep::new(format!("step-{}", i + 1), title);
            plan_step.tool_hint = step["tool"].as_str().map(str::to_string);
            Some(plan_step)
        })
        .collect();
    (!parsed.is_empty()).then_some(parsed)
}

/// A leading numbered list ("1. Load the data") of at least two items.
fn parse_numbered_plan(text: &str) -> Option<Vec<PlanStep>> {
    let mut steps = Vec::new();
    for line in text.lines() {
        let trimmed = line.trim();
        let Some(rest) = trimmed
            .split_once(". ")
            .filter(|(n, _)| n.chars().all(|c| c.is_ascii_digit()) && !n.is_empty())
            .map(|(_, rest)| rest)
        else {
            continue;
        };
        steps.push(PlanStep::new(
            format!("step-{}", steps.len() + 1),
            rest.trim(),
        ));
    }
    (steps.len() >= 2).then_some(steps)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tracker
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct PlanTracker {
    plan: Option<Plan>,
    /// Monotone sequence stamped on progress events; stale external
    /// updates (lower seq) are dropped.
    seq: u64,
    attempts: HashMap<String, u32>,
    max_step_attempts: u32,
}

/// What the loop should do after a step failure.
#[derive(Debug, PartialEq, Eq)]
pub enum FailureAdvice {
    RetryStep { attempt: u32 },
    Replan,
}

impl PlanTracker {
    pub fn new(max_step_attempts: u32) -> Self {
        Self {
            plan: None,
            seq: 0,
            attempts: HashMap::new(),
            max_step_attempts,
        }
    }

    pub fn has_plan(&self) -> bool {
        self.plan.is_some()
    }

    pub fn plan(&self) -> Option<&Plan> {
        self.plan.as_ref()
    }

    /// Install a freshly parsed plan; returns the announcement event.
    pub fn install(&mut self, raw_text: String, steps: Vec<PlanStep>) -> EventBody {
        let event = EventBody::AnalysisPlan {
            raw_text,
            steps: steps.clone(),
        };
        self.plan = Some(Plan { steps });
        self.attempts.clear();
        event
    }

    /// Advance the frontier: mark the first not-started step
    /// in-progress. No-op when a step is already running or the plan
    /// is finished.
    pub fn begin_next_step(&mut self) -> Option<Vec<EventBody>> {
        let plan = self.plan.as_mut()?;
        if plan.in_progress_index().is_some() {
            return None;
        }
        let index = plan
            .steps
            .iter()
            .position(|s| s.status == StepStatus::NotStarted)?;
        plan.steps[index].status = StepStatus::InProgress;
        Some(self.progress_events(index))
    }

    /// Transition the in-progress step. Terminal regressions and
    /// double-starts are rejected.
    pub fn transition_current(&mut self, to: StepStatus) -> Result<Vec<EventBody>> {
        let plan = self
            .plan
            .as_mut()
            .ok_or_else(|| Error::Internal("no active plan".into()))?;
        let index = plan
            .in_progress_index()
            .ok_or_else(|| Error::Internal("no step in progress".into()))?;

        let current = plan.steps[index].status;
        if !current.can_transition_to(to) {
            return Err(Error::Validation(format!(
                "illegal step transition {current:?} → {to:?}"
            )));
        }
        plan.steps[index].status = to;
        Ok(self.progress_events(index))
    }

    /// Record a failure on the in-progress step and decide whether the
    /// loop retries it or asks the model to replan.
    pub fn step_failed(&mut self, reason: &str) -> Result<(FailureAdvice, Vec<EventBody>)> {
        let plan = self
            .plan
            .as_mut()
            .ok_or_else(|| Error::Internal("no active plan".into()))?;
        let index = plan
            .in_progress_index()
            .ok_or_else(|| Error::Internal("no step in progress".into()))?;
        let step_id = plan.steps[index].id.clone();

        let attempt = self.attempts.entry(step_id.clone()).or_insert(0);
        *attempt += 1;
        let attempt_now = *attempt;

        let mut events = vec![EventBody::TaskAttempt {
            step_id: step_id.clone(),
            attempt: attempt_now,
            status: "failed".into(),
            note: Some(reason.to_string()),
        }];

        if attempt_now < self.max_step_attempts {
            // Keep the step in progress for the retry.
            Ok((FailureAdvice::RetryStep { attempt: attempt_now }, events))
        } else {
            let plan = self.plan.as_mut().expect("checked above");
            plan.steps[index].status = StepStatus::Failed;
            events.extend(self.progress_events(index));
            Ok((FailureAdvice::Replan, events))
        }
    }

    fn progress_events(&mut self, index: usize) -> Vec<EventBody> {
        let plan = self.plan.as_ref().expect("caller holds a plan");
        let step = &plan.steps[index];
        self.seq += 1;
        let next_hint = plan
            .steps
            .get(index + 1)
            .filter(|_| step.status.is_terminal())
            .map(|s| s.title.clone());
        vec![
            EventBody::PlanStepUpdate { step: step.clone() },
            EventBody::PlanProgress {
                current_step_index: index + 1,
                total_steps: plan.steps.len(),
                step_title: step.title.clone(),
                step_status: step.status,
                next_hint,
            },
        ]
    }

    /// Current monotone progress sequence (for external consumers that
    /// must drop stale arrivals).
    pub fn progress_seq(&self) -> u64 {
        self.seq
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fenced_plan_parses() {
        let text = "Here is the approach.\n```plan\n{\"steps\":[{\"title\":\"Load sales\",\"tool\":\"load_dataset\"},{\"title\":\"Mean by region\",\"tool\":\"group_by_mean\"}]}\n```";
        let (_, steps) = parse_plan(text).unwrap();
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[0].tool_hint.as_deref(), Some("load_dataset"));
        assert_eq!(steps[1].title, "Mean by region");
    }

    #[test]
    fn numbered_plan_parses() {
        let text = "I'll proceed as follows:\n1. Load the dataset\n2. Compute the mean\n3. Chart the result";
        let (_, steps) = parse_plan(text).unwrap();
        assert_eq!(steps.len(), 3);
        assert_eq!(steps[2].title, "Chart the result");
    }

    #[test]
    fn single_item_is_not_a_plan() {
        assert!(parse_plan("1. just one thing").is_none());
        assert!(parse_plan("no plan here").is_none());
    }

    fn tracker_with_two_steps() -> PlanTracker {
        let mut tracker = PlanTracker::new(2);
        tracker.install(
            "raw".into(),
            vec![PlanStep::new("step-1", "Load"), PlanStep::new("step-2", "Mean")],
        );
        tracker
    }

    #[test]
    fn begin_then_complete_advances() {
        let mut tracker = tracker_with_two_steps();

        let events = tracker.begin_next_step().unwrap();
        assert!(matches!(
            &events[1],
            EventBody::PlanProgress {
                current_step_index: 1,
                step_status: StepStatus::InProgress,
                ..
            }
        ));

        tracker.transition_current(StepStatus::Done).unwrap();
        let events = tracker.begin_next_step().unwrap();
        assert!(matches!(
            &events[1],
            EventBody::PlanProgress {
                current_step_index: 2,
                ..
            }
        ));
    }

    #[test]
    fn at_most_one_step_in_progress() {
        let mut tracker = tracker_with_two_steps();
        tracker.begin_next_step().unwrap();
        assert!(tracker.begin_next_step().is_none());
    }

    #[test]
    fn terminal_transition_rejected() {
        let mut tracker = tracker_with_two_steps();
        tracker.begin_next_step().unwrap();
        tracker.transition_current(StepStatus::Done).unwrap();
        // No step in progress anymore.
        assert!(tracker.transition_current(StepStatus::Failed).is_err());
    }

    #[test]
    fn failure_retries_then_replans() {
        let mut tracker = tracker_with_two_steps();
        tracker.begin_next_step().unwrap();

        let (advice, events) = tracker.step_failed("tool error").unwrap();
        assert_eq!(advice, FailureAdvice::RetryStep { attempt: 1 });
        assert!(matches!(&events[0], EventBody::TaskAttempt { attempt: 1, .. }));

        let (advice, _) = tracker.step_failed("tool error again").unwrap();
        assert_eq!(advice, FailureAdvice::Replan);
        // Step is now terminal-failed.
        assert_eq!(
            tracker.plan().unwrap().steps[0].status,
            StepStatus::Failed
        );
    }

    #[test]
    fn progress_seq_is_monotone() {
        let mut tracker = tracker_with_two_steps();
        let s0 = tracker.progress_seq();
        tracker.begin_next_step().unwrap();
        let s1 = tracker.progress_seq();
        tracker.transition_current(StepStatus::Done).unwrap();
        let s2 = tracker.progress_seq();
        assert!(s0 < s1 && s1 < s2);
    }
}
