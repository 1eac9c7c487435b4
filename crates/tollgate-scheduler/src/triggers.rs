//! Trigger matching and evaluation.

use std::fmt;
use tollgate_core::BranchCondition;
use tollgate_core::run::{RunContext, TriggerEvent};
use tollgate_core::workflow::{EventKind, TriggerConfig, Workflow};
use tracing::{debug, info, warn};

/// Outcome of evaluating an event against a workflow's triggers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActivationDecision {
    Activate(RunContext),
    Suppress(SuppressReason),
}

impl ActivationDecision {
    pub fn is_activated(&self) -> bool {
        matches!(self, ActivationDecision::Activate(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SuppressReason {
    /// The event kind is not one the engine understands.
    UnknownKind(String),
    /// The workflow declares no trigger of this kind.
    UndeclaredKind(EventKind),
    /// No trigger of this kind accepts the branch.
    BranchFiltered { kind: EventKind, branch: String },
    /// A pull request event without a target branch.
    MissingTarget,
}

impl fmt::Display for SuppressReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SuppressReason::UnknownKind(kind) => write!(f, "unknown event kind '{}'", kind),
            SuppressReason::UndeclaredKind(kind) => {
                write!(f, "workflow has no '{}' trigger", kind)
            }
            SuppressReason::BranchFiltered { kind, branch } => {
                write!(f, "no '{}' trigger accepts branch '{}'", kind, branch)
            }
            SuppressReason::MissingTarget => write!(f, "pull request has no target branch"),
        }
    }
}

/// Decides whether an event activates a workflow. Pure; never errors.
pub struct TriggerEvaluator;

impl TriggerEvaluator {
    pub fn new() -> Self {
        Self
    }

    /// Evaluate a typed event.
    pub fn evaluate(&self, workflow: &Workflow, event: &TriggerEvent) -> ActivationDecision {
        let decision = self.decide(workflow.triggers(), event);
        match &decision {
            ActivationDecision::Activate(ctx) => {
                info!(
                    workflow = %workflow.name(),
                    kind = %ctx.kind,
                    branch = %ctx.branch,
                    actor = %ctx.actor,
                    "Activated"
                );
            }
            ActivationDecision::Suppress(reason) => {
                info!(workflow = %workflow.name(), reason = %reason, "Suppressed");
            }
        }
        decision
    }

    /// Evaluate an event whose kind arrives as a string. Unknown kinds are
    /// logged and suppressed, not treated as errors.
    pub fn evaluate_raw(
        &self,
        workflow: &Workflow,
        kind: &str,
        branch: &str,
        target_branch: Option<&str>,
        actor: &str,
    ) -> ActivationDecision {
        let Ok(kind) = kind.parse::<EventKind>() else {
            warn!(workflow = %workflow.name(), kind = %kind, "Ignoring event of unknown kind");
            return ActivationDecision::Suppress(SuppressReason::UnknownKind(kind.to_string()));
        };
        let event = TriggerEvent {
            kind,
            branch: branch.to_string(),
            target_branch: target_branch.map(str::to_string),
            actor: actor.to_string(),
        };
        self.evaluate(workflow, &event)
    }

    fn decide(&self, triggers: &[TriggerConfig], event: &TriggerEvent) -> ActivationDecision {
        // Default: trigger on push to any branch
        let default_trigger;
        let triggers = if triggers.is_empty() {
            default_trigger = [TriggerConfig {
                kind: EventKind::Push,
                branches: vec![],
            }];
            &default_trigger[..]
        } else {
            triggers
        };

        let declared: Vec<&TriggerConfig> =
            triggers.iter().filter(|t| t.kind == event.kind).collect();
        if declared.is_empty() {
            return ActivationDecision::Suppress(SuppressReason::UndeclaredKind(event.kind));
        }

        let matched_branch = match event.kind {
            EventKind::Manual => None,
            EventKind::Push => Some(event.branch.as_str()),
            EventKind::PullRequest => match event.target_branch.as_deref() {
                Some(target) => Some(target),
                None => return ActivationDecision::Suppress(SuppressReason::MissingTarget),
            },
        };

        if let Some(branch) = matched_branch {
            let accepted = declared.iter().any(|trigger| {
                trigger
                    .branch_conditions()
                    .iter()
                    .any(|cond: &BranchCondition| cond.evaluate(branch))
            });
            if !accepted {
                debug!(kind = %event.kind, branch = %branch, "No branch filter matched");
                return ActivationDecision::Suppress(SuppressReason::BranchFiltered {
                    kind: event.kind,
                    branch: branch.to_string(),
                });
            }
        }

        ActivationDecision::Activate(RunContext::from(event))
    }
}

impl Default for TriggerEvaluator {
    fn default() -> Self {
        Self::new()
    }
}
