//! Per-project state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Where a project is in its pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProjectState {
    /// Waiting to start
    Pending,
    /// Writing resolved configuration
    Configuring,
    /// Units compiling
    Building,
    /// Combining unit artifacts
    Packing,
    /// Signing the packed image
    Signing,
    /// Finished, image ready
    Succeeded,
    /// Finished with an error
    Failed,
    /// Stopped before finishing
    Cancelled,
}

impl ProjectState {
    /// Terminal states never change again.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ProjectState::Succeeded | ProjectState::Failed | ProjectState::Cancelled
        )
    }

    /// Whether `self -> next` is a legal step.
    pub fn can_advance_to(self, next: ProjectState) -> bool {
        use ProjectState::*;
        match (self, next) {
            (from, _) if from.is_terminal() => false,
            (_, Failed) | (_, Cancelled) => true,
            (Pending, Configuring)
            | (Configuring, Building)
            | (Building, Packing)
            | (Packing, Signing)
            | (Signing, Succeeded) => true,
            _ => false,
        }
    }
}

impl fmt::Display for ProjectState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProjectState::Pending => write!(f, "⏳ Pending"),
            ProjectState::Configuring => write!(f, "⚙️  Configuring"),
            ProjectState::Building => write!(f, "▶️  Building"),
            ProjectState::Packing => write!(f, "📦 Packing"),
            ProjectState::Signing => write!(f, "🔏 Signing"),
            ProjectState::Succeeded => write!(f, "✅ Succeeded"),
            ProjectState::Failed => write!(f, "❌ Failed"),
            ProjectState::Cancelled => write!(f, "⚠️  Cancelled"),
        }
    }
}

/// A rejected transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("illegal project transition {from:?} -> {to:?}")]
pub struct InvalidTransition {
    /// Current state.
    pub from: ProjectState,
    /// Requested state.
    pub to: ProjectState,
}

/// One recorded transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transition {
    /// State entered.
    pub state: ProjectState,
    /// When.
    pub at: DateTime<Utc>,
}

/// State plus its history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateMachine {
    state: ProjectState,
    history: Vec<Transition>,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl StateMachine {
    /// Start in `Pending`.
    pub fn new() -> Self {
        Self {
            state: ProjectState::Pending,
            history: vec![Transition {
                state: ProjectState::Pending,
                at: Utc::now(),
            }],
        }
    }

    /// Current state.
    pub fn state(&self) -> ProjectState {
        self.state
    }

    /// Move to `next`.
    pub fn advance(&mut self, next: ProjectState) -> Result<(), InvalidTransition> {
        if !self.state.can_advance_to(next) {
            return Err(InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        self.history.push(Transition {
            state: next,
            at: Utc::now(),
        });
        Ok(())
    }

    /// Every state entered, oldest first.
    pub fn history(&self) -> &[Transition] {
        &self.history
    }
}
