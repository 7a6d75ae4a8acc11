//! Phase controller: a deterministic FSM restricting what the agent can do
//! based on where it is in a task.
//!
//! Phases advance linearly with a single permitted back-edge
//! (VERIFY -> FIX on test failure). Each phase carries a restrictive tool
//! mask: a tool must be both in the current mode and allowed by the phase.
//! The controller also enforces the think budget and the tool-latency budget.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::{Error, Result};

/// FSM state constraining which kinds of tools the agent may invoke.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Find relevant code
    Localize,
    /// Form a fix plan
    Understand,
    /// Apply changes
    Fix,
    /// Verify no regressions
    RegressionCheck,
    /// Confirm the target fix
    Verify,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Localize => "localize",
            Self::Understand => "understand",
            Self::Fix => "fix",
            Self::RegressionCheck => "regression_check",
            Self::Verify => "verify",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "localize" => Some(Self::Localize),
            "understand" => Some(Self::Understand),
            "fix" => Some(Self::Fix),
            "regression_check" => Some(Self::RegressionCheck),
            "verify" => Some(Self::Verify),
            _ => None,
        }
    }

    /// The next phase in linear order, if any.
    pub fn next(&self) -> Option<Phase> {
        match self {
            Self::Localize => Some(Self::Understand),
            Self::Understand => Some(Self::Fix),
            Self::Fix => Some(Self::RegressionCheck),
            Self::RegressionCheck => Some(Self::Verify),
            Self::Verify => None,
        }
    }

    /// Whether `self -> to` is a legal edge. Forward edges may skip phases
    /// (a fix with no other tests goes FIX -> VERIFY directly); the only
    /// backward edge is VERIFY -> FIX.
    pub fn can_transition_to(&self, to: Phase) -> bool {
        if *self == Phase::Verify && to == Phase::Fix {
            return true;
        }
        (to as u8) > (*self as u8)
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Localize => "LOCALIZE",
            Self::Understand => "UNDERSTAND",
            Self::Fix => "FIX",
            Self::RegressionCheck => "REGRESSION_CHECK",
            Self::Verify => "VERIFY",
        };
        write!(f, "{}", s)
    }
}

/// Coarse classification of what a tool does, used by the phase mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCategory {
    Read,
    Search,
    Glob,
    BashReadOnly,
    Bash,
    BashTests,
    Write,
    Edit,
    Think,
    Complete,
    /// Always-available meta tools (menu_*, message_user)
    Meta,
}

impl ToolCategory {
    /// Whether a call in this category changes external state.
    pub fn is_state_changing(&self) -> bool {
        matches!(self, Self::Bash | Self::BashTests | Self::Write | Self::Edit)
    }
}

impl Phase {
    /// The restrictive tool mask for this phase. Meta tools always pass.
    /// A phase that allows full `bash` also admits its read-only and
    /// test-running subsets.
    pub fn allows(&self, category: ToolCategory) -> bool {
        use ToolCategory::*;
        if category == Meta {
            return true;
        }
        match self {
            Self::Localize => matches!(category, Read | Search | Glob | BashReadOnly),
            Self::Understand => matches!(category, Read | Search | Glob | BashReadOnly | Think),
            Self::Fix => matches!(
                category,
                Read | Write | Edit | Bash | BashReadOnly | BashTests | Think
            ),
            Self::RegressionCheck => matches!(category, BashTests | Read | Think),
            Self::Verify => matches!(category, BashTests | Read | Think | Complete),
        }
    }
}

/// Per-phase observation counters backing the declarative exit criteria.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitProgress {
    pub files_read: u32,
    pub edits: u32,
    pub tests_run: u32,
    pub thinks: u32,
}

/// Tracks the current phase, which phases were entered, and whether each
/// entered phase's exit criteria have been satisfied.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseTracker {
    current: Phase,
    progress: HashMap<Phase, ExitProgress>,
    entered: Vec<Phase>,
}

impl PhaseTracker {
    pub fn new() -> Self {
        Self {
            current: Phase::Localize,
            progress: HashMap::new(),
            entered: vec![Phase::Localize],
        }
    }

    /// Restore a tracker from checkpointed state.
    pub fn restore(
        current: Phase,
        progress: HashMap<Phase, ExitProgress>,
        entered: Vec<Phase>,
    ) -> Self {
        Self {
            current,
            progress,
            entered,
        }
    }

    pub fn current(&self) -> Phase {
        self.current
    }

    pub fn entered(&self) -> &[Phase] {
        &self.entered
    }

    pub fn progress(&self) -> &HashMap<Phase, ExitProgress> {
        &self.progress
    }

    /// Record an observation attributable to the current phase.
    pub fn record(&mut self, category: ToolCategory) {
        let p = self.progress.entry(self.current).or_default();
        match category {
            ToolCategory::Read => p.files_read += 1,
            ToolCategory::Write | ToolCategory::Edit => p.edits += 1,
            ToolCategory::BashTests => p.tests_run += 1,
            ToolCategory::Think => p.thinks += 1,
            _ => {}
        }
    }

    /// Whether the given phase's exit criteria are satisfied.
    pub fn exit_criteria_met(&self, phase: Phase) -> bool {
        let p = self.progress.get(&phase).copied().unwrap_or_default();
        match phase {
            Phase::Localize => p.files_read >= 1,
            Phase::Understand => p.thinks >= 1,
            Phase::Fix => p.edits >= 1,
            Phase::RegressionCheck => p.tests_run >= 1,
            Phase::Verify => p.tests_run >= 1,
        }
    }

    /// Attempt a phase transition; rejected unless the edge is legal and the
    /// current phase's exit criteria hold.
    pub fn transition(&mut self, to: Phase) -> Result<()> {
        if !self.current.can_transition_to(to) {
            return Err(Error::PhaseViolation(format!(
                "no edge from {} to {}",
                self.current, to
            )));
        }
        if !self.exit_criteria_met(self.current) {
            return Err(Error::PhaseViolation(format!(
                "exit criteria for {} not satisfied",
                self.current
            )));
        }
        self.current = to;
        if !self.entered.contains(&to) {
            self.entered.push(to);
        }
        Ok(())
    }

    /// Whether every entered phase's exit criteria have been satisfied.
    pub fn all_entered_satisfied(&self) -> bool {
        self.entered.iter().all(|p| self.exit_criteria_met(*p))
    }
}

impl Default for PhaseTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Bounded consecutive `think` calls (default 3). The call that would exceed
/// the budget is rejected so the LLM is prompted to act.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThinkBudget {
    pub limit: u32,
    consecutive: u32,
}

impl ThinkBudget {
    pub fn new(limit: u32) -> Self {
        Self {
            limit,
            consecutive: 0,
        }
    }

    pub fn consecutive(&self) -> u32 {
        self.consecutive
    }

    /// Record a think call, failing once the budget is exhausted.
    pub fn record_think(&mut self) -> Result<()> {
        if self.consecutive >= self.limit {
            return Err(Error::budget_exhausted(format!(
                "think ({} consecutive calls)",
                self.consecutive
            )));
        }
        self.consecutive += 1;
        Ok(())
    }

    /// A non-think call resets the streak.
    pub fn record_other(&mut self) {
        self.consecutive = 0;
    }
}

impl Default for ThinkBudget {
    fn default() -> Self {
        Self::new(3)
    }
}

/// Tool-latency budget: after `limit` consecutive turns without a
/// state-changing call, the next call must be one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LatencyBudget {
    pub limit: u32,
    idle_turns: u32,
}

impl LatencyBudget {
    pub fn new(limit: u32) -> Self {
        Self {
            limit,
            idle_turns: 0,
        }
    }

    pub fn idle_turns(&self) -> u32 {
        self.idle_turns
    }

    /// Record a finished turn.
    pub fn note_turn(&mut self, had_state_changing_call: bool) {
        if had_state_changing_call {
            self.idle_turns = 0;
        } else {
            self.idle_turns += 1;
        }
    }

    /// Whether the next call is required to be state-changing.
    pub fn state_change_required(&self) -> bool {
        self.idle_turns >= self.limit
    }

    /// Validate a call category against the budget. Only applies in phases
    /// where state-changing tools are available at all.
    pub fn validate(&self, category: ToolCategory, phase: Phase) -> Result<()> {
        let phase_has_state_tools = [
            ToolCategory::Edit,
            ToolCategory::Write,
            ToolCategory::Bash,
            ToolCategory::BashTests,
        ]
        .iter()
        .any(|c| phase.allows(*c));

        if self.state_change_required()
            && phase_has_state_tools
            && !category.is_state_changing()
            && category != ToolCategory::Meta
            && category != ToolCategory::Complete
        {
            return Err(Error::budget_exhausted(format!(
                "tool latency ({} turns without a state-changing call)",
                self.idle_turns
            )));
        }
        Ok(())
    }
}

impl Default for LatencyBudget {
    fn default() -> Self {
        Self::new(2)
    }
}
