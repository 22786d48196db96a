//! Error types.

use thiserror::Error;

/// Why a path request produced no path.
///
/// Every variant is recoverable: callers that do not care about the reason
/// treat any error as "no path" and fall back to a direct move.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PathError {
    /// The open set ran dry; no route exists on the current grid.
    #[error("goal is unreachable from start")]
    Unreachable,
    /// The search hit its expansion budget before reaching the goal.
    #[error("search budget exhausted after {expansions} expansions")]
    BudgetExceeded { expansions: usize },
    /// The goal cell is blocked and no walkable cell lies within the ring search.
    #[error("no walkable cell within {radius} cells of the goal")]
    NoWalkableGoal { radius: u32 },
}

impl PathError {
    /// A retry with a bigger budget might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, PathError::BudgetExceeded { .. })
    }
}

/// Configuration loading failures.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Failures of agent orders issued through `SimWorld`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum OrderError {
    #[error("no live unit with id {0}")]
    UnknownUnit(u32),
    #[error(transparent)]
    Path(#[from] PathError),
}
