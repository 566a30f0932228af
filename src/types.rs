//! Core identifier and status types for the Flowline engine.
//!
//! This module defines the fundamental types used throughout Flowline for
//! identifying flows and describing their lifecycle. These are the core
//! domain concepts that define what a flow *is*; execution machinery lives
//! in [`crate::controller`] and [`crate::orchestrator`].
//!
//! # Key Types
//!
//! - [`FlowId`]: canonical identifier shared by the master and child records
//! - [`FlowStatus`]: lifecycle status of a whole flow
//! - [`PhaseStatus`]: outcome of a single phase execution
//!
//! # Examples
//!
//! ```rust
//! use flowline::types::{FlowId, FlowStatus};
//!
//! let id = FlowId::generate();
//! assert_eq!(id.as_str().len(), 36); // canonical hyphenated uuid
//!
//! // Encode for persistence
//! assert_eq!(FlowStatus::Paused.encode(), "paused");
//! assert_eq!(FlowStatus::decode("paused"), FlowStatus::Paused);
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Identifier shared by the two records of one flow instance.
///
/// The master and child records of a flow always carry the same `FlowId`;
/// the id is generated once at creation time and serialized in its canonical
/// hyphenated-lowercase uuid form everywhere it is stored.
///
/// # Examples
///
/// ```rust
/// use flowline::types::FlowId;
///
/// let id = FlowId::generate();
/// let restored = FlowId::from(id.as_str());
/// assert_eq!(id, restored);
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FlowId(String);

impl FlowId {
    /// Generate a fresh flow identifier (uuid v4, canonical string form).
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// The canonical string form used for storage and logging.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FlowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for FlowId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for FlowId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Lifecycle status of a flow.
///
/// Statuses move strictly forward:
/// `NotStarted → Running → {Paused | Completed | Failed | Cancelled}`,
/// with `Paused → Running` on resume. `Completed`, `Failed`, and `Cancelled`
/// are terminal; a flow that reached one of them is never mutated again
/// (only purged by an explicit external call).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowStatus {
    /// Created, durably written, but no phase has executed yet.
    NotStarted,
    /// A phase controller loop currently owns this flow.
    Running,
    /// Durably paused awaiting user input; nothing holds resources.
    Paused,
    /// All phases completed.
    Completed,
    /// Terminal failure; structured detail lives in the phase records.
    Failed,
    /// Cooperatively cancelled between phases.
    Cancelled,
}

impl FlowStatus {
    /// Encode into the persisted string form.
    #[must_use]
    pub fn encode(&self) -> &'static str {
        match self {
            FlowStatus::NotStarted => "not_started",
            FlowStatus::Running => "running",
            FlowStatus::Paused => "paused",
            FlowStatus::Completed => "completed",
            FlowStatus::Failed => "failed",
            FlowStatus::Cancelled => "cancelled",
        }
    }

    /// Decode a persisted string form.
    ///
    /// Unknown encodings decode as `Failed` so a corrupted row can never be
    /// mistaken for an active flow.
    #[must_use]
    pub fn decode(s: &str) -> Self {
        match s {
            "not_started" => FlowStatus::NotStarted,
            "running" => FlowStatus::Running,
            "paused" => FlowStatus::Paused,
            "completed" => FlowStatus::Completed,
            "failed" => FlowStatus::Failed,
            "cancelled" => FlowStatus::Cancelled,
            _ => FlowStatus::Failed,
        }
    }

    /// Returns `true` for `Completed`, `Failed`, and `Cancelled`.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            FlowStatus::Completed | FlowStatus::Failed | FlowStatus::Cancelled
        )
    }
}

impl fmt::Display for FlowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.encode())
    }
}

/// Outcome of a single phase execution, as recorded in `phase_state`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    /// Phase finished and its delta was appended.
    Succeeded,
    /// Phase requested user input; the flow paused here.
    Paused,
    /// Phase failed fatally (or exhausted its retry budget).
    Failed,
    /// Phase was skipped on an upstream signal; treated as success.
    Skipped,
}

impl PhaseStatus {
    /// A phase counts as done when it succeeded or was deliberately skipped.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        matches!(self, PhaseStatus::Succeeded | PhaseStatus::Skipped)
    }

    /// Canonical string form used in persisted records.
    #[must_use]
    pub fn encode(&self) -> &'static str {
        match self {
            PhaseStatus::Succeeded => "succeeded",
            PhaseStatus::Paused => "paused",
            PhaseStatus::Failed => "failed",
            PhaseStatus::Skipped => "skipped",
        }
    }

    /// Inverse of [`PhaseStatus::encode`]; unknown encodings decode as
    /// `Failed` so a corrupt record never counts as complete.
    #[must_use]
    pub fn decode(s: &str) -> Self {
        match s {
            "succeeded" => PhaseStatus::Succeeded,
            "paused" => PhaseStatus::Paused,
            "skipped" => PhaseStatus::Skipped,
            _ => PhaseStatus::Failed,
        }
    }
}

impl fmt::Display for PhaseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.encode())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flow_status_encode_decode_round_trip() {
        for status in [
            FlowStatus::NotStarted,
            FlowStatus::Running,
            FlowStatus::Paused,
            FlowStatus::Completed,
            FlowStatus::Failed,
            FlowStatus::Cancelled,
        ] {
            assert_eq!(FlowStatus::decode(status.encode()), status);
        }
    }

    #[test]
    fn unknown_status_decodes_as_failed() {
        assert_eq!(FlowStatus::decode("definitely-not-a-status"), FlowStatus::Failed);
        assert!(FlowStatus::decode("garbage").is_terminal());
    }

    #[test]
    fn terminal_statuses() {
        assert!(!FlowStatus::NotStarted.is_terminal());
        assert!(!FlowStatus::Running.is_terminal());
        assert!(!FlowStatus::Paused.is_terminal());
        assert!(FlowStatus::Completed.is_terminal());
        assert!(FlowStatus::Failed.is_terminal());
        assert!(FlowStatus::Cancelled.is_terminal());
    }

    #[test]
    fn unknown_phase_status_is_not_complete() {
        assert_eq!(PhaseStatus::decode("mystery"), PhaseStatus::Failed);
        assert!(!PhaseStatus::decode("mystery").is_complete());
    }

    #[test]
    fn flow_id_canonical_form() {
        let id = FlowId::generate();
        assert_eq!(id.to_string(), id.as_str());
        // canonical hyphenated uuid
        assert_eq!(id.as_str().split('-').count(), 5);
    }
}
