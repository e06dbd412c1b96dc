//! Hub error types.

use casehub_core::{CaseId, GroupId, UserId};
use thiserror::Error;

/// Errors returned by hub operations.
///
/// Per-recipient delivery failures are never reported here; they are logged
/// and handled by eviction.
#[derive(Debug, Error)]
pub enum HubError {
    /// Broadcast target group has no members (or never existed).
    #[error("group not found: {0}")]
    GroupNotFound(GroupId),
    /// Broadcast target case has no groups.
    #[error("no groups found for case: {0}")]
    CaseNotFound(CaseId),
    /// Target user has no live connection.
    #[error("user not connected: {0}")]
    UserNotConnected(UserId),
    /// A group cannot move between cases.
    #[error("group {group_id} belongs to case {expected}, not {actual}")]
    CaseMismatch {
        /// Group being joined.
        group_id: GroupId,
        /// Case the group is bound to.
        expected: CaseId,
        /// Case supplied by the caller.
        actual: CaseId,
    },
    /// Event could not be serialized.
    #[error("failed to encode event: {0}")]
    Encode(#[from] serde_json::Error),
}

impl HubError {
    /// Whether this is one of the lookup failures.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::GroupNotFound(_) | Self::CaseNotFound(_) | Self::UserNotConnected(_)
        )
    }
}

/// Convenience result alias.
pub type Result<T> = std::result::Result<T, HubError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_classification() {
        assert!(HubError::GroupNotFound("g".into()).is_not_found());
        assert!(HubError::CaseNotFound("c".into()).is_not_found());
        assert!(HubError::UserNotConnected("u".into()).is_not_found());
        let mismatch = HubError::CaseMismatch {
            group_id: "g".into(),
            expected: "c1".into(),
            actual: "c2".into(),
        };
        assert!(!mismatch.is_not_found());
    }

    #[test]
    fn display_messages() {
        assert_eq!(
            HubError::GroupNotFound("nonexistent-group".into()).to_string(),
            "group not found: nonexistent-group"
        );
        assert_eq!(
            HubError::CaseNotFound("C9".into()).to_string(),
            "no groups found for case: C9"
        );
    }
}
