//! Typed ID wrappers shared by both sides of the boundary.
//!
//! IDs are opaque String wrappers (serde-transparent). Session ids travel into
//! file paths on the orchestrator side, so [`SessionId::validate`] and
//! [`JobId::validate`] reject anything that is not a plain path segment.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::ProtocolError;

macro_rules! typed_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create from any string value.
            pub fn from_string(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            /// Create a new ID using UUID v4 (random).
            pub fn new_uuid() -> Self {
                Self(uuid::Uuid::new_v4().to_string())
            }

            /// View as string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new_uuid()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

typed_id!(
    /// Globally unique identifier of one agent conversation.
    SessionId
);
typed_id!(
    /// Identifier of one executor run (one job directory).
    JobId
);
typed_id!(
    /// Deduplication key of a persisted session line.
    LineId
);
typed_id!(
    /// Identifier of a tool call proposed by the model.
    ToolCallId
);
typed_id!(
    /// Workspace owning the session.
    WorkspaceId
);
typed_id!(
    /// Organization owning the workspace.
    OrganizationId
);
typed_id!(
    /// Human user on whose behalf the agent runs.
    UserId
);

/// Longest id accepted as a path segment.
const MAX_PATH_SEGMENT_LEN: usize = 128;

fn validate_path_segment(kind: &'static str, value: &str) -> Result<(), ProtocolError> {
    let valid = !value.is_empty()
        && value.len() <= MAX_PATH_SEGMENT_LEN
        && value != "."
        && value != ".."
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(ProtocolError::InvalidIdentifier {
            kind,
            value: value.chars().take(64).collect(),
        })
    }
}

impl SessionId {
    /// Reject ids that cannot be used verbatim as a file-name component.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        validate_path_segment("session id", &self.0)
    }
}

impl JobId {
    /// Short random job id. Job ids end up in socket paths, which the kernel
    /// caps at 108 bytes, so they are kept compact.
    pub fn short() -> Self {
        let raw = uuid::Uuid::new_v4().simple().to_string();
        Self(format!("job-{}", &raw[..12]))
    }

    pub fn validate(&self) -> Result<(), ProtocolError> {
        validate_path_segment("job id", &self.0)
    }
}
