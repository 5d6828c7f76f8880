//! Opaque identifier types used throughout the coordinator.

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! opaque_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
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
    };
}

opaque_id!(
    /// Identifier of a group call within a room.
    GroupCallId
);

opaque_id!(
    /// A user on the federation, e.g. `@alice:example.org`.
    UserId
);

opaque_id!(
    /// A logged-in device of a user. Stable across restarts.
    DeviceId
);

opaque_id!(
    /// A single run of the coordinator on a device. Regenerated on process
    /// restart, which is how stale advertisements from crashed sessions are
    /// told apart from live ones.
    SessionId
);
