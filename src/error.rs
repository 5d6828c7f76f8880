//! Group-call error types.

use crate::types::ids::{DeviceId, UserId};
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GroupCallError {
    #[error("invalid group call state for {operation}: {state}")]
    InvalidState {
        operation: &'static str,
        state: &'static str,
    },

    #[error("no feed registered for {user_id} ({device_id})")]
    FeedNotFound {
        user_id: UserId,
        device_id: DeviceId,
    },

    #[error("group call disposed while acquiring local media")]
    Disposed,

    #[error("failed to acquire user media")]
    NoUserMedia(#[source] anyhow::Error),

    #[error("unknown device {device_id} for {user_id}")]
    UnknownDevice {
        user_id: UserId,
        device_id: DeviceId,
        #[source]
        source: anyhow::Error,
    },

    #[error("failed to place call to {user_id} ({device_id})")]
    PlaceCallFailed {
        user_id: UserId,
        device_id: DeviceId,
    },

    #[error("call has no opponent user id")]
    CallHasNoOpponent,

    /// Reserved for PTT floor control: an unmute was refused because
    /// another participant currently holds the floor.
    #[error("another user is currently speaking")]
    OtherUserSpeaking,

    #[error("signalling request failed")]
    Signalling(#[from] anyhow::Error),
}

/// Error code carried on the [`Error`](crate::types::events::GroupCallErrorEvent)
/// event for observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupCallErrorCode {
    NoUserMedia,
    UnknownDevice,
    PlaceCallFailed,
}

impl GroupCallError {
    /// The observer-facing code, for errors that are emitted rather than
    /// returned.
    pub fn code(&self) -> Option<GroupCallErrorCode> {
        match self {
            Self::NoUserMedia(_) => Some(GroupCallErrorCode::NoUserMedia),
            Self::UnknownDevice { .. } => Some(GroupCallErrorCode::UnknownDevice),
            Self::PlaceCallFailed { .. } => Some(GroupCallErrorCode::PlaceCallFailed),
            _ => None,
        }
    }
}

/// Failures reported by the single-call layer.
///
/// `UnknownDevice` is kept distinct because the reconciler surfaces it
/// verbatim instead of folding it into a generic placement failure.
#[derive(Debug, Error)]
pub enum SignallingError {
    #[error("unknown device: {0}")]
    UnknownDevice(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
