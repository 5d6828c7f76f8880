//! Multi-party call coordinator for Matrix rooms.
//!
//! A room's replicated event log carries a group-call declaration plus
//! per-device membership advertisements. This crate turns that eventually
//! consistent view into a full mesh of per-device calls: it decides who
//! calls whom, accepts or rejects inbound calls, replaces superseded
//! sessions, retries failures, keeps the local advertisement fresh, and
//! drives local capture (microphone, camera, screen share, push-to-talk,
//! active speaker).
//!
//! Single-call signalling, media capture and the room-event transport are
//! consumed through the traits in [`traits`]; the embedding client
//! provides the implementations.

pub mod error;
pub mod feed;
pub mod feeds;
pub mod group_call;
pub mod handlers;
pub mod local_media;
pub mod membership;
pub mod participants;
pub mod reconcile;
pub mod test_utils;
pub mod traits;
pub mod types;

pub use error::{GroupCallError, GroupCallErrorCode, SignallingError};
pub use feed::{CallFeed, SPEAKING_THRESHOLD};
pub use feeds::ACTIVE_SPEAKER_INTERVAL;
pub use group_call::{GroupCall, GroupCallConfig};
pub use local_media::PTT_MAX_TRANSMIT_TIME;
pub use participants::{ParticipantState, ParticipantView};
pub use reconcile::{CALL_RETRY_INTERVAL, MAX_CALL_RETRIES};
pub use types::events::{EventBus, GroupCallState};
pub use types::ids::{DeviceId, GroupCallId, SessionId, UserId};
pub use types::member::{
    CallIntent, CallType, DataChannelOptions, DeviceAdvertisement, FeedPurpose, DEVICE_TIMEOUT_MS,
    EVENT_TYPE_GROUP_CALL, EVENT_TYPE_GROUP_CALL_MEMBER,
};
