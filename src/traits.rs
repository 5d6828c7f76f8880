//! Collaborator interfaces consumed by the coordinator.
//!
//! The coordinator never talks to the network, the media stack or the
//! single-call signalling machinery directly. It consumes them through the
//! traits in this module, which the embedding client implements. Mock
//! implementations for tests live in [`crate::test_utils`].

use crate::error::SignallingError;
use crate::feed::CallFeed;
use crate::types::ids::{DeviceId, GroupCallId, SessionId, UserId};
use crate::types::member::DataChannelOptions;
use async_trait::async_trait;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tokio::sync::broadcast;

/// A capture handle produced by the media layer. Track-level detail stays
/// behind this trait; the coordinator only flips enablement and watches for
/// the stream ending (screen shares end when the user stops the share from
/// the system UI).
pub trait MediaStream: Send + Sync + fmt::Debug {
    fn has_audio(&self) -> bool;
    fn has_video(&self) -> bool;
    fn set_audio_enabled(&self, enabled: bool);
    fn set_video_enabled(&self, enabled: bool);
    fn audio_enabled(&self) -> bool;
    fn video_enabled(&self) -> bool;
    /// Identifier of the captured source (screen shares only).
    fn source_id(&self) -> Option<String> {
        None
    }
    fn subscribe_ended(&self) -> broadcast::Receiver<()>;
}

#[derive(Debug, Clone, Default)]
pub struct ScreenshareOpts {
    pub desktop_capturer_source_id: Option<String>,
    pub audio: bool,
}

/// Local capture devices.
#[async_trait]
pub trait MediaHandler: Send + Sync {
    async fn get_user_media_stream(
        &self,
        audio: bool,
        video: bool,
    ) -> Result<Arc<dyn MediaStream>, anyhow::Error>;

    async fn get_screensharing_stream(
        &self,
        opts: ScreenshareOpts,
    ) -> Result<Arc<dyn MediaStream>, anyhow::Error>;

    async fn has_audio_device(&self) -> bool;
    async fn has_video_device(&self) -> bool;

    fn stop_user_media_stream(&self, stream: &Arc<dyn MediaStream>);
    fn stop_screensharing_stream(&self, stream: &Arc<dyn MediaStream>);
    fn stop_all_streams(&self);
}

/// State of a single call, as reported by the single-call layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Fledgling,
    InviteSent,
    Ringing,
    Connecting,
    Connected,
    Ended,
}

/// Why a call was hung up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallHangupReason {
    UserHangup,
    /// Superseded by another call for the same pair of devices.
    Replaced,
    /// The opponent advertised a new session id.
    NewSession,
    SignallingFailed,
    Unknown,
}

/// Events a single call emits after it has been registered with the
/// coordinator.
#[derive(Clone)]
pub enum CallEvent {
    FeedsChanged,
    StateChanged {
        new_state: CallState,
        old_state: CallState,
    },
    Hangup,
    Replaced(Arc<dyn Call>),
}

impl fmt::Debug for CallEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FeedsChanged => write!(f, "FeedsChanged"),
            Self::StateChanged {
                new_state,
                old_state,
            } => write!(f, "StateChanged({old_state:?} -> {new_state:?})"),
            Self::Hangup => write!(f, "Hangup"),
            Self::Replaced(call) => write!(f, "Replaced({})", call.call_id()),
        }
    }
}

/// A single peer-to-peer call, owned by the single-call layer. The
/// coordinator drives it through this interface and subscribes to its
/// events while the call occupies a slot in the call graph.
#[async_trait]
pub trait Call: Send + Sync {
    fn call_id(&self) -> String;
    fn room_id(&self) -> String;
    fn group_call_id(&self) -> Option<GroupCallId>;
    fn state(&self) -> CallState;
    fn hangup_reason(&self) -> Option<CallHangupReason>;
    fn invitee(&self) -> Option<UserId>;

    fn opponent_user_id(&self) -> Option<UserId>;
    fn opponent_device_id(&self) -> Option<DeviceId>;
    fn opponent_session_id(&self) -> Option<SessionId>;

    fn remote_usermedia_feed(&self) -> Option<Arc<CallFeed>>;
    fn remote_screensharing_feed(&self) -> Option<Arc<CallFeed>>;
    fn local_usermedia_feed(&self) -> Option<Arc<CallFeed>>;

    fn is_microphone_muted(&self) -> bool;
    fn is_local_video_muted(&self) -> bool;

    fn subscribe(&self) -> broadcast::Receiver<CallEvent>;

    async fn place_call_with_feeds(
        &self,
        feeds: Vec<Arc<CallFeed>>,
        remote_screensharing: bool,
    ) -> Result<(), SignallingError>;

    async fn answer_with_feeds(&self, feeds: Vec<Arc<CallFeed>>) -> Result<(), SignallingError>;

    async fn reject(&self) -> Result<(), SignallingError>;

    async fn hangup(
        &self,
        reason: CallHangupReason,
        suppress_event: bool,
    ) -> Result<(), SignallingError>;

    async fn set_microphone_muted(&self, muted: bool);
    async fn set_local_video_muted(&self, muted: bool);

    async fn send_metadata_update(&self) -> Result<(), SignallingError>;

    async fn push_local_feed(&self, feed: Arc<CallFeed>);
    async fn remove_local_feed(&self, feed: &Arc<CallFeed>);

    fn create_data_channel(&self, label: &str, options: &DataChannelOptions);
}

/// Addressing for an outbound call.
#[derive(Debug, Clone)]
pub struct CallOpts {
    pub invitee: UserId,
    pub opponent_device_id: DeviceId,
    pub opponent_session_id: SessionId,
    pub group_call_id: GroupCallId,
}

/// Constructs outbound calls. Returns `None` when the single-call layer
/// cannot produce a call for the target (the slot is then abandoned until
/// the next reconciliation pass).
pub trait CallFactory: Send + Sync {
    fn create_call(&self, room_id: &str, opts: CallOpts) -> Option<Arc<dyn Call>>;
}

/// Room membership of a user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Membership {
    Join,
    Invite,
    Leave,
    Ban,
    Knock,
}

#[derive(Debug, Clone)]
pub struct RoomMember {
    pub user_id: UserId,
    pub membership: Membership,
}

/// A state event as read back from the room.
#[derive(Debug, Clone)]
pub struct StateEvent {
    pub state_key: String,
    pub content: Value,
}

/// Read access to the room's replicated state.
pub trait Room: Send + Sync {
    fn room_id(&self) -> String;
    fn get_state_events(&self, event_type: &str) -> Vec<StateEvent>;
    fn get_state_event(&self, event_type: &str, state_key: &str) -> Option<StateEvent>;
    fn get_member(&self, user_id: &UserId) -> Option<RoomMember>;
    /// Fires whenever room state changed and the participant view should be
    /// recomputed.
    fn subscribe_updates(&self) -> broadcast::Receiver<()>;
}

/// The outer client: identity, state event writes and the incoming-call
/// stream.
#[async_trait]
pub trait GroupCallClient: Send + Sync {
    fn user_id(&self) -> UserId;
    fn device_id(&self) -> DeviceId;
    fn session_id(&self) -> SessionId;

    /// Write a state event. `keep_alive` marks the request so it survives a
    /// process teardown (used for the membership removal on leave).
    async fn send_state_event(
        &self,
        room_id: &str,
        event_type: &str,
        content: Value,
        state_key: &str,
        keep_alive: bool,
    ) -> Result<(), anyhow::Error>;

    /// Device ids known to the identity service for our user.
    async fn get_devices(&self) -> Result<Vec<DeviceId>, anyhow::Error>;

    fn subscribe_incoming_calls(&self) -> broadcast::Receiver<Arc<dyn Call>>;

    /// Calls already live on the client when a group call is entered.
    fn active_calls(&self) -> Vec<Arc<dyn Call>>;
}
