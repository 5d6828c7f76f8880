//! Typed event bus for group-call observers.
//!
//! One broadcast channel per event type; payloads are `Arc`s so fan-out is
//! cheap. Every emission happens between awaits on the coordinator's op
//! lock, so observers always see mutation and notification in order.

use crate::error::GroupCallErrorCode;
use crate::feed::CallFeed;
use crate::participants::ParticipantView;
use crate::traits::Call;
use std::sync::Arc;
use tokio::sync::broadcast;

// The size of the broadcast channel buffer.
const CHANNEL_CAPACITY: usize = 100;

// Macro to generate EventBus fields and constructor
macro_rules! define_event_bus {
    ($(($field:ident, $type:ty)),* $(,)?) => {
        /// Typed event bus with a separate broadcast channel per event.
        pub struct EventBus {
            $(
                pub $field: broadcast::Sender<$type>,
            )*
        }

        impl EventBus {
            pub fn new() -> Self {
                Self {
                    $(
                        $field: broadcast::channel(CHANNEL_CAPACITY).0,
                    )*
                }
            }
        }
    };
}

define_event_bus! {
    (state_changed, Arc<GroupCallStateChanged>),
    (participants_changed, Arc<ParticipantsChanged>),
    (calls_changed, Arc<CallsChanged>),
    (user_media_feeds_changed, Arc<FeedsChangedEvent>),
    (screenshare_feeds_changed, Arc<FeedsChangedEvent>),
    (active_speaker_changed, Arc<ActiveSpeakerChanged>),
    (local_mute_state_changed, Arc<LocalMuteStateChanged>),
    (local_screenshare_state_changed, Arc<LocalScreenshareStateChanged>),
    (error, Arc<GroupCallErrorEvent>),
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Lifecycle of a group call on this device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupCallState {
    LocalCallFeedUninitialized,
    InitializingLocalCallFeed,
    LocalCallFeedInitialized,
    Entered,
    Ended,
}

impl GroupCallState {
    pub fn is_entered(&self) -> bool {
        matches!(self, Self::Entered)
    }

    pub fn is_ended(&self) -> bool {
        matches!(self, Self::Ended)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::LocalCallFeedUninitialized => "local_call_feed_uninitialized",
            Self::InitializingLocalCallFeed => "initializing_local_call_feed",
            Self::LocalCallFeedInitialized => "local_call_feed_initialized",
            Self::Entered => "entered",
            Self::Ended => "ended",
        }
    }
}

impl std::fmt::Display for GroupCallState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone)]
pub struct GroupCallStateChanged {
    pub new_state: GroupCallState,
    pub old_state: GroupCallState,
}

#[derive(Debug, Clone)]
pub struct ParticipantsChanged {
    pub participants: ParticipantView,
}

/// Emitted once per committed reconciliation pass that changed the graph.
#[derive(Clone)]
pub struct CallsChanged {
    pub calls: Vec<Arc<dyn Call>>,
}

impl std::fmt::Debug for CallsChanged {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallsChanged")
            .field("calls", &self.calls.len())
            .finish()
    }
}

/// Carries the full feed sequence after any mutation.
#[derive(Debug, Clone)]
pub struct FeedsChangedEvent {
    pub feeds: Vec<Arc<CallFeed>>,
}

#[derive(Debug, Clone)]
pub struct ActiveSpeakerChanged {
    pub active_speaker: Option<Arc<CallFeed>>,
}

#[derive(Debug, Clone, Copy)]
pub struct LocalMuteStateChanged {
    pub audio_muted: bool,
    pub video_muted: bool,
}

#[derive(Debug, Clone)]
pub struct LocalScreenshareStateChanged {
    pub enabled: bool,
    pub feed: Option<Arc<CallFeed>>,
    pub source_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct GroupCallErrorEvent {
    pub code: GroupCallErrorCode,
    pub message: String,
}
