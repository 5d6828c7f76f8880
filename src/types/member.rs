//! Wire schemas for the group-call room state events.
//!
//! Two reserved state event types are read and written:
//!
//! - [`EVENT_TYPE_GROUP_CALL`], state key = the group call id, carrying the
//!   call configuration and (on termination) `"m.terminated"`.
//! - [`EVENT_TYPE_GROUP_CALL_MEMBER`], state key = a user id, carrying that
//!   user's per-call device advertisements under `"m.calls"`.
//!
//! A member-state event may hold entries for several concurrent calls. Only
//! the entry whose `m.call_id` matches ours is ever rewritten; all other
//! entries round-trip as raw JSON so foreign fields survive untouched.

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const EVENT_TYPE_GROUP_CALL: &str = "org.matrix.msc3401.call";
pub const EVENT_TYPE_GROUP_CALL_MEMBER: &str = "org.matrix.msc3401.call.member";

/// How long a device advertisement stays valid, in milliseconds.
pub const DEVICE_TIMEOUT_MS: i64 = 3_600_000;

/// What a feed carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FeedPurpose {
    #[serde(rename = "m.usermedia")]
    Usermedia,
    #[serde(rename = "m.screenshare")]
    Screenshare,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedEntry {
    pub purpose: FeedPurpose,
}

/// One device's presence advertisement inside a member-state event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceAdvertisement {
    pub device_id: String,
    pub session_id: String,
    /// Absolute expiry, milliseconds since the epoch.
    pub expires_ts: i64,
    pub feeds: Vec<FeedEntry>,
}

impl DeviceAdvertisement {
    /// Structurally validate a raw device entry: the four fields must be
    /// present with the right types, the advertisement must not have
    /// expired, and `feeds` must be an array. Anything else is discarded
    /// by the caller.
    pub fn parse_valid(raw: &Value, now_ms: i64) -> Option<Self> {
        let obj = raw.as_object()?;
        let device_id = obj.get("device_id")?.as_str()?.to_owned();
        let session_id = obj.get("session_id")?.as_str()?.to_owned();
        let expires_ts = obj.get("expires_ts")?.as_i64()?;
        if expires_ts <= now_ms {
            return None;
        }
        let feeds = obj
            .get("feeds")?
            .as_array()?
            .iter()
            // Entries with an unknown purpose are skipped, not fatal.
            .filter_map(|f| serde_json::from_value::<FeedEntry>(f.clone()).ok())
            .collect();
        Some(Self {
            device_id,
            session_id,
            expires_ts,
            feeds,
        })
    }

    pub fn is_screensharing(&self) -> bool {
        self.feeds
            .iter()
            .any(|f| f.purpose == FeedPurpose::Screenshare)
    }
}

/// Content of a member-state event. Entries are kept raw; see module docs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemberCallsContent {
    #[serde(rename = "m.calls", default)]
    pub calls: Vec<Value>,
}

impl MemberCallsContent {
    /// The `m.call_id` of a raw entry, if it has one.
    pub fn entry_call_id(entry: &Value) -> Option<&str> {
        entry.get("m.call_id")?.as_str()
    }

    /// Split into (our entry, all other entries in order) for the given id.
    pub fn partition(self, call_id: &str) -> (Option<Value>, Vec<Value>) {
        let mut ours = None;
        let mut others = Vec::new();
        for entry in self.calls {
            if ours.is_none() && Self::entry_call_id(&entry) == Some(call_id) {
                ours = Some(entry);
            } else {
                others.push(entry);
            }
        }
        (ours, others)
    }
}

/// Type of a group call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallType {
    #[serde(rename = "m.voice")]
    Voice,
    #[serde(rename = "m.video")]
    Video,
}

/// How clients should surface the call to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallIntent {
    #[serde(rename = "m.ring")]
    Ring,
    #[serde(rename = "m.prompt")]
    Prompt,
    #[serde(rename = "m.room")]
    Room,
}

/// Options for per-call data channels, forwarded verbatim to the
/// single-call layer when data channels are enabled.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataChannelOptions {
    pub ordered: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_packet_life_time: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_retransmits: Option<u16>,
    #[serde(default)]
    pub protocol: String,
}

/// Content of the group-call state event itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupCallContent {
    #[serde(rename = "m.intent")]
    pub intent: CallIntent,
    #[serde(rename = "m.type")]
    pub call_type: CallType,
    #[serde(rename = "io.element.ptt", default)]
    pub ptt: bool,
    #[serde(rename = "dataChannelsEnabled", default)]
    pub data_channels_enabled: bool,
    #[serde(rename = "dataChannelOptions", skip_serializing_if = "Option::is_none")]
    pub data_channel_options: Option<DataChannelOptions>,
    #[serde(rename = "m.terminated", skip_serializing_if = "Option::is_none")]
    pub terminated: Option<String>,
}

/// Value written under `"m.terminated"` when a call is ended for the room.
pub const CALL_TERMINATED_REASON: &str = "call_ended";
