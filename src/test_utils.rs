//! Mock collaborators for tests.

use crate::error::SignallingError;
use crate::feed::CallFeed;
use crate::group_call::{GroupCall, GroupCallConfig};
use crate::traits::{
    Call, CallEvent, CallFactory, CallHangupReason, CallOpts, CallState, GroupCallClient,
    MediaHandler, MediaStream, Membership, Room, RoomMember, ScreenshareOpts, StateEvent,
};
use crate::types::ids::{DeviceId, GroupCallId, SessionId, UserId};
use crate::types::member::{CallIntent, CallType, DataChannelOptions};
use anyhow::anyhow;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, Notify};

#[derive(Debug)]
pub struct MockStream {
    has_audio: bool,
    has_video: bool,
    audio_enabled: AtomicBool,
    video_enabled: AtomicBool,
    source_id: Option<String>,
    ended_tx: broadcast::Sender<()>,
}

impl MockStream {
    pub fn new(has_audio: bool, has_video: bool, source_id: Option<String>) -> Arc<Self> {
        Arc::new(Self {
            has_audio,
            has_video,
            audio_enabled: AtomicBool::new(true),
            video_enabled: AtomicBool::new(true),
            source_id,
            ended_tx: broadcast::channel(4).0,
        })
    }

    pub fn audio_only() -> Arc<dyn MediaStream> {
        Self::new(true, false, None)
    }

    pub fn audio_video() -> Arc<dyn MediaStream> {
        Self::new(true, true, None)
    }

    pub fn screen() -> Arc<Self> {
        Self::new(false, true, Some("screen:0".to_string()))
    }

    /// Simulate the user ending the capture from the system UI.
    pub fn fire_ended(&self) {
        let _ = self.ended_tx.send(());
    }
}

impl MediaStream for MockStream {
    fn has_audio(&self) -> bool {
        self.has_audio
    }

    fn has_video(&self) -> bool {
        self.has_video
    }

    fn set_audio_enabled(&self, enabled: bool) {
        self.audio_enabled.store(enabled, Ordering::SeqCst);
    }

    fn set_video_enabled(&self, enabled: bool) {
        self.video_enabled.store(enabled, Ordering::SeqCst);
    }

    fn audio_enabled(&self) -> bool {
        self.audio_enabled.load(Ordering::SeqCst)
    }

    fn video_enabled(&self) -> bool {
        self.video_enabled.load(Ordering::SeqCst)
    }

    fn source_id(&self) -> Option<String> {
        self.source_id.clone()
    }

    fn subscribe_ended(&self) -> broadcast::Receiver<()> {
        self.ended_tx.subscribe()
    }
}

#[derive(Default)]
pub struct MockMediaHandler {
    pub has_audio_device: AtomicBool,
    pub has_video_device: AtomicBool,
    pub fail_user_media: AtomicBool,
    pub fail_screenshare: AtomicBool,
    /// When set, user-media acquisition blocks until notified.
    pub user_media_gate: Mutex<Option<Arc<Notify>>>,
    pub user_media_requests: AtomicUsize,
    pub stopped_user_media: Mutex<Vec<Arc<dyn MediaStream>>>,
    pub stopped_screenshare: Mutex<Vec<Arc<dyn MediaStream>>>,
    pub stop_all_calls: AtomicUsize,
    pub created_screenshare: Mutex<Vec<Arc<MockStream>>>,
}

impl MockMediaHandler {
    pub fn new() -> Arc<Self> {
        let handler = Self::default();
        handler.has_audio_device.store(true, Ordering::SeqCst);
        handler.has_video_device.store(true, Ordering::SeqCst);
        Arc::new(handler)
    }

    pub fn gate_user_media(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.user_media_gate.lock().unwrap() = Some(gate.clone());
        gate
    }
}

#[async_trait]
impl MediaHandler for MockMediaHandler {
    async fn get_user_media_stream(
        &self,
        audio: bool,
        video: bool,
    ) -> Result<Arc<dyn MediaStream>, anyhow::Error> {
        self.user_media_requests.fetch_add(1, Ordering::SeqCst);
        let gate = self.user_media_gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        if self.fail_user_media.load(Ordering::SeqCst) {
            return Err(anyhow!("user media unavailable"));
        }
        Ok(MockStream::new(audio, video, None))
    }

    async fn get_screensharing_stream(
        &self,
        opts: ScreenshareOpts,
    ) -> Result<Arc<dyn MediaStream>, anyhow::Error> {
        if self.fail_screenshare.load(Ordering::SeqCst) {
            return Err(anyhow!("screen capture unavailable"));
        }
        let source_id = opts
            .desktop_capturer_source_id
            .or_else(|| Some("screen:0".to_string()));
        let stream = MockStream::new(opts.audio, true, source_id);
        self.created_screenshare.lock().unwrap().push(stream.clone());
        Ok(stream)
    }

    async fn has_audio_device(&self) -> bool {
        self.has_audio_device.load(Ordering::SeqCst)
    }

    async fn has_video_device(&self) -> bool {
        self.has_video_device.load(Ordering::SeqCst)
    }

    fn stop_user_media_stream(&self, stream: &Arc<dyn MediaStream>) {
        self.stopped_user_media.lock().unwrap().push(stream.clone());
    }

    fn stop_screensharing_stream(&self, stream: &Arc<dyn MediaStream>) {
        self.stopped_screenshare
            .lock()
            .unwrap()
            .push(stream.clone());
    }

    fn stop_all_streams(&self) {
        self.stop_all_calls.fetch_add(1, Ordering::SeqCst);
    }
}

pub struct MockRoom {
    room_id: String,
    state: Mutex<HashMap<(String, String), Value>>,
    members: Mutex<HashMap<UserId, Membership>>,
    update_tx: broadcast::Sender<()>,
}

impl MockRoom {
    pub fn new(room_id: &str) -> Arc<Self> {
        Arc::new(Self {
            room_id: room_id.to_string(),
            state: Mutex::new(HashMap::new()),
            members: Mutex::new(HashMap::new()),
            update_tx: broadcast::channel(64).0,
        })
    }

    pub fn join(&self, user_id: &UserId) {
        self.set_membership(user_id, Membership::Join);
    }

    pub fn set_membership(&self, user_id: &UserId, membership: Membership) {
        self.members
            .lock()
            .unwrap()
            .insert(user_id.clone(), membership);
        let _ = self.update_tx.send(());
    }

    pub fn set_state_event(&self, event_type: &str, state_key: &str, content: Value) {
        self.state
            .lock()
            .unwrap()
            .insert((event_type.to_string(), state_key.to_string()), content);
        let _ = self.update_tx.send(());
    }

    /// Shorthand for a member-state event keyed by the user.
    pub fn set_member_state(&self, user_id: &str, content: Value) {
        self.set_state_event(
            crate::types::member::EVENT_TYPE_GROUP_CALL_MEMBER,
            user_id,
            content,
        );
    }
}

impl Room for MockRoom {
    fn room_id(&self) -> String {
        self.room_id.clone()
    }

    fn get_state_events(&self, event_type: &str) -> Vec<StateEvent> {
        let state = self.state.lock().unwrap();
        let mut events: Vec<StateEvent> = state
            .iter()
            .filter(|((t, _), _)| t == event_type)
            .map(|((_, key), content)| StateEvent {
                state_key: key.clone(),
                content: content.clone(),
            })
            .collect();
        events.sort_by(|a, b| a.state_key.cmp(&b.state_key));
        events
    }

    fn get_state_event(&self, event_type: &str, state_key: &str) -> Option<StateEvent> {
        self.state
            .lock()
            .unwrap()
            .get(&(event_type.to_string(), state_key.to_string()))
            .map(|content| StateEvent {
                state_key: state_key.to_string(),
                content: content.clone(),
            })
    }

    fn get_member(&self, user_id: &UserId) -> Option<RoomMember> {
        self.members
            .lock()
            .unwrap()
            .get(user_id)
            .map(|membership| RoomMember {
                user_id: user_id.clone(),
                membership: *membership,
            })
    }

    fn subscribe_updates(&self) -> broadcast::Receiver<()> {
        self.update_tx.subscribe()
    }
}

#[derive(Debug, Clone)]
pub struct SentStateEvent {
    pub room_id: String,
    pub event_type: String,
    pub content: Value,
    pub state_key: String,
    pub keep_alive: bool,
}

pub struct MockClient {
    user_id: UserId,
    device_id: DeviceId,
    session_id: SessionId,
    pub devices: Mutex<Vec<DeviceId>>,
    pub sent: Mutex<Vec<SentStateEvent>>,
    pub fail_sends: AtomicBool,
    /// When set, state event writes are applied to this room so they can
    /// be read back.
    room: Mutex<Option<Arc<MockRoom>>>,
    incoming_tx: broadcast::Sender<Arc<dyn Call>>,
    pub active: Mutex<Vec<Arc<dyn Call>>>,
}

impl MockClient {
    pub fn new(user_id: &str, device_id: &str, session_id: &str) -> Arc<Self> {
        Arc::new(Self {
            user_id: UserId::new(user_id),
            device_id: DeviceId::new(device_id),
            session_id: SessionId::new(session_id),
            devices: Mutex::new(vec![DeviceId::new(device_id)]),
            sent: Mutex::new(Vec::new()),
            fail_sends: AtomicBool::new(false),
            room: Mutex::new(None),
            incoming_tx: broadcast::channel(16).0,
            active: Mutex::new(Vec::new()),
        })
    }

    pub fn attach_room(&self, room: Arc<MockRoom>) {
        *self.room.lock().unwrap() = Some(room);
    }

    pub fn deliver_incoming_call(&self, call: Arc<dyn Call>) {
        let _ = self.incoming_tx.send(call);
    }

    pub fn sent_events(&self) -> Vec<SentStateEvent> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl GroupCallClient for MockClient {
    fn user_id(&self) -> UserId {
        self.user_id.clone()
    }

    fn device_id(&self) -> DeviceId {
        self.device_id.clone()
    }

    fn session_id(&self) -> SessionId {
        self.session_id.clone()
    }

    async fn send_state_event(
        &self,
        room_id: &str,
        event_type: &str,
        content: Value,
        state_key: &str,
        keep_alive: bool,
    ) -> Result<(), anyhow::Error> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(anyhow!("state event rejected"));
        }
        self.sent.lock().unwrap().push(SentStateEvent {
            room_id: room_id.to_string(),
            event_type: event_type.to_string(),
            content: content.clone(),
            state_key: state_key.to_string(),
            keep_alive,
        });
        let room = self.room.lock().unwrap().clone();
        if let Some(room) = room {
            room.set_state_event(event_type, state_key, content);
        }
        Ok(())
    }

    async fn get_devices(&self) -> Result<Vec<DeviceId>, anyhow::Error> {
        Ok(self.devices.lock().unwrap().clone())
    }

    fn subscribe_incoming_calls(&self) -> broadcast::Receiver<Arc<dyn Call>> {
        self.incoming_tx.subscribe()
    }

    fn active_calls(&self) -> Vec<Arc<dyn Call>> {
        self.active.lock().unwrap().clone()
    }
}

pub struct MockCall {
    pub call_id: String,
    room_id: String,
    group_call_id: Option<GroupCallId>,
    invitee: Option<UserId>,
    opponent_user_id: Option<UserId>,
    opponent_device_id: Option<DeviceId>,
    opponent_session_id: Option<SessionId>,
    state: Mutex<CallState>,
    hangup_reason: Mutex<Option<CallHangupReason>>,
    events_tx: broadcast::Sender<CallEvent>,
    pub fail_placement: AtomicBool,
    pub fail_placement_unknown_device: AtomicBool,
    pub placements: Mutex<Vec<(Vec<Arc<CallFeed>>, bool)>>,
    pub answers: Mutex<Vec<Vec<Arc<CallFeed>>>>,
    pub rejected: AtomicBool,
    pub hangups: Mutex<Vec<(CallHangupReason, bool)>>,
    pub mic_muted: AtomicBool,
    pub video_muted: AtomicBool,
    pub metadata_updates: AtomicUsize,
    pub pushed_feeds: Mutex<Vec<Arc<CallFeed>>>,
    pub removed_feeds: Mutex<Vec<Arc<CallFeed>>>,
    pub data_channels: Mutex<Vec<(String, DataChannelOptions)>>,
    pub remote_usermedia: Mutex<Option<Arc<CallFeed>>>,
    pub remote_screenshare: Mutex<Option<Arc<CallFeed>>>,
    local_usermedia: Mutex<Option<Arc<CallFeed>>>,
}

impl MockCall {
    pub fn new(
        call_id: &str,
        room_id: &str,
        group_call_id: Option<&str>,
        opponent_user_id: Option<&str>,
        opponent_device_id: Option<&str>,
        opponent_session_id: Option<&str>,
    ) -> Arc<Self> {
        Arc::new(Self {
            call_id: call_id.to_string(),
            room_id: room_id.to_string(),
            group_call_id: group_call_id.map(GroupCallId::new),
            invitee: opponent_user_id.map(UserId::new),
            opponent_user_id: opponent_user_id.map(UserId::new),
            opponent_device_id: opponent_device_id.map(DeviceId::new),
            opponent_session_id: opponent_session_id.map(SessionId::new),
            state: Mutex::new(CallState::Ringing),
            hangup_reason: Mutex::new(None),
            events_tx: broadcast::channel(32).0,
            fail_placement: AtomicBool::new(false),
            fail_placement_unknown_device: AtomicBool::new(false),
            placements: Mutex::new(Vec::new()),
            answers: Mutex::new(Vec::new()),
            rejected: AtomicBool::new(false),
            hangups: Mutex::new(Vec::new()),
            mic_muted: AtomicBool::new(false),
            video_muted: AtomicBool::new(false),
            metadata_updates: AtomicUsize::new(0),
            pushed_feeds: Mutex::new(Vec::new()),
            removed_feeds: Mutex::new(Vec::new()),
            data_channels: Mutex::new(Vec::new()),
            remote_usermedia: Mutex::new(None),
            remote_screenshare: Mutex::new(None),
            local_usermedia: Mutex::new(None),
        })
    }

    pub fn set_call_state(&self, new_state: CallState) {
        *self.state.lock().unwrap() = new_state;
    }

    pub fn emit_state(&self, new_state: CallState) {
        let old_state = {
            let mut state = self.state.lock().unwrap();
            let old = *state;
            *state = new_state;
            old
        };
        let _ = self.events_tx.send(CallEvent::StateChanged {
            new_state,
            old_state,
        });
    }

    pub fn emit_hangup(&self, reason: CallHangupReason) {
        *self.state.lock().unwrap() = CallState::Ended;
        *self.hangup_reason.lock().unwrap() = Some(reason);
        let _ = self.events_tx.send(CallEvent::Hangup);
    }

    pub fn emit_replaced(&self, new_call: Arc<dyn Call>) {
        *self.hangup_reason.lock().unwrap() = Some(CallHangupReason::Replaced);
        let _ = self.events_tx.send(CallEvent::Replaced(new_call));
    }

    pub fn set_remote_usermedia_feed(&self, feed: Option<Arc<CallFeed>>) {
        *self.remote_usermedia.lock().unwrap() = feed;
        let _ = self.events_tx.send(CallEvent::FeedsChanged);
    }

    pub fn set_remote_screensharing_feed(&self, feed: Option<Arc<CallFeed>>) {
        *self.remote_screenshare.lock().unwrap() = feed;
        let _ = self.events_tx.send(CallEvent::FeedsChanged);
    }

    pub fn placement_count(&self) -> usize {
        self.placements.lock().unwrap().len()
    }
}

#[async_trait]
impl Call for MockCall {
    fn call_id(&self) -> String {
        self.call_id.clone()
    }

    fn room_id(&self) -> String {
        self.room_id.clone()
    }

    fn group_call_id(&self) -> Option<GroupCallId> {
        self.group_call_id.clone()
    }

    fn state(&self) -> CallState {
        *self.state.lock().unwrap()
    }

    fn hangup_reason(&self) -> Option<CallHangupReason> {
        *self.hangup_reason.lock().unwrap()
    }

    fn invitee(&self) -> Option<UserId> {
        self.invitee.clone()
    }

    fn opponent_user_id(&self) -> Option<UserId> {
        self.opponent_user_id.clone()
    }

    fn opponent_device_id(&self) -> Option<DeviceId> {
        self.opponent_device_id.clone()
    }

    fn opponent_session_id(&self) -> Option<SessionId> {
        self.opponent_session_id.clone()
    }

    fn remote_usermedia_feed(&self) -> Option<Arc<CallFeed>> {
        self.remote_usermedia.lock().unwrap().clone()
    }

    fn remote_screensharing_feed(&self) -> Option<Arc<CallFeed>> {
        self.remote_screenshare.lock().unwrap().clone()
    }

    fn local_usermedia_feed(&self) -> Option<Arc<CallFeed>> {
        self.local_usermedia.lock().unwrap().clone()
    }

    fn is_microphone_muted(&self) -> bool {
        self.mic_muted.load(Ordering::SeqCst)
    }

    fn is_local_video_muted(&self) -> bool {
        self.video_muted.load(Ordering::SeqCst)
    }

    fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.events_tx.subscribe()
    }

    async fn place_call_with_feeds(
        &self,
        feeds: Vec<Arc<CallFeed>>,
        remote_screensharing: bool,
    ) -> Result<(), SignallingError> {
        if let Some(feed) = feeds
            .iter()
            .find(|f| f.purpose() == crate::types::member::FeedPurpose::Usermedia)
        {
            *self.local_usermedia.lock().unwrap() = Some(feed.clone());
        }
        self.placements
            .lock()
            .unwrap()
            .push((feeds, remote_screensharing));
        if self.fail_placement_unknown_device.load(Ordering::SeqCst) {
            return Err(SignallingError::UnknownDevice(format!(
                "no such device for call {}",
                self.call_id
            )));
        }
        if self.fail_placement.load(Ordering::SeqCst) {
            return Err(SignallingError::Other(anyhow!("invite send failed")));
        }
        *self.state.lock().unwrap() = CallState::InviteSent;
        Ok(())
    }

    async fn answer_with_feeds(&self, feeds: Vec<Arc<CallFeed>>) -> Result<(), SignallingError> {
        if let Some(feed) = feeds
            .iter()
            .find(|f| f.purpose() == crate::types::member::FeedPurpose::Usermedia)
        {
            *self.local_usermedia.lock().unwrap() = Some(feed.clone());
        }
        self.answers.lock().unwrap().push(feeds);
        *self.state.lock().unwrap() = CallState::Connecting;
        Ok(())
    }

    async fn reject(&self) -> Result<(), SignallingError> {
        self.rejected.store(true, Ordering::SeqCst);
        *self.state.lock().unwrap() = CallState::Ended;
        Ok(())
    }

    async fn hangup(
        &self,
        reason: CallHangupReason,
        suppress_event: bool,
    ) -> Result<(), SignallingError> {
        self.hangups.lock().unwrap().push((reason, suppress_event));
        *self.state.lock().unwrap() = CallState::Ended;
        *self.hangup_reason.lock().unwrap() = Some(reason);
        Ok(())
    }

    async fn set_microphone_muted(&self, muted: bool) {
        self.mic_muted.store(muted, Ordering::SeqCst);
    }

    async fn set_local_video_muted(&self, muted: bool) {
        self.video_muted.store(muted, Ordering::SeqCst);
    }

    async fn send_metadata_update(&self) -> Result<(), SignallingError> {
        self.metadata_updates.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn push_local_feed(&self, feed: Arc<CallFeed>) {
        self.pushed_feeds.lock().unwrap().push(feed);
    }

    async fn remove_local_feed(&self, feed: &Arc<CallFeed>) {
        self.removed_feeds.lock().unwrap().push(feed.clone());
    }

    fn create_data_channel(&self, label: &str, options: &DataChannelOptions) {
        self.data_channels
            .lock()
            .unwrap()
            .push((label.to_string(), options.clone()));
    }
}

#[derive(Default)]
pub struct MockCallFactory {
    pub created: Mutex<Vec<Arc<MockCall>>>,
    /// Return `None` from `create_call` this many times.
    pub fail_next_creations: AtomicUsize,
    /// Every created call fails placement with a generic error.
    pub fail_all_placements: AtomicBool,
    /// Created calls fail placement with `UnknownDevice`, consumed FIFO.
    pub unknown_device_failures: Mutex<VecDeque<()>>,
    next_id: AtomicUsize,
}

impl MockCallFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn created_calls(&self) -> Vec<Arc<MockCall>> {
        self.created.lock().unwrap().clone()
    }

    pub fn last_created(&self) -> Option<Arc<MockCall>> {
        self.created.lock().unwrap().last().cloned()
    }
}

impl CallFactory for MockCallFactory {
    fn create_call(&self, room_id: &str, opts: CallOpts) -> Option<Arc<dyn Call>> {
        let remaining = self.fail_next_creations.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_next_creations
                .store(remaining - 1, Ordering::SeqCst);
            return None;
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let call = MockCall::new(
            &format!("call-{id}"),
            room_id,
            Some(opts.group_call_id.as_str()),
            Some(opts.invitee.as_str()),
            Some(opts.opponent_device_id.as_str()),
            Some(opts.opponent_session_id.as_str()),
        );
        call.set_call_state(CallState::Fledgling);
        if self.fail_all_placements.load(Ordering::SeqCst) {
            call.fail_placement.store(true, Ordering::SeqCst);
        }
        if self
            .unknown_device_failures
            .lock()
            .unwrap()
            .pop_front()
            .is_some()
        {
            call.fail_placement_unknown_device
                .store(true, Ordering::SeqCst);
        }
        self.created.lock().unwrap().push(call.clone());
        Some(call)
    }
}

/// Everything a test needs to drive a group call.
pub struct TestContext {
    pub client: Arc<MockClient>,
    pub room: Arc<MockRoom>,
    pub media: Arc<MockMediaHandler>,
    pub factory: Arc<MockCallFactory>,
    pub group_call: Arc<GroupCall>,
}

pub fn default_test_config() -> GroupCallConfig {
    GroupCallConfig {
        group_call_id: GroupCallId::new("G"),
        call_type: CallType::Voice,
        intent: CallIntent::Room,
        is_ptt: false,
        data_channels_enabled: false,
        data_channel_options: None,
    }
}

pub async fn create_test_group_call() -> TestContext {
    create_test_group_call_as("@local:h", "LOCALDEV", |_| {}).await
}

pub async fn create_test_group_call_as(
    user_id: &str,
    device_id: &str,
    configure: impl FnOnce(&mut GroupCallConfig),
) -> TestContext {
    let client = MockClient::new(user_id, device_id, "local-session");
    let room = MockRoom::new("!room:h");
    client.attach_room(room.clone());
    room.join(&UserId::new(user_id));
    let media = MockMediaHandler::new();
    let factory = MockCallFactory::new();
    let mut config = default_test_config();
    configure(&mut config);
    let group_call = GroupCall::new(
        client.clone(),
        room.clone(),
        media.clone(),
        factory.clone(),
        config,
    )
    .await;
    TestContext {
        client,
        room,
        media,
        factory,
        group_call,
    }
}
