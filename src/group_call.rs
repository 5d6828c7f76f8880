//! The group call coordinator: five-state lifecycle, component wiring and
//! domain event emission.

use crate::feed::CallFeed;
use crate::feeds::{FeedRegistry, ACTIVE_SPEAKER_INTERVAL};
use crate::error::GroupCallError;
use crate::handlers::CallHandlerTable;
use crate::participants::ParticipantView;
use crate::reconcile::CALL_RETRY_INTERVAL;
use crate::traits::{
    Call, CallFactory, CallHangupReason, GroupCallClient, MediaHandler, MediaStream, Room,
};
use crate::types::events::{EventBus, GroupCallState, GroupCallStateChanged};
use crate::types::ids::{DeviceId, GroupCallId, UserId};
use crate::types::member::{
    CallIntent, CallType, DataChannelOptions, GroupCallContent, CALL_TERMINATED_REASON,
    EVENT_TYPE_GROUP_CALL,
};
use log::{info, warn};
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;

pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Configuration for a group call, mirroring the group-call state event.
#[derive(Debug, Clone)]
pub struct GroupCallConfig {
    pub group_call_id: GroupCallId,
    pub call_type: CallType,
    pub intent: CallIntent,
    pub is_ptt: bool,
    pub data_channels_enabled: bool,
    pub data_channel_options: Option<DataChannelOptions>,
}

impl GroupCallConfig {
    /// Read the call's configuration from the room's group-call state
    /// event. Returns `None` when the event is absent, malformed, or the
    /// call has already been terminated.
    pub fn from_room_state(room: &dyn Room, group_call_id: &GroupCallId) -> Option<Self> {
        let event = room.get_state_event(EVENT_TYPE_GROUP_CALL, group_call_id.as_str())?;
        let content: GroupCallContent = serde_json::from_value(event.content).ok()?;
        if content.terminated.is_some() {
            return None;
        }
        Some(Self {
            group_call_id: group_call_id.clone(),
            call_type: content.call_type,
            intent: content.intent,
            is_ptt: content.ptt,
            data_channels_enabled: content.data_channels_enabled,
            data_channel_options: content.data_channel_options,
        })
    }
}

/// Background tasks owned by the coordinator. Everything here is aborted
/// on the way out of `Entered`; aborting an already-finished task is a
/// no-op, so double-cancel is safe.
#[derive(Default)]
pub(crate) struct Tasks {
    pub room_updates: Option<JoinHandle<()>>,
    pub incoming_calls: Option<JoinHandle<()>>,
    pub active_speaker: Option<JoinHandle<()>>,
    pub retry: Option<JoinHandle<()>>,
    pub refresh: Option<JoinHandle<()>>,
    pub ptt: Option<JoinHandle<()>>,
    pub participant_expiry: Option<JoinHandle<()>>,
    pub screenshare_ended: Option<JoinHandle<()>>,
}

impl Tasks {
    /// Cancel every task tied to being in the call. The room-update
    /// listener stays; it only dies on `terminate`.
    fn cancel_entered(&mut self) {
        let tasks = [
            self.incoming_calls.take(),
            self.active_speaker.take(),
            self.retry.take(),
            self.refresh.take(),
            self.ptt.take(),
            self.participant_expiry.take(),
            self.screenshare_ended.take(),
        ];
        for task in tasks.into_iter().flatten() {
            task.abort();
        }
    }
}

pub(crate) struct Inner {
    pub feeds: FeedRegistry,
    pub participants: ParticipantView,
    pub call_graph: HashMap<UserId, HashMap<DeviceId, Arc<dyn Call>>>,
    pub handlers: CallHandlerTable,
    pub retry_counts: HashMap<UserId, HashMap<DeviceId, u8>>,
    pub local_usermedia_feed: Option<Arc<CallFeed>>,
    pub local_screenshare_feed: Option<Arc<CallFeed>>,
    pub screenshare_stream: Option<Arc<dyn MediaStream>>,
    pub init_with_audio_muted: bool,
    pub init_with_video_muted: bool,
    pub tasks: Tasks,
}

/// One group call in one room. At most one instance per
/// `(room, group call id)` per process.
///
/// All entry points (public operations, timer ticks, per-call event
/// callbacks) serialize on one lock, so no two of them ever interleave
/// except at their own awaits.
pub struct GroupCall {
    pub(crate) client: Arc<dyn GroupCallClient>,
    pub(crate) room: Arc<dyn Room>,
    pub(crate) media: Arc<dyn MediaHandler>,
    pub(crate) call_factory: Arc<dyn CallFactory>,
    group_call_id: GroupCallId,
    room_id: String,
    call_type: CallType,
    intent: CallIntent,
    pub(crate) is_ptt: bool,
    data_channels_enabled: bool,
    data_channel_options: DataChannelOptions,
    creation_ts: i64,
    pub events: Arc<EventBus>,
    state: RwLock<GroupCallState>,
    entered_via_another_session: AtomicBool,
    pub(crate) inner: Mutex<Inner>,
}

impl GroupCall {
    pub async fn new(
        client: Arc<dyn GroupCallClient>,
        room: Arc<dyn Room>,
        media: Arc<dyn MediaHandler>,
        call_factory: Arc<dyn CallFactory>,
        config: GroupCallConfig,
    ) -> Arc<Self> {
        let events = Arc::new(EventBus::new());
        let this = Arc::new(Self {
            room_id: room.room_id(),
            client,
            room,
            media,
            call_factory,
            group_call_id: config.group_call_id,
            call_type: config.call_type,
            intent: config.intent,
            is_ptt: config.is_ptt,
            data_channels_enabled: config.data_channels_enabled,
            data_channel_options: config.data_channel_options.unwrap_or_default(),
            creation_ts: now_ms(),
            inner: Mutex::new(Inner {
                feeds: FeedRegistry::new(events.clone()),
                participants: ParticipantView::new(),
                call_graph: HashMap::new(),
                handlers: CallHandlerTable::new(),
                retry_counts: HashMap::new(),
                local_usermedia_feed: None,
                local_screenshare_feed: None,
                screenshare_stream: None,
                init_with_audio_muted: false,
                init_with_video_muted: false,
                tasks: Tasks::default(),
            }),
            events,
            state: RwLock::new(GroupCallState::LocalCallFeedUninitialized),
            entered_via_another_session: AtomicBool::new(false),
        });

        // The participant view tracks room state in every lifecycle state.
        let mut updates = this.room.subscribe_updates();
        let weak = Arc::downgrade(&this);
        let listener = tokio::spawn(async move {
            loop {
                match updates.recv().await {
                    Ok(()) => {
                        let Some(group_call) = weak.upgrade() else {
                            break;
                        };
                        group_call.update_participants().await;
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        this.inner.lock().await.tasks.room_updates = Some(listener);
        this.update_participants().await;
        this
    }

    pub fn group_call_id(&self) -> &GroupCallId {
        &self.group_call_id
    }

    pub fn room_id(&self) -> String {
        self.room_id.clone()
    }

    pub fn call_type(&self) -> CallType {
        self.call_type
    }

    pub fn intent(&self) -> CallIntent {
        self.intent
    }

    pub fn is_ptt(&self) -> bool {
        self.is_ptt
    }

    pub fn creation_ts(&self) -> i64 {
        self.creation_ts
    }

    pub(crate) fn data_channels_enabled(&self) -> bool {
        self.data_channels_enabled
    }

    pub(crate) fn data_channel_options(&self) -> &DataChannelOptions {
        &self.data_channel_options
    }

    pub fn state(&self) -> GroupCallState {
        *self.state.read().unwrap()
    }

    pub fn entered_via_another_session(&self) -> bool {
        self.entered_via_another_session.load(Ordering::SeqCst)
    }

    /// Another session of ours entered the call; the participant view
    /// includes our local echo while this is set.
    pub async fn set_entered_via_another_session(self: &Arc<Self>, entered: bool) {
        self.entered_via_another_session
            .store(entered, Ordering::SeqCst);
        self.update_participants().await;
    }

    pub(crate) fn considered_entered(&self) -> bool {
        self.state().is_entered() || self.entered_via_another_session()
    }

    /// Emits `GroupCallStateChanged` on real transitions only.
    pub(crate) fn set_state(&self, new_state: GroupCallState) {
        let old_state = {
            let mut state = self.state.write().unwrap();
            let old = *state;
            if old == new_state {
                return;
            }
            *state = new_state;
            old
        };
        info!(
            target: "GroupCall",
            "Group call {} state {old_state} -> {new_state}",
            self.group_call_id
        );
        let _ = self.events.state_changed.send(Arc::new(GroupCallStateChanged {
            new_state,
            old_state,
        }));
    }

    /// Current participant view snapshot.
    pub async fn participants(&self) -> ParticipantView {
        self.inner.lock().await.participants.clone()
    }

    pub async fn has_local_participant(&self) -> bool {
        let inner = self.inner.lock().await;
        inner
            .participants
            .get(&self.client.user_id())
            .is_some_and(|devices| devices.contains_key(&self.client.device_id()))
    }

    /// Flat snapshot of all calls in the graph.
    pub async fn calls(&self) -> Vec<Arc<dyn Call>> {
        let inner = self.inner.lock().await;
        inner
            .call_graph
            .values()
            .flat_map(|devices| devices.values().cloned())
            .collect()
    }

    pub async fn get_call_by_user_and_device(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
    ) -> Option<Arc<dyn Call>> {
        let inner = self.inner.lock().await;
        inner
            .call_graph
            .get(user_id)
            .and_then(|devices| devices.get(device_id))
            .cloned()
    }

    pub async fn active_speaker(&self) -> Option<Arc<CallFeed>> {
        self.inner.lock().await.feeds.active_speaker()
    }

    pub async fn user_media_feeds(&self) -> Vec<Arc<CallFeed>> {
        self.inner.lock().await.feeds.user_media_feeds().to_vec()
    }

    pub async fn screenshare_feeds(&self) -> Vec<Arc<CallFeed>> {
        self.inner.lock().await.feeds.screenshare_feeds().to_vec()
    }

    pub async fn local_usermedia_feed(&self) -> Option<Arc<CallFeed>> {
        self.inner.lock().await.local_usermedia_feed.clone()
    }

    pub async fn local_screenshare_feed(&self) -> Option<Arc<CallFeed>> {
        self.inner.lock().await.local_screenshare_feed.clone()
    }

    /// Join the call: acquire local media if needed, advertise our device,
    /// and start reconciling the call graph.
    pub async fn enter(self: &Arc<Self>) -> Result<(), GroupCallError> {
        let state = self.state();
        if state == GroupCallState::LocalCallFeedUninitialized {
            self.init_local_call_feed().await?;
        } else if state != GroupCallState::LocalCallFeedInitialized {
            return Err(GroupCallError::InvalidState {
                operation: "enter",
                state: state.name(),
            });
        }

        let mut inner = self.inner.lock().await;
        info!(target: "GroupCall", "Entering group call {}", self.group_call_id);
        self.set_state(GroupCallState::Entered);
        self.publish_member_state_locked(&inner).await?;
        // Adding our local echo changes the view, which runs the first
        // placement pass.
        self.update_participants_locked(&mut inner).await;

        // Admit calls that were already live on the client.
        for call in self.client.active_calls() {
            self.on_incoming_call_locked(&mut inner, call).await;
        }

        self.spawn_entered_tasks(&mut inner);
        Ok(())
    }

    fn spawn_entered_tasks(self: &Arc<Self>, inner: &mut Inner) {
        let weak = Arc::downgrade(self);
        let mut incoming = self.client.subscribe_incoming_calls();
        inner.tasks.incoming_calls = Some(tokio::spawn(async move {
            loop {
                match incoming.recv().await {
                    Ok(call) => {
                        let Some(group_call) = weak.upgrade() else {
                            break;
                        };
                        group_call.on_incoming_call(call).await;
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(target: "GroupCall", "Incoming call listener lagged, missed {missed}");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }));

        let weak = Arc::downgrade(self);
        inner.tasks.active_speaker = Some(tokio::spawn(async move {
            loop {
                tokio::time::sleep(ACTIVE_SPEAKER_INTERVAL).await;
                let Some(group_call) = weak.upgrade() else {
                    break;
                };
                if !group_call.state().is_entered() {
                    break;
                }
                group_call.inner.lock().await.feeds.update_active_speaker();
            }
        }));

        let weak = Arc::downgrade(self);
        inner.tasks.retry = Some(tokio::spawn(async move {
            loop {
                tokio::time::sleep(CALL_RETRY_INTERVAL).await;
                let Some(group_call) = weak.upgrade() else {
                    break;
                };
                if !group_call.state().is_entered() {
                    break;
                }
                group_call.on_retry_tick().await;
            }
        }));

        inner.tasks.refresh = Some(self.spawn_refresh_task());
    }

    /// Leave the call: tear down every call, stop local media, cancel
    /// timers and drop our advertisement. A no-op when already left.
    pub async fn leave(self: &Arc<Self>) {
        let mut inner = self.inner.lock().await;
        if self.state() == GroupCallState::LocalCallFeedUninitialized {
            return;
        }
        let was_entered = self.state().is_entered();
        info!(target: "GroupCall", "Leaving group call {}", self.group_call_id);
        self.dispose_locked(&mut inner).await;
        self.set_state(GroupCallState::LocalCallFeedUninitialized);
        self.update_participants_locked(&mut inner).await;
        if was_entered {
            // Marked keep-alive so it survives a process teardown.
            if let Err(err) = self.remove_member_state_locked(true).await {
                warn!(target: "GroupCall", "Failed to remove member state: {err}");
            }
        }
    }

    /// End the call for this device permanently. With `emit_state_event`,
    /// also mark the group call terminated in room state, preserving the
    /// original event content.
    pub async fn terminate(self: &Arc<Self>, emit_state_event: bool) -> Result<(), GroupCallError> {
        let mut inner = self.inner.lock().await;
        if self.state().is_ended() {
            return Ok(());
        }
        let was_entered = self.state().is_entered();
        info!(target: "GroupCall", "Terminating group call {}", self.group_call_id);
        self.dispose_locked(&mut inner).await;
        if let Some(task) = inner.tasks.room_updates.take() {
            task.abort();
        }
        self.set_state(GroupCallState::Ended);
        if was_entered {
            if let Err(err) = self.remove_member_state_locked(false).await {
                warn!(target: "GroupCall", "Failed to remove member state: {err}");
            }
        }

        if emit_state_event {
            let mut content = self
                .room
                .get_state_event(EVENT_TYPE_GROUP_CALL, self.group_call_id.as_str())
                .map(|event| event.content)
                .unwrap_or_else(|| json!({}));
            if let Some(fields) = content.as_object_mut() {
                fields.insert("m.terminated".to_string(), json!(CALL_TERMINATED_REASON));
            }
            self.client
                .send_state_event(
                    &self.room_id,
                    EVENT_TYPE_GROUP_CALL,
                    content,
                    self.group_call_id.as_str(),
                    false,
                )
                .await
                .map_err(GroupCallError::Signalling)?;
        }
        Ok(())
    }

    /// Tear down calls, media and timers. Idempotent.
    pub(crate) async fn dispose_locked(&self, inner: &mut Inner) {
        inner.tasks.cancel_entered();

        let calls: Vec<Arc<dyn Call>> = inner
            .call_graph
            .values()
            .flat_map(|devices| devices.values().cloned())
            .collect();
        let mut guards = Vec::with_capacity(calls.len());
        for call in &calls {
            guards.push(
                self.dispose_call_locked(inner, call, CallHangupReason::UserHangup)
                    .await,
            );
        }
        inner.call_graph.clear();
        inner.retry_counts.clear();
        if !calls.is_empty() {
            self.emit_calls_changed(inner);
        }
        drop(guards);

        inner.screenshare_stream = None;
        inner.local_screenshare_feed = None;
        inner.local_usermedia_feed = None;
        self.media.stop_all_streams();
        inner.feeds.dispose_all();
    }
}
