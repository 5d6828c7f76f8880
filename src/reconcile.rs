//! Call-graph reconciliation: decides, for every participant, whether to
//! place, keep, replace or drop the outbound call, merges inbound calls,
//! and retries failed placements.
//!
//! The reconciler is the single owner of the call graph. Every pass runs
//! under the coordinator op lock, so graph mutation and the single
//! `CallsChanged` emission are atomic with respect to all other callbacks.

use crate::error::{GroupCallErrorCode, SignallingError};
use crate::feed::CallFeed;
use crate::group_call::{GroupCall, Inner};
use crate::handlers::CallListenerGuard;
use crate::traits::{Call, CallEvent, CallHangupReason, CallOpts, CallState};
use crate::types::events::{CallsChanged, GroupCallErrorEvent};
use crate::types::ids::{DeviceId, UserId};
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

/// How often failed placements are retried while entered.
pub const CALL_RETRY_INTERVAL: Duration = Duration::from_millis(5000);

/// Per-slot cap on retry attempts. Reset when the call connects.
pub const MAX_CALL_RETRIES: u8 = 3;

/// The directionality rule: the local side places the call iff the remote
/// `(user_id, device_id)` pair sorts strictly greater than ours. Total and
/// antisymmetric over distinct pairs, so exactly one side originates.
pub(crate) fn wants_outgoing_call(
    local_user: &UserId,
    local_device: &DeviceId,
    remote_user: &UserId,
    remote_device: &DeviceId,
) -> bool {
    remote_user.as_str() > local_user.as_str()
        || (remote_user == local_user && remote_device.as_str() > local_device.as_str())
}

fn remove_slot(inner: &mut Inner, user_id: &UserId, device_id: &DeviceId) {
    if let Some(devices) = inner.call_graph.get_mut(user_id) {
        devices.remove(device_id);
        if devices.is_empty() {
            inner.call_graph.remove(user_id);
        }
    }
}

fn slot_holds(inner: &Inner, user_id: &UserId, device_id: &DeviceId, call: &Arc<dyn Call>) -> bool {
    inner
        .call_graph
        .get(user_id)
        .and_then(|devices| devices.get(device_id))
        .is_some_and(|occupant| Arc::ptr_eq(occupant, call))
}

impl GroupCall {
    /// Walk the participant view and bring the outgoing half of the call
    /// graph in line with it. Idempotent; emits one `CallsChanged` iff any
    /// slot was added, replaced or removed.
    pub(crate) async fn place_outgoing_calls_locked(self: &Arc<Self>, inner: &mut Inner) {
        let local_user = self.client.user_id();
        let local_device = self.client.device_id();
        let mut changed = false;

        let participants = inner.participants.clone();
        for (member, devices) in &participants {
            for (device_id, participant) in devices {
                if *member == local_user && *device_id == local_device {
                    continue;
                }
                if !wants_outgoing_call(&local_user, &local_device, member, device_id) {
                    continue;
                }

                let existing = inner
                    .call_graph
                    .get(member)
                    .and_then(|m| m.get(device_id))
                    .cloned();
                if let Some(call) = &existing {
                    if call.opponent_session_id().as_ref() == Some(&participant.session_id) {
                        continue;
                    }
                    info!(
                        target: "GroupCall/Reconciler",
                        "Replacing call to {member} ({device_id}): new session {}",
                        participant.session_id
                    );
                    let guard = self
                        .dispose_call_locked(inner, call, CallHangupReason::NewSession)
                        .await;
                    drop(guard);
                    remove_slot(inner, member, device_id);
                    changed = true;
                }

                let opts = CallOpts {
                    invitee: member.clone(),
                    opponent_device_id: device_id.clone(),
                    opponent_session_id: participant.session_id.clone(),
                    group_call_id: self.group_call_id().clone(),
                };
                let Some(call) = self.call_factory.create_call(&self.room_id(), opts) else {
                    warn!(
                        target: "GroupCall/Reconciler",
                        "Failed to construct call to {member} ({device_id})"
                    );
                    continue;
                };

                self.register_call_locked(inner, member.clone(), device_id.clone(), call.clone());
                changed = true;

                debug!(
                    target: "GroupCall/Reconciler",
                    "Placing call to {member} ({device_id}), session {}",
                    participant.session_id
                );
                let feeds = Self::local_feed_clones(inner);
                match call
                    .place_call_with_feeds(feeds, participant.screensharing)
                    .await
                {
                    Ok(()) => {
                        if self.data_channels_enabled() {
                            call.create_data_channel("datachannel", self.data_channel_options());
                        }
                    }
                    Err(err) => {
                        warn!(
                            target: "GroupCall/Reconciler",
                            "Failed to place call to {member} ({device_id}): {err}"
                        );
                        match &err {
                            SignallingError::UnknownDevice(message) => {
                                self.emit_error(GroupCallErrorCode::UnknownDevice, message.clone());
                            }
                            SignallingError::Other(_) => {
                                self.emit_error(
                                    GroupCallErrorCode::PlaceCallFailed,
                                    format!("failed to place call to {member} ({device_id})"),
                                );
                            }
                        }
                        let guard = self
                            .dispose_call_locked(inner, &call, CallHangupReason::SignallingFailed)
                            .await;
                        drop(guard);
                        if slot_holds(inner, member, device_id, &call) {
                            remove_slot(inner, member, device_id);
                        }
                    }
                }
            }
        }

        inner.call_graph.retain(|_, devices| !devices.is_empty());
        if changed {
            self.emit_calls_changed(inner);
        }
    }

    /// Admit a call from the transport into the graph.
    pub(crate) async fn on_incoming_call(self: &Arc<Self>, call: Arc<dyn Call>) {
        let mut inner = self.inner.lock().await;
        self.on_incoming_call_locked(&mut inner, call).await;
    }

    pub(crate) async fn on_incoming_call_locked(
        self: &Arc<Self>,
        inner: &mut Inner,
        call: Arc<dyn Call>,
    ) {
        if call.room_id() != self.room_id() {
            return;
        }
        if call.state() != CallState::Ringing {
            return;
        }
        if call.group_call_id().as_ref() != Some(self.group_call_id()) {
            info!(
                target: "GroupCall/Reconciler",
                "Rejecting incoming call {} for another group call",
                call.call_id()
            );
            if let Err(err) = call.reject().await {
                warn!(target: "GroupCall/Reconciler", "Failed to reject call: {err}");
            }
            return;
        }
        let (Some(user_id), Some(device_id)) = (call.opponent_user_id(), call.opponent_device_id())
        else {
            debug!(
                target: "GroupCall/Reconciler",
                "Ignoring incoming call {} with no identifiable opponent",
                call.call_id()
            );
            return;
        };

        let existing = inner
            .call_graph
            .get(&user_id)
            .and_then(|m| m.get(&device_id))
            .cloned();
        if let Some(existing) = existing {
            if existing.call_id() == call.call_id() {
                // Duplicate delivery.
                return;
            }
            info!(
                target: "GroupCall/Reconciler",
                "Incoming call replaces existing call for {user_id} ({device_id})"
            );
            let guard = self
                .dispose_call_locked(inner, &existing, CallHangupReason::Replaced)
                .await;
            drop(guard);
        }

        self.register_call_locked(inner, user_id.clone(), device_id.clone(), call.clone());
        let feeds = Self::local_feed_clones(inner);
        if let Err(err) = call.answer_with_feeds(feeds).await {
            warn!(
                target: "GroupCall/Reconciler",
                "Failed to answer incoming call from {user_id} ({device_id}): {err}"
            );
        }
        self.emit_calls_changed(inner);
    }

    /// Subscribe to a call's events and insert it into the graph under the
    /// given slot key. The listener task holds only a weak reference, so a
    /// dropped group call silently ends the subscription.
    pub(crate) fn register_call_locked(
        self: &Arc<Self>,
        inner: &mut Inner,
        user_id: UserId,
        device_id: DeviceId,
        call: Arc<dyn Call>,
    ) {
        let mut rx = call.subscribe();
        let this = Arc::downgrade(self);
        let listener_call = call.clone();
        let (uid, did) = (user_id.clone(), device_id.clone());
        let handle = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        let Some(group_call) = this.upgrade() else {
                            break;
                        };
                        group_call
                            .on_call_event(&uid, &did, &listener_call, event)
                            .await;
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(
                            target: "GroupCall/Reconciler",
                            "Call event listener for {uid} ({did}) lagged, missed {missed}"
                        );
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        inner
            .handlers
            .insert(user_id.clone(), device_id.clone(), CallListenerGuard::new(handle));
        inner
            .call_graph
            .entry(user_id)
            .or_default()
            .insert(device_id, call);
    }

    /// Unsubscribe a call's listeners and hang it up if still live. Does
    /// not touch the graph slot; callers decide what happens to it. The
    /// returned guard aborts the listener task when dropped.
    pub(crate) async fn dispose_call_locked(
        &self,
        inner: &mut Inner,
        call: &Arc<dyn Call>,
        reason: CallHangupReason,
    ) -> CallListenerGuard {
        let user_id = call
            .opponent_user_id()
            .expect("disposed call has an opponent user id");
        let device_id = call
            .opponent_device_id()
            .expect("disposed call has an opponent device id");
        let guard = inner.handlers.remove(&user_id, &device_id);
        if call.state() != CallState::Ended {
            if let Err(err) = call.hangup(reason, false).await {
                warn!(
                    target: "GroupCall/Reconciler",
                    "Failed to hang up call to {user_id} ({device_id}): {err}"
                );
            }
        }
        guard
    }

    pub(crate) async fn on_call_event(
        self: &Arc<Self>,
        user_id: &UserId,
        device_id: &DeviceId,
        call: &Arc<dyn Call>,
        event: CallEvent,
    ) {
        match event {
            CallEvent::FeedsChanged => self.on_call_feeds_changed(user_id, device_id, call).await,
            CallEvent::StateChanged { new_state, .. } => {
                self.on_call_state_changed(user_id, device_id, call, new_state)
                    .await;
            }
            CallEvent::Hangup => self.on_call_hangup(user_id, device_id, call).await,
            CallEvent::Replaced(new_call) => {
                self.on_call_replaced(user_id, device_id, call, new_call)
                    .await;
            }
        }
    }

    /// Diff the call's remote feeds against the registry.
    async fn on_call_feeds_changed(
        self: &Arc<Self>,
        user_id: &UserId,
        device_id: &DeviceId,
        call: &Arc<dyn Call>,
    ) {
        let mut inner = self.inner.lock().await;

        let current = inner.feeds.get_user_media_feed(user_id, device_id);
        match (current, call.remote_usermedia_feed()) {
            (None, Some(new)) => inner.feeds.add_user_media_feed(new),
            (Some(old), Some(new)) => {
                if !Arc::ptr_eq(&old, &new) {
                    let _ = inner.feeds.replace_user_media_feed(&old, new);
                }
            }
            (Some(old), None) => {
                let _ = inner.feeds.remove_user_media_feed(&old);
            }
            (None, None) => {}
        }

        let current = inner.feeds.get_screenshare_feed(user_id, device_id);
        match (current, call.remote_screensharing_feed()) {
            (None, Some(new)) => inner.feeds.add_screenshare_feed(new),
            (Some(old), Some(new)) => {
                if !Arc::ptr_eq(&old, &new) {
                    let _ = inner.feeds.replace_screenshare_feed(&old, new);
                }
            }
            (Some(old), None) => {
                let _ = inner.feeds.remove_screenshare_feed(&old);
            }
            (None, None) => {}
        }
    }

    /// Keep the call's mute state in line with ours, and clear the slot's
    /// retry budget once it connects.
    async fn on_call_state_changed(
        self: &Arc<Self>,
        user_id: &UserId,
        device_id: &DeviceId,
        call: &Arc<dyn Call>,
        new_state: CallState,
    ) {
        let mut inner = self.inner.lock().await;

        if let Some(local_feed) = inner.local_usermedia_feed.clone() {
            let audio_muted = local_feed.is_audio_muted();
            let video_muted = local_feed.is_video_muted();
            if call.is_microphone_muted() != audio_muted {
                if let Some(call_feed) = call.local_usermedia_feed() {
                    call_feed.set_audio_muted(audio_muted);
                }
                call.set_microphone_muted(audio_muted).await;
            }
            if call.is_local_video_muted() != video_muted {
                if let Some(call_feed) = call.local_usermedia_feed() {
                    call_feed.set_video_muted(video_muted);
                }
                call.set_local_video_muted(video_muted).await;
            }
        }

        if new_state == CallState::Connected {
            if let Some(counts) = inner.retry_counts.get_mut(user_id) {
                counts.remove(device_id);
                if counts.is_empty() {
                    inner.retry_counts.remove(user_id);
                }
            }
        }
    }

    async fn on_call_hangup(
        self: &Arc<Self>,
        user_id: &UserId,
        device_id: &DeviceId,
        call: &Arc<dyn Call>,
    ) {
        // Replacement is handled by the replace callback.
        if call.hangup_reason() == Some(CallHangupReason::Replaced) {
            return;
        }
        let mut inner = self.inner.lock().await;
        if !slot_holds(&inner, user_id, device_id, call) {
            // A race already replaced this call; nothing to clean up.
            return;
        }
        debug!(
            target: "GroupCall/Reconciler",
            "Call to {user_id} ({device_id}) hung up ({:?})",
            call.hangup_reason()
        );
        remove_slot(&mut inner, user_id, device_id);
        let guard = inner.handlers.remove(user_id, device_id);
        self.emit_calls_changed(&inner);
        drop(inner);
        // Aborts this listener task; must be the last thing we do.
        drop(guard);
    }

    /// The single-call layer replaced the call under us: adopt the new one
    /// into the slot keyed by the previous call's opponent device id.
    async fn on_call_replaced(
        self: &Arc<Self>,
        user_id: &UserId,
        device_id: &DeviceId,
        prev_call: &Arc<dyn Call>,
        new_call: Arc<dyn Call>,
    ) {
        let mut inner = self.inner.lock().await;
        info!(
            target: "GroupCall/Reconciler",
            "Call to {user_id} ({device_id}) replaced: {} -> {}",
            prev_call.call_id(),
            new_call.call_id()
        );
        let old_guard = inner.handlers.remove(user_id, device_id);
        if prev_call.state() != CallState::Ended {
            if let Err(err) = prev_call.hangup(CallHangupReason::Replaced, false).await {
                warn!(
                    target: "GroupCall/Reconciler",
                    "Failed to hang up replaced call: {err}"
                );
            }
        }
        self.register_call_locked(&mut inner, user_id.clone(), device_id.clone(), new_call);
        self.emit_calls_changed(&inner);
        drop(inner);
        // Aborts this listener task; must be the last thing we do.
        drop(old_guard);
    }

    /// One retry tick: bump the budget of every slot that still needs a
    /// call and schedule a placement pass if any had budget left.
    pub(crate) async fn on_retry_tick(self: &Arc<Self>) {
        if !self.state().is_entered() {
            return;
        }
        let mut inner = self.inner.lock().await;
        let local_user = self.client.user_id();
        let local_device = self.client.device_id();
        let mut any_budget = false;

        let participants = inner.participants.clone();
        for (member, devices) in &participants {
            for (device_id, participant) in devices {
                if *member == local_user && *device_id == local_device {
                    continue;
                }
                if !wants_outgoing_call(&local_user, &local_device, member, device_id) {
                    continue;
                }
                let satisfied = inner
                    .call_graph
                    .get(member)
                    .and_then(|m| m.get(device_id))
                    .is_some_and(|call| {
                        call.opponent_session_id().as_ref() == Some(&participant.session_id)
                    });
                if satisfied {
                    continue;
                }
                let count = inner
                    .retry_counts
                    .entry(member.clone())
                    .or_default()
                    .entry(device_id.clone())
                    .or_insert(0);
                if *count >= MAX_CALL_RETRIES {
                    continue;
                }
                *count += 1;
                any_budget = true;
            }
        }

        if any_budget {
            self.place_outgoing_calls_locked(&mut inner).await;
        }
    }

    pub(crate) fn local_feed_clones(inner: &Inner) -> Vec<Arc<CallFeed>> {
        inner
            .local_usermedia_feed
            .iter()
            .chain(inner.local_screenshare_feed.iter())
            .map(|feed| feed.clone_feed())
            .collect()
    }

    pub(crate) fn emit_calls_changed(&self, inner: &Inner) {
        let calls: Vec<Arc<dyn Call>> = inner
            .call_graph
            .values()
            .flat_map(|devices| devices.values().cloned())
            .collect();
        let _ = self.events.calls_changed.send(Arc::new(CallsChanged { calls }));
    }

    pub(crate) fn emit_error(&self, code: GroupCallErrorCode, message: String) {
        let _ = self
            .events
            .error
            .send(Arc::new(GroupCallErrorEvent { code, message }));
    }
}
