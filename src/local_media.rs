//! Local capture: user media acquisition, mute semantics, push-to-talk
//! and screen sharing.

use crate::error::{GroupCallError, GroupCallErrorCode};
use crate::feed::CallFeed;
use crate::group_call::GroupCall;
use crate::traits::{Call, ScreenshareOpts};
use crate::types::events::{
    GroupCallState, LocalMuteStateChanged, LocalScreenshareStateChanged,
};
use crate::types::member::{CallType, FeedPurpose};
use log::{info, warn};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

/// Longest a PTT unmute may transmit before being re-muted.
pub const PTT_MAX_TRANSMIT_TIME: Duration = Duration::from_millis(20_000);

impl GroupCall {
    /// Acquire the local capture stream and register the user-media feed.
    /// Only valid in the uninitialized state. A concurrent `leave` while
    /// capture is pending aborts the initialization without registering
    /// anything.
    pub async fn init_local_call_feed(self: &Arc<Self>) -> Result<Arc<CallFeed>, GroupCallError> {
        {
            let _inner = self.inner.lock().await;
            let state = self.state();
            if state != GroupCallState::LocalCallFeedUninitialized {
                return Err(GroupCallError::InvalidState {
                    operation: "init_local_call_feed",
                    state: state.name(),
                });
            }
            self.set_state(GroupCallState::InitializingLocalCallFeed);
        }

        // Suspension point: the lock is released while capture is pending
        // so leave() can run and flip the state under us.
        let want_video = self.call_type() == CallType::Video;
        let stream = match self.media.get_user_media_stream(true, want_video).await {
            Ok(stream) => stream,
            Err(err) => {
                let _inner = self.inner.lock().await;
                if self.state() == GroupCallState::InitializingLocalCallFeed {
                    self.set_state(GroupCallState::LocalCallFeedUninitialized);
                }
                return Err(GroupCallError::NoUserMedia(err));
            }
        };

        let mut inner = self.inner.lock().await;
        if self.state() != GroupCallState::InitializingLocalCallFeed {
            self.media.stop_user_media_stream(&stream);
            return Err(GroupCallError::Disposed);
        }

        let audio_muted = inner.init_with_audio_muted || !stream.has_audio() || self.is_ptt;
        let video_muted = inner.init_with_video_muted || !stream.has_video();
        stream.set_audio_enabled(!audio_muted);
        stream.set_video_enabled(!video_muted);

        let feed = CallFeed::new(
            self.client.user_id(),
            self.client.device_id(),
            FeedPurpose::Usermedia,
            stream,
            true,
            audio_muted,
            video_muted,
        );
        inner.local_usermedia_feed = Some(feed.clone());
        inner.feeds.add_user_media_feed(feed.clone());
        self.set_state(GroupCallState::LocalCallFeedInitialized);
        Ok(feed)
    }

    pub async fn is_microphone_muted(&self) -> bool {
        let inner = self.inner.lock().await;
        inner
            .local_usermedia_feed
            .as_ref()
            .map(|feed| feed.is_audio_muted())
            .unwrap_or(inner.init_with_audio_muted)
    }

    pub async fn is_local_video_muted(&self) -> bool {
        let inner = self.inner.lock().await;
        inner
            .local_usermedia_feed
            .as_ref()
            .map(|feed| feed.is_video_muted())
            .unwrap_or(inner.init_with_video_muted)
    }

    /// Returns `false` when an unmute is refused because no input device
    /// is available; mutes always proceed.
    pub async fn set_microphone_muted(self: &Arc<Self>, muted: bool) -> bool {
        if !muted && !self.media.has_audio_device().await {
            return false;
        }

        let mut inner = self.inner.lock().await;
        let Some(local_feed) = inner.local_usermedia_feed.clone() else {
            // No feed yet: remember the choice for initialization.
            inner.init_with_audio_muted = muted;
            let video_muted = inner.init_with_video_muted;
            self.emit_local_mute_state(muted, video_muted);
            return true;
        };

        let calls: Vec<Arc<dyn Call>> = inner
            .call_graph
            .values()
            .flat_map(|devices| devices.values().cloned())
            .collect();

        // When a PTT unmute is about to open the mic, listeners should
        // hear about it before any audio flows.
        let updates_before_tracks = !muted && self.is_ptt;
        if updates_before_tracks {
            for call in &calls {
                if let Err(err) = call.send_metadata_update().await {
                    warn!(target: "GroupCall/Media", "Metadata update failed: {err}");
                }
            }
        }

        local_feed.set_audio_muted(muted);
        local_feed.stream().set_audio_enabled(!muted);
        for call in &calls {
            if let Some(call_feed) = call.local_usermedia_feed() {
                call_feed.set_audio_muted(muted);
            }
            call.set_microphone_muted(muted).await;
        }

        if !updates_before_tracks {
            for call in &calls {
                if let Err(err) = call.send_metadata_update().await {
                    warn!(target: "GroupCall/Media", "Metadata update failed: {err}");
                }
            }
        }

        if self.is_ptt {
            if let Some(task) = inner.tasks.ptt.take() {
                task.abort();
            }
            if !muted {
                let weak = Arc::downgrade(self);
                inner.tasks.ptt = Some(tokio::spawn(async move {
                    tokio::time::sleep(PTT_MAX_TRANSMIT_TIME).await;
                    if let Some(group_call) = weak.upgrade() {
                        info!(target: "GroupCall/Media", "PTT transmit window elapsed, re-muting");
                        group_call.set_microphone_muted_boxed(true).await;
                    }
                }));
            }
        }

        let video_muted = local_feed.is_video_muted();
        self.emit_local_mute_state(muted, video_muted);
        true
    }

    /// Returns `false` when an unmute is refused because no camera is
    /// available; mutes always proceed.
    pub async fn set_local_video_muted(self: &Arc<Self>, muted: bool) -> bool {
        if !muted && !self.media.has_video_device().await {
            return false;
        }

        let mut inner = self.inner.lock().await;
        let Some(local_feed) = inner.local_usermedia_feed.clone() else {
            inner.init_with_video_muted = muted;
            let audio_muted = inner.init_with_audio_muted;
            self.emit_local_mute_state(audio_muted, muted);
            return true;
        };

        let calls: Vec<Arc<dyn Call>> = inner
            .call_graph
            .values()
            .flat_map(|devices| devices.values().cloned())
            .collect();

        local_feed.set_video_muted(muted);
        local_feed.stream().set_video_enabled(!muted);
        for call in &calls {
            if let Some(call_feed) = call.local_usermedia_feed() {
                call_feed.set_video_muted(muted);
            }
            call.set_local_video_muted(muted).await;
        }

        let audio_muted = local_feed.is_audio_muted();
        self.emit_local_mute_state(audio_muted, muted);
        true
    }

    pub async fn is_screensharing(&self) -> bool {
        self.inner.lock().await.local_screenshare_feed.is_some()
    }

    /// Start or stop sharing the screen. Failures to acquire the capture
    /// stream are returned when `throw_on_fail` is set, otherwise emitted
    /// as an error event with `Ok(false)`.
    pub async fn set_screensharing_enabled(
        self: &Arc<Self>,
        enabled: bool,
        opts: ScreenshareOpts,
        throw_on_fail: bool,
    ) -> Result<bool, GroupCallError> {
        let mut inner = self.inner.lock().await;
        if enabled == inner.local_screenshare_feed.is_some() {
            return Ok(enabled);
        }

        let calls: Vec<Arc<dyn Call>> = inner
            .call_graph
            .values()
            .flat_map(|devices| devices.values().cloned())
            .collect();

        if enabled {
            info!(target: "GroupCall/Media", "Starting screen share");
            let stream = match self.media.get_screensharing_stream(opts).await {
                Ok(stream) => stream,
                Err(err) => {
                    warn!(target: "GroupCall/Media", "Screen capture failed: {err}");
                    if throw_on_fail {
                        return Err(GroupCallError::NoUserMedia(err));
                    }
                    self.emit_error(
                        GroupCallErrorCode::NoUserMedia,
                        format!("failed to acquire screen capture: {err}"),
                    );
                    return Ok(false);
                }
            };

            // Stop sharing when the user ends the capture from the system
            // UI rather than through us.
            let mut ended = stream.subscribe_ended();
            let weak = Arc::downgrade(self);
            inner.tasks.screenshare_ended = Some(tokio::spawn(async move {
                if ended.recv().await.is_ok() {
                    if let Some(group_call) = weak.upgrade() {
                        let _ = group_call
                            .set_screensharing_enabled_boxed(
                                false,
                                ScreenshareOpts::default(),
                                false,
                            )
                            .await;
                    }
                }
            }));

            let source_id = stream.source_id();
            let feed = CallFeed::new(
                self.client.user_id(),
                self.client.device_id(),
                FeedPurpose::Screenshare,
                stream.clone(),
                true,
                false,
                false,
            );
            inner.screenshare_stream = Some(stream);
            inner.local_screenshare_feed = Some(feed.clone());
            inner.feeds.add_screenshare_feed(feed.clone());

            for call in &calls {
                call.push_local_feed(feed.clone_feed()).await;
            }

            let _ = self
                .events
                .local_screenshare_state_changed
                .send(Arc::new(LocalScreenshareStateChanged {
                    enabled: true,
                    feed: Some(feed),
                    source_id,
                }));
            if self.state().is_entered() {
                if let Err(err) = self.publish_member_state_locked(&inner).await {
                    warn!(target: "GroupCall/Media", "Failed to update member state: {err}");
                }
            }
            Ok(true)
        } else {
            info!(target: "GroupCall/Media", "Stopping screen share");
            let Some(feed) = inner.local_screenshare_feed.take() else {
                return Ok(false);
            };
            let ended_task = inner.tasks.screenshare_ended.take();

            for call in &calls {
                call.remove_local_feed(&feed).await;
            }
            if let Some(stream) = inner.screenshare_stream.take() {
                self.media.stop_screensharing_stream(&stream);
            }
            let _ = inner.feeds.remove_screenshare_feed(&feed);

            let _ = self
                .events
                .local_screenshare_state_changed
                .send(Arc::new(LocalScreenshareStateChanged {
                    enabled: false,
                    feed: None,
                    source_id: None,
                }));
            if self.state().is_entered() {
                if let Err(err) = self.publish_member_state_locked(&inner).await {
                    warn!(target: "GroupCall/Media", "Failed to update member state: {err}");
                }
            }
            drop(inner);
            // May abort the very task running this call, so nothing else
            // can come after it.
            if let Some(task) = ended_task {
                task.abort();
            }
            Ok(false)
        }
    }

    /// Type-erased form of [`set_microphone_muted`] for use at the
    /// recursive call site (the PTT transmit-window timer re-invokes this
    /// once it fires). Boxing here keeps the opaque future graph from
    /// folding back on itself, which otherwise defeats the `Send` check on
    /// the spawned task.
    pub(crate) fn set_microphone_muted_boxed(
        self: Arc<Self>,
        muted: bool,
    ) -> Pin<Box<dyn Future<Output = bool> + Send>> {
        Box::pin(async move { self.set_microphone_muted(muted).await })
    }

    /// Type-erased form of [`set_screensharing_enabled`] for use at the
    /// recursive call site (the capture-ended watcher re-invokes this once
    /// the system UI ends the share). Boxing here keeps the opaque future
    /// graph from folding back on itself, which otherwise defeats the
    /// `Send` check on the spawned task.
    pub(crate) fn set_screensharing_enabled_boxed(
        self: Arc<Self>,
        enabled: bool,
        opts: ScreenshareOpts,
        throw_on_fail: bool,
    ) -> Pin<Box<dyn Future<Output = Result<bool, GroupCallError>> + Send>> {
        Box::pin(async move {
            self.set_screensharing_enabled(enabled, opts, throw_on_fail)
                .await
        })
    }

    fn emit_local_mute_state(&self, audio_muted: bool, video_muted: bool) {
        let _ = self
            .events
            .local_mute_state_changed
            .send(Arc::new(LocalMuteStateChanged {
                audio_muted,
                video_muted,
            }));
    }
}
