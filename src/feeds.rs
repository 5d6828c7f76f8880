//! Registry of user-media and screen-share feeds, plus active-speaker
//! selection.

use crate::error::GroupCallError;
use crate::feed::{CallFeed, SPEAKING_THRESHOLD};
use crate::types::events::{ActiveSpeakerChanged, EventBus, FeedsChangedEvent};
use crate::types::ids::{DeviceId, UserId};
use log::debug;
use std::sync::Arc;
use std::time::Duration;

/// How often the active speaker is recomputed.
pub const ACTIVE_SPEAKER_INTERVAL: Duration = Duration::from_millis(1000);

/// Tracks per-(user, device) feeds for the whole group call. Feeds are
/// unique per `(user_id, device_id)` within each sequence; the reconciler
/// is the only writer for remote feeds, the media controller for local
/// ones.
pub struct FeedRegistry {
    events: Arc<EventBus>,
    user_media_feeds: Vec<Arc<CallFeed>>,
    screenshare_feeds: Vec<Arc<CallFeed>>,
    active_speaker: Option<Arc<CallFeed>>,
}

impl FeedRegistry {
    pub fn new(events: Arc<EventBus>) -> Self {
        Self {
            events,
            user_media_feeds: Vec::new(),
            screenshare_feeds: Vec::new(),
            active_speaker: None,
        }
    }

    pub fn user_media_feeds(&self) -> &[Arc<CallFeed>] {
        &self.user_media_feeds
    }

    pub fn screenshare_feeds(&self) -> &[Arc<CallFeed>] {
        &self.screenshare_feeds
    }

    pub fn active_speaker(&self) -> Option<Arc<CallFeed>> {
        self.active_speaker.clone()
    }

    pub fn get_user_media_feed(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
    ) -> Option<Arc<CallFeed>> {
        self.user_media_feeds
            .iter()
            .find(|f| f.matches(user_id, device_id))
            .cloned()
    }

    pub fn get_screenshare_feed(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
    ) -> Option<Arc<CallFeed>> {
        self.screenshare_feeds
            .iter()
            .find(|f| f.matches(user_id, device_id))
            .cloned()
    }

    pub fn add_user_media_feed(&mut self, feed: Arc<CallFeed>) {
        feed.set_speaking_volume_sampling(true);
        self.user_media_feeds.push(feed);
        self.emit_user_media_feeds_changed();
    }

    pub fn replace_user_media_feed(
        &mut self,
        old: &Arc<CallFeed>,
        new: Arc<CallFeed>,
    ) -> Result<(), GroupCallError> {
        let idx = self
            .user_media_feeds
            .iter()
            .position(|f| f.matches(old.user_id(), old.device_id()))
            .ok_or_else(|| GroupCallError::FeedNotFound {
                user_id: old.user_id().clone(),
                device_id: old.device_id().clone(),
            })?;
        self.user_media_feeds[idx].dispose();
        new.set_speaking_volume_sampling(true);
        self.user_media_feeds[idx] = new;
        self.emit_user_media_feeds_changed();
        Ok(())
    }

    pub fn remove_user_media_feed(&mut self, feed: &Arc<CallFeed>) -> Result<(), GroupCallError> {
        let idx = self
            .user_media_feeds
            .iter()
            .position(|f| f.matches(feed.user_id(), feed.device_id()))
            .ok_or_else(|| GroupCallError::FeedNotFound {
                user_id: feed.user_id().clone(),
                device_id: feed.device_id().clone(),
            })?;
        let removed = self.user_media_feeds.remove(idx);
        removed.dispose();
        self.emit_user_media_feeds_changed();

        let was_active_speaker = self
            .active_speaker
            .as_ref()
            .is_some_and(|current| Arc::ptr_eq(current, &removed));
        if was_active_speaker {
            self.active_speaker = self.user_media_feeds.first().cloned();
            self.emit_active_speaker_changed();
        }
        Ok(())
    }

    pub fn add_screenshare_feed(&mut self, feed: Arc<CallFeed>) {
        feed.set_speaking_volume_sampling(true);
        self.screenshare_feeds.push(feed);
        self.emit_screenshare_feeds_changed();
    }

    pub fn replace_screenshare_feed(
        &mut self,
        old: &Arc<CallFeed>,
        new: Arc<CallFeed>,
    ) -> Result<(), GroupCallError> {
        let idx = self
            .screenshare_feeds
            .iter()
            .position(|f| f.matches(old.user_id(), old.device_id()))
            .ok_or_else(|| GroupCallError::FeedNotFound {
                user_id: old.user_id().clone(),
                device_id: old.device_id().clone(),
            })?;
        self.screenshare_feeds[idx].dispose();
        new.set_speaking_volume_sampling(true);
        self.screenshare_feeds[idx] = new;
        self.emit_screenshare_feeds_changed();
        Ok(())
    }

    pub fn remove_screenshare_feed(&mut self, feed: &Arc<CallFeed>) -> Result<(), GroupCallError> {
        let idx = self
            .screenshare_feeds
            .iter()
            .position(|f| f.matches(feed.user_id(), feed.device_id()))
            .ok_or_else(|| GroupCallError::FeedNotFound {
                user_id: feed.user_id().clone(),
                device_id: feed.device_id().clone(),
            })?;
        let removed = self.screenshare_feeds.remove(idx);
        removed.dispose();
        self.emit_screenshare_feeds_changed();
        Ok(())
    }

    /// One active-speaker tick: pick the loudest feed by mean sample
    /// volume. Local feeds only compete when they are the only feed;
    /// feeds without samples are skipped.
    pub fn update_active_speaker(&mut self) {
        let only_feed = self.user_media_feeds.len() == 1;
        let mut best: Option<(Arc<CallFeed>, f32)> = None;
        for feed in &self.user_media_feeds {
            if feed.is_local() && !only_feed {
                continue;
            }
            let Some(avg) = feed.average_volume() else {
                continue;
            };
            let avg = avg.max(SPEAKING_THRESHOLD);
            let better = best.as_ref().is_none_or(|(_, b)| avg > *b);
            if better {
                best = Some((feed.clone(), avg));
            }
        }

        let Some((feed, avg)) = best else {
            return;
        };
        let is_current = self
            .active_speaker
            .as_ref()
            .is_some_and(|current| Arc::ptr_eq(current, &feed));
        if !is_current && avg > SPEAKING_THRESHOLD {
            debug!(
                target: "GroupCall/ActiveSpeaker",
                "Active speaker changed to {} ({}) at {avg} dB",
                feed.user_id(),
                feed.device_id()
            );
            self.active_speaker = Some(feed);
            self.emit_active_speaker_changed();
        }
    }

    /// Dispose every feed and clear the registry.
    pub fn dispose_all(&mut self) {
        for feed in self
            .user_media_feeds
            .drain(..)
            .chain(self.screenshare_feeds.drain(..))
        {
            feed.dispose();
        }
        self.emit_user_media_feeds_changed();
        self.emit_screenshare_feeds_changed();
        if self.active_speaker.take().is_some() {
            self.emit_active_speaker_changed();
        }
    }

    fn emit_user_media_feeds_changed(&self) {
        let _ = self
            .events
            .user_media_feeds_changed
            .send(Arc::new(FeedsChangedEvent {
                feeds: self.user_media_feeds.clone(),
            }));
    }

    fn emit_screenshare_feeds_changed(&self) {
        let _ = self
            .events
            .screenshare_feeds_changed
            .send(Arc::new(FeedsChangedEvent {
                feeds: self.screenshare_feeds.clone(),
            }));
    }

    fn emit_active_speaker_changed(&self) {
        let _ = self
            .events
            .active_speaker_changed
            .send(Arc::new(ActiveSpeakerChanged {
                active_speaker: self.active_speaker.clone(),
            }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::MockStream;
    use crate::types::member::FeedPurpose;

    fn remote_feed(user: &str, device: &str) -> Arc<CallFeed> {
        CallFeed::new(
            UserId::new(user),
            DeviceId::new(device),
            FeedPurpose::Usermedia,
            MockStream::audio_only(),
            false,
            false,
            false,
        )
    }

    fn local_feed() -> Arc<CallFeed> {
        CallFeed::new(
            UserId::new("@local:h"),
            DeviceId::new("DL"),
            FeedPurpose::Usermedia,
            MockStream::audio_only(),
            true,
            false,
            false,
        )
    }

    fn registry() -> FeedRegistry {
        FeedRegistry::new(Arc::new(EventBus::new()))
    }

    fn fill_samples(feed: &Arc<CallFeed>, volume: f32) {
        for _ in 0..4 {
            feed.append_volume_sample(volume);
        }
    }

    #[test]
    fn test_add_and_get_by_key() {
        let mut registry = registry();
        let feed = remote_feed("@a:h", "DA");
        registry.add_user_media_feed(feed.clone());
        let found = registry
            .get_user_media_feed(&UserId::new("@a:h"), &DeviceId::new("DA"))
            .unwrap();
        assert!(Arc::ptr_eq(&found, &feed));
        assert!(
            registry
                .get_user_media_feed(&UserId::new("@a:h"), &DeviceId::new("DB"))
                .is_none()
        );
    }

    #[test]
    fn test_add_enables_volume_sampling() {
        let mut registry = registry();
        let feed = remote_feed("@a:h", "DA");
        registry.add_user_media_feed(feed.clone());
        feed.append_volume_sample(-10.0);
        assert_eq!(feed.average_volume(), Some(-10.0));
    }

    #[test]
    fn test_remove_unknown_feed_fails() {
        let mut registry = registry();
        let feed = remote_feed("@a:h", "DA");
        assert!(matches!(
            registry.remove_user_media_feed(&feed),
            Err(GroupCallError::FeedNotFound { .. })
        ));
        assert!(matches!(
            registry.replace_user_media_feed(&feed, remote_feed("@a:h", "DA")),
            Err(GroupCallError::FeedNotFound { .. })
        ));
    }

    #[test]
    fn test_replace_keeps_position_and_disposes_old() {
        let mut registry = registry();
        let first = remote_feed("@a:h", "DA");
        let second = remote_feed("@b:h", "DB");
        registry.add_user_media_feed(first.clone());
        registry.add_user_media_feed(second.clone());

        let replacement = remote_feed("@a:h", "DA");
        registry
            .replace_user_media_feed(&first, replacement.clone())
            .unwrap();
        assert!(first.is_disposed());
        assert!(Arc::ptr_eq(&registry.user_media_feeds()[0], &replacement));
        assert!(Arc::ptr_eq(&registry.user_media_feeds()[1], &second));
    }

    #[test]
    fn test_remove_active_speaker_promotes_first_remaining() {
        let mut registry = registry();
        let a = remote_feed("@a:h", "DA");
        let b = remote_feed("@b:h", "DB");
        registry.add_user_media_feed(a.clone());
        registry.add_user_media_feed(b.clone());

        fill_samples(&b, -10.0);
        registry.update_active_speaker();
        assert!(Arc::ptr_eq(&registry.active_speaker().unwrap(), &b));

        registry.remove_user_media_feed(&b).unwrap();
        assert!(b.is_disposed());
        assert!(Arc::ptr_eq(&registry.active_speaker().unwrap(), &a));

        registry.remove_user_media_feed(&a).unwrap();
        assert!(registry.active_speaker().is_none());
    }

    #[test]
    fn test_active_speaker_picks_loudest_remote() {
        let mut registry = registry();
        let a = remote_feed("@a:h", "DA");
        let b = remote_feed("@b:h", "DB");
        registry.add_user_media_feed(a.clone());
        registry.add_user_media_feed(b.clone());

        fill_samples(&a, -40.0);
        fill_samples(&b, -20.0);
        registry.update_active_speaker();
        assert!(Arc::ptr_eq(&registry.active_speaker().unwrap(), &b));
    }

    #[test]
    fn test_active_speaker_ignores_feeds_below_threshold() {
        let mut registry = registry();
        let a = remote_feed("@a:h", "DA");
        registry.add_user_media_feed(a.clone());
        fill_samples(&a, SPEAKING_THRESHOLD - 20.0);
        registry.update_active_speaker();
        assert!(registry.active_speaker().is_none());
    }

    #[test]
    fn test_active_speaker_skips_feeds_without_samples() {
        let mut registry = registry();
        let silent = remote_feed("@a:h", "DA");
        let speaking = remote_feed("@b:h", "DB");
        registry.add_user_media_feed(silent);
        registry.add_user_media_feed(speaking.clone());
        fill_samples(&speaking, -20.0);
        registry.update_active_speaker();
        assert!(Arc::ptr_eq(&registry.active_speaker().unwrap(), &speaking));
    }

    #[test]
    fn test_local_feed_competes_only_when_alone() {
        let mut registry = registry();
        let local = local_feed();
        registry.add_user_media_feed(local.clone());
        fill_samples(&local, -20.0);
        registry.update_active_speaker();
        assert!(Arc::ptr_eq(&registry.active_speaker().unwrap(), &local));

        let remote = remote_feed("@a:h", "DA");
        registry.add_user_media_feed(remote.clone());
        fill_samples(&local, -5.0);
        fill_samples(&remote, -30.0);
        registry.update_active_speaker();
        // The louder local feed no longer competes once a remote exists.
        assert!(Arc::ptr_eq(&registry.active_speaker().unwrap(), &remote));
    }

    #[test]
    fn test_unqualified_tick_keeps_current_speaker() {
        let mut registry = registry();
        let a = remote_feed("@a:h", "DA");
        registry.add_user_media_feed(a.clone());
        fill_samples(&a, -20.0);
        registry.update_active_speaker();
        assert!(registry.active_speaker().is_some());

        // Samples decay below the threshold: the speaker is unchanged.
        a.set_speaking_volume_sampling(false);
        a.set_speaking_volume_sampling(true);
        fill_samples(&a, SPEAKING_THRESHOLD - 10.0);
        registry.update_active_speaker();
        assert!(Arc::ptr_eq(&registry.active_speaker().unwrap(), &a));
    }

    #[test]
    fn test_dispose_all_clears_everything() {
        let mut registry = registry();
        let a = remote_feed("@a:h", "DA");
        registry.add_user_media_feed(a.clone());
        fill_samples(&a, -20.0);
        registry.update_active_speaker();

        registry.dispose_all();
        assert!(a.is_disposed());
        assert!(registry.user_media_feeds().is_empty());
        assert!(registry.screenshare_feeds().is_empty());
        assert!(registry.active_speaker().is_none());
    }
}
