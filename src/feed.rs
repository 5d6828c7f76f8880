//! A single media feed (user media or screen share) belonging to one
//! `(user, device)` pair, local or remote.

use crate::traits::MediaStream;
use crate::types::ids::{DeviceId, UserId};
use crate::types::member::FeedPurpose;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// How many volume samples are kept for active-speaker detection.
pub const SPEAKING_SAMPLE_COUNT: usize = 8;

/// Volume (dB) below which a feed is never considered speaking.
pub const SPEAKING_THRESHOLD: f32 = -60.0;

pub struct CallFeed {
    user_id: UserId,
    device_id: DeviceId,
    purpose: FeedPurpose,
    local: bool,
    stream: Arc<dyn MediaStream>,
    audio_muted: AtomicBool,
    video_muted: AtomicBool,
    sampling: AtomicBool,
    samples: Mutex<Vec<f32>>,
    disposed: AtomicBool,
}

impl std::fmt::Debug for CallFeed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallFeed")
            .field("user_id", &self.user_id)
            .field("device_id", &self.device_id)
            .field("purpose", &self.purpose)
            .field("local", &self.local)
            .field("audio_muted", &self.audio_muted)
            .field("video_muted", &self.video_muted)
            .finish()
    }
}

impl CallFeed {
    pub fn new(
        user_id: UserId,
        device_id: DeviceId,
        purpose: FeedPurpose,
        stream: Arc<dyn MediaStream>,
        local: bool,
        audio_muted: bool,
        video_muted: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            user_id,
            device_id,
            purpose,
            local,
            stream,
            audio_muted: AtomicBool::new(audio_muted),
            video_muted: AtomicBool::new(video_muted),
            sampling: AtomicBool::new(false),
            samples: Mutex::new(Vec::new()),
            disposed: AtomicBool::new(false),
        })
    }

    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    pub fn purpose(&self) -> FeedPurpose {
        self.purpose
    }

    pub fn is_local(&self) -> bool {
        self.local
    }

    pub fn stream(&self) -> &Arc<dyn MediaStream> {
        &self.stream
    }

    pub fn is_audio_muted(&self) -> bool {
        self.audio_muted.load(Ordering::SeqCst)
    }

    pub fn is_video_muted(&self) -> bool {
        self.video_muted.load(Ordering::SeqCst)
    }

    pub fn set_audio_muted(&self, muted: bool) {
        self.audio_muted.store(muted, Ordering::SeqCst);
    }

    pub fn set_video_muted(&self, muted: bool) {
        self.video_muted.store(muted, Ordering::SeqCst);
    }

    /// Matches another feed holding media for the same `(user, device)`.
    pub fn matches(&self, user_id: &UserId, device_id: &DeviceId) -> bool {
        &self.user_id == user_id && &self.device_id == device_id
    }

    pub fn set_speaking_volume_sampling(&self, enabled: bool) {
        self.sampling.store(enabled, Ordering::SeqCst);
        if !enabled {
            self.samples.lock().unwrap().clear();
        }
    }

    /// Record a volume sample (dB). The media layer calls this while
    /// sampling is enabled; only the most recent [`SPEAKING_SAMPLE_COUNT`]
    /// samples are kept.
    pub fn append_volume_sample(&self, volume_db: f32) {
        if !self.sampling.load(Ordering::SeqCst) {
            return;
        }
        let mut samples = self.samples.lock().unwrap();
        if samples.len() >= SPEAKING_SAMPLE_COUNT {
            samples.remove(0);
        }
        samples.push(volume_db);
    }

    /// Arithmetic mean of the current samples, or `None` when no samples
    /// have been recorded yet (such feeds are skipped by active-speaker
    /// selection).
    pub fn average_volume(&self) -> Option<f32> {
        let samples = self.samples.lock().unwrap();
        if samples.is_empty() {
            return None;
        }
        Some(samples.iter().sum::<f32>() / samples.len() as f32)
    }

    /// A clone of this feed handing the same underlying stream to a call.
    /// Mute bits are copied at clone time.
    pub fn clone_feed(self: &Arc<Self>) -> Arc<CallFeed> {
        CallFeed::new(
            self.user_id.clone(),
            self.device_id.clone(),
            self.purpose,
            self.stream.clone(),
            self.local,
            self.is_audio_muted(),
            self.is_video_muted(),
        )
    }

    /// Idempotent.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.set_speaking_volume_sampling(false);
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::MockStream;

    fn feed() -> Arc<CallFeed> {
        CallFeed::new(
            UserId::new("@a:h"),
            DeviceId::new("DA"),
            FeedPurpose::Usermedia,
            MockStream::audio_video(),
            false,
            false,
            false,
        )
    }

    #[test]
    fn test_samples_ignored_until_sampling_enabled() {
        let feed = feed();
        feed.append_volume_sample(-20.0);
        assert_eq!(feed.average_volume(), None);

        feed.set_speaking_volume_sampling(true);
        feed.append_volume_sample(-20.0);
        feed.append_volume_sample(-40.0);
        assert_eq!(feed.average_volume(), Some(-30.0));
    }

    #[test]
    fn test_sample_window_is_bounded() {
        let feed = feed();
        feed.set_speaking_volume_sampling(true);
        for _ in 0..SPEAKING_SAMPLE_COUNT {
            feed.append_volume_sample(-90.0);
        }
        for _ in 0..SPEAKING_SAMPLE_COUNT {
            feed.append_volume_sample(-10.0);
        }
        // Old samples rolled out of the window.
        assert_eq!(feed.average_volume(), Some(-10.0));
    }

    #[test]
    fn test_dispose_clears_samples_and_is_idempotent() {
        let feed = feed();
        feed.set_speaking_volume_sampling(true);
        feed.append_volume_sample(-20.0);
        feed.dispose();
        feed.dispose();
        assert!(feed.is_disposed());
        assert_eq!(feed.average_volume(), None);
    }

    #[test]
    fn test_clone_feed_copies_mute_bits() {
        let feed = feed();
        feed.set_audio_muted(true);
        let clone = feed.clone_feed();
        assert!(clone.is_audio_muted());
        assert!(!clone.is_video_muted());
        assert!(Arc::ptr_eq(feed.stream(), clone.stream()));
    }
}
