//! Publishes and refreshes the local device's entry in the room's
//! member-state document.
//!
//! All writes go through a read-modify-write of our own member-state
//! event: only the entry for this group call is rewritten, every other
//! entry (other calls, unknown fields) survives byte-for-byte.

use crate::error::GroupCallError;
use crate::group_call::{now_ms, GroupCall, Inner};
use crate::types::member::{
    DeviceAdvertisement, FeedEntry, FeedPurpose, MemberCallsContent, DEVICE_TIMEOUT_MS,
    EVENT_TYPE_GROUP_CALL_MEMBER,
};
use log::{debug, warn};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

impl GroupCall {
    /// Bring our member-state entry in line with the local state: while
    /// entered this (re)publishes our device advertisement, otherwise it
    /// removes it.
    pub async fn update_member_state(&self) -> Result<(), GroupCallError> {
        let inner = self.inner.lock().await;
        if self.state().is_entered() {
            self.publish_member_state_locked(&inner).await
        } else {
            self.remove_member_state_locked(false).await
        }
    }

    /// Drop advertisements that could never be valid: devices unknown to
    /// the identity service, and our own entry when we are not in the
    /// call. Skips the write when nothing would change.
    pub async fn clean_member_state(&self) -> Result<(), GroupCallError> {
        let known = self
            .client
            .get_devices()
            .await
            .map_err(GroupCallError::Signalling)?;
        let device_id = self.client.device_id();
        let considered_entered = self.considered_entered();

        let _inner = self.inner.lock().await;
        self.update_devices(
            move |devices| {
                let filtered: Vec<DeviceAdvertisement> = devices
                    .iter()
                    .filter(|d| {
                        if !known.iter().any(|k| k.as_str() == d.device_id) {
                            return false;
                        }
                        if d.device_id == device_id.as_str() && !considered_entered {
                            return false;
                        }
                        true
                    })
                    .cloned()
                    .collect();
                if filtered == devices {
                    None
                } else {
                    Some(filtered)
                }
            },
            false,
        )
        .await
    }

    /// Remove any stale entry for this device, then append a fresh
    /// advertisement carrying our session id and current feed purposes.
    pub(crate) async fn publish_member_state_locked(
        &self,
        inner: &Inner,
    ) -> Result<(), GroupCallError> {
        let device_id = self.client.device_id();
        let session_id = self.client.session_id();
        let mut feeds = Vec::new();
        if inner.local_usermedia_feed.is_some() {
            feeds.push(FeedEntry {
                purpose: FeedPurpose::Usermedia,
            });
        }
        if inner.local_screenshare_feed.is_some() {
            feeds.push(FeedEntry {
                purpose: FeedPurpose::Screenshare,
            });
        }
        debug!(
            target: "GroupCall/Membership",
            "Publishing advertisement for {device_id}, {} feeds",
            feeds.len()
        );
        self.update_devices(
            move |devices| {
                let mut devices: Vec<DeviceAdvertisement> = devices
                    .into_iter()
                    .filter(|d| d.device_id != device_id.as_str())
                    .collect();
                devices.push(DeviceAdvertisement {
                    device_id: device_id.to_string(),
                    session_id: session_id.to_string(),
                    // Restamped on write.
                    expires_ts: 0,
                    feeds,
                });
                Some(devices)
            },
            false,
        )
        .await
    }

    /// Filter our device out of the advertisement list. With `keep_alive`
    /// the write is marked to survive a process teardown.
    pub(crate) async fn remove_member_state_locked(
        &self,
        keep_alive: bool,
    ) -> Result<(), GroupCallError> {
        let device_id = self.client.device_id();
        debug!(
            target: "GroupCall/Membership",
            "Removing advertisement for {device_id}"
        );
        self.update_devices(
            move |devices| {
                Some(
                    devices
                        .into_iter()
                        .filter(|d| d.device_id != device_id.as_str())
                        .collect(),
                )
            },
            keep_alive,
        )
        .await
    }

    /// Read-modify-write of our member-state event. The mutation sees only
    /// the structurally valid, unexpired devices of our entry; returning
    /// `None` aborts the write. Foreign entries are preserved verbatim and
    /// our devices are restamped with a fresh expiry.
    async fn update_devices<F>(&self, mutate: F, keep_alive: bool) -> Result<(), GroupCallError>
    where
        F: FnOnce(Vec<DeviceAdvertisement>) -> Option<Vec<DeviceAdvertisement>>,
    {
        let now = now_ms();
        let user_id = self.client.user_id();
        let content = self
            .room
            .get_state_event(EVENT_TYPE_GROUP_CALL_MEMBER, user_id.as_str())
            .map(|event| event.content)
            .unwrap_or_else(|| json!({}));
        let parsed: MemberCallsContent = serde_json::from_value(content).unwrap_or_default();
        let (ours, others) = parsed.partition(self.group_call_id().as_str());

        let valid: Vec<DeviceAdvertisement> = ours
            .as_ref()
            .and_then(|entry| entry.get("m.devices"))
            .and_then(|devices| devices.as_array())
            .map(|devices| {
                devices
                    .iter()
                    .filter_map(|d| DeviceAdvertisement::parse_valid(d, now))
                    .collect()
            })
            .unwrap_or_default();

        let Some(mut new_devices) = mutate(valid) else {
            return Ok(());
        };

        let mut calls = others;
        if !new_devices.is_empty() {
            for device in &mut new_devices {
                device.expires_ts = now + DEVICE_TIMEOUT_MS;
            }
            let mut entry =
                ours.unwrap_or_else(|| json!({ "m.call_id": self.group_call_id().as_str() }));
            entry["m.devices"] = serde_json::to_value(&new_devices)
                .map_err(|err| GroupCallError::Signalling(err.into()))?;
            calls.push(entry);
        }

        self.client
            .send_state_event(
                &self.room_id(),
                EVENT_TYPE_GROUP_CALL_MEMBER,
                json!({ "m.calls": calls }),
                user_id.as_str(),
                keep_alive,
            )
            .await
            .map_err(GroupCallError::Signalling)
    }

    /// Periodic advertisement refresh, re-publishing well before the
    /// expiry lapses. Runs until the call leaves `Entered`.
    pub(crate) fn spawn_refresh_task(self: &Arc<Self>) -> JoinHandle<()> {
        let this = Arc::downgrade(self);
        tokio::spawn(async move {
            let interval = Duration::from_millis((DEVICE_TIMEOUT_MS * 3 / 4) as u64);
            loop {
                tokio::time::sleep(interval).await;
                let Some(group_call) = this.upgrade() else {
                    break;
                };
                if !group_call.state().is_entered() {
                    break;
                }
                if let Err(err) = group_call.update_member_state().await {
                    warn!(
                        target: "GroupCall/Membership",
                        "Failed to refresh member state: {err}"
                    );
                }
            }
        })
    }
}
