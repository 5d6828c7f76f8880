//! Derives the authoritative participant view from room state.
//!
//! The view maps each joined member to the devices it currently advertises
//! for this call. It is recomputed on every room-state update and whenever
//! the earliest advertisement would expire, and committed (with a
//! `ParticipantsChanged` emission) only when its structural value changed.

use crate::group_call::{now_ms, GroupCall, Inner};
use crate::traits::{Membership, Room};
use crate::types::events::ParticipantsChanged;
use crate::types::ids::{DeviceId, GroupCallId, SessionId, UserId};
use crate::types::member::{
    DeviceAdvertisement, MemberCallsContent, EVENT_TYPE_GROUP_CALL_MEMBER,
};
use log::debug;
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

/// Per-device participation state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParticipantState {
    pub session_id: SessionId,
    pub screensharing: bool,
}

/// Ordered mapping of member to advertised devices. Inner maps are never
/// empty and never contain expired devices.
pub type ParticipantView = BTreeMap<UserId, BTreeMap<DeviceId, ParticipantState>>;

pub(crate) struct LocalParticipant<'a> {
    pub user_id: &'a UserId,
    pub device_id: &'a DeviceId,
    pub session_id: &'a SessionId,
    /// True when state is `Entered` or the call was entered from another
    /// session of ours.
    pub considered_entered: bool,
    pub screensharing: bool,
}

pub(crate) struct ParticipantComputation {
    pub view: ParticipantView,
    /// Earliest `expires_ts` among valid devices, if any: when it lapses
    /// the view must be recomputed.
    pub next_expiry: Option<i64>,
}

pub(crate) fn compute_participants(
    room: &dyn Room,
    group_call_id: &GroupCallId,
    local: LocalParticipant<'_>,
    now_ms: i64,
) -> ParticipantComputation {
    let mut view = ParticipantView::new();
    let mut next_expiry: Option<i64> = None;

    for event in room.get_state_events(EVENT_TYPE_GROUP_CALL_MEMBER) {
        let member_id = UserId::new(event.state_key.clone());
        let Ok(content) = serde_json::from_value::<MemberCallsContent>(event.content) else {
            continue;
        };
        let Some(entry) = content
            .calls
            .iter()
            .find(|e| MemberCallsContent::entry_call_id(e) == Some(group_call_id.as_str()))
        else {
            continue;
        };
        let Some(devices) = entry.get("m.devices").and_then(|d| d.as_array()) else {
            continue;
        };

        let mut inner = BTreeMap::new();
        for raw in devices {
            let Some(advert) = DeviceAdvertisement::parse_valid(raw, now_ms) else {
                continue;
            };
            next_expiry = Some(match next_expiry {
                Some(current) => current.min(advert.expires_ts),
                None => advert.expires_ts,
            });
            // Local echo suppression: our own device only counts once we
            // are actually in the call.
            if member_id == *local.user_id
                && advert.device_id == local.device_id.as_str()
                && !local.considered_entered
            {
                continue;
            }
            inner.insert(
                DeviceId::new(advert.device_id.clone()),
                ParticipantState {
                    session_id: SessionId::new(advert.session_id.clone()),
                    screensharing: advert.is_screensharing(),
                },
            );
        }
        if inner.is_empty() {
            continue;
        }
        let is_joined = room
            .get_member(&member_id)
            .is_some_and(|m| m.membership == Membership::Join);
        if !is_joined {
            continue;
        }
        view.insert(member_id, inner);
    }

    if local.considered_entered {
        view.entry(local.user_id.clone())
            .or_default()
            .entry(local.device_id.clone())
            .or_insert_with(|| ParticipantState {
                session_id: local.session_id.clone(),
                screensharing: local.screensharing,
            });
    }

    ParticipantComputation { view, next_expiry }
}

impl GroupCall {
    /// Recompute the participant view from room state. Emits
    /// `ParticipantsChanged` only when the view actually changed, and
    /// triggers a reconciliation pass while entered.
    pub async fn update_participants(self: &Arc<Self>) {
        let mut inner = self.inner.lock().await;
        self.update_participants_locked(&mut inner).await;
    }

    /// Type-erased form of [`update_participants`] for use at recursive
    /// call sites (the participant-expiry timer re-invokes this once it
    /// fires). Boxing here keeps the opaque future graph from folding back
    /// on itself, which otherwise defeats the `Send` check on the spawned
    /// task.
    pub(crate) fn update_participants_boxed(
        self: Arc<Self>,
    ) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(async move { self.update_participants().await })
    }

    pub(crate) async fn update_participants_locked(self: &Arc<Self>, inner: &mut Inner) {
        let now = now_ms();
        let local_user_id = self.client.user_id();
        let local_device_id = self.client.device_id();
        let local_session_id = self.client.session_id();
        let computed = compute_participants(
            &*self.room,
            self.group_call_id(),
            LocalParticipant {
                user_id: &local_user_id,
                device_id: &local_device_id,
                session_id: &local_session_id,
                considered_entered: self.considered_entered(),
                screensharing: inner.local_screenshare_feed.is_some(),
            },
            now,
        );

        // One expiration timer, re-armed to the earliest advertisement
        // lapse on every pass.
        if let Some(task) = inner.tasks.participant_expiry.take() {
            task.abort();
        }
        if let Some(expiry) = computed.next_expiry {
            let this = Arc::downgrade(self);
            inner.tasks.participant_expiry = Some(tokio::spawn(async move {
                let wait = (expiry - now_ms()).max(0) as u64;
                tokio::time::sleep(Duration::from_millis(wait)).await;
                if let Some(group_call) = this.upgrade() {
                    group_call.update_participants_boxed().await;
                }
            }));
        }

        if computed.view == inner.participants {
            return;
        }
        debug!(
            target: "GroupCall/Participants",
            "Participant view changed: {} members",
            computed.view.len()
        );
        inner.participants = computed.view.clone();
        let _ = self
            .events
            .participants_changed
            .send(Arc::new(ParticipantsChanged {
                participants: computed.view,
            }));

        if self.state().is_entered() {
            self.place_outgoing_calls_locked(inner).await;
        }
    }
}
