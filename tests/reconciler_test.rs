//! Call-graph reconciliation scenarios driven through mock collaborators.

use matrix_groupcall::feed::CallFeed;
use matrix_groupcall::test_utils::{create_test_group_call, create_test_group_call_as, MockCall, MockStream, TestContext};
use matrix_groupcall::traits::{Call, CallHangupReason, CallState};
use matrix_groupcall::types::ids::{DeviceId, SessionId, UserId};
use matrix_groupcall::types::member::FeedPurpose;
use matrix_groupcall::GroupCallErrorCode;
use serde_json::json;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

fn advert(device_id: &str, session_id: &str) -> serde_json::Value {
    json!({
        "device_id": device_id,
        "session_id": session_id,
        "expires_ts": chrono::Utc::now().timestamp_millis() + 3_600_000,
        "feeds": [{"purpose": "m.usermedia"}],
    })
}

fn member_content(devices: Vec<serde_json::Value>) -> serde_json::Value {
    json!({ "m.calls": [{ "m.call_id": "G", "m.devices": devices }] })
}

async fn advertise(ctx: &TestContext, user_id: &str, devices: Vec<serde_json::Value>) {
    ctx.room.join(&UserId::new(user_id));
    ctx.room.set_member_state(user_id, member_content(devices));
    ctx.group_call.update_participants().await;
}

/// S1: two-party voice call where the local side places.
#[tokio::test]
async fn test_local_side_places_call_to_greater_user() {
    let ctx = create_test_group_call_as("@a:h", "DA", |_| {}).await;
    let mut calls_rx = ctx.group_call.events.calls_changed.subscribe();

    advertise(&ctx, "@b:h", vec![advert("DB", "s1")]).await;
    ctx.group_call.enter().await.unwrap();

    let created = ctx.factory.created_calls();
    assert_eq!(created.len(), 1);
    let call = &created[0];
    assert_eq!(call.invitee(), Some(UserId::new("@b:h")));
    assert_eq!(call.opponent_device_id(), Some(DeviceId::new("DB")));
    assert_eq!(call.opponent_session_id(), Some(SessionId::new("s1")));
    assert_eq!(
        call.group_call_id(),
        Some(matrix_groupcall::GroupCallId::new("G"))
    );

    let placements = call.placements.lock().unwrap().clone();
    assert_eq!(placements.len(), 1);
    let (feeds, remote_screensharing) = &placements[0];
    assert_eq!(feeds.len(), 1, "one clone of the local feed");
    assert_eq!(feeds[0].purpose(), FeedPurpose::Usermedia);
    assert!(!remote_screensharing);

    // Exactly one CallsChanged for the whole pass.
    let event = calls_rx.try_recv().unwrap();
    assert_eq!(event.calls.len(), 1);
    assert!(calls_rx.try_recv().is_err());

    let slot = ctx
        .group_call
        .get_call_by_user_and_device(&UserId::new("@b:h"), &DeviceId::new("DB"))
        .await
        .unwrap();
    assert_eq!(slot.call_id(), call.call_id());
}

/// S2: the lesser side must not place, and accepts the inbound call.
#[tokio::test]
async fn test_lesser_side_waits_and_accepts_incoming() {
    let ctx = create_test_group_call_as("@z:h", "D1", |_| {}).await;
    advertise(&ctx, "@a:h", vec![advert("D9", "s1")]).await;
    ctx.group_call.enter().await.unwrap();

    assert!(
        ctx.factory.created_calls().is_empty(),
        "\"@a:h\" < \"@z:h\": remote side places"
    );

    let incoming = MockCall::new("in-1", "!room:h", Some("G"), Some("@a:h"), Some("D9"), Some("s1"));
    let mut calls_rx = ctx.group_call.events.calls_changed.subscribe();
    ctx.client.deliver_incoming_call(incoming.clone());

    let event = tokio::time::timeout(Duration::from_secs(5), calls_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.calls.len(), 1);
    assert_eq!(incoming.answers.lock().unwrap().len(), 1);
    assert!(ctx
        .group_call
        .get_call_by_user_and_device(&UserId::new("@a:h"), &DeviceId::new("D9"))
        .await
        .is_some());
}

/// S3: a new advertised session replaces the existing call.
#[tokio::test]
async fn test_new_session_replaces_existing_call() {
    let ctx = create_test_group_call_as("@a:h", "DA", |_| {}).await;
    advertise(&ctx, "@b:h", vec![advert("DB", "s1")]).await;
    ctx.group_call.enter().await.unwrap();
    let call1 = ctx.factory.last_created().unwrap();

    let mut calls_rx = ctx.group_call.events.calls_changed.subscribe();
    advertise(&ctx, "@b:h", vec![advert("DB", "s2")]).await;

    let hangups = call1.hangups.lock().unwrap().clone();
    assert_eq!(hangups.len(), 1);
    assert_eq!(hangups[0].0, CallHangupReason::NewSession);

    let created = ctx.factory.created_calls();
    assert_eq!(created.len(), 2);
    let call2 = &created[1];
    assert_eq!(call2.opponent_session_id(), Some(SessionId::new("s2")));
    assert_eq!(call2.placement_count(), 1);

    // One CallsChanged for dispose + place.
    assert!(calls_rx.try_recv().is_ok());
    assert!(calls_rx.try_recv().is_err());

    let slot = ctx
        .group_call
        .get_call_by_user_and_device(&UserId::new("@b:h"), &DeviceId::new("DB"))
        .await
        .unwrap();
    assert_eq!(slot.call_id(), call2.call_id());
}

/// Matching session is left alone on recompute.
#[tokio::test]
async fn test_matching_session_not_replaced() {
    let ctx = create_test_group_call_as("@a:h", "DA", |_| {}).await;
    advertise(&ctx, "@b:h", vec![advert("DB", "s1")]).await;
    ctx.group_call.enter().await.unwrap();
    assert_eq!(ctx.factory.created_calls().len(), 1);

    // Same session advertised again plus an unrelated change.
    advertise(&ctx, "@c:h", vec![advert("DC", "s9")]).await;
    let created = ctx.factory.created_calls();
    assert_eq!(created.len(), 2, "only the new participant gets a call");
    assert_eq!(created[0].placement_count(), 1);
}

/// S4: retry cap, then counter reset on a connection.
#[tokio::test(start_paused = true)]
async fn test_retry_cap_and_reset_on_connected() {
    let ctx = create_test_group_call_as("@a:h", "DA", |_| {}).await;
    ctx.factory.fail_all_placements.store(true, Ordering::SeqCst);
    advertise(&ctx, "@b:h", vec![advert("DB", "s1")]).await;
    ctx.group_call.enter().await.unwrap();
    assert_eq!(ctx.factory.created_calls().len(), 1, "initial attempt failed");

    // Three retry ticks attempt with budget 1..=3.
    for _ in 0..3 {
        tokio::time::advance(Duration::from_millis(5100)).await;
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }
    assert_eq!(ctx.factory.created_calls().len(), 4);

    // Budget exhausted: further ticks stop attempting.
    for _ in 0..3 {
        tokio::time::advance(Duration::from_millis(5100)).await;
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }
    assert_eq!(ctx.factory.created_calls().len(), 4);

    // A session change bypasses the retry budget and, once the call
    // connects, the counter clears.
    ctx.factory.fail_all_placements.store(false, Ordering::SeqCst);
    advertise(&ctx, "@b:h", vec![advert("DB", "s2")]).await;
    assert_eq!(ctx.factory.created_calls().len(), 5);
    let call = ctx.factory.last_created().unwrap();
    call.emit_state(CallState::Connected);
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }

    // Slot freed again: the cleared counter allows retries once more.
    call.emit_hangup(CallHangupReason::SignallingFailed);
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
    ctx.factory.fail_all_placements.store(true, Ordering::SeqCst);
    tokio::time::advance(Duration::from_millis(5100)).await;
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
    assert_eq!(
        ctx.factory.created_calls().len(),
        6,
        "retry ran with a fresh budget after the connection"
    );
}

/// Placement failure frees the slot and surfaces the right error code.
#[tokio::test]
async fn test_placement_failure_emits_error_and_frees_slot() {
    let ctx = create_test_group_call_as("@a:h", "DA", |_| {}).await;
    ctx.factory.fail_all_placements.store(true, Ordering::SeqCst);
    let mut error_rx = ctx.group_call.events.error.subscribe();

    advertise(&ctx, "@b:h", vec![advert("DB", "s1")]).await;
    ctx.group_call.enter().await.unwrap();

    let error = error_rx.try_recv().unwrap();
    assert_eq!(error.code, GroupCallErrorCode::PlaceCallFailed);

    let call = ctx.factory.last_created().unwrap();
    let hangups = call.hangups.lock().unwrap().clone();
    assert_eq!(hangups[0].0, CallHangupReason::SignallingFailed);
    assert!(ctx.group_call.calls().await.is_empty(), "slot freed");
}

#[tokio::test]
async fn test_unknown_device_failure_surfaced_verbatim() {
    let ctx = create_test_group_call_as("@a:h", "DA", |_| {}).await;
    ctx.factory.unknown_device_failures.lock().unwrap().push_back(());
    let mut error_rx = ctx.group_call.events.error.subscribe();

    advertise(&ctx, "@b:h", vec![advert("DB", "s1")]).await;
    ctx.group_call.enter().await.unwrap();

    let error = error_rx.try_recv().unwrap();
    assert_eq!(error.code, GroupCallErrorCode::UnknownDevice);
    assert!(error.message.contains("no such device"), "{}", error.message);
}

#[tokio::test]
async fn test_incoming_for_other_group_call_rejected() {
    let ctx = create_test_group_call().await;
    ctx.group_call.enter().await.unwrap();

    let foreign = MockCall::new("in-1", "!room:h", Some("H"), Some("@a:h"), Some("D9"), Some("s1"));
    ctx.client.deliver_incoming_call(foreign.clone());
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
    assert!(foreign.rejected.load(Ordering::SeqCst));
    assert!(ctx.group_call.calls().await.is_empty());
}

#[tokio::test]
async fn test_incoming_not_ringing_or_wrong_room_ignored() {
    let ctx = create_test_group_call().await;
    ctx.group_call.enter().await.unwrap();

    let wrong_room = MockCall::new("in-1", "!other:h", Some("G"), Some("@a:h"), Some("D9"), Some("s1"));
    let not_ringing = MockCall::new("in-2", "!room:h", Some("G"), Some("@a:h"), Some("D9"), Some("s1"));
    not_ringing.set_call_state(CallState::Connecting);

    ctx.client.deliver_incoming_call(wrong_room.clone());
    ctx.client.deliver_incoming_call(not_ringing.clone());
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
    assert!(!wrong_room.rejected.load(Ordering::SeqCst));
    assert!(wrong_room.answers.lock().unwrap().is_empty());
    assert!(not_ringing.answers.lock().unwrap().is_empty());
    assert!(ctx.group_call.calls().await.is_empty());
}

#[tokio::test]
async fn test_duplicate_incoming_delivery_ignored() {
    let ctx = create_test_group_call_as("@z:h", "D1", |_| {}).await;
    ctx.group_call.enter().await.unwrap();

    let incoming = MockCall::new("in-1", "!room:h", Some("G"), Some("@a:h"), Some("D9"), Some("s1"));
    ctx.client.deliver_incoming_call(incoming.clone());
    ctx.client.deliver_incoming_call(incoming.clone());
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
    assert_eq!(incoming.answers.lock().unwrap().len(), 1);
    assert_eq!(ctx.group_call.calls().await.len(), 1);
}

#[tokio::test]
async fn test_incoming_replaces_different_call_in_slot() {
    let ctx = create_test_group_call_as("@z:h", "D1", |_| {}).await;
    ctx.group_call.enter().await.unwrap();

    let first = MockCall::new("in-1", "!room:h", Some("G"), Some("@a:h"), Some("D9"), Some("s1"));
    let second = MockCall::new("in-2", "!room:h", Some("G"), Some("@a:h"), Some("D9"), Some("s1"));
    ctx.client.deliver_incoming_call(first.clone());
    ctx.client.deliver_incoming_call(second.clone());
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }

    let hangups = first.hangups.lock().unwrap().clone();
    assert_eq!(hangups.len(), 1);
    assert_eq!(hangups[0].0, CallHangupReason::Replaced);
    let slot = ctx
        .group_call
        .get_call_by_user_and_device(&UserId::new("@a:h"), &DeviceId::new("D9"))
        .await
        .unwrap();
    assert_eq!(slot.call_id(), "in-2");
}

#[tokio::test]
async fn test_hangup_removes_call_from_graph() {
    let ctx = create_test_group_call_as("@a:h", "DA", |_| {}).await;
    advertise(&ctx, "@b:h", vec![advert("DB", "s1")]).await;
    ctx.group_call.enter().await.unwrap();
    let call = ctx.factory.last_created().unwrap();
    assert_eq!(ctx.group_call.calls().await.len(), 1);

    let mut calls_rx = ctx.group_call.events.calls_changed.subscribe();
    call.emit_hangup(CallHangupReason::UserHangup);
    let event = tokio::time::timeout(Duration::from_secs(5), calls_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(event.calls.is_empty());
    assert!(ctx.group_call.calls().await.is_empty());
}

/// A hangup whose reason is `Replaced` leaves the slot to the replace
/// callback.
#[tokio::test]
async fn test_hangup_with_replaced_reason_keeps_slot() {
    let ctx = create_test_group_call_as("@a:h", "DA", |_| {}).await;
    advertise(&ctx, "@b:h", vec![advert("DB", "s1")]).await;
    ctx.group_call.enter().await.unwrap();
    let call = ctx.factory.last_created().unwrap();

    call.emit_hangup(CallHangupReason::Replaced);
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
    assert_eq!(ctx.group_call.calls().await.len(), 1, "slot untouched");
}

#[tokio::test]
async fn test_replaced_event_swaps_call_in_slot() {
    let ctx = create_test_group_call_as("@a:h", "DA", |_| {}).await;
    advertise(&ctx, "@b:h", vec![advert("DB", "s1")]).await;
    ctx.group_call.enter().await.unwrap();
    let call1 = ctx.factory.last_created().unwrap();

    let call2 = MockCall::new("repl-1", "!room:h", Some("G"), Some("@b:h"), Some("DB"), Some("s1"));
    let mut calls_rx = ctx.group_call.events.calls_changed.subscribe();
    call1.emit_replaced(call2.clone());

    let event = tokio::time::timeout(Duration::from_secs(5), calls_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.calls.len(), 1);
    let slot = ctx
        .group_call
        .get_call_by_user_and_device(&UserId::new("@b:h"), &DeviceId::new("DB"))
        .await
        .unwrap();
    assert_eq!(slot.call_id(), "repl-1");

    // Events from the replacement call are now routed.
    call2.emit_hangup(CallHangupReason::UserHangup);
    let event = tokio::time::timeout(Duration::from_secs(5), calls_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(event.calls.is_empty());
}

fn remote_feed(user: &str, device: &str, purpose: FeedPurpose) -> Arc<CallFeed> {
    CallFeed::new(
        UserId::new(user),
        DeviceId::new(device),
        purpose,
        MockStream::audio_only(),
        false,
        false,
        false,
    )
}

#[tokio::test]
async fn test_remote_feed_diff_add_replace_remove() {
    let ctx = create_test_group_call_as("@a:h", "DA", |_| {}).await;
    advertise(&ctx, "@b:h", vec![advert("DB", "s1")]).await;
    ctx.group_call.enter().await.unwrap();
    let call = ctx.factory.last_created().unwrap();
    let mut feeds_rx = ctx.group_call.events.user_media_feeds_changed.subscribe();

    // absent -> present
    let feed_a = remote_feed("@b:h", "DB", FeedPurpose::Usermedia);
    call.set_remote_usermedia_feed(Some(feed_a.clone()));
    let event = tokio::time::timeout(Duration::from_secs(5), feeds_rx.recv())
        .await
        .unwrap()
        .unwrap();
    // Local feed plus the new remote one.
    assert_eq!(event.feeds.len(), 2);

    // present -> present (different object)
    let feed_b = remote_feed("@b:h", "DB", FeedPurpose::Usermedia);
    call.set_remote_usermedia_feed(Some(feed_b.clone()));
    tokio::time::timeout(Duration::from_secs(5), feeds_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(feed_a.is_disposed(), "replaced feed disposed");
    let feeds = ctx.group_call.user_media_feeds().await;
    assert!(feeds.iter().any(|f| Arc::ptr_eq(f, &feed_b)));

    // present -> absent
    call.set_remote_usermedia_feed(None);
    let event = tokio::time::timeout(Duration::from_secs(5), feeds_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.feeds.len(), 1, "only the local feed remains");
    assert!(feed_b.is_disposed());
}

#[tokio::test]
async fn test_remote_screenshare_feed_diff() {
    let ctx = create_test_group_call_as("@a:h", "DA", |_| {}).await;
    advertise(&ctx, "@b:h", vec![advert("DB", "s1")]).await;
    ctx.group_call.enter().await.unwrap();
    let call = ctx.factory.last_created().unwrap();
    let mut feeds_rx = ctx.group_call.events.screenshare_feeds_changed.subscribe();

    let feed = remote_feed("@b:h", "DB", FeedPurpose::Screenshare);
    call.set_remote_screensharing_feed(Some(feed.clone()));
    let event = tokio::time::timeout(Duration::from_secs(5), feeds_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.feeds.len(), 1);

    call.set_remote_screensharing_feed(None);
    let event = tokio::time::timeout(Duration::from_secs(5), feeds_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(event.feeds.is_empty());
}

/// Our mute bits are pushed into calls whose state disagrees.
#[tokio::test]
async fn test_mute_state_pushed_on_call_state_change() {
    let ctx = create_test_group_call_as("@a:h", "DA", |_| {}).await;
    advertise(&ctx, "@b:h", vec![advert("DB", "s1")]).await;
    ctx.group_call.enter().await.unwrap();
    assert!(ctx.group_call.set_microphone_muted(true).await);

    let call = ctx.factory.last_created().unwrap();
    call.mic_muted.store(false, Ordering::SeqCst);
    call.emit_state(CallState::Connecting);
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
    assert!(call.mic_muted.load(Ordering::SeqCst), "local mute bit pushed");
}

/// The graph never calls our own device even though it appears in the
/// participant view.
#[tokio::test]
async fn test_local_device_never_called() {
    let ctx = create_test_group_call_as("@a:h", "DA", |_| {}).await;
    ctx.group_call.enter().await.unwrap();
    assert!(ctx.group_call.has_local_participant().await);
    assert!(ctx.factory.created_calls().is_empty());
}

/// Data channels are created with the configured options once placement
/// succeeds.
#[tokio::test]
async fn test_data_channel_created_when_enabled() {
    let ctx = create_test_group_call_as("@a:h", "DA", |config| {
        config.data_channels_enabled = true;
    })
    .await;
    advertise(&ctx, "@b:h", vec![advert("DB", "s1")]).await;
    ctx.group_call.enter().await.unwrap();

    let call = ctx.factory.last_created().unwrap();
    let channels = call.data_channels.lock().unwrap().clone();
    assert_eq!(channels.len(), 1);
    assert_eq!(channels[0].0, "datachannel");
}

/// Calls already live on the client when we enter are admitted like
/// fresh incoming ones.
#[tokio::test]
async fn test_active_client_calls_admitted_on_enter() {
    let ctx = create_test_group_call_as("@z:h", "D1", |_| {}).await;
    let existing = MockCall::new("pre-1", "!room:h", Some("G"), Some("@a:h"), Some("D9"), Some("s1"));
    ctx.client
        .active
        .lock()
        .unwrap()
        .push(existing.clone());

    ctx.group_call.enter().await.unwrap();
    assert_eq!(existing.answers.lock().unwrap().len(), 1);
    assert!(ctx
        .group_call
        .get_call_by_user_and_device(&UserId::new("@a:h"), &DeviceId::new("D9"))
        .await
        .is_some());
}

/// The remote-screensharing hint comes from the participant state.
#[tokio::test]
async fn test_placement_carries_screensharing_hint() {
    let ctx = create_test_group_call_as("@a:h", "DA", |_| {}).await;
    ctx.room.join(&UserId::new("@b:h"));
    ctx.room.set_member_state(
        "@b:h",
        json!({ "m.calls": [{ "m.call_id": "G", "m.devices": [json!({
            "device_id": "DB",
            "session_id": "s1",
            "expires_ts": chrono::Utc::now().timestamp_millis() + 3_600_000,
            "feeds": [{"purpose": "m.usermedia"}, {"purpose": "m.screenshare"}],
        })] }] }),
    );
    ctx.group_call.update_participants().await;
    ctx.group_call.enter().await.unwrap();

    let call = ctx.factory.last_created().unwrap();
    let placements = call.placements.lock().unwrap().clone();
    assert!(placements[0].1, "remote is screensharing");
}
