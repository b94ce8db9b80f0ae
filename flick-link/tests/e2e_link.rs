use std::{sync::Arc, time::Duration};

use flick_core::{Command, SettingsRecord, WireMessage, encode_frame};
use flick_link::{
    ActivationState, DEFAULT_ACK_TIMEOUT, LinkError, LinkSession, SendOutcome,
    memory::{self, MemoryLinkControl, Side},
};
use futures::StreamExt;
use tokio::time::timeout;
use tokio_stream::wrappers::UnboundedReceiverStream;

struct Devices {
    companion: Arc<LinkSession>,
    primary: Arc<LinkSession>,
    control: MemoryLinkControl,
}

fn start_pair(ack_timeout: Duration) -> Devices {
    let pair = memory::pair();
    let companion = LinkSession::start(
        Arc::new(pair.companion),
        pair.companion_events,
        ack_timeout,
    );
    let primary = LinkSession::start(Arc::new(pair.primary), pair.primary_events, ack_timeout);
    Devices {
        companion,
        primary,
        control: pair.control,
    }
}

async fn wait_for_activation(session: &LinkSession) {
    let mut state = session.watch_state();
    timeout(
        Duration::from_secs(2),
        state.wait_for(|s| s.activation == ActivationState::Activated),
    )
    .await
    .expect("activation within timeout")
    .expect("state channel open");
}

async fn next_message(stream: &mut UnboundedReceiverStream<WireMessage>) -> Option<WireMessage> {
    timeout(Duration::from_millis(500), stream.next())
        .await
        .ok()
        .flatten()
}

#[tokio::test]
async fn send_before_activation_is_refused() {
    let devices = start_pair(DEFAULT_ACK_TIMEOUT);
    let err = devices
        .companion
        .send(&WireMessage::Command(Command::NextTrack))
        .unwrap_err();
    assert!(matches!(err, LinkError::NotActivated));
}

#[tokio::test]
async fn send_to_unreachable_peer_is_refused_immediately() {
    let devices = start_pair(DEFAULT_ACK_TIMEOUT);
    devices.control.set_reachable(false);
    devices.companion.activate();
    wait_for_activation(&devices.companion).await;

    assert!(!devices.companion.state().reachable);
    let err = devices
        .companion
        .send(&WireMessage::Command(Command::PlayPause))
        .unwrap_err();
    assert!(matches!(err, LinkError::Unreachable));
}

#[tokio::test]
async fn commands_arrive_in_send_order_and_are_acknowledged() {
    let devices = start_pair(DEFAULT_ACK_TIMEOUT);
    devices.companion.activate();
    devices.primary.activate();
    wait_for_activation(&devices.companion).await;
    wait_for_activation(&devices.primary).await;

    let mut inbound = devices.primary.subscribe().expect("first subscriber");
    let sent = [
        WireMessage::Command(Command::NextTrack),
        WireMessage::Settings(SettingsRecord {
            tutorial_completed: true,
            ..SettingsRecord::default()
        }),
        WireMessage::Command(Command::PreviousTrack),
        WireMessage::Command(Command::PlayPause),
    ];

    let mut pending = Vec::new();
    for message in &sent {
        pending.push(devices.companion.send(message).expect("gate open"));
    }
    for handle in pending {
        assert_eq!(handle.outcome().await, SendOutcome::Acknowledged);
    }

    for expected in &sent {
        let received = next_message(&mut inbound).await.expect("message delivered");
        assert_eq!(&received, expected);
    }
}

#[tokio::test]
async fn activate_is_idempotent() {
    let devices = start_pair(DEFAULT_ACK_TIMEOUT);
    devices.primary.activate();
    devices.primary.activate();
    wait_for_activation(&devices.primary).await;
    devices.primary.activate();
    assert_eq!(
        devices.primary.state().activation,
        ActivationState::Activated
    );
}

#[tokio::test]
async fn inbound_stream_has_a_single_subscriber() {
    let devices = start_pair(DEFAULT_ACK_TIMEOUT);
    let _first = devices.primary.subscribe().expect("first subscriber");
    assert!(matches!(
        devices.primary.subscribe(),
        Err(LinkError::AlreadySubscribed)
    ));
}

#[tokio::test(start_paused = true)]
async fn slow_transport_resolves_to_send_failed_after_ack_timeout() {
    let devices = start_pair(Duration::from_millis(300));
    devices.companion.activate();
    devices.primary.activate();
    wait_for_activation(&devices.companion).await;

    devices.control.set_delivery_delay(Duration::from_secs(30));
    let handle = devices
        .companion
        .send(&WireMessage::Command(Command::NextTrack))
        .expect("gate open");

    let outcome = timeout(Duration::from_secs(1), handle.outcome())
        .await
        .expect("outcome resolves within bounded period");
    assert!(matches!(outcome, SendOutcome::SendFailed(_)));
}

#[tokio::test]
async fn transport_error_surfaces_as_send_failed() {
    let devices = start_pair(DEFAULT_ACK_TIMEOUT);
    devices.companion.activate();
    devices.primary.activate();
    wait_for_activation(&devices.companion).await;

    devices.control.set_failure(Some("watch app not installed"));
    let handle = devices
        .companion
        .send(&WireMessage::Command(Command::PlayPause))
        .expect("gate open");
    assert_eq!(
        handle.outcome().await,
        SendOutcome::SendFailed("watch app not installed".to_owned())
    );
}

#[tokio::test]
async fn reachability_events_update_state() {
    let devices = start_pair(DEFAULT_ACK_TIMEOUT);
    devices.primary.activate();
    wait_for_activation(&devices.primary).await;
    assert!(devices.primary.state().reachable);

    let mut state = devices.primary.watch_state();
    devices.control.set_reachable(false);
    timeout(Duration::from_secs(1), state.wait_for(|s| !s.reachable))
        .await
        .expect("reachability update")
        .expect("state channel open");

    let err = devices
        .primary
        .send(&WireMessage::Command(Command::NextTrack))
        .unwrap_err();
    assert!(matches!(err, LinkError::Unreachable));
}

#[tokio::test]
async fn deactivated_session_reactivates_automatically() {
    let devices = start_pair(DEFAULT_ACK_TIMEOUT);
    devices.companion.activate();
    devices.primary.activate();
    wait_for_activation(&devices.companion).await;
    wait_for_activation(&devices.primary).await;

    devices.control.make_inactive(Side::Primary);
    devices.control.deactivate(Side::Primary);
    tokio::time::sleep(Duration::from_millis(50)).await;
    wait_for_activation(&devices.primary).await;

    // Delivery only succeeds once the primary side has re-activated.
    let handle = devices
        .companion
        .send(&WireMessage::Command(Command::NextTrack))
        .expect("gate open");
    assert_eq!(handle.outcome().await, SendOutcome::Acknowledged);
}

#[tokio::test]
async fn malformed_frames_are_dropped_without_breaking_the_stream() {
    let devices = start_pair(DEFAULT_ACK_TIMEOUT);
    devices.primary.activate();
    wait_for_activation(&devices.primary).await;
    let mut inbound = devices.primary.subscribe().expect("subscriber");

    devices.control.inject_raw(Side::Primary, vec![1, 2, 3]);
    let mut wrong_version = encode_frame(&WireMessage::Command(Command::NextTrack)).unwrap();
    wrong_version[4] = 42;
    devices.control.inject_raw(Side::Primary, wrong_version);
    let valid = encode_frame(&WireMessage::Command(Command::PlayPause)).unwrap();
    devices.control.inject_raw(Side::Primary, valid);

    assert_eq!(
        next_message(&mut inbound).await,
        Some(WireMessage::Command(Command::PlayPause))
    );
}
