mod common;

use duplex_core::adapters::call_events::RecordedEvent;
use duplex_core::adapters::loopback::peer_connection::LoopbackPeerConnection;
use duplex_core::adapters::loopback::signaling::InMemorySignalingHub;
use duplex_core::application::ports::PeerConnection;
use duplex_core::domain::identity::TrackOrigin;
use duplex_core::domain::media::MediaKind;
use duplex_core::domain::peer::{DataChannelConfig, IceCandidate, MediaConstraints, SdpType};
use duplex_core::domain::signal::SignalMessage;
use duplex_core::CallState;

use common::{count_of, descriptions_from, peer, wait_for, Peer, Scripted};

async fn running_pair(hub: &std::sync::Arc<InMemorySignalingHub>) -> (Peer, Peer) {
    let a = peer(hub, true).await;
    let b = peer(hub, true).await;
    a.manager.start_call(b.id, false).await.unwrap();
    wait_for("incoming call", || b.manager.state() == CallState::ReceivingRequest).await;
    b.manager.answer_call(false).await.unwrap();
    wait_for("both running", || {
        a.manager.state() == CallState::Running && b.manager.state() == CallState::Running
    })
    .await;
    (a, b)
}

fn candidate(n: u32) -> IceCandidate {
    IceCandidate {
        candidate: format!("candidate:{n} 1 udp 2122260223 10.0.0.{n} 4000{n} typ host"),
        sdp_mline_index: 0,
        sdp_mid: Some("0".into()),
    }
}

#[tokio::test]
async fn glare_polite_side_answers_impolite_offer() {
    let hub = InMemorySignalingHub::new();
    let a = peer(&hub, true).await;
    let b = peer(&hub, true).await;
    assert!(b.id > a.id, "b must be the polite side");

    // Both offers are in flight before either side sees the other's.
    hub.pause();
    a.manager.start_call(b.id, false).await.unwrap();
    b.manager.start_call(a.id, false).await.unwrap();
    hub.resume();

    wait_for("both running", || {
        a.manager.state() == CallState::Running && b.manager.state() == CallState::Running
    })
    .await;

    let from_a = descriptions_from(&hub, a.id);
    let from_b = descriptions_from(&hub, b.id);
    assert_eq!(count_of(&from_a, SdpType::Offer), 1);
    assert_eq!(count_of(&from_a, SdpType::Answer), 0);
    assert_eq!(count_of(&from_b, SdpType::Answer), 1);

    // Polite side applied the impolite offer.
    let a_offer = &from_a[0];
    assert_eq!(b.pc().remote_description().as_ref(), Some(a_offer));
    // Impolite side kept its own offer.
    assert_eq!(a.pc().local_description().as_ref(), Some(a_offer));

    assert_eq!(a.count(&RecordedEvent::PeerAccepted(b.id)), 1);
    assert_eq!(b.count(&RecordedEvent::PeerAccepted(a.id)), 1);
    assert!(!a.saw(&RecordedEvent::OfferReceived(b.id)));
}

#[tokio::test]
async fn early_candidates_are_applied_in_order_once() {
    let hub = InMemorySignalingHub::new();
    let b = peer(&hub, true).await;
    let remote = Scripted::connect(&hub).await;

    let caller = LoopbackPeerConnection::detached();
    caller.add_track(MediaKind::Audio, "remote-mic").unwrap();
    let offer = caller.create_offer(MediaConstraints::default()).await.unwrap();
    caller.set_local_description(offer.clone()).await.unwrap();

    remote.send(SignalMessage::Description(offer), b.id).await;
    for n in 1..=3 {
        remote.send(SignalMessage::Candidate(candidate(n)), b.id).await;
    }
    wait_for("incoming call", || b.manager.state() == CallState::ReceivingRequest).await;

    b.manager.answer_call(false).await.unwrap();
    wait_for("buffered candidates applied", || {
        b.pc().applied_remote_candidates().len() == 3
    })
    .await;
    assert_eq!(
        b.pc().applied_remote_candidates(),
        vec![candidate(1), candidate(2), candidate(3)]
    );

    // Once the gate is open new candidates go straight in.
    remote.send(SignalMessage::Candidate(candidate(4)), b.id).await;
    wait_for("late candidate", || {
        b.pc().applied_remote_candidates().len() == 4
    })
    .await;
    assert_eq!(b.pc().applied_remote_candidates()[3], candidate(4));
}

#[tokio::test]
async fn restart_answer_does_not_count_as_acceptance() {
    let hub = InMemorySignalingHub::new();
    let (a, b) = running_pair(&hub).await;
    let first_answer = b.pc().local_description().unwrap();

    a.manager.restart_ice().await.unwrap();
    wait_for("restart answered", || {
        count_of(&descriptions_from(&hub, b.id), SdpType::Answer) == 2
    })
    .await;
    let restart_answer = descriptions_from(&hub, b.id).pop().unwrap();
    wait_for("restart answer applied", || {
        a.pc().remote_description().as_ref() == Some(&restart_answer)
    })
    .await;

    assert_ne!(restart_answer, first_answer);
    assert_eq!(a.count(&RecordedEvent::PeerAccepted(b.id)), 1);
    assert_eq!(a.manager.state(), CallState::Running);
}

#[tokio::test]
async fn toggling_video_renegotiates() {
    let hub = InMemorySignalingHub::new();
    let (a, b) = running_pair(&hub).await;
    let offers_before = count_of(&descriptions_from(&hub, a.id), SdpType::Offer);

    a.manager.set_video_enabled(true).await.unwrap();
    wait_for("remote video", || {
        b.saw(&RecordedEvent::TrackAdded(TrackOrigin::Remote, MediaKind::Video))
    })
    .await;
    assert!(a.saw(&RecordedEvent::TrackAdded(TrackOrigin::Local, MediaKind::Video)));
    assert_eq!(
        count_of(&descriptions_from(&hub, a.id), SdpType::Offer),
        offers_before + 1
    );

    // Enabling again changes nothing and sends nothing.
    a.manager.set_video_enabled(true).await.unwrap();
    assert_eq!(
        count_of(&descriptions_from(&hub, a.id), SdpType::Offer),
        offers_before + 1
    );

    a.manager.set_video_enabled(false).await.unwrap();
    wait_for("remote video gone", || {
        b.saw(&RecordedEvent::TrackRemoved(TrackOrigin::Remote, MediaKind::Video))
    })
    .await;
    assert_eq!(a.pc().local_tracks(), vec![MediaKind::Audio]);
}

#[tokio::test]
async fn data_channel_reaches_remote() {
    let hub = InMemorySignalingHub::new();
    let (a, b) = running_pair(&hub).await;

    a.manager
        .open_data_channel("chat", DataChannelConfig::default())
        .await
        .unwrap();
    wait_for("data channel", || {
        b.saw(&RecordedEvent::DataChannelReceived("chat".into()))
    })
    .await;
    assert_eq!(a.pc().data_channels(), vec!["chat".to_string()]);

    let invalid = DataChannelConfig {
        max_packet_life_time: Some(100),
        max_retransmits: Some(3),
        ..DataChannelConfig::default()
    };
    assert!(a.manager.open_data_channel("bad", invalid).await.is_err());
}

#[tokio::test]
async fn busy_peer_rejects_second_caller() {
    let hub = InMemorySignalingHub::new();
    let (a, b) = running_pair(&hub).await;
    let mut intruder = Scripted::connect(&hub).await;

    let pc = LoopbackPeerConnection::detached();
    let offer = pc.create_offer(MediaConstraints::default()).await.unwrap();
    intruder.send(SignalMessage::Description(offer), b.id).await;

    wait_for("rejection", || intruder.received_end_call(b.id)).await;
    assert_eq!(b.manager.state(), CallState::Running);
    assert_eq!(b.manager.state(), a.manager.state());
}

#[tokio::test]
async fn stale_answer_while_idle_leaves_role_unset() {
    let hub = InMemorySignalingHub::new();
    let old = Scripted::connect(&hub).await;
    let a = peer(&hub, true).await;
    let c = peer(&hub, true).await;
    assert!(old.id < a.id && a.id < c.id);

    // A late answer from a call `a` is no longer part of. Coming from a
    // lower id it is flagged polite for `a`.
    let old_caller = LoopbackPeerConnection::detached();
    let offer = old_caller.create_offer(MediaConstraints::default()).await.unwrap();
    old_caller.set_local_description(offer.clone()).await.unwrap();
    let old_callee = LoopbackPeerConnection::detached();
    old_callee.set_remote_description(offer).await.unwrap();
    let answer = old_callee
        .create_answer(MediaConstraints::default())
        .await
        .unwrap();
    old.send(SignalMessage::Description(answer), a.id).await;
    old.send(SignalMessage::Candidate(candidate(7)), a.id).await;

    hub.pause();
    a.manager.start_call(c.id, false).await.unwrap();
    c.manager.start_call(a.id, false).await.unwrap();
    hub.resume();

    wait_for("both running", || {
        a.manager.state() == CallState::Running && c.manager.state() == CallState::Running
    })
    .await;

    // `a` stayed impolite towards `c` and kept its offer.
    let from_a = descriptions_from(&hub, a.id);
    let from_c = descriptions_from(&hub, c.id);
    assert_eq!(count_of(&from_a, SdpType::Offer), 1);
    assert_eq!(count_of(&from_a, SdpType::Answer), 0);
    assert_eq!(count_of(&from_c, SdpType::Answer), 1);
    assert_eq!(a.pc().local_description().as_ref(), Some(&from_a[0]));
    assert!(!a.pc().applied_remote_candidates().contains(&candidate(7)));
}

#[tokio::test]
async fn postponed_commit_negotiates_once_stable() {
    let hub = InMemorySignalingHub::new();
    let (a, b) = running_pair(&hub).await;
    let offers_before = count_of(&descriptions_from(&hub, a.id), SdpType::Offer);

    // Hold the restart offer so `a` sits in have-local-offer.
    hub.pause();
    a.manager.restart_ice().await.unwrap();
    a.manager.set_video_enabled(true).await.unwrap();
    assert_eq!(
        count_of(&descriptions_from(&hub, a.id), SdpType::Offer),
        offers_before + 1
    );

    hub.resume();
    wait_for("remote video", || {
        b.saw(&RecordedEvent::TrackAdded(TrackOrigin::Remote, MediaKind::Video))
    })
    .await;
    assert_eq!(
        count_of(&descriptions_from(&hub, a.id), SdpType::Offer),
        offers_before + 2
    );
    assert_eq!(a.manager.state(), CallState::Running);
}

#[tokio::test]
async fn collision_while_running_renegotiates_from_polite_side() {
    let hub = InMemorySignalingHub::new();
    let (a, b) = running_pair(&hub).await;
    assert!(b.id > a.id);

    hub.pause();
    a.manager.restart_ice().await.unwrap();
    b.manager.restart_ice().await.unwrap();
    hub.resume();

    // `b` answers the impolite offer, then offers again itself.
    wait_for("renegotiation answered", || {
        count_of(&descriptions_from(&hub, a.id), SdpType::Answer) == 1
    })
    .await;
    let from_a = descriptions_from(&hub, a.id);
    let from_b = descriptions_from(&hub, b.id);
    assert_eq!(count_of(&from_a, SdpType::Offer), 2);
    assert_eq!(count_of(&from_b, SdpType::Offer), 2);
    assert_eq!(count_of(&from_b, SdpType::Answer), 2);

    wait_for("renegotiation applied", || {
        b.pc().remote_description().as_ref() == from_a.last()
    })
    .await;
    assert_eq!(a.manager.state(), CallState::Running);
    assert_eq!(b.manager.state(), CallState::Running);
}
