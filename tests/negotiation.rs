mod common;

use std::time::Duration;

use common::{settle, TestRoom};
use meshlink::config::EngineConfig;
use meshlink::events::EngineEvent;
use meshlink::media::peer::NegotiationState;
use meshlink::media::source::SyntheticCapture;
use meshlink::media::{TrackKind, TrackSource};
use meshlink::roster::Roster;
use meshlink::signal::{IceCandidate, ParticipantId, SignalKind};

#[tokio::test]
async fn greater_id_offers_when_it_joins_last() {
    let room = TestRoom::new();
    let a = room.join("alice-1").await;
    let b = room.join("bob-1").await;

    a.wait_stable(1).await;
    b.wait_stable(1).await;

    assert_eq!(room.count(SignalKind::Offer, "bob-1", Some("alice-1")).await, 1);
    assert_eq!(room.count(SignalKind::Offer, "alice-1", None).await, 0);
    assert_eq!(room.count(SignalKind::Answer, "alice-1", Some("bob-1")).await, 1);
}

#[tokio::test]
async fn greater_id_offers_when_it_joins_first() {
    let room = TestRoom::new();
    let b = room.join("bob-1").await;
    let a = room.join("alice-1").await;

    a.wait_stable(1).await;
    b.wait_stable(1).await;

    assert_eq!(room.count(SignalKind::Offer, "bob-1", Some("alice-1")).await, 1);
    assert_eq!(room.count(SignalKind::Offer, "alice-1", None).await, 0);
}

#[tokio::test]
async fn ensuring_a_connection_twice_sends_one_offer() {
    let room = TestRoom::new();
    room.roster.join("a".into()).await;
    let b = room.join("b").await;
    b.wait_for(|s| s.links.iter().any(|l| l.state == NegotiationState::Offering))
        .await;

    b.handle.connect("a".into()).await.unwrap();
    b.handle.connect("a".into()).await.unwrap();
    settle().await;

    assert_eq!(room.count(SignalKind::Offer, "b", Some("a")).await, 1);
    assert_eq!(b.factory.created().len(), 1);
}

#[tokio::test]
async fn early_answer_is_queued_and_applied_once() {
    let room = TestRoom::new();
    // Two copies arrive before b has even heard of a
    room.send_answer("a", "b").await;
    room.send_answer("a", "b").await;

    let mut b = room.join("b").await;
    settle().await;
    assert!(b.handle.state().links.is_empty());

    room.roster.join("a".into()).await;
    let state = b.wait_stable(1).await;
    assert_eq!(state.links[0].peer_id, ParticipantId::from("a"));
    assert_eq!(room.count(SignalKind::Offer, "b", Some("a")).await, 1);

    b.expect_event(|e| matches!(e, EngineEvent::PeerConnected { .. }))
        .await;
    // A second application would have failed and torn the link down
    settle().await;
    assert_eq!(b.handle.state().stable_links(), 1);
}

#[tokio::test]
async fn toggling_audio_and_video_never_renegotiates() {
    let room = TestRoom::new();
    let a = room.join("a").await;
    let b = room.join("b").await;
    a.wait_stable(1).await;
    b.wait_stable(1).await;
    let offers = room.total(SignalKind::Offer).await;
    let answers = room.total(SignalKind::Answer).await;

    b.handle.set_audio_enabled(false).await.unwrap();
    b.handle.set_video_enabled(false).await.unwrap();
    b.wait_for(|s| !s.audio_enabled && !s.video_enabled).await;
    b.handle.set_video_enabled(true).await.unwrap();
    b.wait_for(|s| s.video_enabled).await;
    settle().await;

    assert_eq!(room.total(SignalKind::Offer).await, offers);
    assert_eq!(room.total(SignalKind::Answer).await, answers);

    let conn = b.connection_to("a");
    assert!(!conn.sending(TrackKind::Audio).unwrap().is_enabled());
    assert!(conn.sending(TrackKind::Video).unwrap().is_enabled());
    assert_eq!(conn.replacements(), 0);
}

#[tokio::test]
async fn screen_share_round_trip_restores_camera_on_every_link() {
    let room = TestRoom::new();
    let p1 = room.join("p1").await;
    let p2 = room.join("p2").await;
    let p3 = room.join("p3").await;
    for p in [&p1, &p2, &p3] {
        p.wait_stable(2).await;
    }
    let offers = room.total(SignalKind::Offer).await;

    p2.handle.start_screen_share().await.unwrap();
    assert!(p2.handle.state().screen_sharing);
    for peer in ["p1", "p3"] {
        let video = p2.connection_to(peer).sending(TrackKind::Video).unwrap();
        assert_eq!(video.source(), TrackSource::Screen);
    }

    p2.handle.stop_screen_share().await.unwrap();
    p2.wait_for(|s| !s.screen_sharing).await;
    for peer in ["p1", "p3"] {
        let conn = p2.connection_to(peer);
        assert_eq!(conn.sending(TrackKind::Video).unwrap().source(), TrackSource::Camera);
        assert_eq!(conn.replacements(), 2);
    }

    settle().await;
    assert_eq!(room.total(SignalKind::Offer).await, offers);
}

#[tokio::test]
async fn externally_ended_screen_share_falls_back_to_camera() {
    let room = TestRoom::new();
    let a = room.join("a").await;
    let mut b = room.join("b").await;
    a.wait_stable(1).await;
    b.wait_stable(1).await;

    b.handle.start_screen_share().await.unwrap();
    let screen = b.connection_to("a").sending(TrackKind::Video).unwrap();
    assert_eq!(screen.source(), TrackSource::Screen);

    // The platform's own "stop sharing" button
    screen.stop();

    b.expect_event(|e| *e == EngineEvent::ScreenShareEnded).await;
    b.wait_for(|s| !s.screen_sharing).await;
    let video = b.connection_to("a").sending(TrackKind::Video).unwrap();
    assert_eq!(video.source(), TrackSource::Camera);
}

#[tokio::test]
async fn denied_camera_still_joins_and_can_share_screen() {
    let room = TestRoom::new();
    let a = room.join("a").await;
    let mut b = room
        .join_with(
            "b",
            SyntheticCapture::new().deny_camera(true),
            EngineConfig::default(),
        )
        .await;

    b.expect_event(|e| matches!(e, EngineEvent::CaptureDenied { .. }))
        .await;
    a.wait_stable(1).await;
    b.wait_stable(1).await;
    assert!(b.connection_to("a").sending(TrackKind::Video).is_none());

    // No video sender yet, so one is added
    b.handle.start_screen_share().await.unwrap();
    let video = b.connection_to("a").sending(TrackKind::Video).unwrap();
    assert_eq!(video.source(), TrackSource::Screen);

    b.handle.stop_screen_share().await.unwrap();
    b.wait_for(|s| !s.screen_sharing).await;
    assert!(b.connection_to("a").sending(TrackKind::Video).is_none());
}

#[tokio::test]
async fn rejected_screen_share_reports_denial() {
    let room = TestRoom::new();
    let b = room
        .join_with(
            "b",
            SyntheticCapture::new().deny_screen(true),
            EngineConfig::default(),
        )
        .await;
    assert!(b.handle.start_screen_share().await.is_err());
    assert!(!b.handle.state().screen_sharing);
}

#[tokio::test]
async fn three_participants_form_a_full_mesh() {
    let room = TestRoom::new();
    let p1 = room.join("p1").await;
    let p2 = room.join("p2").await;
    let p3 = room.join("p3").await;

    for p in [&p1, &p2, &p3] {
        let state = p.wait_stable(2).await;
        assert_eq!(state.links.len(), 2);
    }

    assert_eq!(room.count(SignalKind::Offer, "p2", Some("p1")).await, 1);
    assert_eq!(room.count(SignalKind::Offer, "p3", Some("p1")).await, 1);
    assert_eq!(room.count(SignalKind::Offer, "p3", Some("p2")).await, 1);
    assert_eq!(room.count(SignalKind::Offer, "p1", None).await, 0);
    assert_eq!(room.total(SignalKind::Offer).await, 3);
}

#[tokio::test]
async fn simultaneous_snapshot_discovery_sends_no_duplicate_offers() {
    let room = TestRoom::new();
    room.roster.join("a".into()).await;
    room.roster.join("b".into()).await;

    let a = room.start("a", SyntheticCapture::new(), EngineConfig::default());
    let b = room.start("b", SyntheticCapture::new(), EngineConfig::default());

    a.wait_stable(1).await;
    b.wait_stable(1).await;
    settle().await;

    assert_eq!(room.total(SignalKind::Offer).await, 1);
    assert_eq!(room.count(SignalKind::Offer, "b", Some("a")).await, 1);
    assert_eq!(a.factory.created().len(), 1);
    assert_eq!(b.factory.created().len(), 1);
}

#[tokio::test]
async fn rejected_answer_is_retried_once() {
    let room = TestRoom::new();
    room.roster.join("a".into()).await;
    let b = room.join("b").await;
    b.wait_for(|s| s.links.iter().any(|l| l.state == NegotiationState::Offering))
        .await;

    b.factory
        .faults()
        .fail_remote_descriptions
        .store(1, std::sync::atomic::Ordering::SeqCst);
    room.send_answer("a", "b").await;

    b.wait_stable(1).await;
    // The local offer was still in place, so nothing was rolled back
    assert_eq!(b.connection_to("a").rollback_attempts(), 0);
}

#[tokio::test]
async fn answer_rejected_twice_drops_the_link() {
    let room = TestRoom::new();
    room.roster.join("a".into()).await;
    let mut b = room.join("b").await;
    b.wait_for(|s| s.links.iter().any(|l| l.state == NegotiationState::Offering))
        .await;

    b.factory
        .faults()
        .fail_remote_descriptions
        .store(2, std::sync::atomic::Ordering::SeqCst);
    room.send_answer("a", "b").await;

    let event = b
        .expect_event(|e| matches!(e, EngineEvent::PeerDisconnected { .. }))
        .await;
    assert_eq!(
        event,
        EngineEvent::PeerDisconnected {
            peer_id: "a".into()
        }
    );
    b.wait_for(|s| s.links.is_empty()).await;
    assert!(b.connection_to("a").is_closed());
}

#[tokio::test]
async fn crossing_offer_makes_lesser_id_roll_back_and_answer() {
    let room = TestRoom::new();
    room.roster.join("b".into()).await;
    let a = room.join("a").await;

    // Manual retry makes a offer despite the ordering
    a.handle.connect("b".into()).await.unwrap();
    a.wait_for(|s| s.links.iter().any(|l| l.state == NegotiationState::Offering))
        .await;

    room.send_offer("b", "a").await;
    a.wait_stable(1).await;
    assert_eq!(room.count(SignalKind::Answer, "a", Some("b")).await, 1);
    assert_eq!(a.factory.created().len(), 1);
}

#[tokio::test]
async fn failed_rollback_on_crossing_offer_drops_the_link() {
    let room = TestRoom::new();
    room.roster.join("b".into()).await;
    let mut a = room.join("a").await;

    a.handle.connect("b".into()).await.unwrap();
    a.wait_for(|s| s.links.iter().any(|l| l.state == NegotiationState::Offering))
        .await;
    a.factory
        .faults()
        .fail_rollback
        .store(true, std::sync::atomic::Ordering::SeqCst);

    room.send_offer("b", "a").await;
    let event = a
        .expect_event(|e| matches!(e, EngineEvent::PeerDisconnected { .. }))
        .await;
    assert_eq!(
        event,
        EngineEvent::PeerDisconnected {
            peer_id: "b".into()
        }
    );
    a.wait_for(|s| s.links.is_empty()).await;

    let conn = a.connection_to("b");
    assert_eq!(conn.rollback_attempts(), 1);
    assert!(conn.is_closed());
    settle().await;
    assert_eq!(room.count(SignalKind::Answer, "a", None).await, 0);
}

#[tokio::test]
async fn crossing_offer_is_ignored_by_greater_id() {
    let room = TestRoom::new();
    room.roster.join("a".into()).await;
    let b = room.join("b").await;
    b.wait_for(|s| s.links.iter().any(|l| l.state == NegotiationState::Offering))
        .await;

    room.send_offer("a", "b").await;
    settle().await;
    assert_eq!(room.count(SignalKind::Answer, "b", None).await, 0);

    room.send_answer("a", "b").await;
    b.wait_stable(1).await;
}

#[tokio::test]
async fn early_ice_candidates_are_held_until_the_offer() {
    let room = TestRoom::new();
    room.roster.join("b".into()).await;
    let a = room.join("a").await;

    let candidate = IceCandidate {
        candidate: "candidate:7 1 udp 2122260223 10.0.0.7 40000 typ host".into(),
        sdp_mid: Some("0".into()),
        sdp_mline_index: Some(0),
        username_fragment: None,
    };
    room.send_candidate("b", "a", &candidate).await;
    settle().await;
    room.send_offer("b", "a").await;

    a.wait_stable(1).await;
    assert_eq!(a.connection_to("b").applied_candidates(), vec![candidate]);
}

#[tokio::test]
async fn stalled_negotiation_times_out() {
    let room = TestRoom::new();
    room.roster.join("a".into()).await;
    let config = EngineConfig {
        negotiation_timeout_ms: 200,
        sweep_interval_ms: 20,
        ..Default::default()
    };
    let mut b = room.join_with("b", SyntheticCapture::new(), config).await;

    b.expect_event(|e| matches!(e, EngineEvent::PeerDisconnected { .. }))
        .await;
    b.wait_for(|s| s.links.is_empty()).await;
    assert!(b.connection_to("a").is_closed());
}

#[tokio::test]
async fn roster_removal_evicts_peer_and_ends_removed_session() {
    let room = TestRoom::new();
    let mut a = room.join("a").await;
    let mut b = room.join("b").await;
    a.wait_stable(1).await;
    b.wait_stable(1).await;

    let conn = a.connection_to("b");
    room.roster.remove(&"a".into()).await;

    a.expect_event(|e| *e == EngineEvent::Evicted).await;
    b.expect_event(|e| matches!(e, EngineEvent::PeerDisconnected { .. }))
        .await;
    b.wait_for(|s| s.links.is_empty()).await;

    let outcome = tokio::time::timeout(Duration::from_secs(5), a.task)
        .await
        .unwrap()
        .unwrap();
    assert!(outcome.is_ok());
    assert!(conn.is_closed());
}

#[tokio::test]
async fn leaving_closes_links_and_leaves_roster() {
    let room = TestRoom::new();
    let a = room.join("a").await;
    let b = room.join("b").await;
    a.wait_stable(1).await;
    b.wait_stable(1).await;

    let conn = a.connection_to("b");
    a.handle.leave().await.unwrap();
    let outcome = tokio::time::timeout(Duration::from_secs(5), a.task)
        .await
        .unwrap()
        .unwrap();
    assert!(outcome.is_ok());
    assert!(conn.is_closed());

    b.wait_for(|s| s.links.is_empty()).await;
    assert_eq!(room.roster.list().await.unwrap(), vec![ParticipantId::from("b")]);
}

#[tokio::test]
async fn failed_connection_is_removed_and_reported() {
    let room = TestRoom::new();
    let a = room.join("a").await;
    let mut b = room.join("b").await;
    a.wait_stable(1).await;
    b.wait_stable(1).await;

    b.connection_to("a").fail();

    let event = b
        .expect_event(|e| matches!(e, EngineEvent::PeerDisconnected { .. }))
        .await;
    assert_eq!(
        event,
        EngineEvent::PeerDisconnected {
            peer_id: "a".into()
        }
    );
    b.wait_for(|s| s.links.is_empty()).await;
    assert!(b.connection_to("a").is_closed());
}

#[tokio::test]
async fn repeated_offer_on_stable_link_is_ignored() {
    let room = TestRoom::new();
    let a = room.join("a").await;
    let b = room.join("b").await;
    a.wait_stable(1).await;
    b.wait_stable(1).await;

    room.send_offer("b", "a").await;
    settle().await;

    assert_eq!(room.count(SignalKind::Answer, "a", Some("b")).await, 1);
    assert_eq!(a.factory.created().len(), 1);
    assert_eq!(a.handle.state().stable_links(), 1);
    assert!(!a.connection_to("b").is_closed());
}

#[tokio::test]
async fn departed_participants_are_not_contacted_by_later_joiners() {
    let room = TestRoom::new();
    let a = room.join("a").await;
    a.handle.leave().await.unwrap();
    let outcome = tokio::time::timeout(Duration::from_secs(5), a.task)
        .await
        .unwrap()
        .unwrap();
    assert!(outcome.is_ok());
    // a's announcement stays in the replayed history
    assert_eq!(room.count(SignalKind::Announce, "a", None).await, 1);

    let b = room.join("b").await;
    settle().await;

    assert!(b.handle.state().links.is_empty());
    assert!(b.factory.created().is_empty());
    assert_eq!(room.count(SignalKind::Offer, "b", None).await, 0);
}

#[tokio::test]
async fn denied_camera_and_microphone_join_receive_only() {
    let room = TestRoom::new();
    let a = room.join("a").await;
    let mut b = room
        .join_with(
            "b",
            SyntheticCapture::new().deny_camera(true).deny_microphone(true),
            EngineConfig::default(),
        )
        .await;

    b.expect_event(|e| matches!(e, EngineEvent::CaptureDenied { .. }))
        .await;
    b.expect_event(|e| matches!(e, EngineEvent::CaptureDenied { .. }))
        .await;
    a.wait_stable(1).await;
    let state = b.wait_stable(1).await;
    assert!(!state.audio_enabled);
    assert!(!state.video_enabled);

    assert!(b.connection_to("a").senders().is_empty());
    // b still receives what a sends
    assert_eq!(a.connection_to("b").senders().len(), 2);
}
