mod support;

use std::collections::BTreeSet;
use std::time::Duration;

use huddle_proto::{ClientMessage, SideChannelMessage};
use huddle_topology::{
    ClientConfig, MediaTrack, NegotiationState, ParticipantKey, PeerEventKind, TransportState,
};
use support::{
    answer_from, host_changed, mute_from, offer_from, outline, room_info, stream_map_from,
    user_joined, user_left, Call, Harness,
};
use tokio::time::Instant;

/// Host "h" alone in the room, then `peers` join one after another.
async fn host_with(peers: &[&str]) -> Harness {
    let mut harness = Harness::new("h");
    harness.server(room_info("h", &["h"])).await;
    for peer in peers {
        harness.server(user_joined(peer)).await;
    }
    harness.drain();
    harness
}

/// Brings every listed peer to Connected with an open side channel.
async fn settle(harness: &mut Harness, peers: &[&str]) {
    for peer in peers {
        harness.server(answer_from(peer)).await;
        harness.peer_event(peer, PeerEventKind::ChannelOpen).await;
    }
    harness.drain();
}

fn mute_targets(messages: &[ClientMessage]) -> Vec<(String, String)> {
    messages
        .iter()
        .filter_map(|m| match m {
            ClientMessage::MuteStatusChanged(p) => Some((
                p.target_user_id.clone().unwrap_or_default(),
                p.user_id.clone(),
            )),
            _ => None,
        })
        .collect()
}

#[test_timeout::tokio_timeout_test]
async fn room_info_does_not_start_onboarding() {
    let mut harness = Harness::new("h");
    harness.server(room_info("h", &["h", "a", "b"])).await;

    assert!(harness.manager.is_host());
    assert!(harness.factory.opened().is_empty());
    assert!(harness.drain().is_empty());
    assert_eq!(harness.manager.participants().user_ids(), vec!["a", "b"]);
}

#[test_timeout::tokio_timeout_test]
async fn onboarding_sends_stream_map_before_offer() {
    let mut harness = Harness::new("h");
    harness.server(room_info("h", &["h"])).await;
    harness.server(user_joined("a")).await;

    assert_eq!(
        outline(&harness.drain()),
        vec![
            ("stream-id-map", "a".to_string()),
            ("offer", "a".to_string()),
        ]
    );
    assert_eq!(
        harness.factory.calls_for("a"),
        vec![
            Call::Open { generation: 1 },
            Call::CreateDataChannel("voice-activity".to_string()),
            Call::AddTrack("stream-h".to_string()),
            Call::CreateOffer,
        ]
    );
    assert_eq!(
        harness.manager.connection_state("a"),
        Some(NegotiationState::OfferSent)
    );
}

#[test_timeout::tokio_timeout_test]
async fn new_peer_receives_existing_mute_states_once() {
    let mut harness = Harness::new("h");
    harness.server(room_info("h", &["h", "a", "b"])).await;
    harness.server(mute_from("a", "a", true)).await;
    harness.server(mute_from("b", "b", true)).await;
    harness.drain();

    harness.server(user_joined("c")).await;
    let sent = harness.drain();
    let mutes = mute_targets(&sent);
    assert_eq!(
        mutes,
        vec![
            ("c".to_string(), "a".to_string()),
            ("c".to_string(), "b".to_string()),
        ]
    );
    assert_eq!(outline(&sent).last().map(|(kind, _)| *kind), Some("offer"));
}

#[test_timeout::tokio_timeout_test]
async fn host_mute_is_part_of_the_snapshot() {
    let mut harness = host_with(&["a"]).await;
    harness.manager.set_local_muted(true);
    assert_eq!(
        mute_targets(&harness.drain()),
        vec![("a".to_string(), "h".to_string())]
    );

    harness.server(user_joined("b")).await;
    assert_eq!(
        mute_targets(&harness.drain()),
        vec![("b".to_string(), "h".to_string())]
    );
}

#[test_timeout::tokio_timeout_test]
async fn host_relays_incoming_track_with_mapping_first() {
    let mut harness = host_with(&["a", "b"]).await;
    settle(&mut harness, &["a", "b"]).await;

    let track = MediaTrack::opus("mic-a", "stream-a");
    harness
        .peer_event("a", PeerEventKind::Track(track.clone()))
        .await;

    assert_eq!(
        outline(&harness.drain()),
        vec![
            ("stream-id-map", "b".to_string()),
            ("offer", "b".to_string()),
        ]
    );
    assert_eq!(
        harness.factory.count("b", &Call::AddTrack("stream-a".to_string())),
        1
    );
    assert_eq!(
        harness.factory.count("a", &Call::AddTrack("stream-a".to_string())),
        0
    );
    assert_eq!(harness.manager.relayed_track("a"), Some(&track));
    assert_eq!(
        harness
            .manager
            .stream_identities()
            .resolve("stream-a")
            .map(String::as_str),
        Some("a")
    );

    // A later joiner gets the relayed track and its owner up front.
    harness.server(user_joined("c")).await;
    let sent = harness.drain();
    let map = sent.iter().find_map(|m| match m {
        ClientMessage::StreamIdMap(p) => Some(p.entries.clone()),
        _ => None,
    });
    let map = map.expect("stream map sent to c");
    assert_eq!(map.get("stream-a").map(String::as_str), Some("a"));
    assert_eq!(map.get("stream-h").map(String::as_str), Some("h"));
    assert!(harness
        .factory
        .calls_for("c")
        .contains(&Call::AddTrack("stream-a".to_string())));
}

#[test_timeout::tokio_timeout_test]
async fn participant_resolves_placeholder_when_mapping_arrives() {
    let mut harness = Harness::new("p");
    harness.server(room_info("h", &["h", "a", "p"])).await;
    harness.server(offer_from("h")).await;
    assert_eq!(outline(&harness.drain()), vec![("answer", "h".to_string())]);

    // Mapping first: attributed straight away.
    harness
        .server(stream_map_from("h", &[("stream-h", "h")]))
        .await;
    harness
        .peer_event("h", PeerEventKind::Track(MediaTrack::opus("mic-h", "stream-h")))
        .await;
    assert!(harness
        .manager
        .participants()
        .get("h")
        .and_then(|p| p.stream.as_ref())
        .is_some());

    // Track first: parked under its stream id.
    harness
        .peer_event("h", PeerEventKind::Track(MediaTrack::opus("mic-a", "stream-a")))
        .await;
    assert!(harness
        .manager
        .participant(&ParticipantKey::Stream("stream-a".to_string()))
        .is_some_and(|p| p.profile.is_none() && p.stream.is_some()));

    harness
        .server(stream_map_from("h", &[("stream-a", "a")]))
        .await;
    let view = harness.manager.participants();
    assert!(view.placeholder("stream-a").is_none());
    assert_eq!(
        view.get("a")
            .and_then(|p| p.stream.as_ref())
            .map(MediaTrack::stream_id),
        Some("stream-a")
    );
    assert!(view
        .iter()
        .all(|(key, _)| matches!(key, ParticipantKey::User(_))));
}

#[test_timeout::tokio_timeout_test]
async fn speaking_status_fans_out_to_everyone_else_once() {
    let mut harness = host_with(&["a", "b", "c"]).await;
    settle(&mut harness, &["a", "b", "c"]).await;

    let report = SideChannelMessage::speaking(true).to_text().expect("encode");
    harness
        .peer_event("a", PeerEventKind::ChannelMessage(report.clone()))
        .await;
    harness
        .peer_event("a", PeerEventKind::ChannelMessage(report))
        .await;

    let expected = SideChannelMessage::relayed_speaking("a", true);
    for peer in ["b", "c"] {
        let sent = harness.factory.sent_data(peer);
        assert_eq!(sent.len(), 1, "peer {peer}");
        assert_eq!(
            SideChannelMessage::from_text(&sent[0]).expect("decode"),
            expected
        );
    }
    assert!(harness.factory.sent_data("a").is_empty());
    assert!(harness
        .manager
        .participants()
        .get("a")
        .is_some_and(|p| p.is_speaking));
}

#[test_timeout::tokio_timeout_test]
async fn local_speaking_is_edge_triggered() {
    let mut harness = host_with(&["a", "b"]).await;
    settle(&mut harness, &["a", "b"]).await;

    harness.manager.set_local_speaking(true).await;
    harness.manager.set_local_speaking(true).await;
    harness.manager.set_local_speaking(false).await;

    for peer in ["a", "b"] {
        let sent: Vec<SideChannelMessage> = harness
            .factory
            .sent_data(peer)
            .iter()
            .map(|text| SideChannelMessage::from_text(text).expect("decode"))
            .collect();
        assert_eq!(
            sent,
            vec![
                SideChannelMessage::speaking(true),
                SideChannelMessage::speaking(false),
            ]
        );
    }
}

#[test_timeout::tokio_timeout_test]
async fn mute_relay_skips_sender_and_subject() {
    let mut harness = host_with(&["a", "b", "c"]).await;

    harness.server(mute_from("a", "a", true)).await;
    let targets: BTreeSet<String> = mute_targets(&harness.drain())
        .into_iter()
        .map(|(target, user)| {
            assert_eq!(user, "a");
            target
        })
        .collect();
    assert_eq!(targets, BTreeSet::from(["b".to_string(), "c".to_string()]));
    assert!(harness
        .manager
        .participants()
        .get("a")
        .is_some_and(|p| p.is_muted));
}

#[test_timeout::tokio_timeout_test]
async fn participant_mute_goes_only_to_host() {
    let mut harness = Harness::new("p");
    harness.server(room_info("h", &["h", "a", "p"])).await;

    harness.manager.set_local_muted(true);
    harness.manager.set_local_muted(true);
    assert_eq!(
        mute_targets(&harness.drain()),
        vec![("h".to_string(), "p".to_string())]
    );

    // Participants apply relayed mute state without relaying it further.
    harness.server(mute_from("h", "a", true)).await;
    assert!(harness.drain().is_empty());
    assert!(harness
        .manager
        .participants()
        .get("a")
        .is_some_and(|p| p.is_muted));
}

#[test_timeout::tokio_timeout_test]
async fn new_host_rebuilds_the_star() {
    let mut harness = Harness::new("a");
    harness.server(room_info("h", &["h", "a", "b"])).await;
    harness.server(offer_from("h")).await;
    harness.drain();
    assert_eq!(harness.manager.peer_ids(), vec!["h"]);

    harness.server(user_left("h")).await;
    harness.server(host_changed("a")).await;

    assert!(harness.manager.is_host());
    assert_eq!(harness.factory.count("h", &Call::Close), 1);
    assert_eq!(harness.manager.peer_ids(), vec!["b"]);
    assert_eq!(
        outline(&harness.drain()),
        vec![
            ("stream-id-map", "b".to_string()),
            ("offer", "b".to_string()),
        ]
    );
}

#[test_timeout::tokio_timeout_test]
async fn participants_wait_for_the_new_host() {
    let mut harness = Harness::new("b");
    harness.server(room_info("h", &["h", "a", "b"])).await;
    harness.server(offer_from("h")).await;
    harness
        .peer_event("h", PeerEventKind::Track(MediaTrack::opus("mic-h", "stream-h")))
        .await;
    harness.server(stream_map_from("h", &[("stream-h", "h")])).await;
    harness.drain();

    harness.server(user_left("h")).await;
    harness.server(host_changed("a")).await;

    assert!(!harness.manager.is_host());
    assert!(harness.manager.peer_ids().is_empty());
    assert!(harness.drain().is_empty());
    assert_eq!(harness.manager.participants().user_ids(), vec!["a"]);
    // Stream ownership outlives the topology that produced it.
    assert_eq!(harness.manager.stream_identities().len(), 1);

    harness.server(offer_from("a")).await;
    assert_eq!(outline(&harness.drain()), vec![("answer", "a".to_string())]);
}

#[test_timeout::tokio_timeout_test]
async fn departed_user_is_forgotten() {
    let mut harness = host_with(&["a", "b"]).await;
    settle(&mut harness, &["a", "b"]).await;
    harness
        .peer_event("a", PeerEventKind::Track(MediaTrack::opus("mic-a", "stream-a")))
        .await;

    harness.server(user_left("a")).await;

    assert_eq!(harness.manager.peer_ids(), vec!["b"]);
    assert!(harness.manager.participants().get("a").is_none());
    assert!(harness.manager.relayed_track("a").is_none());
    assert_eq!(harness.factory.count("a", &Call::Close), 1);
}

#[test_timeout::tokio_timeout_test]
async fn leave_resets_everything_but_stream_identities() {
    let mut harness = Harness::new("p");
    harness.server(room_info("h", &["h", "p"])).await;
    harness.server(offer_from("h")).await;
    harness.server(stream_map_from("h", &[("stream-h", "h")])).await;
    harness.drain();

    harness.manager.leave().await;

    assert_eq!(outline(&harness.drain()), vec![("leave", String::new())]);
    assert!(harness.manager.room().is_none());
    assert!(harness.manager.participants().is_empty());
    assert!(harness.manager.peer_ids().is_empty());
    assert_eq!(harness.manager.stream_identities().len(), 1);
    assert!(!harness.manager.snapshot().is_host);
}

#[test_timeout::tokio_timeout_test]
async fn stalled_negotiation_is_retried_by_host() {
    let mut harness = host_with(&["a"]).await;
    assert_eq!(harness.factory.generation_of("a"), 1);

    let later = Instant::now() + Duration::from_secs(21);
    let reaped = harness.manager.reap_stalled_negotiations(later).await;

    assert_eq!(reaped, vec!["a".to_string()]);
    assert_eq!(harness.factory.count("a", &Call::Close), 1);
    assert_eq!(harness.factory.generation_of("a"), 2);
    assert_eq!(
        harness.manager.connection_state("a"),
        Some(NegotiationState::OfferSent)
    );
    assert_eq!(
        outline(&harness.drain()),
        vec![
            ("stream-id-map", "a".to_string()),
            ("offer", "a".to_string()),
        ]
    );
}

#[test_timeout::tokio_timeout_test]
async fn watchdog_can_be_disabled() {
    let config = ClientConfig {
        negotiation_timeout: None,
        ..ClientConfig::default()
    };
    let mut harness = Harness::with_config("h", config);
    harness.server(room_info("h", &["h"])).await;
    harness.server(user_joined("a")).await;

    let much_later = Instant::now() + Duration::from_secs(3600);
    assert!(harness
        .manager
        .reap_stalled_negotiations(much_later)
        .await
        .is_empty());
    assert_eq!(harness.factory.generation_of("a"), 1);
}

#[test_timeout::tokio_timeout_test]
async fn events_from_replaced_connections_are_ignored() {
    let mut harness = host_with(&["a"]).await;
    harness.server(answer_from("a")).await;

    harness
        .peer_event("a", PeerEventKind::StateChanged(TransportState::Failed))
        .await;
    assert_eq!(harness.factory.generation_of("a"), 2);

    harness
        .manager
        .handle_peer_event(huddle_topology::PeerEvent {
            remote: "a".to_string(),
            generation: 1,
            kind: PeerEventKind::Track(MediaTrack::opus("mic-a", "stream-a")),
        })
        .await
        .expect("stale event ignored");
    assert!(harness.manager.relayed_track("a").is_none());
}

#[test_timeout::tokio_timeout_test]
async fn rejoining_peer_is_onboarded_again() {
    let mut harness = host_with(&["a"]).await;
    settle(&mut harness, &["a"]).await;
    harness
        .peer_event("a", PeerEventKind::Track(MediaTrack::opus("mic-a", "stream-a")))
        .await;
    assert!(harness.manager.relayed_track("a").is_some());

    // Same user, new socket: the server announces it again.
    harness.server(user_joined("a")).await;

    assert_eq!(harness.factory.count("a", &Call::Close), 1);
    assert_eq!(harness.factory.generation_of("a"), 2);
    assert!(harness.manager.relayed_track("a").is_none());
    assert_eq!(
        harness.manager.connection_state("a"),
        Some(NegotiationState::OfferSent)
    );
    assert_eq!(
        outline(&harness.drain()),
        vec![
            ("stream-id-map", "a".to_string()),
            ("offer", "a".to_string()),
        ]
    );
}

#[test_timeout::tokio_timeout_test]
async fn mute_set_before_joining_reaches_the_host() {
    let mut harness = Harness::new("p");
    harness.manager.set_local_muted(true);
    assert!(harness.drain().is_empty());

    harness.server(room_info("h", &["h", "a", "p"])).await;
    assert_eq!(
        mute_targets(&harness.drain()),
        vec![("h".to_string(), "p".to_string())]
    );

    harness.server(offer_from("h")).await;
    assert_eq!(outline(&harness.drain()), vec![("answer", "h".to_string())]);
}

#[test_timeout::tokio_timeout_test]
async fn local_mute_closes_the_microphone_gate() {
    let mut harness = Harness::new("p");
    harness.server(room_info("h", &["h", "p"])).await;
    let mic = harness.manager.local_track().cloned().expect("local track");
    assert!(mic.is_enabled());

    harness.manager.set_local_muted(true);
    assert!(!mic.is_enabled());
    assert!(harness.manager.snapshot().local_muted);

    harness.manager.set_local_muted(false);
    assert!(mic.is_enabled());
}

#[test_timeout::tokio_timeout_test]
async fn lost_host_link_detaches_every_relayed_stream() {
    let mut harness = Harness::new("p");
    harness.server(room_info("h", &["h", "a", "p"])).await;
    harness.server(offer_from("h")).await;
    harness
        .server(stream_map_from("h", &[("stream-h", "h"), ("stream-a", "a")]))
        .await;
    harness
        .peer_event("h", PeerEventKind::Track(MediaTrack::opus("mic-h", "stream-h")))
        .await;
    harness
        .peer_event("h", PeerEventKind::Track(MediaTrack::opus("mic-a", "stream-a")))
        .await;
    harness
        .peer_event("h", PeerEventKind::Track(MediaTrack::opus("mic-x", "stream-x")))
        .await;
    harness.drain();

    harness
        .peer_event("h", PeerEventKind::StateChanged(TransportState::Failed))
        .await;

    let view = harness.manager.participants();
    assert!(view.iter().all(|(_, p)| p.stream.is_none()));
    assert!(view.placeholder("stream-x").is_none());
    assert_eq!(view.user_ids(), vec!["a", "h"]);
    assert!(harness.manager.peer_ids().is_empty());
    assert!(harness.drain().is_empty());
}
