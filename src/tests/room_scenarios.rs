//! End-to-end room behaviour against fake transports and devices.

use futures::channel::mpsc as fmpsc;
use futures::StreamExt;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};

use super::fakes::{FakeDevices, FakeTransportFactory};
use crate::connection::{NegotiationRole, NegotiationState};
use crate::media::{ConnectionKey, MediaKind};
use crate::peers::{IceConnectionState, TransportEventKind};
use crate::room::{LocalMediaController, Role, RoomEvent, RoomSession, SessionStatus};
use crate::settings::MemorySettings;
use crate::signaling::{IceCandidate, ParticipantInfo, SignalingClient, SignalingMessage, SignalingSender};

struct Harness {
    room: RoomSession,
    factory: FakeTransportFactory,
    devices: Arc<FakeDevices>,
    outgoing: mpsc::UnboundedReceiver<SignalingMessage>,
}

fn info(id: &str) -> ParticipantInfo {
    ParticipantInfo {
        user_id: id.into(),
        display_name: id.to_uppercase(),
        role: Role::Participant,
        muted: false,
        screen_sharing: false,
    }
}

fn harness() -> Harness {
    let factory = FakeTransportFactory::new();
    let devices = Arc::new(FakeDevices::new());
    let media = LocalMediaController::new(devices.clone(), Arc::new(MemorySettings::new()));
    let (sender, outgoing) = SignalingSender::channel();
    let room = RoomSession::new("m-1", "Me", sender, Arc::new(factory.clone()), media);
    Harness {
        room,
        factory,
        devices,
        outgoing,
    }
}

impl Harness {
    async fn join(&mut self, others: &[&str]) {
        self.room.join().await.unwrap();
        self.signal(SignalingMessage::Joined {
            user_id: "me".into(),
            participants: others.iter().map(|id| info(id)).collect(),
            ice_servers: vec![],
        })
        .await;
    }

    async fn signal(&mut self, message: SignalingMessage) {
        self.room.handle_signal(message).await.unwrap();
    }

    async fn arrive(&mut self, id: &str) {
        self.signal(SignalingMessage::ParticipantJoined {
            user_id: id.into(),
            display_name: id.to_uppercase(),
            role: Role::Participant,
        })
        .await;
    }

    async fn depart(&mut self, id: &str) {
        self.signal(SignalingMessage::ParticipantLeft { user_id: id.into() })
            .await;
    }

    async fn pump_transport(&mut self) {
        let event = self.room.next_transport_event().await.unwrap();
        self.room.handle_transport_event(event).await.unwrap();
    }

    fn sent(&mut self) -> Vec<SignalingMessage> {
        let mut sent = Vec::new();
        while let Ok(message) = self.outgoing.try_recv() {
            sent.push(message);
        }
        sent
    }

    fn audio_peers(&self) -> Vec<String> {
        self.room
            .peers()
            .keys_of_kind(MediaKind::Audio)
            .into_iter()
            .map(|k| k.participant_id)
            .collect()
    }

    fn roster_ids(&self) -> Vec<String> {
        let mut ids = self.room.participants().ids();
        ids.sort();
        ids
    }

    fn state(&self, key: &ConnectionKey) -> Option<NegotiationState> {
        self.room.peers().state_of(key)
    }
}

fn drain(events: &mut broadcast::Receiver<RoomEvent>) -> Vec<RoomEvent> {
    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    seen
}

#[tokio::test]
async fn three_join_and_the_middle_one_leaves() {
    let mut h = harness();
    h.join(&[]).await;
    for id in ["a", "b", "c"] {
        h.arrive(id).await;
    }
    let b_audio = h
        .room
        .peers()
        .connection(&ConnectionKey::audio("b"))
        .unwrap()
        .generation();

    h.depart("b").await;

    assert_eq!(h.audio_peers(), vec!["a", "c"]);
    assert_eq!(h.room.participants().ids(), vec!["a", "c"]);
    assert!(h.factory.is_closed(b_audio));
    assert!(h.room.peers().connection(&ConnectionKey::screen("b")).is_none());
}

#[tokio::test]
async fn joined_roster_gets_audio_offers() {
    let mut h = harness();
    h.join(&["a", "b"]).await;

    let sent = h.sent();
    assert!(matches!(sent[0], SignalingMessage::Join { .. }));
    let targets: Vec<_> = sent
        .iter()
        .filter_map(|m| match m {
            SignalingMessage::Offer { target_user_id, .. } => target_user_id.clone(),
            _ => None,
        })
        .collect();
    assert_eq!(targets, vec!["a", "b"]);
    assert_eq!(h.room.status(), SessionStatus::Joined);
    assert_eq!(h.room.user_id(), Some("me"));

    let a = ConnectionKey::audio("a");
    assert_eq!(h.state(&a), Some(NegotiationState::HaveLocalOffer));
    h.signal(SignalingMessage::Answer {
        sdp: "answer-from-a".into(),
        target_user_id: None,
        from_user_id: Some("a".into()),
    })
    .await;
    assert_eq!(h.state(&a), Some(NegotiationState::Stable));
    assert_eq!(h.factory.remote_answers(&a), vec!["answer-from-a"]);
}

#[tokio::test]
async fn one_failed_connection_does_not_block_the_rest_of_the_roster() {
    let mut h = harness();
    h.factory.refuse("b");
    let mut events = h.room.subscribe();
    h.join(&["a", "b", "c"]).await;

    assert_eq!(h.roster_ids(), vec!["a", "c"]);
    assert_eq!(h.audio_peers(), vec!["a", "c"]);
    let seen = drain(&mut events);
    assert!(seen.iter().any(|e| matches!(e, RoomEvent::Error { .. })));
    assert!(!seen
        .iter()
        .any(|e| matches!(e, RoomEvent::ParticipantJoined(p) if p.id == "b")));
    let targets: Vec<_> = h
        .sent()
        .into_iter()
        .filter_map(|m| match m {
            SignalingMessage::Offer { target_user_id, .. } => target_user_id,
            _ => None,
        })
        .collect();
    assert_eq!(targets, vec!["a", "c"]);
}

#[tokio::test]
async fn newcomer_offer_is_answered() {
    let mut h = harness();
    h.join(&[]).await;
    h.arrive("z").await;
    let z = ConnectionKey::audio("z");
    assert_eq!(h.state(&z), Some(NegotiationState::New));

    h.signal(SignalingMessage::IceCandidate {
        candidate: IceCandidate::new("early"),
        target_user_id: None,
        from_user_id: Some("z".into()),
    })
    .await;
    h.signal(SignalingMessage::Offer {
        sdp: "offer-from-z".into(),
        target_user_id: None,
        from_user_id: Some("z".into()),
    })
    .await;

    assert_eq!(h.state(&z), Some(NegotiationState::Stable));
    assert_eq!(h.factory.candidates(&z), vec!["early"]);
    assert!(h
        .sent()
        .iter()
        .any(|m| matches!(m, SignalingMessage::Answer { target_user_id: Some(t), .. } if t == "z")));
}

#[tokio::test]
async fn leave_twice_matches_leave_once() {
    let mut h = harness();
    h.join(&["a"]).await;
    h.room.open_microphone().unwrap();
    h.arrive("b").await;
    h.room.start_screen_share().await.unwrap();
    h.sent();

    h.room.leave().await.unwrap();
    h.room.leave().await.unwrap();

    assert_eq!(h.sent(), vec![SignalingMessage::Leave]);
    assert_eq!(h.room.status(), SessionStatus::Left);
    assert!(h.room.peers().is_empty());
    assert!(h.room.participants().is_empty());
    assert!(h.room.local_stream().is_none());
    assert!(h.room.screen_share().is_none());
    assert_eq!(h.factory.open_transports(), 0);
    let opened = h.devices.opened();
    assert_eq!(opened.len(), 2);
    assert!(opened.iter().all(|s| !s.is_live()));
}

#[tokio::test]
async fn second_screen_share_returns_the_same_connections() {
    let mut h = harness();
    h.join(&["a", "b"]).await;

    let first = h.room.start_screen_share().await.unwrap();
    assert_eq!(
        first.connections,
        vec![ConnectionKey::screen("a"), ConnectionKey::screen("b")]
    );
    let generations: Vec<u64> = first
        .connections
        .iter()
        .map(|k| h.room.peers().connection(k).unwrap().generation())
        .collect();
    let created = h.factory.created();
    assert_eq!(
        h.factory.local_media(&ConnectionKey::screen("a")),
        Some(first.stream_id.clone())
    );

    let second = h.room.start_screen_share().await.unwrap();

    assert_eq!(first, second);
    let again: Vec<u64> = second
        .connections
        .iter()
        .map(|k| h.room.peers().connection(k).unwrap().generation())
        .collect();
    assert_eq!(generations, again);
    assert_eq!(h.factory.created(), created);
    assert_eq!(h.devices.opened().len(), 1);
}

#[tokio::test]
async fn screen_share_requires_a_joined_room() {
    let mut h = harness();
    assert!(h.room.start_screen_share().await.is_err());
    assert!(h.devices.opened().is_empty());
}

#[tokio::test]
async fn our_share_replaces_an_incoming_one() {
    let mut h = harness();
    h.join(&["a", "b"]).await;
    h.signal(SignalingMessage::ScreenShareStart {
        from_user_id: Some("a".into()),
    })
    .await;
    h.signal(SignalingMessage::ScreenOffer {
        sdp: "a-screen".into(),
        target_user_id: None,
        from_user_id: Some("a".into()),
    })
    .await;
    let incoming = ConnectionKey::screen("a");
    let answered = h.room.peers().connection(&incoming).unwrap();
    assert_eq!(answered.role(), NegotiationRole::Answerer);
    let answered = answered.generation();
    h.sent();

    let state = h.room.start_screen_share().await.unwrap();

    assert_eq!(
        state.connections,
        vec![ConnectionKey::screen("a"), ConnectionKey::screen("b")]
    );
    assert!(h.factory.is_closed(answered));
    assert!(!h.room.participant("a").unwrap().is_screen_sharing);
    let targets: Vec<_> = h
        .sent()
        .into_iter()
        .filter_map(|m| match m {
            SignalingMessage::ScreenOffer { target_user_id, .. } => target_user_id,
            _ => None,
        })
        .collect();
    assert_eq!(targets, vec!["a", "b"]);
}

#[tokio::test]
async fn stopping_our_share_keeps_an_incoming_one() {
    let mut h = harness();
    h.join(&["a", "b"]).await;
    h.room.start_screen_share().await.unwrap();

    // b starts sharing after us; its offer replaces our connection to b.
    h.signal(SignalingMessage::ScreenShareStart {
        from_user_id: Some("b".into()),
    })
    .await;
    h.signal(SignalingMessage::ScreenOffer {
        sdp: "b-screen".into(),
        target_user_id: None,
        from_user_id: Some("b".into()),
    })
    .await;
    let incoming = ConnectionKey::screen("b");
    assert_eq!(
        h.room.peers().connection(&incoming).unwrap().role(),
        NegotiationRole::Answerer
    );
    assert_eq!(
        h.room.screen_share().unwrap().connections,
        vec![ConnectionKey::screen("a")]
    );

    h.sent();
    h.room.stop_screen_share().await.unwrap();
    assert_eq!(h.room.peers().keys_of_kind(MediaKind::Screen), vec![incoming.clone()]);
    assert_eq!(
        h.sent(),
        vec![SignalingMessage::ScreenShareStop { from_user_id: None }]
    );

    h.signal(SignalingMessage::ScreenShareStop {
        from_user_id: Some("b".into()),
    })
    .await;
    assert!(h.room.peers().keys_of_kind(MediaKind::Screen).is_empty());
    assert!(!h.room.participant("b").unwrap().is_screen_sharing);
}

#[tokio::test]
async fn newcomer_receives_our_active_share() {
    let mut h = harness();
    h.join(&["a"]).await;
    h.room.start_screen_share().await.unwrap();
    h.arrive("b").await;

    let state = h.room.screen_share().unwrap();
    assert_eq!(
        state.connections,
        vec![ConnectionKey::screen("a"), ConnectionKey::screen("b")]
    );
    assert_eq!(
        h.state(&ConnectionKey::screen("b")),
        Some(NegotiationState::HaveLocalOffer)
    );
}

#[tokio::test]
async fn mute_disables_but_keeps_tracks() {
    let mut h = harness();
    h.join(&[]).await;
    h.room.open_microphone().unwrap();
    let mic = h.room.local_stream().unwrap().clone();
    h.sent();

    h.room.toggle_mute(true).unwrap();
    assert_eq!(mic.tracks().len(), 1);
    assert!(mic.is_live());
    assert!(!mic.tracks()[0].is_enabled());
    assert_eq!(h.sent(), vec![SignalingMessage::Mute { muted: true }]);

    // A replacement stream inherits the mute and the old one is released.
    h.room.open_microphone().unwrap();
    let replacement = h.room.local_stream().unwrap().clone();
    assert!(!mic.is_live());
    assert!(!replacement.tracks()[0].is_enabled());

    h.room.toggle_mute(false).unwrap();
    assert!(replacement.tracks()[0].is_enabled());
    assert!(!h.room.is_muted());
}

#[tokio::test]
async fn participant_mute_updates_roster() {
    let mut h = harness();
    h.join(&["a"]).await;
    let mut events = h.room.subscribe();

    h.signal(SignalingMessage::ParticipantMuted {
        user_id: "a".into(),
        muted: true,
    })
    .await;

    assert!(h.room.participant("a").unwrap().audio_muted);
    assert!(drain(&mut events)
        .iter()
        .any(|e| matches!(e, RoomEvent::ParticipantUpdated(p) if p.id == "a" && p.audio_muted)));
}

#[tokio::test]
async fn lost_audio_connection_removes_the_participant() {
    let mut h = harness();
    h.join(&["a"]).await;
    h.signal(SignalingMessage::Answer {
        sdp: "answer".into(),
        target_user_id: None,
        from_user_id: Some("a".into()),
    })
    .await;
    let mut events = h.room.subscribe();
    let key = ConnectionKey::audio("a");
    h.sent();

    h.factory
        .emit(&key, TransportEventKind::IceState(IceConnectionState::Failed));
    h.pump_transport().await;
    assert_eq!(h.state(&key), Some(NegotiationState::HaveLocalOffer));
    assert!(matches!(h.sent().as_slice(), [SignalingMessage::Offer { .. }]));

    h.factory
        .emit(&key, TransportEventKind::IceState(IceConnectionState::Failed));
    h.pump_transport().await;

    assert!(h.room.participants().is_empty());
    assert!(h.audio_peers().is_empty());
    assert_eq!(h.factory.open_transports(), 0);
    let seen = drain(&mut events);
    assert!(matches!(seen[0], RoomEvent::Reconnecting(_)));
    assert!(seen
        .iter()
        .any(|e| matches!(e, RoomEvent::ConnectionLost { key: k, .. } if k == &key)));
    assert!(seen
        .iter()
        .any(|e| matches!(e, RoomEvent::ParticipantLeft(id) if id == "a")));
}

#[tokio::test]
async fn meeting_end_releases_everything() {
    let mut h = harness();
    h.join(&["a"]).await;
    h.room.open_microphone().unwrap();
    h.sent();

    h.signal(SignalingMessage::MeetingEnded {
        reason: Some("host ended the meeting".into()),
    })
    .await;
    assert_eq!(h.room.status(), SessionStatus::Ended);
    assert!(h.room.peers().is_empty());
    assert!(h.devices.opened().iter().all(|s| !s.is_live()));

    h.arrive("late").await;
    assert!(h.room.participants().is_empty());
    h.room.leave().await.unwrap();
    assert!(h.sent().is_empty());
    assert_eq!(h.room.status(), SessionStatus::Ended);
}

#[tokio::test]
async fn signals_from_strangers_are_dropped() {
    let mut h = harness();
    h.join(&["a"]).await;

    h.signal(SignalingMessage::Offer {
        sdp: "who".into(),
        target_user_id: None,
        from_user_id: Some("ghost".into()),
    })
    .await;
    h.signal(SignalingMessage::ScreenIceCandidate {
        candidate: IceCandidate::new("ghost-candidate"),
        target_user_id: None,
        from_user_id: Some("ghost".into()),
    })
    .await;

    assert_eq!(h.room.peers().keys(), vec![ConnectionKey::audio("a")]);
}

#[tokio::test]
async fn audio_connections_follow_the_roster_under_churn() {
    let mut h = harness();
    h.join(&["a", "b"]).await;
    let pool = ["a", "b", "c", "d", "e", "f"];
    let mut rng = StdRng::seed_from_u64(7);

    for _ in 0..200 {
        let id = pool[rng.gen_range(0..pool.len())];
        match rng.gen_range(0..3) {
            0 if h.room.participants().contains(id) => h.depart(id).await,
            0 | 1 => h.arrive(id).await,
            _ => {
                // Renegotiation from a present peer replaces its connection.
                if h.room.participants().contains(id) {
                    h.signal(SignalingMessage::Offer {
                        sdp: format!("renegotiate-{id}"),
                        target_user_id: None,
                        from_user_id: Some(id.into()),
                    })
                    .await;
                }
            }
        }
        assert_eq!(h.audio_peers(), h.roster_ids());
    }
    assert_eq!(h.factory.open_transports(), h.room.peers().len());
}

#[tokio::test]
async fn run_processes_signaling_until_leave() {
    let (in_tx, in_rx) = fmpsc::unbounded::<std::result::Result<Message, WsError>>();
    let (out_tx, mut out_rx) = fmpsc::unbounded::<Message>();
    let mut client = SignalingClient::from_transport(out_tx, in_rx);

    let factory = FakeTransportFactory::new();
    let media = LocalMediaController::new(Arc::new(FakeDevices::new()), Arc::new(MemorySettings::new()));
    let mut room = RoomSession::new("m-1", "Me", client.sender(), Arc::new(factory.clone()), media);
    let handle = room.handle();
    let mut events = room.subscribe();

    let joined = SignalingMessage::Joined {
        user_id: "me".into(),
        participants: vec![info("a")],
        ice_servers: vec![],
    };
    in_tx
        .unbounded_send(Ok(Message::Text(joined.encode().unwrap())))
        .unwrap();

    let task = tokio::spawn(async move {
        room.run(&mut client).await.unwrap();
        (room, client)
    });

    loop {
        if let RoomEvent::StatusChanged(SessionStatus::Joined) = events.recv().await.unwrap() {
            break;
        }
    }
    handle.set_muted(true).unwrap();
    handle.leave().unwrap();
    let (room, _client) = task.await.unwrap();

    assert_eq!(room.status(), SessionStatus::Left);
    assert!(room.peers().is_empty());

    let mut kinds = Vec::new();
    for _ in 0..4 {
        match out_rx.next().await.unwrap() {
            Message::Text(text) => kinds.push(SignalingMessage::decode(&text).unwrap().type_name()),
            other => panic!("unexpected frame {:?}", other),
        }
    }
    assert_eq!(kinds, vec!["join", "offer", "mute", "leave"]);
}

#[tokio::test]
async fn signaling_loss_tears_the_room_down() {
    let (in_tx, in_rx) = fmpsc::unbounded::<std::result::Result<Message, WsError>>();
    let (out_tx, _out_rx) = fmpsc::unbounded::<Message>();
    let mut client = SignalingClient::from_transport(out_tx, in_rx);

    let factory = FakeTransportFactory::new();
    let media = LocalMediaController::new(Arc::new(FakeDevices::new()), Arc::new(MemorySettings::new()));
    let mut room = RoomSession::new("m-1", "Me", client.sender(), Arc::new(factory.clone()), media);
    let mut events = room.subscribe();

    let joined = SignalingMessage::Joined {
        user_id: "me".into(),
        participants: vec![info("a")],
        ice_servers: vec![],
    };
    in_tx
        .unbounded_send(Ok(Message::Text(joined.encode().unwrap())))
        .unwrap();
    drop(in_tx);

    room.run(&mut client).await.unwrap();

    assert_eq!(room.status(), SessionStatus::Left);
    assert_eq!(factory.open_transports(), 0);
    assert!(drain(&mut events)
        .iter()
        .any(|e| matches!(e, RoomEvent::Disconnected { .. })));
}
