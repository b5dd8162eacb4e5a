//! Two negotiation machines talking over loopback transports

use meshcall::media::{Lane, LaneSources, LocalSource, MediaKind};
use meshcall::negotiation::loopback::{sdp_lanes, LoopbackFactory};
use meshcall::negotiation::{
    ApplyOutcome, NegotiationStateMachine, SessionEvent, SignalingState, TransportEvent,
};
use meshcall::signaling::SessionDescription;
use tokio::sync::mpsc;
use tokio_test::assert_ok;

struct Side {
    remote: String,
    machine: NegotiationStateMachine,
    factory: LoopbackFactory,
    events: mpsc::UnboundedReceiver<SessionEvent>,
}

impl Side {
    /// Whether the last description from the other side carries real `lane` content
    fn receiving_live(&self, lane: Lane) -> bool {
        self.factory
            .latest(&self.remote)
            .is_some_and(|t| t.receiving_live(lane))
    }
}

async fn open(local: &str, remote: &str, sources: &LaneSources) -> Side {
    let factory = LoopbackFactory::new();
    let (tx, events) = mpsc::unbounded_channel();
    let machine = NegotiationStateMachine::open(&factory, local, remote, 1, sources, tx)
        .await
        .unwrap();
    Side {
        remote: remote.to_string(),
        machine,
        factory,
        events,
    }
}

fn with_camera() -> LaneSources {
    LaneSources {
        audio: Some(LocalSource::capture(Lane::Audio, "mic")),
        video: Some(LocalSource::capture(Lane::Video, "cam")),
        screen: None,
    }
}

fn remote_tracks(side: &mut Side) -> Vec<String> {
    let mut tracks = Vec::new();
    while let Ok(event) = side.events.try_recv() {
        if let TransportEvent::RemoteTrack(track) = event.event {
            tracks.push(track.track_id);
        }
    }
    tracks
}

/// Deliver `offer` to `answerer` and its answer back to `offerer`
async fn exchange(offerer: &mut Side, answerer: &mut Side, offer: SessionDescription) {
    assert_eq!(
        assert_ok!(answerer.machine.apply_remote_description(offer).await),
        ApplyOutcome::Success
    );
    let answer = assert_ok!(answerer.machine.create_answer().await);
    assert_eq!(
        assert_ok!(offerer.machine.apply_remote_description(answer).await),
        ApplyOutcome::Success
    );
}

#[tokio::test]
async fn test_glare_converges_and_polite_side_reoffers() {
    let mut alice = open("alice", "bob", &with_camera()).await;
    let mut bob = open("bob", "alice", &with_camera()).await;
    assert!(alice.machine.is_polite());
    assert!(!bob.machine.is_polite());

    let alice_offer = alice.machine.create_offer().await.unwrap().unwrap();
    let bob_offer = bob.machine.create_offer().await.unwrap().unwrap();

    assert_eq!(
        bob.machine
            .apply_remote_description(alice_offer)
            .await
            .unwrap(),
        ApplyOutcome::Ignored
    );
    exchange(&mut bob, &mut alice, bob_offer).await;
    assert!(alice.machine.needs_renegotiation());

    // One track per lane each way; the answer already carries alice's camera
    let lanes = vec!["microphone", "camera", "screen"];
    assert_eq!(remote_tracks(&mut alice), lanes);
    assert_eq!(remote_tracks(&mut bob), lanes);
    assert!(alice.receiving_live(Lane::Video));
    assert!(bob.receiving_live(Lane::Video));
    assert!(!bob.receiving_live(Lane::Screen));

    let reoffer = alice
        .machine
        .renegotiate_if_needed()
        .await
        .unwrap()
        .unwrap();
    exchange(&mut alice, &mut bob, reoffer).await;

    // Nothing new to announce the second time round
    assert!(remote_tracks(&mut bob).is_empty());
    assert!(!alice.machine.needs_renegotiation());
    assert_eq!(alice.machine.state(), SignalingState::Stable);
    assert_eq!(bob.machine.state(), SignalingState::Stable);
}

#[tokio::test]
async fn test_lane_order_survives_toggles() {
    let mut sources = LaneSources::default();
    let mut alice = open("alice", "bob", &sources).await;
    let mut bob = open("bob", "alice", &LaneSources::default()).await;

    let first = alice.machine.create_offer().await.unwrap().unwrap();
    exchange(&mut alice, &mut bob, first).await;

    let toggles = [
        (Lane::Video, Some(LocalSource::capture(Lane::Video, "cam"))),
        (Lane::Screen, Some(LocalSource::capture(Lane::Screen, "Display 1"))),
        (Lane::Video, None),
        (Lane::Audio, Some(LocalSource::capture(Lane::Audio, "mic"))),
        (Lane::Screen, None),
    ];

    for (lane, source) in toggles {
        sources.set(lane, source.clone());
        let offer = alice
            .machine
            .replace_lane(lane, source)
            .await
            .unwrap()
            .unwrap();

        let lanes = sdp_lanes(&offer.sdp);
        let kinds: Vec<MediaKind> = lanes.iter().map(|l| l.kind).collect();
        let mids: Vec<usize> = lanes.iter().map(|l| l.mid).collect();
        assert_eq!(kinds, vec![MediaKind::Audio, MediaKind::Video, MediaKind::Video]);
        assert_eq!(mids, vec![0, 1, 2]);

        for bound in alice.machine.lanes() {
            let live = sources.get(bound.lane).map(|s| s.id().to_string());
            assert_eq!(bound.placeholder, live.is_none());
            if let Some(id) = live {
                assert_eq!(bound.track_id, id);
            }
        }

        exchange(&mut alice, &mut bob, offer).await;
        for lane in Lane::ALL {
            assert_eq!(bob.receiving_live(lane), sources.get(lane).is_some());
        }
    }

    // Content changed five times without any new track reaching bob
    assert_eq!(remote_tracks(&mut bob).len(), 3);

    assert_eq!(alice.machine.lanes().len(), 3);
    assert_eq!(bob.machine.state(), SignalingState::Stable);
}
