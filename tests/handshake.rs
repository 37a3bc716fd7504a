//! Offer/answer/candidate scenarios against the mock transport.

mod common;

use std::time::Duration;

use common::{Harness, SHORT};
use teleop_core::dispatch::CoreEvent;
use teleop_core::rtc::SdpKind;
use teleop_core::session::SessionRole;
use teleop_core::signal::{Candidate, Envelope, EnvelopeKind, PeerId};
use tokio::time::sleep;

fn candidate(index: i32) -> Candidate {
    Candidate {
        mid: "0".into(),
        mline_index: index,
        sdp: format!("candidate:{index} 1 udp 2130706431 10.0.0.2 54321 typ host"),
    }
}

#[tokio::test]
async fn offerer_handshake_reaches_peer_up() {
    let harness = Harness::start("c1");
    let vehicle = PeerId::from("v1");

    // Presence is announced as soon as the link opens.
    harness
        .wait_envelope("join", |e| matches!(e.kind, EnvelopeKind::Join))
        .await;

    harness.core.connect_to(&vehicle).expect("connect_to");
    let ctl = harness.connector.wait_for_peer(&vehicle, SHORT).await;
    assert_eq!(ctl.role(), SessionRole::Offerer);

    let offer = harness
        .wait_envelope("offer", |e| matches!(e.kind, EnvelopeKind::Offer))
        .await;
    assert_eq!(offer.from, harness.local_id);
    assert_eq!(offer.to, Some(vehicle.clone()));
    assert!(offer.sdp.as_deref().unwrap_or("").contains("offer-sdp"));

    harness.link.deliver(Envelope::answer(
        vehicle.clone(),
        harness.local_id.clone(),
        "answer-sdp:v1",
    ));
    ctl.establish();

    harness
        .wait_event("peer up", |event| {
            matches!(event, CoreEvent::PeerUp { peer } if peer.as_str() == "v1")
        })
        .await;

    let descriptions = ctl.remote_descriptions();
    assert_eq!(descriptions.len(), 1);
    assert_eq!(descriptions[0].0, SdpKind::Answer);

    // Locally gathered candidates go out addressed to the peer.
    ctl.emit_local_candidate(candidate(0));
    let sent = harness
        .wait_envelope("candidate", |e| matches!(e.kind, EnvelopeKind::Candidate))
        .await;
    assert_eq!(sent.to, Some(vehicle));
    assert_eq!(sent.candidate.as_ref().unwrap().mline_index, 0);
}

#[tokio::test]
async fn remote_offer_creates_answerer_session() {
    let harness = Harness::start("v1");
    let cockpit = PeerId::from("c1");

    harness.link.deliver(Envelope::offer(
        cockpit.clone(),
        harness.local_id.clone(),
        "offer-sdp:c1",
    ));

    let ctl = harness.connector.wait_for_peer(&cockpit, SHORT).await;
    assert_eq!(ctl.role(), SessionRole::Answerer);

    let answer = harness
        .wait_envelope("answer", |e| matches!(e.kind, EnvelopeKind::Answer))
        .await;
    assert_eq!(answer.from, harness.local_id);
    assert_eq!(answer.to, Some(cockpit.clone()));

    let descriptions = ctl.remote_descriptions();
    assert_eq!(descriptions.len(), 1);
    assert_eq!(descriptions[0].0, SdpKind::Offer);

    ctl.establish();
    harness
        .wait_event("peer up", |event| {
            matches!(event, CoreEvent::PeerUp { peer } if peer.as_str() == "c1")
        })
        .await;
}

#[tokio::test]
async fn early_candidates_buffer_until_answer_applies_then_flush_in_order() {
    let harness = Harness::start("c1");
    let vehicle = PeerId::from("v1");

    harness.core.connect_to(&vehicle).expect("connect_to");
    let ctl = harness.connector.wait_for_peer(&vehicle, SHORT).await;
    harness
        .wait_envelope("offer", |e| matches!(e.kind, EnvelopeKind::Offer))
        .await;

    // Candidates arrive before the answer; nothing may reach the transport.
    for index in 0..3 {
        harness.link.deliver(Envelope::candidate(
            vehicle.clone(),
            harness.local_id.clone(),
            candidate(index),
        ));
    }
    sleep(Duration::from_millis(50)).await;
    assert!(ctl.remote_candidates().is_empty());

    harness.link.deliver(Envelope::answer(
        vehicle.clone(),
        harness.local_id.clone(),
        "answer-sdp:v1",
    ));

    let applied = ctl.wait_remote_candidates(3, SHORT).await;
    let order: Vec<i32> = applied.iter().map(|c| c.mline_index).collect();
    assert_eq!(order, vec![0, 1, 2]);

    // Exactly once: no replay after another candidate trickles in.
    harness.link.deliver(Envelope::candidate(
        vehicle.clone(),
        harness.local_id.clone(),
        candidate(3),
    ));
    let applied = ctl.wait_remote_candidates(4, SHORT).await;
    assert_eq!(applied.len(), 4);
}

#[tokio::test]
async fn malformed_candidate_is_dropped_without_closing_the_session() {
    let harness = Harness::start("c1");
    let vehicle = PeerId::from("v1");

    harness.core.connect_to(&vehicle).expect("connect_to");
    let ctl = harness.connector.wait_for_peer(&vehicle, SHORT).await;
    harness
        .wait_envelope("offer", |e| matches!(e.kind, EnvelopeKind::Offer))
        .await;

    harness.link.deliver(Envelope::candidate(
        vehicle.clone(),
        harness.local_id.clone(),
        Candidate {
            mid: String::new(),
            mline_index: -1,
            sdp: "candidate:bogus".into(),
        },
    ));
    harness
        .wait_event("peer error", |event| {
            matches!(event, CoreEvent::PeerError { peer, .. } if peer.as_str() == "v1")
        })
        .await;

    // The handshake continues unharmed.
    harness.link.deliver(Envelope::answer(
        vehicle.clone(),
        harness.local_id.clone(),
        "answer-sdp:v1",
    ));
    ctl.establish();
    harness
        .wait_event("peer up", |event| {
            matches!(event, CoreEvent::PeerUp { peer } if peer.as_str() == "v1")
        })
        .await;
    assert!(!ctl.is_closed());
}

#[tokio::test]
async fn malformed_remote_offer_surfaces_bad_sdp_and_keeps_session() {
    let harness = Harness::start("v1");
    let cockpit = PeerId::from("c1");

    harness.connector.fail_next_remote_sdp();
    harness.link.deliver(Envelope::offer(
        cockpit.clone(),
        harness.local_id.clone(),
        "garbled",
    ));

    let event = harness
        .wait_event("bad_sdp", |event| {
            matches!(event, CoreEvent::PeerError { peer, .. } if peer.as_str() == "c1")
        })
        .await;
    let CoreEvent::PeerError { message, .. } = event else {
        unreachable!()
    };
    assert_eq!(message, "bad_sdp");

    // A well-formed retry still goes through on the same session.
    let ctl = harness.connector.wait_for_peer(&cockpit, SHORT).await;
    assert!(!ctl.is_closed());
    harness.link.deliver(Envelope::offer(
        cockpit.clone(),
        harness.local_id.clone(),
        "offer-sdp:c1:retry",
    ));
    harness
        .wait_envelope("answer", |e| matches!(e.kind, EnvelopeKind::Answer))
        .await;
}

#[tokio::test]
async fn answer_and_candidate_from_unknown_peers_are_dropped_with_errors() {
    let harness = Harness::start("v1");

    harness.link.deliver(Envelope::answer(
        PeerId::from("ghost"),
        harness.local_id.clone(),
        "answer-sdp:ghost",
    ));
    harness
        .wait_event("unknown answer error", |event| {
            matches!(event, CoreEvent::PeerError { peer, .. } if peer.as_str() == "ghost")
        })
        .await;

    harness.link.deliver(Envelope::candidate(
        PeerId::from("ghost2"),
        harness.local_id.clone(),
        candidate(0),
    ));
    harness
        .wait_event("unknown candidate error", |event| {
            matches!(event, CoreEvent::PeerError { peer, .. } if peer.as_str() == "ghost2")
        })
        .await;

    assert!(harness.connector.peer(&PeerId::from("ghost")).is_none());
    assert!(harness.connector.peer(&PeerId::from("ghost2")).is_none());
}

#[tokio::test]
async fn envelopes_addressed_elsewhere_are_ignored() {
    let harness = Harness::start("v1");

    harness.link.deliver(Envelope::offer(
        PeerId::from("c1"),
        PeerId::from("someone-else"),
        "offer-sdp:c1",
    ));
    sleep(Duration::from_millis(50)).await;
    assert!(harness.connector.peer(&PeerId::from("c1")).is_none());
}

#[tokio::test]
async fn transport_create_failure_reports_error_and_allows_retry() {
    let harness = Harness::start("c1");
    let vehicle = PeerId::from("v1");

    harness.connector.fail_next_connect();
    harness.core.connect_to(&vehicle).expect("connect_to");
    let event = harness
        .wait_event("create failure", |event| {
            matches!(event, CoreEvent::PeerError { peer, .. } if peer.as_str() == "v1")
        })
        .await;
    let CoreEvent::PeerError { message, .. } = event else {
        unreachable!()
    };
    assert_eq!(message, "transport_create_failed");

    // The session is gone; dialing again starts fresh.
    harness.core.connect_to(&vehicle).expect("reconnect");
    let ctl = harness.connector.wait_for_peer(&vehicle, SHORT).await;
    assert_eq!(ctl.offer_count(), 1);
}

#[tokio::test]
async fn connect_to_is_idempotent() {
    let harness = Harness::start("c1");
    let vehicle = PeerId::from("v1");

    harness.core.connect_to(&vehicle).expect("first");
    let ctl = harness.connector.wait_for_peer(&vehicle, SHORT).await;
    harness.core.connect_to(&vehicle).expect("second");
    sleep(Duration::from_millis(50)).await;
    assert_eq!(ctl.offer_count(), 1);

    let offers = harness
        .link
        .sent()
        .into_iter()
        .filter(|e| matches!(e.kind, EnvelopeKind::Offer))
        .count();
    assert_eq!(offers, 1);
}

/// Both ends in one process: every envelope each core emits is ferried to
/// the other, like the signaling service would.
#[tokio::test]
async fn two_cores_complete_a_full_handshake() {
    let cockpit = Harness::start("c1");
    let vehicle = Harness::start("v1");

    let ferry = |from: &Harness, to: &Harness| {
        let from_link = from.link.clone();
        let to_link = to.link.clone();
        let to_id = to.local_id.clone();
        tokio::spawn(async move {
            loop {
                for envelope in from_link.take_sent() {
                    let addressed_here =
                        envelope.to.is_none() || envelope.to.as_ref() == Some(&to_id);
                    if addressed_here && !matches!(envelope.kind, EnvelopeKind::Join) {
                        to_link.deliver(envelope);
                    }
                }
                sleep(Duration::from_millis(2)).await;
            }
        })
    };
    let ferries = [ferry(&cockpit, &vehicle), ferry(&vehicle, &cockpit)];

    cockpit
        .core
        .connect_to(&PeerId::from("v1"))
        .expect("connect_to");

    let cockpit_ctl = cockpit
        .connector
        .wait_for_peer(&PeerId::from("v1"), SHORT)
        .await;
    let vehicle_ctl = vehicle
        .connector
        .wait_for_peer(&PeerId::from("c1"), SHORT)
        .await;
    assert_eq!(cockpit_ctl.role(), SessionRole::Offerer);
    assert_eq!(vehicle_ctl.role(), SessionRole::Answerer);

    // Candidates trickle both ways.
    cockpit_ctl.emit_local_candidate(candidate(0));
    vehicle_ctl.emit_local_candidate(candidate(1));
    vehicle_ctl.wait_remote_candidates(1, SHORT).await;
    cockpit_ctl.wait_remote_candidates(1, SHORT).await;

    cockpit_ctl.establish();
    vehicle_ctl.establish();
    cockpit
        .wait_event("cockpit sees vehicle", |event| {
            matches!(event, CoreEvent::PeerUp { peer } if peer.as_str() == "v1")
        })
        .await;
    vehicle
        .wait_event("vehicle sees cockpit", |event| {
            matches!(event, CoreEvent::PeerUp { peer } if peer.as_str() == "c1")
        })
        .await;

    for ferry in ferries {
        ferry.abort();
    }
}
