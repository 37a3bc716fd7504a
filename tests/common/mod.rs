//! Shared harness for the scenario tests: a core assembled over the mock
//! transport and a captured signaling link, with every application event
//! recorded.

#![allow(dead_code)]

use std::mem::ManuallyDrop;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::{sleep, Instant};

use teleop_core::config::CoreConfig;
use teleop_core::core::Core;
use teleop_core::dispatch::{CoreEvent, EventKind};
use teleop_core::link::mock::CapturedLink;
use teleop_core::link::Link;
use teleop_core::rtc::mock::{MockConnector, MockPeerCtl};
use teleop_core::rtc::RtcSettings;
use teleop_core::signal::{Envelope, PeerId};
use teleop_core::telemetry;

pub const STEP: Duration = Duration::from_millis(5);
pub const SHORT: Duration = Duration::from_secs(2);

const ALL_KINDS: [EventKind; 8] = [
    EventKind::LinkUp,
    EventKind::LinkDown,
    EventKind::LinkError,
    EventKind::PeerUp,
    EventKind::PeerDown,
    EventKind::Message,
    EventKind::PeerError,
    EventKind::LivenessLost,
];

pub struct Harness {
    pub local_id: PeerId,
    // `Core` owns a multi-thread tokio runtime; dropping it from within
    // another runtime's worker (as happens implicitly when a `#[tokio::test]`
    // fn returns) panics. `Drop` below moves it to a plain thread instead.
    pub core: ManuallyDrop<Arc<Core>>,
    pub connector: Arc<MockConnector>,
    pub link: Arc<CapturedLink>,
    events: Arc<Mutex<Vec<CoreEvent>>>,
}

impl Drop for Harness {
    fn drop(&mut self) {
        let core = unsafe { ManuallyDrop::take(&mut self.core) };
        let _ = std::thread::spawn(move || drop(core)).join();
    }
}

impl Harness {
    pub fn start(local_id: &str) -> Harness {
        Harness::start_with(local_id, |_| {})
    }

    pub fn start_with(local_id: &str, tweak: impl FnOnce(&mut CoreConfig)) -> Harness {
        let _ = telemetry::logging::init(&Default::default());

        let mut config = CoreConfig::default();
        config.local_id = PeerId::from(local_id);
        tweak(&mut config);
        let local = config.local_id.clone();

        let connector = MockConnector::new(RtcSettings {
            ice_servers: config.ice_servers.clone(),
            labels: config.channels.clone(),
            channel_buffer_bytes: config.channel_buffer_bytes,
        });
        let link_slot: Arc<Mutex<Option<Arc<CapturedLink>>>> = Arc::new(Mutex::new(None));
        let slot = link_slot.clone();
        let core = Core::with_parts(
            config,
            connector.clone(),
            Box::new(move |events, _handle| {
                let link = CapturedLink::new(events);
                *slot.lock().unwrap() = Some(link.clone());
                link as Arc<dyn Link>
            }),
        )
        .expect("core assembles");

        let events: Arc<Mutex<Vec<CoreEvent>>> = Arc::new(Mutex::new(Vec::new()));
        for kind in ALL_KINDS {
            let log = events.clone();
            core.on(kind, move |event| log.lock().unwrap().push(event.clone()))
                .expect("subscribe before start");
        }

        core.start().expect("core starts");
        let link = link_slot
            .lock()
            .unwrap()
            .clone()
            .expect("link built at start");
        link.open();

        Harness {
            local_id: local,
            core: ManuallyDrop::new(Arc::new(core)),
            connector,
            link,
            events,
        }
    }

    pub fn events(&self) -> Vec<CoreEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn count(&self, pred: impl Fn(&CoreEvent) -> bool) -> usize {
        self.events().iter().filter(|event| pred(event)).count()
    }

    pub async fn wait_event(
        &self,
        what: &str,
        pred: impl Fn(&CoreEvent) -> bool,
    ) -> CoreEvent {
        let deadline = Instant::now() + SHORT;
        loop {
            if let Some(event) = self.events().into_iter().find(|event| pred(event)) {
                return event;
            }
            if Instant::now() >= deadline {
                panic!("timed out waiting for {what}; saw {:?}", self.events());
            }
            sleep(STEP).await;
        }
    }

    pub async fn wait_envelope(
        &self,
        what: &str,
        pred: impl Fn(&Envelope) -> bool,
    ) -> Envelope {
        let deadline = Instant::now() + SHORT;
        loop {
            if let Some(envelope) = self.link.sent().into_iter().find(|e| pred(e)) {
                return envelope;
            }
            if Instant::now() >= deadline {
                panic!("timed out waiting for {what}; sent {:?}", self.link.sent());
            }
            sleep(STEP).await;
        }
    }

    /// Dials `peer` and plays the remote side of a successful handshake:
    /// answers the offer and brings the transport up. Returns once
    /// `on_peer_up` has been observed.
    pub async fn establish(&self, peer: &str) -> Arc<MockPeerCtl> {
        let peer_id = PeerId::from(peer);
        self.core.connect_to(&peer_id).expect("connect_to");
        let ctl = self.connector.wait_for_peer(&peer_id, SHORT).await;

        let offer_to = peer_id.clone();
        self.wait_envelope("offer", |e| {
            matches!(e.kind, teleop_core::signal::EnvelopeKind::Offer)
                && e.to.as_ref() == Some(&offer_to)
        })
        .await;
        self.link.deliver(Envelope::answer(
            peer_id.clone(),
            self.local_id.clone(),
            format!("answer-sdp:{peer}"),
        ));
        ctl.establish();

        let up_peer = peer_id.clone();
        self.wait_event("peer up", move |event| {
            matches!(event, CoreEvent::PeerUp { peer } if *peer == up_peer)
        })
        .await;
        ctl
    }

    /// `Core::stop` blocks, so run it off the async test thread.
    pub async fn stop(&self) {
        let core = self.core.clone();
        tokio::task::spawn_blocking(move || core.stop())
            .await
            .expect("stop task")
            .expect("stop succeeds");
    }
}
