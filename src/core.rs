//! The public façade consumed by the cockpit and vehicle orchestrators.
//!
//! `Core` owns its tokio runtime, so the embedding application needs none of
//! its own: every public method is callable from plain threads. Commands and
//! frames are enqueued, never processed inline, and callbacks fire on the
//! dispatcher worker (or the configured executor); `send` never runs user
//! code synchronously.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::runtime::Runtime;

use crate::config::{ConfigError, CoreConfig};
use crate::dispatch::{
    Command, CoreEvent, Event, EventKind, EventQueue, HandlerTable, DEFAULT_QUEUE_LIMIT,
};
use crate::link::{Link, LinkConfig, WsLink};
use crate::monitor;
use crate::registry::{Registry, RegistrySettings};
use crate::rtc::web::WebRtcConnector;
use crate::rtc::{PeerConnector, RtcSettings};
use crate::session::{self, SendError, ShareMap};
use crate::signal::PeerId;

/// Margin on top of the shutdown deadline before `stop` gives up waiting.
const STOP_WAIT_MARGIN: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("core is already started")]
    AlreadyStarted,
    #[error("core is not started")]
    NotStarted,
    #[error("core is stopped")]
    Stopped,
    #[error("core has failed")]
    Failed,
    #[error("runtime setup failed: {0}")]
    Runtime(String),
}

/// Builds the signaling link at start time; swapped out in tests.
pub type LinkFactory =
    Box<dyn FnOnce(EventQueue, &tokio::runtime::Handle) -> Arc<dyn Link> + Send>;

#[derive(Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Running,
    Stopped,
}

struct Inner {
    phase: Phase,
    connector: Arc<dyn PeerConnector>,
    link_factory: Option<LinkFactory>,
    events: Option<EventQueue>,
    worker: Option<tokio::task::JoinHandle<()>>,
    monitor: Option<tokio::task::JoinHandle<()>>,
}

pub struct Core {
    config: CoreConfig,
    runtime: Runtime,
    handlers: HandlerTable,
    share: ShareMap,
    inner: Mutex<Inner>,
}

impl Core {
    /// Validates the configuration and assembles a core over the WebRTC
    /// stack and the websocket signaling link.
    pub fn new(config: CoreConfig) -> Result<Core, CoreError> {
        let connector = Arc::new(WebRtcConnector::new(RtcSettings {
            ice_servers: config.ice_servers.clone(),
            labels: config.channels.clone(),
            channel_buffer_bytes: config.channel_buffer_bytes,
        }));
        let link_config = LinkConfig::from_core(&config);
        Core::with_parts(
            config,
            connector,
            Box::new(move |events, handle| {
                WsLink::spawn(link_config, events, handle) as Arc<dyn Link>
            }),
        )
    }

    /// Assembly seam: the same core over any transport factory and link.
    /// Tests pair this with `rtc::mock` and `link::mock`.
    pub fn with_parts(
        config: CoreConfig,
        connector: Arc<dyn PeerConnector>,
        link_factory: LinkFactory,
    ) -> Result<Core, CoreError> {
        config.validate()?;
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("teleop-core")
            .enable_all()
            .build()
            .map_err(|err| CoreError::Runtime(err.to_string()))?;
        Ok(Core {
            handlers: HandlerTable::new(config.executor.clone()),
            share: session::new_share_map(),
            config,
            runtime,
            inner: Mutex::new(Inner {
                phase: Phase::Idle,
                connector,
                link_factory: Some(link_factory),
                events: None,
                worker: None,
                monitor: None,
            }),
        })
    }

    pub fn local_id(&self) -> &PeerId {
        &self.config.local_id
    }

    /// Registers a handler. Subscriptions are fixed before `start`; the
    /// runtime never mutates its observer set afterwards.
    pub fn on(
        &self,
        kind: EventKind,
        handler: impl Fn(&CoreEvent) + Send + Sync + 'static,
    ) -> Result<(), CoreError> {
        let inner = self.inner.lock();
        match inner.phase {
            Phase::Idle => {
                self.handlers.on(kind, Arc::new(handler));
                Ok(())
            }
            Phase::Running => Err(CoreError::AlreadyStarted),
            Phase::Stopped => Err(CoreError::Stopped),
        }
    }

    pub fn start(&self) -> Result<(), CoreError> {
        let mut inner = self.inner.lock();
        match inner.phase {
            Phase::Idle => {}
            Phase::Running => return Err(CoreError::AlreadyStarted),
            Phase::Stopped => return Err(CoreError::Stopped),
        }

        let (events, rx) = EventQueue::new(DEFAULT_QUEUE_LIMIT);
        let factory = inner
            .link_factory
            .take()
            .ok_or(CoreError::AlreadyStarted)?;
        let link = factory(events.clone(), self.runtime.handle());

        let registry = Registry::new(
            RegistrySettings::from_core(&self.config),
            inner.connector.clone(),
            link,
            events.clone(),
            self.handlers.clone(),
            self.share.clone(),
        );
        inner.worker = Some(self.runtime.spawn(registry.run(rx)));
        inner.monitor = monitor::spawn(
            self.runtime.handle(),
            events.clone(),
            self.config.heartbeat.interval,
        );
        inner.events = Some(events);
        inner.phase = Phase::Running;
        tracing::info!(target: "core", local_id = %self.config.local_id, "core started");
        Ok(())
    }

    /// Blocks until every session's terminal event has been delivered and
    /// the link has closed, bounded by the shutdown deadline.
    pub fn stop(&self) -> Result<(), CoreError> {
        let events = {
            let inner = self.inner.lock();
            match inner.phase {
                Phase::Running => inner.events.clone().ok_or(CoreError::NotStarted)?,
                Phase::Idle => return Err(CoreError::NotStarted),
                Phase::Stopped => return Ok(()),
            }
        };

        let (done_tx, done_rx) = std::sync::mpsc::channel();
        let posted = events.post(Event::Command(Command::Stop { done: done_tx }));
        if posted {
            let wait = self.config.shutdown_deadline + STOP_WAIT_MARGIN;
            if done_rx.recv_timeout(wait).is_err() {
                tracing::warn!(target: "core", "stop did not drain within the deadline");
            }
        }

        let mut inner = self.inner.lock();
        inner.phase = Phase::Stopped;
        inner.events = None;
        if let Some(monitor) = inner.monitor.take() {
            monitor.abort();
        }
        inner.worker = None;
        self.share.write().clear();
        tracing::info!(target: "core", local_id = %self.config.local_id, "core stopped");
        Ok(())
    }

    /// Idempotent: a peer with an existing session keeps it.
    pub fn connect_to(&self, peer: &PeerId) -> Result<(), CoreError> {
        self.command(Command::ConnectTo { peer: peer.clone() })
    }

    pub fn disconnect(&self, peer: &PeerId, reason: &str) -> Result<(), CoreError> {
        self.command(Command::Disconnect {
            peer: peer.clone(),
            reason: reason.to_string(),
        })
    }

    /// Non-blocking; the frame lands in the channel's bounded queue or the
    /// call reports why not. Never invokes callbacks synchronously.
    pub fn send(&self, peer: &PeerId, label: &str, payload: Bytes) -> Result<(), SendError> {
        session::send_via(&self.share, peer, label, payload)
    }

    /// Sends to every connected peer; one result per peer attempted.
    pub fn broadcast(&self, label: &str, payload: Bytes) -> Vec<(PeerId, Result<(), SendError>)> {
        session::broadcast_via(&self.share, label, &payload)
    }

    fn command(&self, command: Command) -> Result<(), CoreError> {
        let events = {
            let inner = self.inner.lock();
            match inner.phase {
                Phase::Running => inner.events.clone().ok_or(CoreError::NotStarted)?,
                Phase::Idle => return Err(CoreError::NotStarted),
                Phase::Stopped => return Err(CoreError::Stopped),
            }
        };
        if events.post(Event::Command(command)) {
            Ok(())
        } else {
            Err(CoreError::Failed)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::mock::CapturedLink;
    use crate::rtc::mock::MockConnector;

    fn mock_core(local_id: &str) -> (Core, Arc<MockConnector>) {
        let mut config = CoreConfig::default();
        config.local_id = PeerId::from(local_id);
        let connector = MockConnector::new(RtcSettings {
            ice_servers: Vec::new(),
            labels: config.channels.clone(),
            channel_buffer_bytes: config.channel_buffer_bytes,
        });
        let parts_connector = connector.clone();
        let core = Core::with_parts(
            config,
            parts_connector,
            Box::new(|events, _handle| CapturedLink::new(events) as Arc<dyn Link>),
        )
        .expect("core");
        (core, connector)
    }

    #[test]
    fn lifecycle_guards_command_and_subscription_order() {
        let (core, _connector) = mock_core("c1");
        assert!(matches!(
            core.connect_to(&PeerId::from("v1")),
            Err(CoreError::NotStarted)
        ));
        core.on(EventKind::PeerUp, |_| {}).expect("subscribe");

        core.start().expect("start");
        assert!(matches!(core.start(), Err(CoreError::AlreadyStarted)));
        assert!(matches!(
            core.on(EventKind::PeerUp, |_| {}),
            Err(CoreError::AlreadyStarted)
        ));

        core.stop().expect("stop");
        assert!(core.stop().is_ok());
        assert!(matches!(
            core.connect_to(&PeerId::from("v1")),
            Err(CoreError::Stopped)
        ));
    }

    #[test]
    fn send_without_session_reports_peer_gone() {
        let (core, _connector) = mock_core("c1");
        core.start().expect("start");
        assert_eq!(
            core.send(&PeerId::from("v1"), "control", Bytes::from_static(b"x")),
            Err(SendError::PeerGone)
        );
        assert!(core.broadcast("telemetry", Bytes::from_static(b"t")).is_empty());
        core.stop().expect("stop");
    }

    #[test]
    fn invalid_config_is_rejected_up_front() {
        let mut config = CoreConfig::default();
        config.local_id = PeerId::new("");
        assert!(matches!(
            Core::new(config),
            Err(CoreError::Config(ConfigError::EmptyLocalId))
        ));
    }
}
