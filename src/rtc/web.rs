//! WebRTC-backed peer transports.
//!
//! Each peer gets its own `RTCPeerConnection`; every library callback is
//! translated into a dispatcher event carrying the peer id, never a handle.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{API, APIBuilder};
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use crate::dispatch::{Event, EventQueue, SessionEvent};
use crate::session::{ChannelPump, ChannelSender, SessionRole};
use crate::signal::{Candidate, PeerId};

use super::{PeerConnector, PeerTransport, RtcError, RtcSettings, SdpKind, TransportPhase};

pub struct WebRtcConnector {
    settings: RtcSettings,
}

impl WebRtcConnector {
    pub fn new(settings: RtcSettings) -> Self {
        WebRtcConnector { settings }
    }

    fn rtc_configuration(&self) -> RTCConfiguration {
        RTCConfiguration {
            ice_servers: self
                .settings
                .ice_servers
                .iter()
                .map(|server| RTCIceServer {
                    urls: vec![server.uri.clone()],
                    username: server.username.clone().unwrap_or_default(),
                    credential: server.credential.clone().unwrap_or_default(),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        }
    }
}

fn to_setup_error<E: std::fmt::Display>(err: E) -> RtcError {
    RtcError::Setup(err.to_string())
}

fn build_api() -> Result<API, RtcError> {
    let mut media_engine = MediaEngine::default();
    media_engine
        .register_default_codecs()
        .map_err(to_setup_error)?;

    let mut registry = Registry::new();
    registry = register_default_interceptors(registry, &mut media_engine).map_err(to_setup_error)?;

    let mut setting = SettingEngine::default();
    setting.set_ice_timeouts(
        Some(Duration::from_secs(3)),
        Some(Duration::from_secs(10)),
        Some(Duration::from_millis(500)),
    );

    Ok(APIBuilder::new()
        .with_setting_engine(setting)
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build())
}

#[async_trait]
impl PeerConnector for WebRtcConnector {
    async fn connect(
        &self,
        peer: &PeerId,
        role: SessionRole,
        events: EventQueue,
    ) -> Result<Arc<dyn PeerTransport>, RtcError> {
        let api = build_api()?;
        let pc = Arc::new(
            api.new_peer_connection(self.rtc_configuration())
                .await
                .map_err(to_setup_error)?,
        );
        tracing::debug!(target: "rtc", peer = %peer, ?role, "peer connection created");

        let candidate_peer = peer.clone();
        let candidate_events = events.clone();
        pc.on_ice_candidate(Box::new(move |candidate| {
            let peer = candidate_peer.clone();
            let events = candidate_events.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    return;
                };
                match candidate.to_json() {
                    Ok(json) => {
                        events.post(Event::Session {
                            peer,
                            event: SessionEvent::LocalCandidate {
                                candidate: Candidate {
                                    mid: json.sdp_mid.unwrap_or_default(),
                                    mline_index: json.sdp_mline_index.unwrap_or(0) as i32,
                                    sdp: json.candidate,
                                },
                            },
                        });
                    }
                    Err(err) => {
                        tracing::warn!(target: "rtc", peer = %peer, error = %err, "candidate serialization failed");
                    }
                }
            })
        }));

        let state_peer = peer.clone();
        let state_events = events.clone();
        pc.on_peer_connection_state_change(Box::new(move |state| {
            let peer = state_peer.clone();
            let events = state_events.clone();
            Box::pin(async move {
                tracing::debug!(target: "rtc", peer = %peer, ?state, "connection state changed");
                events.post(Event::Session {
                    peer,
                    event: SessionEvent::PhaseChanged {
                        phase: map_phase(state),
                    },
                });
            })
        }));

        let renegotiate_peer = peer.clone();
        let renegotiate_events = events.clone();
        pc.on_negotiation_needed(Box::new(move || {
            let peer = renegotiate_peer.clone();
            let events = renegotiate_events.clone();
            Box::pin(async move {
                events.post(Event::Session {
                    peer,
                    event: SessionEvent::RenegotiationNeeded,
                });
            })
        }));

        // Channels created by the remote side surface here; the offerer's
        // own pre-created channels are registered directly below.
        let incoming_peer = peer.clone();
        let incoming_events = events.clone();
        let capacity = self.settings.channel_buffer_bytes;
        pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
            let peer = incoming_peer.clone();
            let events = incoming_events.clone();
            Box::pin(async move {
                register_channel(&peer, dc, events, capacity);
            })
        }));

        if role == SessionRole::Offerer {
            for label in self.settings.labels.all() {
                // Heartbeats tolerate reordering; command and telemetry do not.
                let ordered = label != self.settings.labels.heartbeat;
                let dc = pc
                    .create_data_channel(
                        label,
                        Some(RTCDataChannelInit {
                            ordered: Some(ordered),
                            ..Default::default()
                        }),
                    )
                    .await
                    .map_err(to_setup_error)?;
                register_channel(peer, dc, events.clone(), capacity);
            }
        }

        Ok(Arc::new(WebRtcPeer { pc }))
    }
}

/// Hooks one data channel into the event queue and arms its writer pump.
/// The pump starts on open so nothing is written to a half-ready channel.
fn register_channel(peer: &PeerId, dc: Arc<RTCDataChannel>, events: EventQueue, capacity: usize) {
    let label = dc.label().to_string();
    let (sender, pump) = ChannelSender::pair(capacity);
    let pump_slot: Arc<Mutex<Option<ChannelPump>>> = Arc::new(Mutex::new(Some(pump)));

    let open_peer = peer.clone();
    let open_label = label.clone();
    let open_events = events.clone();
    let open_dc = dc.clone();
    dc.on_open(Box::new(move || {
        let peer = open_peer.clone();
        let label = open_label.clone();
        let events = open_events.clone();
        let dc = open_dc.clone();
        let sender = sender.clone();
        let pump_slot = pump_slot.clone();
        Box::pin(async move {
            tracing::debug!(target: "rtc", peer = %peer, label = %label, "data channel open");
            let pump = pump_slot.lock().ok().and_then(|mut slot| slot.take());
            if let Some(mut pump) = pump {
                let writer_peer = peer.clone();
                let writer_label = label.clone();
                tokio::spawn(async move {
                    while let Some(frame) = pump.recv().await {
                        if let Err(err) = dc.send(frame.payload()).await {
                            tracing::warn!(
                                target: "rtc",
                                peer = %writer_peer,
                                label = %writer_label,
                                error = %err,
                                "data channel write failed"
                            );
                            break;
                        }
                    }
                });
            }
            events.post(Event::Session {
                peer,
                event: SessionEvent::ChannelOpen { label, sender },
            });
        })
    }));

    let message_peer = peer.clone();
    let message_label = label.clone();
    let message_events = events.clone();
    dc.on_message(Box::new(move |message: DataChannelMessage| {
        let peer = message_peer.clone();
        let label = message_label.clone();
        let events = message_events.clone();
        Box::pin(async move {
            events.post(Event::Session {
                peer,
                event: SessionEvent::Frame {
                    label,
                    payload: message.data,
                },
            });
        })
    }));

    let close_peer = peer.clone();
    let close_label = label.clone();
    let close_events = events.clone();
    dc.on_close(Box::new(move || {
        let peer = close_peer.clone();
        let label = close_label.clone();
        let events = close_events.clone();
        Box::pin(async move {
            events.post(Event::Session {
                peer,
                event: SessionEvent::ChannelClosed { label },
            });
        })
    }));

    let error_peer = peer.clone();
    let error_label = label;
    dc.on_error(Box::new(move |err| {
        let peer = error_peer.clone();
        let label = error_label.clone();
        let events = events.clone();
        Box::pin(async move {
            events.post(Event::Session {
                peer,
                event: SessionEvent::TransportError {
                    message: format!("channel {label}: {err}"),
                },
            });
        })
    }));
}

fn map_phase(state: RTCPeerConnectionState) -> TransportPhase {
    match state {
        RTCPeerConnectionState::New | RTCPeerConnectionState::Unspecified => TransportPhase::New,
        RTCPeerConnectionState::Connecting => TransportPhase::Connecting,
        RTCPeerConnectionState::Connected => TransportPhase::Connected,
        RTCPeerConnectionState::Disconnected => TransportPhase::Disconnected,
        RTCPeerConnectionState::Failed => TransportPhase::Failed,
        RTCPeerConnectionState::Closed => TransportPhase::Closed,
    }
}

struct WebRtcPeer {
    pc: Arc<RTCPeerConnection>,
}

#[async_trait]
impl PeerTransport for WebRtcPeer {
    async fn create_offer(&self) -> Result<String, RtcError> {
        let offer = self.pc.create_offer(None).await.map_err(to_setup_error)?;
        let sdp = offer.sdp.clone();
        self.pc
            .set_local_description(offer)
            .await
            .map_err(to_setup_error)?;
        Ok(sdp)
    }

    async fn create_answer(&self) -> Result<String, RtcError> {
        let answer = self.pc.create_answer(None).await.map_err(to_setup_error)?;
        let sdp = answer.sdp.clone();
        self.pc
            .set_local_description(answer)
            .await
            .map_err(to_setup_error)?;
        Ok(sdp)
    }

    async fn set_remote_description(&self, kind: SdpKind, sdp: &str) -> Result<(), RtcError> {
        let description = match kind {
            SdpKind::Offer => RTCSessionDescription::offer(sdp.to_string()),
            SdpKind::Answer => RTCSessionDescription::answer(sdp.to_string()),
        }
        .map_err(|err| RtcError::Sdp(err.to_string()))?;
        self.pc
            .set_remote_description(description)
            .await
            .map_err(|err| RtcError::Sdp(err.to_string()))
    }

    async fn add_remote_candidate(&self, candidate: &Candidate) -> Result<(), RtcError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.sdp.clone(),
            sdp_mid: Some(candidate.mid.clone()),
            sdp_mline_index: Some(candidate.mline_index as u16),
            username_fragment: None,
        };
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|err| RtcError::Candidate(err.to_string()))
    }

    async fn close(&self) {
        if let Err(err) = self.pc.close().await {
            tracing::debug!(target: "rtc", error = %err, "peer connection close failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_mapping_covers_terminal_states() {
        assert_eq!(
            map_phase(RTCPeerConnectionState::Connected),
            TransportPhase::Connected
        );
        assert_eq!(
            map_phase(RTCPeerConnectionState::Failed),
            TransportPhase::Failed
        );
        assert_eq!(
            map_phase(RTCPeerConnectionState::Closed),
            TransportPhase::Closed
        );
        assert_eq!(
            map_phase(RTCPeerConnectionState::Unspecified),
            TransportPhase::New
        );
    }
}
