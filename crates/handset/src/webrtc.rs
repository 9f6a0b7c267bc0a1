//! Media-session capability backed by the `webrtc` crate. Only the
//! negotiation surface is adapted here; tracks and data channels are the
//! embedding application's business.

use async_trait::async_trait;
use std::sync::Arc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;

use switchboard_proto::{CandidateInit, SdpKind, SessionDescription};

use crate::capability::{
    MediaEventKind, MediaEvents, MediaSession, MediaSessionFactory, SignalingPhase,
};
use crate::error::MediaError;

/// Creates one `RTCPeerConnection`-backed session per call attempt.
pub struct WebRtcFactory {
    ice_servers: Vec<String>,
}

impl WebRtcFactory {
    pub fn new(ice_servers: Vec<String>) -> Self {
        Self { ice_servers }
    }
}

impl Default for WebRtcFactory {
    fn default() -> Self {
        Self {
            ice_servers: vec![
                "stun:stun.l.google.com:19302".to_string(),
                "stun:stun1.l.google.com:19302".to_string(),
                "stun:stun.services.mozilla.com".to_string(),
            ],
        }
    }
}

#[async_trait]
impl MediaSessionFactory for WebRtcFactory {
    async fn create(&self, events: MediaEvents) -> Result<Arc<dyn MediaSession>, MediaError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(to_engine_error)?;
        let mut registry = Registry::new();
        registry =
            register_default_interceptors(registry, &mut media_engine).map_err(to_engine_error)?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: self.ice_servers.clone(),
                ..Default::default()
            }],
            ..Default::default()
        };
        let pc = Arc::new(
            api.new_peer_connection(config)
                .await
                .map_err(to_engine_error)?,
        );

        let candidate_events = events.clone();
        pc.on_ice_candidate(Box::new(move |candidate| {
            let events = candidate_events.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    // End of gathering; nothing to trickle.
                    return;
                };
                match candidate.to_json() {
                    Ok(json) => events.emit(MediaEventKind::LocalCandidate(CandidateInit {
                        candidate: json.candidate,
                        sdp_mid: json.sdp_mid,
                        sdp_mline_index: json.sdp_mline_index.map(|idx| idx as u32),
                    })),
                    Err(err) => {
                        tracing::warn!(target: "handset", error = %err, "failed to serialize local candidate");
                    }
                }
            })
        }));

        let phase_events = events.clone();
        pc.on_signaling_state_change(Box::new(move |state| {
            let events = phase_events.clone();
            Box::pin(async move {
                events.emit(MediaEventKind::SignalingPhase(map_phase(state)));
            })
        }));

        let renegotiation_events = events.clone();
        pc.on_negotiation_needed(Box::new(move || {
            let events = renegotiation_events.clone();
            Box::pin(async move {
                events.emit(MediaEventKind::NegotiationNeeded);
            })
        }));

        pc.on_peer_connection_state_change(Box::new(move |state| {
            let events = events.clone();
            Box::pin(async move {
                if state == RTCPeerConnectionState::Failed {
                    events.emit(MediaEventKind::Failed("peer connection failed".into()));
                }
            })
        }));

        Ok(Arc::new(WebRtcSession { pc }))
    }
}

struct WebRtcSession {
    pc: Arc<RTCPeerConnection>,
}

#[async_trait]
impl MediaSession for WebRtcSession {
    async fn create_offer(&self) -> Result<SessionDescription, MediaError> {
        let offer = self.pc.create_offer(None).await.map_err(to_engine_error)?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription, MediaError> {
        let answer = self.pc.create_answer(None).await.map_err(to_engine_error)?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), MediaError> {
        self.pc
            .set_local_description(to_rtc_description(description)?)
            .await
            .map_err(to_engine_error)
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), MediaError> {
        self.pc
            .set_remote_description(to_rtc_description(description)?)
            .await
            .map_err(to_engine_error)
    }

    async fn add_candidate(&self, candidate: CandidateInit) -> Result<(), MediaError> {
        if self.pc.remote_description().await.is_none() {
            return Err(MediaError::RemoteDescriptionMissing);
        }
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index.map(|idx| idx as u16),
            username_fragment: None,
        };
        self.pc.add_ice_candidate(init).await.map_err(to_engine_error)
    }

    async fn has_remote_description(&self) -> bool {
        self.pc.remote_description().await.is_some()
    }

    async fn close(&self) {
        if let Err(err) = self.pc.close().await {
            tracing::debug!(target: "handset", error = %err, "peer connection close failed");
        }
    }
}

fn to_rtc_description(description: SessionDescription) -> Result<RTCSessionDescription, MediaError> {
    match description.kind {
        SdpKind::Offer => RTCSessionDescription::offer(description.sdp).map_err(to_engine_error),
        SdpKind::Answer => RTCSessionDescription::answer(description.sdp).map_err(to_engine_error),
    }
}

fn map_phase(state: RTCSignalingState) -> SignalingPhase {
    match state {
        RTCSignalingState::Stable => SignalingPhase::Stable,
        RTCSignalingState::Closed => SignalingPhase::Closed,
        _ => SignalingPhase::Negotiating,
    }
}

fn to_engine_error(err: impl std::fmt::Display) -> MediaError {
    MediaError::Engine(err.to_string())
}
