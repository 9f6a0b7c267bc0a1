use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use switchboard_proto::{
    CallDecision, ClientEnvelope, SdpKind, ServerEnvelope, SessionDescription, Verdict,
};

use crate::candidates::CandidateBuffer;
use crate::capability::{
    MediaEvent, MediaEventKind, MediaEvents, MediaSession, MediaSessionFactory, SignalingPhase,
};

/// Endpoint-local progress marker for the current call attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    /// Connected, not yet registered.
    Initial,
    /// Registered and idle.
    Waiting,
    /// Offer/answer exchange in flight.
    Processing,
    /// Local and remote descriptions both set.
    InCall,
}

/// When descriptions are created. The relay protocol is the same either
/// way; deferred adds the standalone `answer` envelope on the return
/// path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationProfile {
    /// The caller creates its offer at call time and the callee answers
    /// inside the call-acceptance response.
    Eager,
    /// Offer creation waits for the engine to ask for one, and the
    /// callee transmits its answer as a separate envelope.
    Deferred,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CallRole {
    Caller,
    Callee,
}

/// Locally initiated actions, fed to the driver by the public handle.
#[derive(Debug, Clone)]
pub enum Command {
    Register { name: String },
    List,
    Call { to: String },
    HangUp,
}

/// What the application observes.
#[derive(Debug, Clone, PartialEq)]
pub enum HandsetEvent {
    Registered,
    RegistrationRejected { reason: Option<String> },
    PeerList(Vec<String>),
    IncomingCall { from: String },
    CallEstablished { peer: String },
    CallRejected { reason: Option<String> },
    CallEnded,
    CallFailed { reason: String },
}

/// The endpoint-side negotiation state machine. Driven by discrete
/// events: protocol envelopes from the relay, engine events from the
/// media capability, and locally initiated commands. Each transition's
/// precondition is checked explicitly; anything out of order is dropped
/// with a diagnostic rather than propagated.
pub struct Negotiation {
    profile: NegotiationProfile,
    factory: Arc<dyn MediaSessionFactory>,
    outbound: mpsc::UnboundedSender<ClientEnvelope>,
    events: mpsc::UnboundedSender<HandsetEvent>,
    media_tx: mpsc::UnboundedSender<MediaEvent>,
    state: NegotiationState,
    name: Option<String>,
    peer: Option<String>,
    role: Option<CallRole>,
    media: Option<Arc<dyn MediaSession>>,
    buffer: CandidateBuffer,
    /// Bumped on every session create and teardown; engine events from
    /// older generations are stale and ignored.
    generation: u64,
    local_set: bool,
    remote_set: bool,
}

impl Negotiation {
    pub fn new(
        profile: NegotiationProfile,
        factory: Arc<dyn MediaSessionFactory>,
        outbound: mpsc::UnboundedSender<ClientEnvelope>,
        events: mpsc::UnboundedSender<HandsetEvent>,
        media_tx: mpsc::UnboundedSender<MediaEvent>,
    ) -> Self {
        Self {
            profile,
            factory,
            outbound,
            events,
            media_tx,
            state: NegotiationState::Initial,
            name: None,
            peer: None,
            role: None,
            media: None,
            buffer: CandidateBuffer::new(),
            generation: 0,
            local_set: false,
            remote_set: false,
        }
    }

    pub fn state(&self) -> NegotiationState {
        self.state
    }

    pub fn profile(&self) -> NegotiationProfile {
        self.profile
    }

    pub async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Register { name } => {
                self.name = Some(name.clone());
                self.send(ClientEnvelope::Register { name });
            }
            Command::List => self.send(ClientEnvelope::List),
            Command::Call { to } => self.place_call(to).await,
            Command::HangUp => self.hang_up().await,
        }
    }

    pub async fn handle_envelope(&mut self, envelope: ServerEnvelope) {
        match envelope {
            ServerEnvelope::RegisterResponse { response, message } => {
                self.on_register_response(response, message);
            }
            ServerEnvelope::ListResponse { list } => {
                self.emit(HandsetEvent::PeerList(list));
            }
            ServerEnvelope::IncomingCall { from, offer } => {
                self.on_incoming_call(from, offer).await;
            }
            ServerEnvelope::CallResponse {
                response,
                message,
                sdp_answer,
            } => {
                self.on_call_response(response, message, sdp_answer).await;
            }
            ServerEnvelope::StartCommunication { sdp } => {
                self.on_start_communication(sdp).await;
            }
            ServerEnvelope::IceCandidate { candidate } => {
                if self.media.is_none() {
                    debug!("candidate with no active negotiation dropped");
                    return;
                }
                let ready = self.buffer.accept(candidate);
                self.apply_candidates(ready).await;
            }
            ServerEnvelope::StopCommunication => {
                if matches!(
                    self.state,
                    NegotiationState::Processing | NegotiationState::InCall
                ) {
                    self.teardown().await;
                    self.emit(HandsetEvent::CallEnded);
                }
            }
            ServerEnvelope::Pong => trace!("pong"),
            ServerEnvelope::Unknown => debug!("ignoring unknown envelope kind"),
        }
    }

    pub async fn handle_media_event(&mut self, event: MediaEvent) {
        if event.generation != self.generation {
            trace!(
                generation = event.generation,
                current = self.generation,
                "stale media event dropped"
            );
            return;
        }
        match event.kind {
            MediaEventKind::LocalCandidate(candidate) => {
                // Locally produced candidates go out immediately; the
                // relay routes them through the stored pairing.
                if self.peer.is_some() {
                    self.send(ClientEnvelope::OnIceCandidate { candidate });
                } else {
                    debug!("local candidate with no peer dropped");
                }
            }
            MediaEventKind::SignalingPhase(SignalingPhase::Stable) => {
                let has_remote = match &self.media {
                    Some(media) => media.has_remote_description().await,
                    None => false,
                };
                if has_remote {
                    let ready = self.buffer.open();
                    self.apply_candidates(ready).await;
                }
            }
            MediaEventKind::SignalingPhase(phase) => trace!(?phase, "signaling phase"),
            MediaEventKind::NegotiationNeeded => self.on_negotiation_needed().await,
            MediaEventKind::Failed(reason) => self.fail_back_to_waiting(reason).await,
        }
    }

    fn on_register_response(&mut self, response: Verdict, message: Option<String>) {
        match response {
            Verdict::Accepted => {
                if self.state == NegotiationState::Initial {
                    self.state = NegotiationState::Waiting;
                    self.emit(HandsetEvent::Registered);
                }
            }
            Verdict::Rejected => {
                self.name = None;
                self.emit(HandsetEvent::RegistrationRejected { reason: message });
            }
        }
    }

    async fn place_call(&mut self, to: String) {
        if self.state != NegotiationState::Waiting {
            warn!(state = ?self.state, "call ignored: endpoint is not idle");
            return;
        }
        let Some(from) = self.name.clone() else {
            warn!("call ignored: not registered");
            return;
        };

        self.state = NegotiationState::Processing;
        self.role = Some(CallRole::Caller);
        self.peer = Some(to.clone());
        let Some(media) = self.start_media().await else {
            return;
        };

        match self.profile {
            NegotiationProfile::Eager => {
                let offer = match media.create_offer().await {
                    Ok(offer) => offer,
                    Err(err) => return self.fail_back_to_waiting(err.to_string()).await,
                };
                if let Err(err) = media.set_local_description(offer.clone()).await {
                    return self.fail_back_to_waiting(err.to_string()).await;
                }
                self.local_set = true;
                self.send(ClientEnvelope::Call {
                    from,
                    to,
                    sdp_offer: offer,
                });
            }
            NegotiationProfile::Deferred => {
                // The offer waits for the engine's negotiation-needed
                // signal (local media being attached, typically).
                trace!(peer = %to, "deferring offer creation");
            }
        }
    }

    async fn on_incoming_call(&mut self, from: String, offer: SessionDescription) {
        if self.state != NegotiationState::Waiting {
            // Busy or unregistered: explicit rejection, not a silent
            // drop, so the caller is released promptly.
            self.send(ClientEnvelope::IncomingCallResponse {
                from,
                call_response: CallDecision::Reject,
                sdp_answer: None,
            });
            return;
        }

        self.state = NegotiationState::Processing;
        self.role = Some(CallRole::Callee);
        self.peer = Some(from.clone());
        self.emit(HandsetEvent::IncomingCall { from: from.clone() });
        let Some(media) = self.start_media().await else {
            return;
        };

        match self.profile {
            NegotiationProfile::Eager => {
                if let Err(err) = media.set_remote_description(offer).await {
                    return self.fail_back_to_waiting(err.to_string()).await;
                }
                self.remote_set = true;
                let ready = self.buffer.open();
                self.apply_candidates(ready).await;

                let answer = match media.create_answer().await {
                    Ok(answer) => answer,
                    Err(err) => return self.fail_back_to_waiting(err.to_string()).await,
                };
                if let Err(err) = media.set_local_description(answer.clone()).await {
                    return self.fail_back_to_waiting(err.to_string()).await;
                }
                self.local_set = true;
                self.send(ClientEnvelope::IncomingCallResponse {
                    from,
                    call_response: CallDecision::Accept,
                    sdp_answer: Some(answer),
                });
                self.maybe_established();
            }
            NegotiationProfile::Deferred => {
                // Accept now; the relay sends the offer back as the
                // transport-completion envelope and the answer returns
                // as a standalone `answer`.
                self.send(ClientEnvelope::IncomingCallResponse {
                    from,
                    call_response: CallDecision::Accept,
                    sdp_answer: None,
                });
            }
        }
    }

    async fn on_call_response(
        &mut self,
        response: Verdict,
        message: Option<String>,
        sdp_answer: Option<SessionDescription>,
    ) {
        if self.state != NegotiationState::Processing || self.role != Some(CallRole::Caller) {
            debug!(state = ?self.state, "call response out of sequence dropped");
            return;
        }
        match response {
            Verdict::Rejected => {
                self.teardown().await;
                self.emit(HandsetEvent::CallRejected { reason: message });
            }
            Verdict::Accepted => match sdp_answer {
                Some(answer) => {
                    self.apply_remote(answer).await;
                    self.maybe_established();
                }
                // Deferred callee: the answer arrives later as a
                // transport-completion envelope.
                None => trace!("call accepted, awaiting deferred answer"),
            },
        }
    }

    /// Transport completion carries whichever description this side
    /// still needs: the stored offer for a callee, a relayed answer for
    /// a caller.
    async fn on_start_communication(&mut self, sdp: SessionDescription) {
        if self.media.is_none()
            || !matches!(
                self.state,
                NegotiationState::Processing | NegotiationState::InCall
            )
        {
            debug!("transport completion with no active negotiation dropped");
            return;
        }
        match sdp.kind {
            SdpKind::Answer => {
                self.apply_remote(sdp).await;
                self.maybe_established();
            }
            SdpKind::Offer => {
                if self.remote_set {
                    debug!("remote description already applied; duplicate offer ignored");
                    return;
                }
                self.apply_remote(sdp).await;
                if !self.remote_set {
                    return;
                }
                if self.profile == NegotiationProfile::Deferred {
                    let Some(media) = self.media.clone() else {
                        return;
                    };
                    let answer = match media.create_answer().await {
                        Ok(answer) => answer,
                        Err(err) => return self.fail_back_to_waiting(err.to_string()).await,
                    };
                    if let Err(err) = media.set_local_description(answer.clone()).await {
                        return self.fail_back_to_waiting(err.to_string()).await;
                    }
                    self.local_set = true;
                    self.send(ClientEnvelope::Answer { sdp: answer });
                }
                self.maybe_established();
            }
        }
    }

    async fn on_negotiation_needed(&mut self) {
        let deferred_offer_pending = self.profile == NegotiationProfile::Deferred
            && self.role == Some(CallRole::Caller)
            && self.state == NegotiationState::Processing
            && !self.local_set;
        if !deferred_offer_pending {
            trace!("negotiation-needed signal ignored");
            return;
        }
        let (Some(media), Some(from), Some(to)) =
            (self.media.clone(), self.name.clone(), self.peer.clone())
        else {
            return;
        };
        let offer = match media.create_offer().await {
            Ok(offer) => offer,
            Err(err) => return self.fail_back_to_waiting(err.to_string()).await,
        };
        if let Err(err) = media.set_local_description(offer.clone()).await {
            return self.fail_back_to_waiting(err.to_string()).await;
        }
        self.local_set = true;
        self.send(ClientEnvelope::Call {
            from,
            to,
            sdp_offer: offer,
        });
    }

    async fn hang_up(&mut self) {
        if !matches!(
            self.state,
            NegotiationState::Processing | NegotiationState::InCall
        ) {
            return;
        }
        self.send(ClientEnvelope::Stop);
        self.teardown().await;
        self.emit(HandsetEvent::CallEnded);
    }

    /// Create the per-call media session. On failure the endpoint falls
    /// back to idle and may retry.
    async fn start_media(&mut self) -> Option<Arc<dyn MediaSession>> {
        self.generation += 1;
        self.buffer.reset();
        self.local_set = false;
        self.remote_set = false;
        let events = MediaEvents::new(self.generation, self.media_tx.clone());
        match self.factory.create(events).await {
            Ok(media) => {
                self.media = Some(Arc::clone(&media));
                Some(media)
            }
            Err(err) => {
                self.fail_back_to_waiting(err.to_string()).await;
                None
            }
        }
    }

    async fn apply_remote(&mut self, description: SessionDescription) {
        let Some(media) = self.media.clone() else {
            return;
        };
        match media.set_remote_description(description).await {
            Ok(()) => {
                self.remote_set = true;
                let ready = self.buffer.open();
                self.apply_candidates(ready).await;
            }
            Err(err) => self.fail_back_to_waiting(err.to_string()).await,
        }
    }

    /// Apply candidates in order. An engine rejecting one candidate is
    /// not fatal to the call; the rest still apply.
    async fn apply_candidates(&mut self, ready: Vec<switchboard_proto::CandidateInit>) {
        let Some(media) = self.media.clone() else {
            return;
        };
        for candidate in ready {
            if let Err(err) = media.add_candidate(candidate).await {
                warn!(error = %err, "candidate rejected by the media engine");
            }
        }
    }

    fn maybe_established(&mut self) {
        if self.state == NegotiationState::Processing && self.local_set && self.remote_set {
            self.state = NegotiationState::InCall;
            let peer = self.peer.clone().unwrap_or_default();
            self.emit(HandsetEvent::CallEstablished { peer });
        }
    }

    async fn fail_back_to_waiting(&mut self, reason: String) {
        warn!(reason = %reason, "negotiation failed");
        self.teardown().await;
        self.emit(HandsetEvent::CallFailed { reason });
    }

    /// Release all per-call state and return to idle (or initial when
    /// never registered).
    async fn teardown(&mut self) {
        if let Some(media) = self.media.take() {
            media.close().await;
        }
        self.buffer.reset();
        self.peer = None;
        self.role = None;
        self.local_set = false;
        self.remote_set = false;
        self.generation += 1;
        if self.state != NegotiationState::Initial {
            self.state = NegotiationState::Waiting;
        }
    }

    fn send(&self, envelope: ClientEnvelope) {
        if self.outbound.send(envelope).is_err() {
            debug!("signaling link closed; outgoing envelope dropped");
        }
    }

    fn emit(&self, event: HandsetEvent) {
        let _ = self.events.send(event);
    }
}
