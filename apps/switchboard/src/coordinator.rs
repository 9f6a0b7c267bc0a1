use std::sync::Arc;
use tracing::{debug, info};

use switchboard_proto::{CallDecision, CandidateInit, ServerEnvelope, SessionDescription, Verdict};

use crate::registry::{ConnectionId, Registry};

/// The peer-pairing half of call setup. Pairing is established by the
/// caller's `call` and is symmetric once accepted: both endpoints' peer
/// references point at each other before any candidate is relayed.
///
/// A reference to an endpoint that vanished mid-processing always
/// degrades to a rejection or a silent drop; nothing here is fatal to
/// any other session.
pub struct Coordinator {
    registry: Arc<Registry>,
}

impl Coordinator {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self { registry }
    }

    /// Pair `from` with `to`, store the caller's offer, and deliver the
    /// incoming-call notification. Resolves deterministically to "peer
    /// not found" when the callee is gone by the time we look.
    pub fn place_call(
        &self,
        caller_id: ConnectionId,
        from: &str,
        to: &str,
        offer: SessionDescription,
    ) {
        let Some(callee_id) = self.registry.resolve(to) else {
            self.registry
                .send_to(caller_id, ServerEnvelope::call_rejected("peer not found"));
            return;
        };

        // Caller side first; the callee may still vanish underneath us.
        self.registry.with_endpoint_mut(caller_id, |endpoint| {
            endpoint.peer = Some(to.to_string());
            endpoint.pending_offer = Some(offer.clone());
        });

        let delivered = self
            .registry
            .with_endpoint_mut(callee_id, |endpoint| {
                endpoint.peer = Some(from.to_string());
                endpoint.send(ServerEnvelope::IncomingCall {
                    from: from.to_string(),
                    offer: offer.clone(),
                });
            })
            .is_some();

        if delivered {
            info!(caller = %from, callee = %to, "call placed");
        } else {
            // Callee disconnected between lookup and pairing: undo the
            // caller half so no half-paired endpoint survives.
            self.registry.with_endpoint_mut(caller_id, |endpoint| {
                endpoint.peer = None;
                endpoint.pending_offer = None;
            });
            self.registry
                .send_to(caller_id, ServerEnvelope::call_rejected("peer not found"));
        }
    }

    /// The callee decided. Acceptance relays the answer (when present) to
    /// the caller and the stored offer back to the callee; rejection
    /// notifies the caller and releases the pairing on both sides.
    pub fn answer_call(
        &self,
        callee_id: ConnectionId,
        caller_name: &str,
        decision: CallDecision,
        answer: Option<SessionDescription>,
    ) {
        let callee_name = self.registry.name_of(callee_id);
        let caller_id = self.registry.resolve(caller_name);

        if decision == CallDecision::Reject || callee_name.is_none() {
            if let Some(caller_id) = caller_id {
                if let Some(callee_name) = callee_name.as_deref() {
                    self.registry.with_endpoint_mut(caller_id, |endpoint| {
                        if endpoint.peer.as_deref() == Some(callee_name) {
                            endpoint.peer = None;
                            endpoint.pending_offer = None;
                        }
                    });
                }
                self.registry
                    .send_to(caller_id, ServerEnvelope::call_rejected("call rejected"));
            }
            self.registry.with_endpoint_mut(callee_id, |endpoint| {
                endpoint.peer = None;
            });
            return;
        }

        let Some(caller_id) = caller_id else {
            // Caller vanished mid-handshake: nothing to relay, release
            // the callee so future candidates are not mis-routed.
            debug!(caller = %caller_name, "call acceptance for vanished caller dropped");
            self.registry.with_endpoint_mut(callee_id, |endpoint| {
                endpoint.peer = None;
            });
            return;
        };

        let offer = self
            .registry
            .with_endpoint_mut(caller_id, |endpoint| endpoint.pending_offer.take())
            .flatten();

        self.registry.send_to(
            caller_id,
            ServerEnvelope::CallResponse {
                response: Verdict::Accepted,
                message: None,
                sdp_answer: answer,
            },
        );

        // Transport completion for the callee consumes the stored offer.
        match offer {
            Some(offer) => self
                .registry
                .send_to(callee_id, ServerEnvelope::StartCommunication { sdp: offer }),
            None => debug!(
                caller = %caller_name,
                "accepted call has no stored offer; skipping completion relay"
            ),
        }
    }

    /// Relay a trickled candidate to the sender's current peer. Dropped
    /// silently when no pairing exists or the peer is gone.
    pub fn relay_candidate(&self, sender_id: ConnectionId, candidate: CandidateInit) {
        let Some(peer_name) = self.registry.peer_of(sender_id) else {
            debug!(connection = %sender_id, "candidate with no peer pairing dropped");
            return;
        };
        let Some(peer_id) = self.registry.resolve(&peer_name) else {
            debug!(connection = %sender_id, peer = %peer_name, "candidate for vanished peer dropped");
            return;
        };
        self.registry
            .send_to(peer_id, ServerEnvelope::IceCandidate { candidate });
    }

    /// Relay a later-stage answer to the sender's current peer
    /// (renegotiation path). Same degradation rules as candidates.
    pub fn relay_answer(&self, sender_id: ConnectionId, sdp: SessionDescription) {
        let Some(peer_name) = self.registry.peer_of(sender_id) else {
            debug!(connection = %sender_id, "answer with no peer pairing dropped");
            return;
        };
        let Some(peer_id) = self.registry.resolve(&peer_name) else {
            debug!(connection = %sender_id, peer = %peer_name, "answer for vanished peer dropped");
            return;
        };
        self.registry
            .send_to(peer_id, ServerEnvelope::StartCommunication { sdp });
    }

    /// Release the sender's pairing and its counterpart's, so no future
    /// candidate is mis-routed through a stale reference.
    pub fn release(&self, id: ConnectionId) {
        let Some(name) = self.registry.name_of(id) else {
            return;
        };
        let peer_name = self
            .registry
            .with_endpoint_mut(id, |endpoint| {
                endpoint.pending_offer = None;
                endpoint.peer.take()
            })
            .flatten();
        let Some(peer_name) = peer_name else {
            return;
        };
        if let Some(peer_id) = self.registry.resolve(&peer_name) {
            let released = self
                .registry
                .with_endpoint_mut(peer_id, |endpoint| {
                    // Only sever a pairing that still points back at us;
                    // the peer may have moved on to another call.
                    if endpoint.peer.as_deref() == Some(name.as_str()) {
                        endpoint.peer = None;
                        endpoint.pending_offer = None;
                        true
                    } else {
                        false
                    }
                })
                .unwrap_or(false);
            if released {
                self.registry
                    .send_to(peer_id, ServerEnvelope::StopCommunication);
            }
        }
        info!(endpoint = %name, "pairing released");
    }

    /// Connection closed: unregister immediately and clear the
    /// counterpart's peer reference, so the survivor does not keep
    /// relaying into a vanished identity. The survivor is not notified;
    /// its own `stop` returns it to idle.
    pub fn connection_closed(&self, id: ConnectionId) {
        let Some(endpoint) = self.registry.unregister(id) else {
            return;
        };
        info!(connection = %endpoint.id, endpoint = %endpoint.name, "endpoint unregistered");
        let Some(peer_name) = endpoint.peer else {
            return;
        };
        if let Some(peer_id) = self.registry.resolve(&peer_name) {
            self.registry.with_endpoint_mut(peer_id, |peer| {
                if peer.peer.as_deref() == Some(endpoint.name.as_str()) {
                    peer.peer = None;
                    peer.pending_offer = None;
                }
            });
        }
    }
}
