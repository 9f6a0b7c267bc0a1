use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use switchboard_proto::{ClientEnvelope, ServerEnvelope, Verdict};

use crate::coordinator::Coordinator;
use crate::registry::{ConnectionId, Registry};

/// Dispatches incoming envelopes to registry/coordinator operations.
/// One envelope at a time per connection, in arrival order; envelopes
/// from different connections may interleave arbitrarily.
pub struct Router {
    registry: Arc<Registry>,
    coordinator: Coordinator,
}

impl Router {
    pub fn new(registry: Arc<Registry>) -> Self {
        let coordinator = Coordinator::new(Arc::clone(&registry));
        Self {
            registry,
            coordinator,
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Handle one envelope from `conn`. `reply` is the connection's own
    /// outgoing channel, usable before the connection has registered.
    pub fn dispatch(
        &self,
        conn: ConnectionId,
        reply: &mpsc::UnboundedSender<ServerEnvelope>,
        envelope: ClientEnvelope,
    ) {
        match envelope {
            ClientEnvelope::Register { name } => {
                match self.registry.register(conn, &name, reply.clone()) {
                    Ok(()) => {
                        info!(connection = %conn, name = %name, "endpoint registered");
                        let _ = reply.send(ServerEnvelope::RegisterResponse {
                            response: Verdict::Accepted,
                            message: None,
                        });
                    }
                    Err(err) => {
                        debug!(connection = %conn, name = %name, error = %err, "registration rejected");
                        let _ = reply.send(ServerEnvelope::RegisterResponse {
                            response: Verdict::Rejected,
                            message: Some(err.to_string()),
                        });
                    }
                }
            }
            ClientEnvelope::List => {
                let _ = reply.send(ServerEnvelope::ListResponse {
                    list: self.registry.list_names(),
                });
            }
            ClientEnvelope::Call {
                from,
                to,
                sdp_offer,
            } => match self.registry.name_of(conn) {
                Some(registered) => {
                    if registered != from {
                        // The pairing is keyed by the sender's actual
                        // registration, not the claimed name.
                        warn!(
                            connection = %conn,
                            claimed = %from,
                            registered = %registered,
                            "call envelope carries a mismatched caller name"
                        );
                    }
                    self.coordinator
                        .place_call(conn, &registered, &to, sdp_offer);
                }
                None => {
                    let _ = reply.send(ServerEnvelope::call_rejected("not registered"));
                }
            },
            ClientEnvelope::IncomingCallResponse {
                from,
                call_response,
                sdp_answer,
            } => {
                self.coordinator
                    .answer_call(conn, &from, call_response, sdp_answer);
            }
            ClientEnvelope::OnIceCandidate { candidate } => {
                self.coordinator.relay_candidate(conn, candidate);
            }
            ClientEnvelope::Answer { sdp } => {
                self.coordinator.relay_answer(conn, sdp);
            }
            ClientEnvelope::Stop => {
                self.coordinator.release(conn);
            }
            ClientEnvelope::Ping => {
                let _ = reply.send(ServerEnvelope::Pong);
            }
            ClientEnvelope::Unknown => {
                debug!(connection = %conn, "ignoring unknown envelope kind");
            }
        }
    }

    /// Close events unregister immediately and sever the counterpart's
    /// pairing; racing an explicit withdrawal is fine.
    pub fn connection_closed(&self, conn: ConnectionId) {
        self.coordinator.connection_closed(conn);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use switchboard_proto::{CallDecision, CandidateInit, SessionDescription};

    struct TestConn {
        id: ConnectionId,
        tx: mpsc::UnboundedSender<ServerEnvelope>,
        rx: mpsc::UnboundedReceiver<ServerEnvelope>,
    }

    impl TestConn {
        fn new() -> Self {
            let (tx, rx) = mpsc::unbounded_channel();
            Self {
                id: ConnectionId::new(),
                tx,
                rx,
            }
        }

        fn recv(&mut self) -> ServerEnvelope {
            self.rx.try_recv().expect("expected an outgoing envelope")
        }

        fn assert_silent(&mut self) {
            assert!(self.rx.try_recv().is_err(), "expected no outgoing envelope");
        }
    }

    fn router() -> Router {
        Router::new(Arc::new(Registry::new()))
    }

    fn register(router: &Router, conn: &mut TestConn, name: &str) {
        router.dispatch(
            conn.id,
            &conn.tx,
            ClientEnvelope::Register { name: name.into() },
        );
        match conn.recv() {
            ServerEnvelope::RegisterResponse {
                response: Verdict::Accepted,
                ..
            } => {}
            other => panic!("unexpected registration outcome: {other:?}"),
        }
    }

    fn candidate(tag: &str) -> CandidateInit {
        CandidateInit {
            candidate: format!("candidate:{tag} 1 UDP 2122252543 192.0.2.1 54400 typ host"),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
        }
    }

    #[test_timeout::timeout]
    fn round_trip_script() {
        let router = router();
        let mut alice = TestConn::new();
        let mut imposter = TestConn::new();

        register(&router, &mut alice, "alice");

        router.dispatch(
            imposter.id,
            &imposter.tx,
            ClientEnvelope::Register {
                name: "alice".into(),
            },
        );
        match imposter.recv() {
            ServerEnvelope::RegisterResponse {
                response: Verdict::Rejected,
                ..
            } => {}
            other => panic!("expected rejection, got {other:?}"),
        }

        router.dispatch(alice.id, &alice.tx, ClientEnvelope::List);
        assert_eq!(
            alice.recv(),
            ServerEnvelope::ListResponse {
                list: vec!["alice".into()],
            }
        );

        router.dispatch(
            alice.id,
            &alice.tx,
            ClientEnvelope::Call {
                from: "alice".into(),
                to: "bob".into(),
                sdp_offer: SessionDescription::offer("v=0"),
            },
        );
        match alice.recv() {
            ServerEnvelope::CallResponse {
                response: Verdict::Rejected,
                message: Some(message),
                sdp_answer: None,
            } => assert_eq!(message, "peer not found"),
            other => panic!("expected peer-not-found rejection, got {other:?}"),
        }
        assert!(router.registry().peer_of(alice.id).is_none());
    }

    #[test_timeout::timeout]
    fn pairing_is_symmetric_before_any_candidate_relay() {
        let router = router();
        let mut alice = TestConn::new();
        let mut bob = TestConn::new();
        register(&router, &mut alice, "alice");
        register(&router, &mut bob, "bob");

        router.dispatch(
            alice.id,
            &alice.tx,
            ClientEnvelope::Call {
                from: "alice".into(),
                to: "bob".into(),
                sdp_offer: SessionDescription::offer("v=0 alice"),
            },
        );

        // Both references point at each other before the callee answers.
        assert_eq!(router.registry().peer_of(alice.id).as_deref(), Some("bob"));
        assert_eq!(router.registry().peer_of(bob.id).as_deref(), Some("alice"));
        assert_eq!(
            bob.recv(),
            ServerEnvelope::IncomingCall {
                from: "alice".into(),
                offer: SessionDescription::offer("v=0 alice"),
            }
        );

        // Candidates relay both ways through the stored pairing.
        router.dispatch(
            bob.id,
            &bob.tx,
            ClientEnvelope::OnIceCandidate {
                candidate: candidate("b0"),
            },
        );
        assert_eq!(
            alice.recv(),
            ServerEnvelope::IceCandidate {
                candidate: candidate("b0"),
            }
        );
        router.dispatch(
            alice.id,
            &alice.tx,
            ClientEnvelope::OnIceCandidate {
                candidate: candidate("a0"),
            },
        );
        assert_eq!(
            bob.recv(),
            ServerEnvelope::IceCandidate {
                candidate: candidate("a0"),
            }
        );
    }

    #[test_timeout::timeout]
    fn acceptance_relays_answer_and_stored_offer() {
        let router = router();
        let mut alice = TestConn::new();
        let mut bob = TestConn::new();
        register(&router, &mut alice, "alice");
        register(&router, &mut bob, "bob");

        router.dispatch(
            alice.id,
            &alice.tx,
            ClientEnvelope::Call {
                from: "alice".into(),
                to: "bob".into(),
                sdp_offer: SessionDescription::offer("v=0 alice"),
            },
        );
        bob.recv();

        router.dispatch(
            bob.id,
            &bob.tx,
            ClientEnvelope::IncomingCallResponse {
                from: "alice".into(),
                call_response: CallDecision::Accept,
                sdp_answer: Some(SessionDescription::answer("v=0 bob")),
            },
        );

        assert_eq!(
            alice.recv(),
            ServerEnvelope::CallResponse {
                response: Verdict::Accepted,
                message: None,
                sdp_answer: Some(SessionDescription::answer("v=0 bob")),
            }
        );
        assert_eq!(
            bob.recv(),
            ServerEnvelope::StartCommunication {
                sdp: SessionDescription::offer("v=0 alice"),
            }
        );

        // The stored offer is consumed: a second acceptance relays no
        // completion envelope.
        router.dispatch(
            bob.id,
            &bob.tx,
            ClientEnvelope::IncomingCallResponse {
                from: "alice".into(),
                call_response: CallDecision::Accept,
                sdp_answer: None,
            },
        );
        alice.recv();
        bob.assert_silent();
    }

    #[test_timeout::timeout]
    fn rejection_notifies_the_caller_and_unpairs() {
        let router = router();
        let mut alice = TestConn::new();
        let mut bob = TestConn::new();
        register(&router, &mut alice, "alice");
        register(&router, &mut bob, "bob");

        router.dispatch(
            alice.id,
            &alice.tx,
            ClientEnvelope::Call {
                from: "alice".into(),
                to: "bob".into(),
                sdp_offer: SessionDescription::offer("v=0"),
            },
        );
        bob.recv();

        router.dispatch(
            bob.id,
            &bob.tx,
            ClientEnvelope::IncomingCallResponse {
                from: "alice".into(),
                call_response: CallDecision::Reject,
                sdp_answer: None,
            },
        );

        match alice.recv() {
            ServerEnvelope::CallResponse {
                response: Verdict::Rejected,
                ..
            } => {}
            other => panic!("expected rejection, got {other:?}"),
        }
        assert!(router.registry().peer_of(alice.id).is_none());
        assert!(router.registry().peer_of(bob.id).is_none());
    }

    #[test_timeout::timeout]
    fn callee_vanishing_mid_call_resolves_to_peer_not_found() {
        let router = router();
        let mut alice = TestConn::new();
        let mut bob = TestConn::new();
        register(&router, &mut alice, "alice");
        register(&router, &mut bob, "bob");

        // Bob's close races ahead of Alice's call being processed.
        router.connection_closed(bob.id);

        router.dispatch(
            alice.id,
            &alice.tx,
            ClientEnvelope::Call {
                from: "alice".into(),
                to: "bob".into(),
                sdp_offer: SessionDescription::offer("v=0"),
            },
        );
        match alice.recv() {
            ServerEnvelope::CallResponse {
                response: Verdict::Rejected,
                message: Some(message),
                ..
            } => assert_eq!(message, "peer not found"),
            other => panic!("expected peer-not-found, got {other:?}"),
        }
        assert!(router.registry().peer_of(alice.id).is_none());
    }

    #[test_timeout::timeout]
    fn disconnect_clears_the_counterpart_pairing() {
        let router = router();
        let mut alice = TestConn::new();
        let mut bob = TestConn::new();
        register(&router, &mut alice, "alice");
        register(&router, &mut bob, "bob");

        router.dispatch(
            alice.id,
            &alice.tx,
            ClientEnvelope::Call {
                from: "alice".into(),
                to: "bob".into(),
                sdp_offer: SessionDescription::offer("v=0"),
            },
        );
        bob.recv();

        router.connection_closed(alice.id);

        // Bob's pairing is gone, so his candidates and answers drop
        // silently instead of erroring.
        assert!(router.registry().peer_of(bob.id).is_none());
        router.dispatch(
            bob.id,
            &bob.tx,
            ClientEnvelope::OnIceCandidate {
                candidate: candidate("b0"),
            },
        );
        router.dispatch(
            bob.id,
            &bob.tx,
            ClientEnvelope::Answer {
                sdp: SessionDescription::answer("v=0"),
            },
        );
        bob.assert_silent();

        // And bob's own stop still works as a no-op release.
        router.dispatch(bob.id, &bob.tx, ClientEnvelope::Stop);
        bob.assert_silent();
    }

    #[test_timeout::timeout]
    fn stop_releases_both_sides_and_notifies_the_peer() {
        let router = router();
        let mut alice = TestConn::new();
        let mut bob = TestConn::new();
        register(&router, &mut alice, "alice");
        register(&router, &mut bob, "bob");

        router.dispatch(
            alice.id,
            &alice.tx,
            ClientEnvelope::Call {
                from: "alice".into(),
                to: "bob".into(),
                sdp_offer: SessionDescription::offer("v=0"),
            },
        );
        bob.recv();

        router.dispatch(alice.id, &alice.tx, ClientEnvelope::Stop);

        assert_eq!(bob.recv(), ServerEnvelope::StopCommunication);
        assert!(router.registry().peer_of(alice.id).is_none());
        assert!(router.registry().peer_of(bob.id).is_none());

        // Neither side can relay candidates through the severed pairing.
        router.dispatch(
            alice.id,
            &alice.tx,
            ClientEnvelope::OnIceCandidate {
                candidate: candidate("a0"),
            },
        );
        bob.assert_silent();
    }

    #[test_timeout::timeout]
    fn answer_relays_as_transport_completion() {
        let router = router();
        let mut alice = TestConn::new();
        let mut bob = TestConn::new();
        register(&router, &mut alice, "alice");
        register(&router, &mut bob, "bob");

        router.dispatch(
            alice.id,
            &alice.tx,
            ClientEnvelope::Call {
                from: "alice".into(),
                to: "bob".into(),
                sdp_offer: SessionDescription::offer("v=0"),
            },
        );
        bob.recv();

        router.dispatch(
            bob.id,
            &bob.tx,
            ClientEnvelope::Answer {
                sdp: SessionDescription::answer("v=0 late"),
            },
        );
        assert_eq!(
            alice.recv(),
            ServerEnvelope::StartCommunication {
                sdp: SessionDescription::answer("v=0 late"),
            }
        );
    }

    #[test_timeout::timeout]
    fn unpaired_candidate_is_dropped_silently() {
        let router = router();
        let mut alice = TestConn::new();
        register(&router, &mut alice, "alice");

        router.dispatch(
            alice.id,
            &alice.tx,
            ClientEnvelope::OnIceCandidate {
                candidate: candidate("a0"),
            },
        );
        alice.assert_silent();
    }

    #[test_timeout::timeout]
    fn call_from_unregistered_connection_is_rejected() {
        let router = router();
        let mut stranger = TestConn::new();

        router.dispatch(
            stranger.id,
            &stranger.tx,
            ClientEnvelope::Call {
                from: "ghost".into(),
                to: "alice".into(),
                sdp_offer: SessionDescription::offer("v=0"),
            },
        );
        match stranger.recv() {
            ServerEnvelope::CallResponse {
                response: Verdict::Rejected,
                message: Some(message),
                ..
            } => assert_eq!(message, "not registered"),
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[test_timeout::timeout]
    fn unknown_kinds_and_pings_behave() {
        let router = router();
        let mut alice = TestConn::new();

        router.dispatch(alice.id, &alice.tx, ClientEnvelope::Unknown);
        alice.assert_silent();

        router.dispatch(alice.id, &alice.tx, ClientEnvelope::Ping);
        assert_eq!(alice.recv(), ServerEnvelope::Pong);
    }

    #[test_timeout::timeout]
    fn candidate_relay_order_is_preserved_per_pair() {
        let router = router();
        let mut alice = TestConn::new();
        let mut bob = TestConn::new();
        register(&router, &mut alice, "alice");
        register(&router, &mut bob, "bob");

        router.dispatch(
            alice.id,
            &alice.tx,
            ClientEnvelope::Call {
                from: "alice".into(),
                to: "bob".into(),
                sdp_offer: SessionDescription::offer("v=0"),
            },
        );
        bob.recv();

        for tag in ["a0", "a1", "a2"] {
            router.dispatch(
                alice.id,
                &alice.tx,
                ClientEnvelope::OnIceCandidate {
                    candidate: candidate(tag),
                },
            );
        }
        for tag in ["a0", "a1", "a2"] {
            assert_eq!(
                bob.recv(),
                ServerEnvelope::IceCandidate {
                    candidate: candidate(tag),
                }
            );
        }
    }
}
