use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

use switchboard_proto::{CandidateInit, SessionDescription};

use crate::error::MediaError;

/// Coarse view of the engine's signaling progress, used to decide when
/// buffered candidates may drain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingPhase {
    Stable,
    Negotiating,
    Closed,
}

#[derive(Debug, Clone)]
pub enum MediaEventKind {
    /// A locally discovered candidate, ready to trickle to the peer.
    LocalCandidate(CandidateInit),
    SignalingPhase(SignalingPhase),
    /// The engine wants a (re)negotiation; drives deferred offer
    /// creation.
    NegotiationNeeded,
    Failed(String),
}

/// An engine event stamped with the call generation that produced it.
/// Events from a torn-down session carry a stale generation and are
/// discarded by the driver.
#[derive(Debug, Clone)]
pub struct MediaEvent {
    pub generation: u64,
    pub kind: MediaEventKind,
}

/// Handle a media session uses to report engine events back to the
/// negotiation driver.
#[derive(Debug, Clone)]
pub struct MediaEvents {
    generation: u64,
    tx: mpsc::UnboundedSender<MediaEvent>,
}

impl MediaEvents {
    pub fn new(generation: u64, tx: mpsc::UnboundedSender<MediaEvent>) -> Self {
        Self { generation, tx }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn emit(&self, kind: MediaEventKind) {
        let _ = self.tx.send(MediaEvent {
            generation: self.generation,
            kind,
        });
    }
}

/// Signaling-facing view of the media transport engine. The negotiation
/// driver only ever creates and applies descriptions and candidates
/// through this capability; media itself never passes through here.
#[async_trait]
pub trait MediaSession: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription, MediaError>;
    async fn create_answer(&self) -> Result<SessionDescription, MediaError>;
    async fn set_local_description(&self, description: SessionDescription)
        -> Result<(), MediaError>;
    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), MediaError>;
    /// Fails when no remote description is set; callers are expected to
    /// buffer until then.
    async fn add_candidate(&self, candidate: CandidateInit) -> Result<(), MediaError>;
    async fn has_remote_description(&self) -> bool;
    async fn close(&self);
}

/// Creates one media session per call attempt.
#[async_trait]
pub trait MediaSessionFactory: Send + Sync {
    async fn create(&self, events: MediaEvents) -> Result<Arc<dyn MediaSession>, MediaError>;
}
