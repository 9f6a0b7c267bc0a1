//! Endpoint-side library for one-to-one call negotiation over a
//! switchboard relay.
//!
//! A [`Handset`] owns one signaling connection and one negotiation state
//! machine. The media transport engine is consumed through the
//! [`MediaSession`] capability; [`WebRtcFactory`] provides the default
//! engine and tests substitute their own.
//!
//! ```no_run
//! use std::sync::Arc;
//! use handset::{Handset, NegotiationProfile, WebRtcFactory};
//!
//! # async fn run() -> Result<(), handset::HandsetError> {
//! let handset = Handset::connect(
//!     "ws://localhost:8000",
//!     NegotiationProfile::Eager,
//!     Arc::new(WebRtcFactory::default()),
//! )
//! .await?;
//! handset.register("alice")?;
//! let mut events = handset.events().await?;
//! handset.call("bob")?;
//! while let Some(event) = events.recv().await {
//!     println!("{event:?}");
//! }
//! # Ok(())
//! # }
//! ```

mod candidates;
mod capability;
mod error;
mod negotiation;
mod signaling;
mod webrtc;

pub use candidates::CandidateBuffer;
pub use capability::{
    MediaEvent, MediaEventKind, MediaEvents, MediaSession, MediaSessionFactory, SignalingPhase,
};
pub use error::{HandsetError, MediaError};
pub use negotiation::{Command, HandsetEvent, Negotiation, NegotiationProfile, NegotiationState};
pub use signaling::SignalingLink;
pub use self::webrtc::WebRtcFactory;

use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, Mutex as AsyncMutex};

use capability::MediaEvent as EngineEvent;

/// Public handle over one connected endpoint. Commands are enqueued to
/// the driver task; observations come back on the event stream.
pub struct Handset {
    commands: mpsc::UnboundedSender<Command>,
    events: AsyncMutex<Option<mpsc::UnboundedReceiver<HandsetEvent>>>,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
    _link: Arc<SignalingLink>,
}

impl Handset {
    /// Open the signaling connection and start the negotiation driver.
    pub async fn connect(
        relay_url: &str,
        profile: NegotiationProfile,
        factory: Arc<dyn MediaSessionFactory>,
    ) -> Result<Arc<Self>, HandsetError> {
        let link = SignalingLink::connect(relay_url).await?;
        let envelopes = link.envelopes().await?;

        let (command_tx, command_rx) = mpsc::unbounded_channel::<Command>();
        let (event_tx, event_rx) = mpsc::unbounded_channel::<HandsetEvent>();
        let (media_tx, media_rx) = mpsc::unbounded_channel::<EngineEvent>();

        let negotiation = Negotiation::new(profile, factory, link.sender(), event_tx, media_tx);
        let driver = tokio::spawn(run_driver(negotiation, envelopes, command_rx, media_rx));

        Ok(Arc::new(Self {
            commands: command_tx,
            events: AsyncMutex::new(Some(event_rx)),
            tasks: Mutex::new(vec![driver]),
            _link: link,
        }))
    }

    pub fn register(&self, name: impl Into<String>) -> Result<(), HandsetError> {
        self.command(Command::Register { name: name.into() })
    }

    pub fn list(&self) -> Result<(), HandsetError> {
        self.command(Command::List)
    }

    pub fn call(&self, to: impl Into<String>) -> Result<(), HandsetError> {
        self.command(Command::Call { to: to.into() })
    }

    pub fn hang_up(&self) -> Result<(), HandsetError> {
        self.command(Command::HangUp)
    }

    /// Take the event stream. Single-consumer; a second take fails.
    pub async fn events(&self) -> Result<mpsc::UnboundedReceiver<HandsetEvent>, HandsetError> {
        let mut guard = self.events.lock().await;
        guard
            .take()
            .ok_or_else(|| HandsetError::Setup("event stream already taken".into()))
    }

    fn command(&self, command: Command) -> Result<(), HandsetError> {
        self.commands
            .send(command)
            .map_err(|_| HandsetError::ChannelClosed)
    }
}

impl Drop for Handset {
    fn drop(&mut self) {
        if let Ok(mut tasks) = self.tasks.lock() {
            for handle in tasks.drain(..) {
                handle.abort();
            }
        }
    }
}

/// One logical actor per endpoint: protocol envelopes, engine events,
/// and local commands are serialized through a single loop, so every
/// state transition observes a consistent machine.
async fn run_driver(
    mut negotiation: Negotiation,
    mut envelopes: mpsc::UnboundedReceiver<switchboard_proto::ServerEnvelope>,
    mut commands: mpsc::UnboundedReceiver<Command>,
    mut engine: mpsc::UnboundedReceiver<EngineEvent>,
) {
    loop {
        tokio::select! {
            envelope = envelopes.recv() => match envelope {
                Some(envelope) => negotiation.handle_envelope(envelope).await,
                None => break,
            },
            command = commands.recv() => match command {
                Some(command) => negotiation.handle_command(command).await,
                None => break,
            },
            event = engine.recv() => match event {
                Some(event) => negotiation.handle_media_event(event).await,
                None => break,
            },
        }
    }
    tracing::debug!(target: "handset", "negotiation driver stopped");
}
