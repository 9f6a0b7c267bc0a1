use thiserror::Error;

/// Failures surfaced by the signaling link and the public handle.
#[derive(Debug, Error)]
pub enum HandsetError {
    #[error("signaling setup failed: {0}")]
    Setup(String),
    #[error("signaling channel closed")]
    ChannelClosed,
}

/// Failures reported by the media transport engine. Local to the
/// endpoint that produced them; they never reach the relay.
#[derive(Debug, Error)]
pub enum MediaError {
    #[error("media engine failure: {0}")]
    Engine(String),
    #[error("no remote description set")]
    RemoteDescriptionMissing,
}
