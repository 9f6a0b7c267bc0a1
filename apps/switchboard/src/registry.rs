use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::fmt;
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

use switchboard_proto::{ServerEnvelope, SessionDescription};

/// Server-assigned identity of one live signaling connection. Assigned on
/// upgrade, never reused, and gone once the socket closes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// One registered participant: the owning connection, its display name,
/// and the call state the coordinator layers on top.
pub struct Endpoint {
    pub id: ConnectionId,
    pub name: String,
    tx: mpsc::UnboundedSender<ServerEnvelope>,
    /// Display name of the endpoint currently being negotiated with. May
    /// go stale when that peer disconnects; stale is a valid transient
    /// state, not an error.
    pub peer: Option<String>,
    /// The offer this endpoint most recently sent as a caller, held until
    /// the callee's answer consumes it.
    pub pending_offer: Option<SessionDescription>,
}

impl Endpoint {
    fn new(id: ConnectionId, name: String, tx: mpsc::UnboundedSender<ServerEnvelope>) -> Self {
        Self {
            id,
            name,
            tx,
            peer: None,
            pending_offer: None,
        }
    }

    /// Fire-and-forget delivery. A closed socket is the reader task's
    /// problem, never the sender's.
    pub fn send(&self, envelope: ServerEnvelope) {
        let _ = self.tx.send(envelope);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RegisterError {
    #[error("name already in use")]
    NameTaken,
    #[error("connection already registered")]
    AlreadyRegistered,
}

/// The set of connected endpoints, indexed by connection identity and by
/// display name. `endpoints` is the authoritative store; `names` is the
/// derived lookup index and every mutation updates both.
///
/// Locking discipline: no map guard is held across an `await`, and the
/// name index is never acquired while an endpoint guard is held.
#[derive(Default)]
pub struct Registry {
    endpoints: DashMap<ConnectionId, Endpoint>,
    names: DashMap<String, ConnectionId>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `(id, name)` and create the Endpoint. Rejected when the name
    /// is held by a live endpoint (the same connection retrying included)
    /// or when the connection already registered under another name.
    pub fn register(
        &self,
        id: ConnectionId,
        name: &str,
        tx: mpsc::UnboundedSender<ServerEnvelope>,
    ) -> Result<(), RegisterError> {
        if self.endpoints.contains_key(&id) {
            return Err(RegisterError::AlreadyRegistered);
        }
        match self.names.entry(name.to_string()) {
            Entry::Occupied(_) => Err(RegisterError::NameTaken),
            // The name-shard guard stays held while the endpoint lands, so
            // a racing register of the same name observes it as taken.
            Entry::Vacant(slot) => {
                self.endpoints
                    .insert(id, Endpoint::new(id, name.to_string(), tx));
                slot.insert(id);
                Ok(())
            }
        }
    }

    /// Remove the endpoint bound to `id` from both indices. Idempotent:
    /// close events can race explicit withdrawal.
    pub fn unregister(&self, id: ConnectionId) -> Option<Endpoint> {
        let (_, endpoint) = self.endpoints.remove(&id)?;
        self.names
            .remove_if(&endpoint.name, |_, owner| *owner == id);
        Some(endpoint)
    }

    pub fn resolve(&self, name: &str) -> Option<ConnectionId> {
        self.names.get(name).map(|entry| *entry.value())
    }

    pub fn name_of(&self, id: ConnectionId) -> Option<String> {
        self.endpoints.get(&id).map(|entry| entry.name.clone())
    }

    pub fn peer_of(&self, id: ConnectionId) -> Option<String> {
        self.endpoints.get(&id).and_then(|entry| entry.peer.clone())
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    /// Names of all currently registered endpoints, sorted for stable
    /// output.
    pub fn list_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.names.iter().map(|entry| entry.key().clone()).collect();
        names.sort();
        names
    }

    /// Run `f` against the endpoint bound to `id`, if any. The closure
    /// must not call back into the registry while the guard is held.
    pub fn with_endpoint_mut<R>(
        &self,
        id: ConnectionId,
        f: impl FnOnce(&mut Endpoint) -> R,
    ) -> Option<R> {
        self.endpoints
            .get_mut(&id)
            .map(|mut entry| f(entry.value_mut()))
    }

    pub fn send_to(&self, id: ConnectionId, envelope: ServerEnvelope) {
        if let Some(endpoint) = self.endpoints.get(&id) {
            endpoint.send(envelope);
        }
    }
}
