//! Basic type definitions for the client engine
//!
//! Provides newtype wrappers for type safety:
//! - `SessionId`: UUID-based identifier of one logged-in session
//! - `EventId`: UUID-based identifier of one async event
//! - `ClientId`: the 8-digit connection id sent to the service

use uuid::Uuid;

/// Unique session identifier (newtype pattern)
///
/// Keys the signal registry, so subscriptions never leak between sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(pub Uuid);

impl SessionId {
    /// Create a new random session ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique async event identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventId(pub Uuid);

impl EventId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Connection id sent with every channel request
///
/// The service expects an 8-digit decimal number chosen by the client.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct ClientId(pub String);

impl ClientId {
    /// Generate a new random 8-digit client id
    pub fn generate() -> Self {
        use rand::Rng;
        let n: u32 = rand::thread_rng().gen_range(10_000_000..100_000_000);
        Self(n.to_string())
    }

    /// Wrap an existing id (e.g. one restored from a previous login)
    pub fn from_string(id: String) -> Self {
        Self(id)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_id_unique() {
        let id1 = SessionId::new();
        let id2 = SessionId::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_client_id_length() {
        let id = ClientId::generate();
        assert_eq!(id.0.len(), 8);
        assert!(id.0.chars().all(|c| c.is_ascii_digit()));
    }
}
