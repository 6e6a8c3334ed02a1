use thiserror::Error;

/// A request the relay refused. The connection stays open and the client is
/// told why; the `Display` text is what goes on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RelayError {
    #[error("The provided username is already in use.")]
    UsernameTaken,

    #[error("The username cannot be empty.")]
    EmptyUsername,

    #[error("Already registered as {0}.")]
    AlreadyRegistered(String),

    #[error("Register a username before sending messages.")]
    NotRegistered,

    #[error("Source field doesn't match username in cache for this socket. No spoofing!")]
    Spoofed,

    #[error("Destination {0} is not a connected user, and also not ALL. The message was discarded.")]
    UnknownDestination(String),

    #[error("Invalid message received.")]
    Malformed,
}

impl RelayError {
    /// Rejections of a username are answered with a registration reply
    /// rather than a plain error.
    pub fn is_registration_rejection(&self) -> bool {
        matches!(self, RelayError::UsernameTaken | RelayError::EmptyUsername)
    }
}

/// A payload that could not be decoded, or an envelope that could not be
/// framed. A decode failure is fatal to the connection that sent it.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("payload is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("envelope cannot be framed: {0}")]
    Frame(#[from] std::io::Error),
}
