//! Error types for the DHCP server.
//!
//! All fallible operations in this crate return [`Result<T>`], which uses
//! the [`Error`] enum for error variants.

/// Errors that can occur while configuring or running the server.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// File system or network I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error (config files).
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The address plan is missing required fields or is inconsistent.
    ///
    /// Raised while deriving lease parameters; fatal to startup.
    #[error("Invalid address plan: {0}")]
    InvalidPlan(String),

    /// Invalid server configuration outside the address plan itself.
    ///
    /// Returned by [`ServerConfig::validate`](crate::ServerConfig::validate),
    /// e.g. for an empty peer hardware address.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Socket creation, configuration or bind failure.
    ///
    /// Typically a missing privilege for port 67, an address already in use,
    /// or a device that does not exist in the current network namespace.
    #[error("Bind error: {0}")]
    Bind(String),

    /// Malformed DHCP packet received.
    ///
    /// The packet is too short, lacks the magic cookie, or violates the
    /// fixed header rules.
    #[error("Malformed DHCP packet: {0}")]
    MalformedPacket(String),

    /// The option block of a DHCP packet could not be consumed.
    #[error("Malformed DHCP options: {0}")]
    MalformedOptions(String),

    /// [`DhcpServer::serve`](crate::DhcpServer::serve) was called without a
    /// listener, or after a previous serve loop already consumed it.
    #[error("No listener is set up")]
    NotListening,
}

/// A specialized Result type for DHCP operations.
pub type Result<T> = std::result::Result<T, Error>;
