//! Error types and result handling for pglogical-capture.
//!
//! This module defines the main error type [`Error`] and a convenience
//! [`Result`] type alias used throughout the crate.
//!
//! # Example
//!
//! ```rust
//! use pglogical_capture::{Error, Result};
//!
//! fn connect_to_database() -> Result<()> {
//!     // Simulating a connection error
//!     Err(Error::Connection("Failed to connect".to_string()))
//! }
//!
//! match connect_to_database() {
//!     Ok(()) => println!("Connected"),
//!     Err(Error::Connection(msg)) => eprintln!("Connection error: {}", msg),
//!     Err(e) => eprintln!("Other error: {}", e),
//! }
//! ```

use thiserror::Error;

/// The main error type for capture operations.
///
/// Errors raised while setting up or starting a capture are returned to the
/// caller directly. Errors raised inside the background fetch loop end the
/// loop and are handed back as its terminal result.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error, typically from an invalid file or environment variable.
    #[error("Configuration error: {0}")]
    Config(String),

    /// PostgreSQL client error on the control connection.
    #[error("PostgreSQL error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    /// JSON serialization error, typically from checkpoint persistence.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error on a socket or checkpoint file.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The control or replication endpoint could not be reached.
    #[error("Connection error: {0}")]
    Connection(String),

    /// Authentication failure with PostgreSQL.
    #[error("Authentication error: {0}")]
    Authentication(String),

    /// Protocol-level error in the replication stream: a malformed
    /// identify response, keepalive or WAL record, or an unexpected message.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The server answered with an `ErrorResponse`.
    #[error("Server error: {message}")]
    Server {
        /// Server message, with SQLSTATE when present
        message: String,
    },

    /// The decoder collaborator rejected a WAL payload.
    #[error("Decode error: {0}")]
    Decode(String),

    /// Refreshing type metadata after a DDL event failed.
    #[error("Schema refresh failed: {0}")]
    SchemaRefresh(#[source] Box<Error>),

    /// Replication lifecycle error, such as capturing before setup.
    #[error("Replication error: {message}")]
    Replication {
        /// Description of the replication error
        message: String,
    },

    /// Invalid or malformed replication message.
    #[error("Invalid message format: {message}")]
    InvalidMessage {
        /// Description of what was invalid
        message: String,
    },

    /// Shutdown was requested or the change receiver went away.
    ///
    /// This is not really an error but uses the error mechanism
    /// to cleanly exit the fetch loop.
    #[error("Shutdown requested")]
    Shutdown,
}

/// A convenient Result type alias for capture operations.
///
/// This is equivalent to `std::result::Result<T, pglogical_capture::Error>`.
pub type Result<T> = std::result::Result<T, Error>;
