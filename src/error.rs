//! Crate-wide [`Error`] and [`Result`].
//!
//! Almost every error is fatal for the pipelines that observe it: the
//! process stops and resumes from the last durable checkpoint on restart.
//! Variants are grouped by where they surface so operators can tell a
//! configuration mistake from a protocol fault or a sink failure.
//!
//! # Example
//!
//! ```rust
//! use pg_truck::{Error, Result};
//!
//! fn open_sink(url: &str) -> Result<()> {
//!     if url.is_empty() {
//!         return Err(Error::Connection("no sink url".to_string()));
//!     }
//!     Ok(())
//! }
//!
//! match open_sink("") {
//!     Err(Error::Connection(reason)) => assert_eq!(reason, "no sink url"),
//!     other => panic!("unexpected {:?}", other),
//! }
//! ```

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// Invalid configuration, detected while validating the loaded file.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The configuration file or environment could not be loaded.
    #[error("Configuration load error: {0}")]
    ConfigLoad(#[from] config::ConfigError),

    /// Failure on a regular SQL connection (control, enrichment, sink or
    /// backfill).
    #[error("PostgreSQL error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    /// A wal2json payload is not valid JSON.
    #[error("JSON error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Socket failure on a replication connection.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connection error: {0}")]
    Connection(String),

    /// The server rejected the replication connection's credentials or
    /// asked for an unsupported method.
    #[error("Authentication error: {0}")]
    Authentication(String),

    /// Unexpected frame or server error on a replication connection.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Publication or slot reconciliation failed during startup.
    #[error("Setup error: {message}")]
    Setup { message: String },

    /// A replication command failed or the stream ended unexpectedly.
    #[error("Replication error: {message}")]
    Replication { message: String },

    /// A CopyBoth message or server value could not be parsed.
    #[error("Malformed message: {message}")]
    InvalidMessage { message: String },

    /// A change record could not be turned into a changeset.
    #[error("Decode error: {message}")]
    Decode { message: String },

    /// Snapshot backfill of a table failed. The table has to be backfilled
    /// again from a fresh snapshot.
    #[error("Backfill of {table} failed: {message}")]
    Backfill { table: String, message: String },

    /// Enrichment read or sink write failed for a pipeline.
    #[error("Pipeline {pipeline} failed: {message}")]
    Pipeline { pipeline: String, message: String },

    #[error("Timed out: {message}")]
    Timeout { message: String },

    /// Stop was requested, by Ctrl-C or by a failing pipeline. Travels as
    /// an error so every loop unwinds the same way.
    #[error("Shutdown requested")]
    Shutdown,
}

impl Error {
    pub(crate) fn decode(message: impl Into<String>) -> Self {
        Error::Decode {
            message: message.into(),
        }
    }

    pub(crate) fn setup(message: impl Into<String>) -> Self {
        Error::Setup {
            message: message.into(),
        }
    }

    pub(crate) fn invalid_message(message: impl Into<String>) -> Self {
        Error::InvalidMessage {
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
