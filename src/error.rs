//! Error types shared by the playback engine
//!
//! Connection and source failures are typed so the actor can decide which ones end a
//! track silently and which ones are reported as playback errors.

use std::path::PathBuf;
use thiserror::Error;

/// Errors returned to callers of the supervisor and actor APIs
#[derive(Error, Debug)]
pub enum PlayerError {
    #[error("Guild is not connected. Call join first.")]
    NotConnected,
    #[error("Player actor has shut down")]
    ActorClosed,
    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),
    #[error("Source error: {0}")]
    Source(#[from] SourceError),
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Errors raised while opening or reading an audio source
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("{name} not found. Searched: {searched}")]
    ExecutableNotFound { name: String, searched: String },
    #[error("Failed to start {program:?}: {source}")]
    Spawn {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Fetch stage exited with {code:?}: {stderr}")]
    FetchFailed { code: Option<i32>, stderr: String },
    #[error("Invalid metadata: {0}")]
    Metadata(#[from] serde_json::Error),
    #[error("Stream factory failed: {0}")]
    Factory(String),
}

/// Errors raised by a [`crate::connection::ConnectionAdapter`]
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("Voice connection is closed")]
    Closed,
    #[error("Voice driver error: {0}")]
    Driver(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
