//! Front-end and Export Interfaces Library
//! 
//! This crate provides the radio front-end sample sources and the exporters
//! (UDP remote sink, tab-separated DCI logs) around the decoding core.

pub mod source;
pub mod zmq_rf;
pub mod remote_sink;
pub mod dci_log;

use thiserror::Error;

/// Interface errors
#[derive(Error, Debug)]
pub enum InterfaceError {
    #[error("ZMQ error: {0}")]
    ZmqError(#[from] zmq::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid message format: {0}")]
    InvalidMessage(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Initialization failed: {0}")]
    InitializationFailed(String),

    #[error("Timed out waiting for samples")]
    Timeout,

    #[error("Sample stream ended")]
    EndOfStream,
}

impl InterfaceError {
    /// Errors after which the next acquisition may still succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, InterfaceError::Timeout | InterfaceError::InvalidMessage(_))
    }
}
