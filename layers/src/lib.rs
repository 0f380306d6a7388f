//! PDCCH Scanning Layers Library
//!
//! This crate implements the blind DCI search over the LTE control region
//! (`phy`) and the real-time decoding pipeline around it (`mac`).

pub mod phy;
pub mod mac;

use thiserror::Error;

/// Common errors for the scanning layers
#[derive(Error, Debug)]
pub enum LayerError {
    #[error("PHY initialization failed: {0}")]
    PhyInit(String),

    #[error("Control region estimation failed: {0}")]
    ControlRegion(String),

    #[error("Candidate decode failed: {0}")]
    CandidateDecode(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Initialization failed: {0}")]
    InitializationFailed(String),

    #[error("Front-end error: {0}")]
    FrontEnd(#[from] interfaces::InterfaceError),

    #[error("Thread spawn failed: {0}")]
    Spawn(#[from] std::io::Error),
}
