use std::io;

use crate::crypto::CryptoError;
use crate::device::DeviceError;
use crate::filter::FilterError;
use crate::nat::NatError;

/// Errors that stop the relay before or while it starts.
///
/// Per-packet failures (decode, decrypt, unknown session) never reach this
/// type; the loop that sees them drops the packet and carries on.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    #[error("filter: {0}")]
    Filter(#[from] FilterError),

    #[error("device: {0}")]
    Device(#[from] DeviceError),

    #[error("crypto: {0}")]
    Crypto(#[from] CryptoError),

    #[error("nat: {0}")]
    Nat(#[from] NatError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("relay stopped: {0}")]
    Relay(String),

    #[error("engine is {0}, cannot open")]
    InvalidState(&'static str),
}

impl Error {
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
