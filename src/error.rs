//! Error taxonomy surfaced to the HTTP façade.
//!
//! Every façade response carries a numeric code plus a human-readable
//! message; the HTTP status is derived from the code, independent of the
//! underlying overlay failure detail.

use crate::envelope::DecodeError;
use crate::seal::SealError;

/// Application-level result codes. Zero means success; everything else maps
/// onto one [`OverlayError`] variant.
pub mod code {
    pub const OK: u32 = 0;
    pub const PARAMETER: u32 = 1001;
    pub const PARSE: u32 = 1002;
    pub const CODEC: u32 = 1003;
    pub const UNSUPPORTED_TYPE: u32 = 1004;
    pub const ENCRYPTION: u32 = 1005;
    pub const DECRYPTION: u32 = 1006;
    pub const TIMEOUT: u32 = 1007;
    pub const NO_PEERS: u32 = 1008;
    pub const PROXY_EXHAUSTED: u32 = 1009;
    pub const NOT_FOUND: u32 = 1010;
    pub const OVERLAY: u32 = 1011;
    pub const UPSTREAM: u32 = 1012;
    pub const INTERNAL: u32 = 1013;
}

#[derive(Debug, thiserror::Error)]
pub enum OverlayError {
    #[error("parameter error: {0}")]
    Parameter(String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("envelope encoding error: {0}")]
    Codec(String),

    #[error("unsupported message type {0}")]
    UnsupportedType(u32),

    #[error("encryption error: {0}")]
    Encryption(String),

    #[error("decryption failed")]
    DecryptionFailed,

    #[error("request timed out")]
    Timeout,

    #[error("no reachable peers for {0}")]
    NoReachablePeers(String),

    #[error("proxy exhausted after {attempts} failed candidates")]
    ProxyExhausted { attempts: u32 },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("overlay error: {0}")]
    Overlay(String),

    #[error("upstream model endpoint error: {0}")]
    Upstream(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl OverlayError {
    pub fn code(&self) -> u32 {
        match self {
            OverlayError::Parameter(_) => code::PARAMETER,
            OverlayError::Parse(_) => code::PARSE,
            OverlayError::Codec(_) => code::CODEC,
            OverlayError::UnsupportedType(_) => code::UNSUPPORTED_TYPE,
            OverlayError::Encryption(_) => code::ENCRYPTION,
            OverlayError::DecryptionFailed => code::DECRYPTION,
            OverlayError::Timeout => code::TIMEOUT,
            OverlayError::NoReachablePeers(_) => code::NO_PEERS,
            OverlayError::ProxyExhausted { .. } => code::PROXY_EXHAUSTED,
            OverlayError::NotFound(_) => code::NOT_FOUND,
            OverlayError::Overlay(_) => code::OVERLAY,
            OverlayError::Upstream(_) => code::UPSTREAM,
            OverlayError::Internal(_) => code::INTERNAL,
        }
    }

    /// HTTP status for the façade: caller mistakes are 4xx, everything the
    /// caller cannot fix is 5xx.
    pub fn http_status(&self) -> u16 {
        match self {
            OverlayError::Parameter(_) | OverlayError::Parse(_) => 400,
            OverlayError::NotFound(_) => 404,
            OverlayError::Timeout => 504,
            OverlayError::NoReachablePeers(_) | OverlayError::ProxyExhausted { .. } => 502,
            _ => 500,
        }
    }
}

impl From<DecodeError> for OverlayError {
    fn from(e: DecodeError) -> Self {
        OverlayError::Codec(e.to_string())
    }
}

impl From<SealError> for OverlayError {
    fn from(e: SealError) -> Self {
        match e {
            SealError::DecryptionFailed => OverlayError::DecryptionFailed,
            other => OverlayError::Encryption(other.to_string()),
        }
    }
}
