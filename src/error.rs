//! Public error surface.
//!
//! Every fallible public operation returns one of a small set of error
//! kinds; diagnostic detail travels as an attached string. Internal
//! plumbing that never crosses the API boundary uses `anyhow` instead.

use thiserror::Error;

/// Errors surfaced by the switch public API.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// The target hashname is not known, has no usable keys or paths,
    /// or is currently marked down.
    #[error("unknown peer: {0}")]
    UnknownPeer(String),

    /// An operation exceeded its retry or deadline budget.
    #[error("timed out: {0}")]
    Timeout(String),

    /// The switch, line, or channel has been closed.
    #[error("closed: {0}")]
    Closed(String),

    /// A packet failed to decode or violated the wire contract.
    #[error("invalid packet: {0}")]
    InvalidPacket(String),

    /// A key set failed validation or CSID negotiation found no overlap.
    #[error("invalid keys: {0}")]
    InvalidKeys(String),

    /// A parts (fingerprint) set failed validation.
    #[error("invalid parts: {0}")]
    InvalidParts(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// True when the error indicates a permanent condition rather than
    /// something a retry could fix.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Error::Closed(_) | Error::InvalidKeys(_) | Error::InvalidParts(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_carries_detail() {
        let err = Error::UnknownPeer("abcd1234".into());
        assert!(err.to_string().contains("abcd1234"));
    }

    #[test]
    fn terminal_classification() {
        assert!(Error::Closed("switch".into()).is_terminal());
        assert!(!Error::Timeout("dial".into()).is_terminal());
    }
}
