//! Error kinds shared by every netcore module.
//!
//! Receive-side validation never surfaces these to callers; it counts and
//! discards. Everything else propagates a `NetError` through `NetResult`.

use core::fmt;

/// Error kinds returned by public netcore operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NetError {
    /// No free entry in the selected pool
    PoolEmpty,
    /// Backing memory segment cannot grow
    SegOverflow,
    /// Write or copy would run past the end of a buffer or chain
    WouldOverflow,
    /// Bad caller input
    InvalidArg,
    /// Message type/code not valid for this operation
    InvalidType,
    /// Malformed received header, length or checksum
    ProtocolViolation,
    /// Transmit refused (suppressed error message, bad destination, ...)
    Tx,
    /// Operation timed out
    Timeout,
    /// Non-blocking operation has nothing to do yet
    WouldBlock,
    /// Cache or list miss
    NotFound,
    /// Lifecycle misuse: already initialized or started
    AlreadyInit,
    /// Lifecycle misuse: not initialized or not started
    NotInit,
    /// Interface link is down
    LinkDown,
    /// Object is not in a state that allows the operation
    InvalidState,
    /// Invariant violation
    Fatal,
}

impl NetError {
    pub fn as_str(&self) -> &'static str {
        match self {
            NetError::PoolEmpty => "pool empty",
            NetError::SegOverflow => "segment overflow",
            NetError::WouldOverflow => "would overflow",
            NetError::InvalidArg => "invalid argument",
            NetError::InvalidType => "invalid type",
            NetError::ProtocolViolation => "protocol violation",
            NetError::Tx => "tx refused",
            NetError::Timeout => "timeout",
            NetError::WouldBlock => "would block",
            NetError::NotFound => "not found",
            NetError::AlreadyInit => "already initialized",
            NetError::NotInit => "not initialized",
            NetError::LinkDown => "link down",
            NetError::InvalidState => "invalid state",
            NetError::Fatal => "fatal",
        }
    }

    /// Transient errors drive retries instead of failing an operation.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            NetError::Timeout | NetError::WouldBlock | NetError::LinkDown
        )
    }
}

impl fmt::Display for NetError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub type NetResult<T> = Result<T, NetError>;

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::format;

    #[test]
    fn test_display_matches_as_str() {
        assert_eq!(format!("{}", NetError::PoolEmpty), "pool empty");
        assert_eq!(format!("{}", NetError::LinkDown), NetError::LinkDown.as_str());
    }

    #[test]
    fn test_transient_kinds() {
        assert!(NetError::Timeout.is_transient());
        assert!(NetError::LinkDown.is_transient());
        assert!(!NetError::NotFound.is_transient());
        assert!(!NetError::Fatal.is_transient());
    }
}
