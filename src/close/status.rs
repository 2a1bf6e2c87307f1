//! Close status codes
//!
//! Status code and reason carried by a close frame (RFC 6455 section 7.4).

use std::fmt;

use thiserror::Error;

/// Maximum reason length: a control frame payload is 125 bytes, 2 go to the code
pub const MAX_REASON_BYTES: usize = 123;

/// Errors raised when building a close status to send
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StatusError {
    #[error("Close code {0} may not be sent in a close frame")]
    InvalidCode(u16),

    #[error("Close reason is {0} bytes, maximum is {MAX_REASON_BYTES}")]
    ReasonTooLong(usize),
}

/// Result type for close status construction
pub type StatusResult<T> = Result<T, StatusError>;

/// Status code and reason of a close frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseStatus {
    code: u16,
    reason: String,
}

impl CloseStatus {
    pub const NORMAL: u16 = 1000;
    pub const GOING_AWAY: u16 = 1001;
    pub const TRY_AGAIN_LATER: u16 = 1013;

    /// Build a status to send, validating code and reason
    pub fn new(code: u16, reason: impl Into<String>) -> StatusResult<Self> {
        if !Self::is_sendable(code) {
            return Err(StatusError::InvalidCode(code));
        }
        let reason = reason.into();
        if reason.len() > MAX_REASON_BYTES {
            return Err(StatusError::ReasonTooLong(reason.len()));
        }
        Ok(Self { code, reason })
    }

    /// Record a status received from the peer as-is
    pub fn from_peer(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    /// 1000, normal closure
    pub fn normal() -> Self {
        Self::from_peer(Self::NORMAL, "")
    }

    /// 1001, endpoint going away (server shutdown)
    pub fn going_away() -> Self {
        Self::from_peer(Self::GOING_AWAY, "")
    }

    /// 1013, try again later (no capacity)
    pub fn try_again_later() -> Self {
        Self::from_peer(Self::TRY_AGAIN_LATER, "")
    }

    pub fn code(&self) -> u16 {
        self.code
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }

    /// Whether `code` may appear in a close frame we send
    ///
    /// 1004-1006 and 1015 are reserved for local reporting, 1016-2999 are
    /// reserved for future protocol use, 3000-4999 belong to libraries and
    /// applications.
    pub fn is_sendable(code: u16) -> bool {
        matches!(code, 1000..=1003 | 1007..=1014 | 3000..=4999)
    }
}

impl Default for CloseStatus {
    fn default() -> Self {
        Self::normal()
    }
}

impl fmt::Display for CloseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.reason.is_empty() {
            write!(f, "{}", self.code)
        } else {
            write!(f, "{} ({})", self.code, self.reason)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sendable_codes() {
        for code in [1000, 1001, 1002, 1003, 1007, 1011, 1013, 1014, 3000, 4999] {
            assert!(CloseStatus::is_sendable(code), "{} should be sendable", code);
        }
        for code in [0, 999, 1004, 1005, 1006, 1015, 1016, 2999, 5000] {
            assert!(!CloseStatus::is_sendable(code), "{} should be rejected", code);
        }
    }

    #[test]
    fn test_new_rejects_reserved_code() {
        assert_eq!(
            CloseStatus::new(1006, "abnormal"),
            Err(StatusError::InvalidCode(1006))
        );
    }

    #[test]
    fn test_new_rejects_long_reason() {
        let reason = "x".repeat(MAX_REASON_BYTES + 1);
        assert_eq!(
            CloseStatus::new(1000, reason),
            Err(StatusError::ReasonTooLong(MAX_REASON_BYTES + 1))
        );
        assert!(CloseStatus::new(1000, "x".repeat(MAX_REASON_BYTES)).is_ok());
    }

    #[test]
    fn test_reason_limit_counts_bytes() {
        // 62 two-byte characters, 124 bytes
        let reason = "é".repeat(62);
        assert!(matches!(
            CloseStatus::new(4000, reason),
            Err(StatusError::ReasonTooLong(124))
        ));
    }

    #[test]
    fn test_from_peer_keeps_raw_code() {
        let status = CloseStatus::from_peer(1005, "");
        assert_eq!(status.code(), 1005);
        assert_eq!(status.reason(), "");
    }

    #[test]
    fn test_display() {
        assert_eq!(CloseStatus::normal().to_string(), "1000");
        let status = CloseStatus::new(4001, "bye").unwrap();
        assert_eq!(status.to_string(), "4001 (bye)");
    }
}
