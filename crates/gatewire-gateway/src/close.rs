//! Socket close codes.
//!
//! Codes 1000-1011 are standard WebSocket codes; 4000-4014 are session-layer
//! codes sent by the gateway. The client closes with 3000 when it plans to
//! resume. The code decides whether a shard may resume,
//! must start a fresh session, or must stop.

use std::fmt;

/// A close code received from, or sent to, the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CloseCode(pub u16);

impl CloseCode {
    /// 1000
    pub const NORMAL_CLOSURE: CloseCode = CloseCode(1000);
    /// 1001
    pub const GOING_AWAY: CloseCode = CloseCode(1001);
    /// 1002
    pub const PROTOCOL_ERROR: CloseCode = CloseCode(1002);
    /// 1003
    pub const TYPE_ERROR: CloseCode = CloseCode(1003);
    /// 1007
    pub const ENCODING_ERROR: CloseCode = CloseCode(1007);
    /// 1008
    pub const POLICY_VIOLATION: CloseCode = CloseCode(1008);
    /// 1009
    pub const TOO_BIG: CloseCode = CloseCode(1009);
    /// 1011
    pub const UNEXPECTED_CONDITION: CloseCode = CloseCode(1011);
    /// Sent by the client when it intends to resume. The server keeps the
    /// session for any code other than 1000 and 1001.
    pub const CLIENT_RESUME: CloseCode = CloseCode(3000);
    /// 4000
    pub const UNKNOWN_ERROR: CloseCode = CloseCode(4000);
    /// 4001
    pub const UNKNOWN_OPCODE: CloseCode = CloseCode(4001);
    /// 4002
    pub const DECODE_ERROR: CloseCode = CloseCode(4002);
    /// 4003
    pub const NOT_AUTHENTICATED: CloseCode = CloseCode(4003);
    /// 4004: the token is invalid.
    pub const AUTHENTICATION_FAILED: CloseCode = CloseCode(4004);
    /// 4005
    pub const ALREADY_AUTHENTICATED: CloseCode = CloseCode(4005);
    /// 4007: the resume sequence was invalid.
    pub const INVALID_SEQ: CloseCode = CloseCode(4007);
    /// 4008
    pub const RATE_LIMITED: CloseCode = CloseCode(4008);
    /// 4009: the session timed out.
    pub const SESSION_TIMEOUT: CloseCode = CloseCode(4009);
    /// 4010: the shard index or count is invalid.
    pub const INVALID_SHARD: CloseCode = CloseCode(4010);
    /// 4011: the client must shard.
    pub const SHARDING_REQUIRED: CloseCode = CloseCode(4011);
    /// 4012
    pub const INVALID_VERSION: CloseCode = CloseCode(4012);
    /// 4013
    pub const INVALID_INTENT: CloseCode = CloseCode(4013);
    /// 4014: a privileged intent was not granted.
    pub const DISALLOWED_INTENT: CloseCode = CloseCode(4014);

    /// Symbolic name, if the code is known.
    pub fn name(&self) -> Option<&'static str> {
        let name = match self.0 {
            1000 => "NORMAL_CLOSURE",
            1001 => "GOING_AWAY",
            1002 => "PROTOCOL_ERROR",
            1003 => "TYPE_ERROR",
            1007 => "ENCODING_ERROR",
            1008 => "POLICY_VIOLATION",
            1009 => "TOO_BIG",
            1011 => "UNEXPECTED_CONDITION",
            3000 => "CLIENT_RESUME",
            4000 => "UNKNOWN_ERROR",
            4001 => "UNKNOWN_OPCODE",
            4002 => "DECODE_ERROR",
            4003 => "NOT_AUTHENTICATED",
            4004 => "AUTHENTICATION_FAILED",
            4005 => "ALREADY_AUTHENTICATED",
            4007 => "INVALID_SEQ",
            4008 => "RATE_LIMITED",
            4009 => "SESSION_TIMEOUT",
            4010 => "INVALID_SHARD",
            4011 => "SHARDING_REQUIRED",
            4012 => "INVALID_VERSION",
            4013 => "INVALID_INTENT",
            4014 => "DISALLOWED_INTENT",
            _ => return None,
        };
        Some(name)
    }

    /// True for standard socket codes (1xxx).
    pub fn is_standard(&self) -> bool {
        self.0 / 1000 == 1
    }

    /// True if reconnecting cannot help; the shard must stop.
    pub fn is_fatal(&self) -> bool {
        matches!(self.0, 4004 | 4010..=4014)
    }

    /// True if the session is gone and the next connection must identify.
    pub fn clears_session(&self) -> bool {
        matches!(self.0, 4007 | 4009)
    }

    /// True if the shard may reconnect.
    pub fn can_reconnect(&self) -> bool {
        !self.is_fatal()
    }
}

impl fmt::Display for CloseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{} {}", self.0, name),
            None => write!(f, "{}", self.0),
        }
    }
}

impl From<u16> for CloseCode {
    fn from(code: u16) -> Self {
        CloseCode(code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_codes() {
        for code in [4004, 4010, 4011, 4012, 4013, 4014] {
            assert!(CloseCode(code).is_fatal(), "{code} should be fatal");
            assert!(!CloseCode(code).can_reconnect());
        }
        for code in [1000, 1001, 4000, 4001, 4007, 4008, 4009, 4999] {
            assert!(!CloseCode(code).is_fatal(), "{code} should be recoverable");
        }
    }

    #[test]
    fn test_session_clearing_codes() {
        assert!(CloseCode::INVALID_SEQ.clears_session());
        assert!(CloseCode::SESSION_TIMEOUT.clears_session());
        assert!(!CloseCode::RATE_LIMITED.clears_session());
        assert!(!CloseCode::GOING_AWAY.clears_session());
    }

    #[test]
    fn test_standard_and_display() {
        assert!(CloseCode::GOING_AWAY.is_standard());
        assert!(!CloseCode::UNKNOWN_ERROR.is_standard());
        assert_eq!(CloseCode::DISALLOWED_INTENT.to_string(), "4014 DISALLOWED_INTENT");
        assert_eq!(CloseCode(4999).to_string(), "4999");
        assert_eq!(CloseCode::from(4004), CloseCode::AUTHENTICATION_FAILED);
    }
}
