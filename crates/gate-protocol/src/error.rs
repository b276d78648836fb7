//! Matchmaking error codes and the HTTP error envelope.

use serde::{Deserialize, Serialize};

/// Matchmaking and join error codes (4210 to 4216).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// No handler is registered for the requested method or room name
    MatchmakeNoHandler,
    /// No room matched the requested criteria
    MatchmakeInvalidCriteria,
    /// The requested room id does not exist
    MatchmakeInvalidRoomId,
    /// Generic failure; used whenever a failure carries no code of its own
    MatchmakeUnhandled,
    /// The seat reservation is missing or has expired
    MatchmakeExpired,
    AuthFailed,
    ApplicationError,

    Custom(i32),
}

impl ErrorCode {
    pub fn code(&self) -> i32 {
        match self {
            Self::MatchmakeNoHandler => 4210,
            Self::MatchmakeInvalidCriteria => 4211,
            Self::MatchmakeInvalidRoomId => 4212,
            Self::MatchmakeUnhandled => 4213,
            Self::MatchmakeExpired => 4214,
            Self::AuthFailed => 4215,
            Self::ApplicationError => 4216,
            Self::Custom(c) => *c,
        }
    }

    pub fn from_code(code: i32) -> Self {
        match code {
            4210 => Self::MatchmakeNoHandler,
            4211 => Self::MatchmakeInvalidCriteria,
            4212 => Self::MatchmakeInvalidRoomId,
            4213 => Self::MatchmakeUnhandled,
            4214 => Self::MatchmakeExpired,
            4215 => Self::AuthFailed,
            4216 => Self::ApplicationError,
            c => Self::Custom(c),
        }
    }
}

/// A failure reported by the matchmaker or a room.
///
/// The code is optional: collaborators that fail without classifying the
/// failure leave it unset and [`MatchmakeError::code`] falls back to
/// [`ErrorCode::MatchmakeUnhandled`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchmakeError {
    code: Option<i32>,
    pub message: String,
}

/// Result of a matchmaker operation.
pub type MatchmakeResult<T = serde_json::Value> = Result<T, MatchmakeError>;

impl MatchmakeError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code: Some(code.code()),
            message: message.into(),
        }
    }

    /// A failure that carries no code of its own.
    pub fn uncoded(message: impl Into<String>) -> Self {
        Self {
            code: None,
            message: message.into(),
        }
    }

    pub fn unhandled(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::MatchmakeUnhandled, message)
    }

    pub fn seat_expired() -> Self {
        Self::new(ErrorCode::MatchmakeExpired, "seat reservation expired.")
    }

    pub fn no_handler(method: &str) -> Self {
        Self::new(
            ErrorCode::MatchmakeNoHandler,
            format!("no available handler for \"{method}\""),
        )
    }

    pub fn invalid_criteria(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::MatchmakeInvalidCriteria, message)
    }

    pub fn invalid_room_id(room_id: &str) -> Self {
        Self::new(
            ErrorCode::MatchmakeInvalidRoomId,
            format!("room \"{room_id}\" not found"),
        )
    }

    pub fn invalid_json() -> Self {
        Self::unhandled("invalid JSON input")
    }

    /// The numeric code, defaulting to the generic unhandled code.
    pub fn code(&self) -> i32 {
        self.code.unwrap_or(ErrorCode::MatchmakeUnhandled.code())
    }

    pub fn error_code(&self) -> ErrorCode {
        ErrorCode::from_code(self.code())
    }

    /// Whether the collaborator supplied a code explicitly.
    pub fn has_code(&self) -> bool {
        self.code.is_some()
    }

    pub fn envelope(&self) -> ErrorEnvelope {
        ErrorEnvelope {
            code: self.code(),
            error: self.message.clone(),
        }
    }
}

impl std::fmt::Display for MatchmakeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Matchmake error [{}]: {}", self.code(), self.message)
    }
}

impl std::error::Error for MatchmakeError {}

/// Body of every failed `/matchmake` response (HTTP 406).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    pub code: i32,
    pub error: String,
}

impl From<&MatchmakeError> for ErrorEnvelope {
    fn from(err: &MatchmakeError) -> Self {
        err.envelope()
    }
}
