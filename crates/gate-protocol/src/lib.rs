//! Room Gateway - Protocol Types
//!
//! Wire-level types shared by the transport, the matchmaker and clients:
//! matchmaking error codes, the HTTP error envelope, WebSocket close codes
//! and the binary frames the gateway itself writes to sockets.

pub mod close;
pub mod error;
pub mod frame;

pub use close::CloseCode;
pub use error::{ErrorCode, ErrorEnvelope, MatchmakeError, MatchmakeResult};
pub use frame::{Protocol, decode_error_frame, encode_error_frame, encode_join_frame};
