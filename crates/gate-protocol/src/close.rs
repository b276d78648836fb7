//! WebSocket close codes used by the gateway.

/// Close codes reported with a connection's `Close` event.
pub struct CloseCode;

impl CloseCode {
    pub const NORMAL_CLOSURE: u16 = 1000;
    /// Peer sent a close frame without a status code
    pub const NO_STATUS_RECEIVED: u16 = 1005;
    /// Socket dropped without a close frame
    pub const ABNORMAL_CLOSURE: u16 = 1006;
    /// Client broke a transport policy (e.g. flooded its event buffer)
    pub const POLICY_VIOLATION: u16 = 1008;

    /// Client left on purpose
    pub const CONSENTED: u16 = 4000;
    /// Transport is shutting down
    pub const SERVER_SHUTDOWN: u16 = 4001;
    /// Server closed the connection after sending an error frame
    pub const WITH_ERROR: u16 = 4002;

    /// Whether the close was initiated by the client on purpose.
    pub fn is_consented(code: u16) -> bool {
        code == Self::CONSENTED || code == Self::NORMAL_CLOSURE
    }
}
