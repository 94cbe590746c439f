//! RPC-layer errors.

use std::time::Duration;

use thiserror::Error;

use labcell_core::{CommandError, ErrorCode};

/// Failures of a single connection attempt, staged so operators can tell a
/// bad hostname from a dead peer from a broken upgrade.
#[derive(Debug, Clone, Error)]
pub enum ConnectError {
    #[error("dns resolution failed for {host}: {detail}")]
    Dns { host: String, detail: String },
    #[error("connection refused by {addr}")]
    Refused { addr: String },
    #[error("tcp dial to {addr} failed: {detail}")]
    Io { addr: String, detail: String },
    #[error("websocket handshake with {addr} failed: {detail}")]
    Handshake { addr: String, detail: String },
    #[error("retry budget exhausted after {attempts} attempts")]
    RetriesExhausted { attempts: u32 },
}

/// Outcome classification of one `send_request`.
#[derive(Debug, Clone, Error)]
pub enum RpcError {
    #[error("robot link is down")]
    Disconnected,
    #[error("no reply within {0:?}")]
    Timeout(Duration),
    #[error("remote error: {0}")]
    Remote(String),
}

impl RpcError {
    pub fn code(&self) -> ErrorCode {
        match self {
            RpcError::Disconnected => ErrorCode::RobotDisconnected,
            RpcError::Timeout(_) => ErrorCode::PrimitiveTimeout,
            RpcError::Remote(_) => ErrorCode::PrimitiveRemoteError,
        }
    }
}

impl From<RpcError> for CommandError {
    fn from(err: RpcError) -> Self {
        match err {
            RpcError::Disconnected => CommandError::RobotDisconnected,
            RpcError::Timeout(_) => CommandError::PrimitiveTimeout,
            RpcError::Remote(detail) => CommandError::PrimitiveRemoteError(detail),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rpc_error_codes() {
        assert_eq!(RpcError::Disconnected.code().as_u16(), 3000);
        assert_eq!(
            RpcError::Timeout(Duration::from_secs(10)).code().as_u16(),
            3001
        );
        assert_eq!(RpcError::Remote("x".to_string()).code().as_u16(), 3002);
    }
}
