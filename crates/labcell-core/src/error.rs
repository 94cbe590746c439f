//! The unified error code table and the error type every surface maps onto.

use thiserror::Error;

use crate::types::ObjectType;

/// Numeric wire codes shared by the HTTP envelope, result documents, and
/// per-bottle failure entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    Ok,
    BadRequest,
    UnknownCmdType,
    BottleUnknown,
    SlotUnknown,
    SlotFull,
    TypeMismatch,
    PlatformOverCapacity,
    RobotDisconnected,
    PrimitiveTimeout,
    PrimitiveRemoteError,
    TaskNotFound,
    TaskAlreadyTerminal,
    NoWaitingTask,
    EnterIdTypeMismatch,
    Internal,
}

impl ErrorCode {
    pub fn as_u16(self) -> u16 {
        match self {
            ErrorCode::Ok => 0,
            ErrorCode::BadRequest => 1000,
            ErrorCode::UnknownCmdType => 1001,
            ErrorCode::BottleUnknown => 2000,
            ErrorCode::SlotUnknown => 2001,
            ErrorCode::SlotFull => 2002,
            ErrorCode::TypeMismatch => 2003,
            ErrorCode::PlatformOverCapacity => 2004,
            ErrorCode::RobotDisconnected => 3000,
            ErrorCode::PrimitiveTimeout => 3001,
            ErrorCode::PrimitiveRemoteError => 3002,
            ErrorCode::TaskNotFound => 4000,
            ErrorCode::TaskAlreadyTerminal => 4001,
            ErrorCode::NoWaitingTask => 4002,
            ErrorCode::EnterIdTypeMismatch => 4003,
            ErrorCode::Internal => 5000,
        }
    }
}

/// Error type for command validation and execution.
#[derive(Debug, Clone, Error)]
pub enum CommandError {
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("unknown cmd_type: {0}")]
    UnknownCmdType(String),
    #[error("unknown bottle: {0}")]
    BottleUnknown(String),
    #[error("unknown slot: {0}")]
    SlotUnknown(String),
    #[error("slot full: {0}")]
    SlotFull(String),
    #[error("bottle {bottle_id} ({object_type}) does not fit slot {pose_name}")]
    TypeMismatch {
        bottle_id: String,
        object_type: ObjectType,
        pose_name: String,
    },
    #[error("back platform has no free {0} slot")]
    PlatformOverCapacity(ObjectType),
    #[error("robot link is down")]
    RobotDisconnected,
    #[error("robot primitive timed out")]
    PrimitiveTimeout,
    #[error("robot primitive failed: {0}")]
    PrimitiveRemoteError(String),
    #[error("task not found: {0}")]
    TaskNotFound(String),
    #[error("task already terminal: {0}")]
    TaskAlreadyTerminal(String),
    #[error("no task waiting for enter-id")]
    NoWaitingTask,
    #[error("enter-id type mismatch: task expects {expected}, got {got}")]
    EnterIdTypeMismatch {
        expected: ObjectType,
        got: ObjectType,
    },
    #[error("internal: {0}")]
    Internal(String),
}

impl CommandError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::BadRequest(_) => ErrorCode::BadRequest,
            Self::UnknownCmdType(_) => ErrorCode::UnknownCmdType,
            Self::BottleUnknown(_) => ErrorCode::BottleUnknown,
            Self::SlotUnknown(_) => ErrorCode::SlotUnknown,
            Self::SlotFull(_) => ErrorCode::SlotFull,
            Self::TypeMismatch { .. } => ErrorCode::TypeMismatch,
            Self::PlatformOverCapacity(_) => ErrorCode::PlatformOverCapacity,
            Self::RobotDisconnected => ErrorCode::RobotDisconnected,
            Self::PrimitiveTimeout => ErrorCode::PrimitiveTimeout,
            Self::PrimitiveRemoteError(_) => ErrorCode::PrimitiveRemoteError,
            Self::TaskNotFound(_) => ErrorCode::TaskNotFound,
            Self::TaskAlreadyTerminal(_) => ErrorCode::TaskAlreadyTerminal,
            Self::NoWaitingTask => ErrorCode::NoWaitingTask,
            Self::EnterIdTypeMismatch { .. } => ErrorCode::EnterIdTypeMismatch,
            Self::Internal(_) => ErrorCode::Internal,
        }
    }
}
