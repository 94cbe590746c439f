//! # Labcell RPC
//!
//! The long-lived WebSocket link to a robot and the typed primitive layer on
//! top of it.
//!
//! This crate contains:
//! - The rosbridge-style `call_service` / `service_response` wire protocol
//! - `RobotLink`: request/response correlation, a dedicated reader task, and
//!   automatic reconnection with a configurable retry policy
//! - `RobotPrimitives`: one typed wrapper per robot service action
//!
//! Callers at a higher layer own any domain ordering; the link only
//! serializes frame writes.

pub mod client;
pub mod error;
pub mod primitives;
pub mod protocol;

pub use client::{LinkConfig, RobotLink, RobotTransport};
pub use error::{ConnectError, RpcError};
pub use primitives::{RobotPrimitives, SafePose};
pub use protocol::{ServiceCall, ServiceResponse, MANIPULATION_SERVICE, NAVIGATION_SERVICE};
