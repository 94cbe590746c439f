//! # Labcell Core
//!
//! Core data model and deterministic logic for the labcell workcell
//! orchestrator.
//!
//! This crate contains:
//! - Bottle / Slot / Task record / command envelope definitions
//! - The authoritative inventory (slots, capacities, reservations)
//! - The navigation-minimizing route planner
//! - The unified error code table shared by every surface
//!
//! This crate does NOT care about:
//! - How commands arrive (HTTP) or how primitives are dispatched (RPC)
//! - Task scheduling and worker lifecycles
//! - Process bootstrap and configuration files

pub mod error;
pub mod inventory;
pub mod planner;
pub mod types;

pub use error::{CommandError, ErrorCode};
pub use inventory::{Inventory, InventoryError, Reservation};
pub use planner::{PickupLeg, PickupPlan, PlanReject, PutLeg, PutPlan, TransferBatch, TransferPlan};
pub use types::{
    Bottle, Command, CommandEnvelope, CommandOutcome, CompletedStep, Detection, FailedBottle,
    Hand, ObjectType, ScanStep, ScannedBottle, Slot, SlotCategory, TaskRecord, TaskStatus,
};
