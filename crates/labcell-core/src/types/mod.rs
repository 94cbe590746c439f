//! Shared type definitions for the workcell data model.

mod bottle;
mod command;
mod slot;
mod task;

pub use bottle::{Bottle, Hand, ObjectType};
pub use command::{
    BottleGetParams, CancelParams, Command, CommandEnvelope, CommandOutcome, EnterIdParams,
    FailedBottle, PickUpParams, PutToParams, ReleaseParam, ScanResultParams, TargetParam,
    TransferParams,
};
pub use slot::{Slot, SlotCategory};
pub use task::{CompletedStep, Detection, ScanStep, ScannedBottle, TaskRecord, TaskStatus};
