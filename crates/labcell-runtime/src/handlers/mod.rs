//! Per-command execution: walk the plan, drive primitives, keep the ledger.
//!
//! Failure policy (identical across handlers): a primitive failure on a
//! per-bottle sequence records `(bottle_id, failing_step, code)` and moves on
//! to the next bottle at the same waypoint; a navigation-level failure
//! abandons the current leg and moves on to the next. Cancellation is
//! observed between primitives only.

mod pickup;
mod put_to;
mod transfer;

use std::time::Duration;

use serde_json::Value;
use tokio_util::sync::CancellationToken;

use labcell_core::planner::{PickupLeg, PlanReject, PutLeg, PutSite};
use labcell_core::types::{Command, CommandOutcome, FailedBottle};
use labcell_core::{CommandError, ErrorCode, InventoryError};
use labcell_rpc::SafePose;

use crate::engine::{HandlerContext, TaskHandle};
use crate::scan;

/// Dispatch a queued command to its handler.
pub async fn execute(
    ctx: &HandlerContext,
    handle: &TaskHandle,
    command: Command,
    cancel: CancellationToken,
) -> Result<Value, CommandError> {
    match command {
        Command::PickUp(params) => pickup::run(ctx, params, &cancel).await,
        Command::PutTo(params) => put_to::run(ctx, params, &cancel).await,
        Command::Transfer(params) => transfer::run(ctx, params, &cancel).await,
        Command::ScanQrcode => scan::run(ctx, handle, &cancel).await,
        other => Err(CommandError::Internal(format!(
            "{} is not a queued command",
            other.cmd_type()
        ))),
    }
}

pub(crate) fn command_timeout(ctx: &HandlerContext, timeout: Option<f64>) -> Duration {
    timeout
        .filter(|secs| *secs > 0.0)
        .map(Duration::from_secs_f64)
        .unwrap_or_else(|| ctx.robot.default_timeout())
}

pub(crate) fn outcome_value(outcome: CommandOutcome) -> Result<Value, CommandError> {
    serde_json::to_value(outcome).map_err(|err| CommandError::Internal(err.to_string()))
}

pub(crate) fn rejects_to_failures(rejected: Vec<PlanReject>) -> Vec<FailedBottle> {
    rejected
        .into_iter()
        .map(|reject| FailedBottle::new(reject.bottle_id, "plan", reject.code))
        .collect()
}

fn back_reserve_code(err: &InventoryError) -> ErrorCode {
    match err {
        InventoryError::SlotFull(_) => ErrorCode::PlatformOverCapacity,
        InventoryError::TypeMismatch { .. } => ErrorCode::TypeMismatch,
        InventoryError::UnknownSlot(_) => ErrorCode::SlotUnknown,
        _ => ErrorCode::Internal,
    }
}

fn release_reserve_code(err: &InventoryError) -> ErrorCode {
    match err {
        InventoryError::SlotFull(_) => ErrorCode::SlotFull,
        InventoryError::TypeMismatch { .. } => ErrorCode::TypeMismatch,
        InventoryError::UnknownSlot(_) => ErrorCode::SlotUnknown,
        _ => ErrorCode::Internal,
    }
}

/// Navigate to a leg's waypoint. `Err` carries the failing step and code for
/// the leg-level failure entries.
pub(crate) async fn approach(
    ctx: &HandlerContext,
    navigation_pose: &str,
    timeout: Duration,
) -> Result<(), (&'static str, ErrorCode)> {
    if let Err(err) = ctx.robot.waiting_navigation_status(timeout).await {
        return Err(("waiting_navigation_status", err.code()));
    }
    if let Err(err) = ctx.robot.navigation_to_pose(navigation_pose, timeout).await {
        return Err(("navigation_to_pose", err.code()));
    }
    Ok(())
}

/// Walk pickup legs: shelf/worktable slot onto the robot back platform.
///
/// Per-bottle sequence: grab at the source slot, turn the waist to the back,
/// put onto the typed back-platform slot, turn back front.
pub(crate) async fn run_pickup_legs(
    ctx: &HandlerContext,
    legs: &[PickupLeg],
    timeout: Duration,
    cancel: &CancellationToken,
    failed: &mut Vec<FailedBottle>,
) -> usize {
    let mut success = 0;
    'legs: for leg in legs {
        if cancel.is_cancelled() {
            break;
        }
        if let Err((step, code)) = approach(ctx, &leg.navigation_pose, timeout).await {
            tracing::warn!(
                navigation_pose = %leg.navigation_pose,
                step,
                "navigation failed, skipping leg"
            );
            for site in &leg.bottles {
                failed.push(FailedBottle::new(&site.bottle_id, step, code));
            }
            continue;
        }

        for site in &leg.bottles {
            if cancel.is_cancelled() {
                break 'legs;
            }
            let back_slot = site.object_type.back_platform_slot();
            let reservation = match ctx
                .inventory
                .reserve_slot_for_type(back_slot, site.object_type)
            {
                Ok(reservation) => reservation,
                Err(err) => {
                    failed.push(FailedBottle::new(
                        &site.bottle_id,
                        "reserve_back_slot",
                        back_reserve_code(&err),
                    ));
                    continue;
                }
            };

            if let Err(err) = ctx
                .robot
                .grab_object(site.object_type, &site.target_pose, site.hand, timeout)
                .await
            {
                ctx.inventory.cancel_reservation(reservation);
                failed.push(FailedBottle::new(&site.bottle_id, "grab_object", err.code()));
                continue;
            }
            if let Err(err) = ctx.inventory.commit_remove(&site.target_pose, &site.bottle_id) {
                tracing::warn!(bottle_id = %site.bottle_id, error = %err, "ledger remove failed");
            }

            if let Err(err) = ctx.robot.turn_waist(180, true, timeout).await {
                ctx.inventory.cancel_reservation(reservation);
                failed.push(FailedBottle::new(&site.bottle_id, "turn_waist", err.code()));
                continue;
            }

            if let Err(err) = ctx
                .robot
                .put_object(
                    site.object_type,
                    back_slot,
                    site.hand,
                    SafePose::Preset,
                    timeout,
                )
                .await
            {
                ctx.inventory.cancel_reservation(reservation);
                failed.push(FailedBottle::new(&site.bottle_id, "put_object", err.code()));
                continue;
            }
            if let Err(err) = ctx.inventory.commit_place(reservation, &site.bottle_id) {
                tracing::warn!(bottle_id = %site.bottle_id, error = %err, "ledger place failed");
            }
            success += 1;

            // The bottle is committed; a failed turn-back is logged and the
            // next grab re-orients anyway.
            if let Err(err) = ctx.robot.turn_waist(0, true, timeout).await {
                tracing::warn!(bottle_id = %site.bottle_id, error = %err, "turn back front failed");
            }
        }
    }
    success
}

/// Walk put legs: robot back platform (or current slot) into release slots.
pub(crate) async fn run_put_legs(
    ctx: &HandlerContext,
    legs: &[PutLeg],
    timeout: Duration,
    cancel: &CancellationToken,
    failed: &mut Vec<FailedBottle>,
) -> usize {
    let mut success = 0;
    'legs: for leg in legs {
        if cancel.is_cancelled() {
            break;
        }
        if let Err((step, code)) = approach(ctx, &leg.navigation_pose, timeout).await {
            tracing::warn!(
                navigation_pose = %leg.navigation_pose,
                step,
                "navigation failed, skipping leg"
            );
            for site in &leg.puts {
                failed.push(FailedBottle::new(&site.bottle_id, step, code));
            }
            continue;
        }

        for site in &leg.puts {
            if cancel.is_cancelled() {
                break 'legs;
            }
            match put_single(ctx, site, timeout).await {
                Ok(()) => success += 1,
                Err(entry) => failed.push(entry),
            }
        }
    }
    success
}

/// Per-bottle put sequence: turn to the back, grab from the source slot,
/// turn front, put into the release slot. The robot must already stand at
/// the leg's waypoint.
pub(crate) async fn put_single(
    ctx: &HandlerContext,
    site: &PutSite,
    timeout: Duration,
) -> Result<(), FailedBottle> {
    let reservation = ctx
        .inventory
        .reserve_slot_for_type(&site.release_pose, site.object_type)
        .map_err(|err| {
            FailedBottle::new(
                &site.bottle_id,
                "reserve_release_slot",
                release_reserve_code(&err),
            )
        })?;

    if let Err(err) = ctx.robot.turn_waist(180, true, timeout).await {
        ctx.inventory.cancel_reservation(reservation);
        return Err(FailedBottle::new(&site.bottle_id, "turn_waist", err.code()));
    }

    if let Err(err) = ctx
        .robot
        .grab_object(site.object_type, &site.source_pose, site.hand, timeout)
        .await
    {
        ctx.inventory.cancel_reservation(reservation);
        return Err(FailedBottle::new(&site.bottle_id, "grab_object", err.code()));
    }
    if let Err(err) = ctx.inventory.commit_remove(&site.source_pose, &site.bottle_id) {
        tracing::warn!(bottle_id = %site.bottle_id, error = %err, "ledger remove failed");
    }

    if let Err(err) = ctx.robot.turn_waist(0, true, timeout).await {
        ctx.inventory.cancel_reservation(reservation);
        return Err(FailedBottle::new(&site.bottle_id, "turn_waist", err.code()));
    }

    if let Err(err) = ctx
        .robot
        .put_object(
            site.object_type,
            &site.release_pose,
            site.hand,
            SafePose::Preset,
            timeout,
        )
        .await
    {
        ctx.inventory.cancel_reservation(reservation);
        return Err(FailedBottle::new(&site.bottle_id, "put_object", err.code()));
    }
    if let Err(err) = ctx.inventory.commit_place(reservation, &site.bottle_id) {
        tracing::warn!(bottle_id = %site.bottle_id, error = %err, "ledger place failed");
    }
    Ok(())
}
