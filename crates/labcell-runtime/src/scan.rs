//! The SCAN_QRCODE state machine.
//!
//! The session navigates to the scan table, picks up the scan gun, and loops
//! over cv_detect hits: reserve a back-platform slot for the detected family,
//! grab, scan, park on the ENTER_ID rendezvous, then stow the bound bottle on
//! the platform. Two consecutive no-detections end the loop; the session then
//! delivers every scanned bottle to the split station.
//!
//! Whenever the session stops mid-bottle (platform full, failed stow,
//! cancellation), the return stack is unwound first: bottles grabbed but not
//! committed anywhere go back to their scan-table temp pose, so the physical
//! world never diverges from the ledger.

use chrono::Utc;
use serde_json::{json, Value};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use labcell_core::planner::PutSite;
use labcell_core::types::{Bottle, FailedBottle, Hand, ObjectType, ScanStep, ScannedBottle};
use labcell_core::{CommandError, ErrorCode};
use labcell_rpc::SafePose;

use crate::engine::{HandlerContext, TaskHandle};
use crate::handlers::{approach, put_single};

const SCAN_NAV: &str = "scan_table";
const SPLIT_NAV: &str = "split_table";

/// How long a parked session waits for ENTER_ID before failing.
const ID_WAIT_TIMEOUT: Duration = Duration::from_secs(300);

/// A bottle in hand that has not been committed to any slot yet.
struct ReturnItem {
    object_type: ObjectType,
    detect_pose: String,
}

pub(crate) async fn run(
    ctx: &HandlerContext,
    handle: &TaskHandle,
    cancel: &CancellationToken,
) -> Result<Value, CommandError> {
    let timeout = ctx.robot.default_timeout();
    let mut scanned: Vec<ScannedBottle> = Vec::new();
    let mut failed: Vec<FailedBottle> = Vec::new();
    let mut return_stack: Vec<ReturnItem> = Vec::new();

    handle.advance_step(ScanStep::NavigatingToScan, "");
    ctx.robot.waiting_navigation_status(timeout).await?;
    ctx.robot.navigation_to_pose(SCAN_NAV, timeout).await?;

    handle.advance_step(ScanStep::GrabScanGun, "arrived at scan table");
    ctx.robot.grab_scan_gun(timeout).await?;

    let mut misses = 0;
    loop {
        if cancel.is_cancelled() {
            unwind(ctx, &mut return_stack, &mut failed, timeout).await;
            return Ok(outcome(&scanned, &failed, "scan session cancelled"));
        }

        handle.advance_step(ScanStep::CvDetecting, "");
        let Some(detection) = ctx.robot.cv_detect(timeout).await? else {
            misses += 1;
            if misses >= 2 {
                break;
            }
            continue;
        };
        misses = 0;

        let back_slot = detection.bottle_type.back_platform_slot();
        let reservation = match ctx
            .inventory
            .reserve_slot_for_type(back_slot, detection.bottle_type)
        {
            Ok(reservation) => reservation,
            Err(err) => {
                // Platform slot for this family is full: report the
                // detection, restore anything in hand, and deliver what was
                // fully processed.
                tracing::warn!(
                    target_pose = %detection.target_pose,
                    error = %err,
                    "no platform capacity for detection, wrapping up"
                );
                failed.push(FailedBottle::new(
                    &detection.target_pose,
                    "reserve_back_slot",
                    ErrorCode::PlatformOverCapacity,
                ));
                unwind(ctx, &mut return_stack, &mut failed, timeout).await;
                break;
            }
        };

        handle.advance_step(
            ScanStep::GrabbingBottle,
            format!("detected {} at {}", detection.bottle_type, detection.target_pose),
        );
        if let Err(err) = ctx
            .robot
            .grab_object(detection.bottle_type, &detection.target_pose, Hand::Right, timeout)
            .await
        {
            ctx.inventory.cancel_reservation(reservation);
            return Err(err.into());
        }
        return_stack.push(ReturnItem {
            object_type: detection.bottle_type,
            detect_pose: detection.target_pose.clone(),
        });

        handle.advance_step(ScanStep::Scanning, "");
        if let Err(err) = ctx.robot.scan(timeout).await {
            ctx.inventory.cancel_reservation(reservation);
            unwind(ctx, &mut return_stack, &mut failed, timeout).await;
            return Err(err.into());
        }

        handle.set_waiting(detection.clone());
        let rx = ctx.rendezvous.register(handle.task_id(), detection.bottle_type);
        let entered = tokio::select! {
            result = rx => result.ok(),
            () = cancel.cancelled() => {
                ctx.rendezvous.clear(handle.task_id());
                ctx.inventory.cancel_reservation(reservation);
                unwind(ctx, &mut return_stack, &mut failed, timeout).await;
                return Ok(outcome(&scanned, &failed, "scan session cancelled"));
            }
            () = tokio::time::sleep(ID_WAIT_TIMEOUT) => {
                ctx.rendezvous.clear(handle.task_id());
                ctx.inventory.cancel_reservation(reservation);
                unwind(ctx, &mut return_stack, &mut failed, timeout).await;
                return Err(CommandError::Internal(
                    "timed out waiting for enter-id".to_string(),
                ));
            }
        };
        let Some(entered) = entered else {
            ctx.rendezvous.clear(handle.task_id());
            ctx.inventory.cancel_reservation(reservation);
            unwind(ctx, &mut return_stack, &mut failed, timeout).await;
            return Err(CommandError::Internal(
                "enter-id rendezvous dropped".to_string(),
            ));
        };
        handle.resume_running();

        // First contact with this bottle: register it on the fly.
        if ctx.inventory.lookup_bottle(&entered.bottle_id).is_err() {
            ctx.inventory.register_bottle(Bottle::new(
                &entered.bottle_id,
                entered.object_type,
                Hand::Right,
            ));
        }
        if let Err(err) = ctx.inventory.mark_scanned(&entered.bottle_id) {
            tracing::warn!(bottle_id = %entered.bottle_id, error = %err, "mark_scanned failed");
        }

        handle.advance_step(
            ScanStep::PuttingToBack,
            format!("bound {}", entered.bottle_id),
        );
        match ctx
            .robot
            .put_object(entered.object_type, back_slot, Hand::Right, SafePose::Preset, timeout)
            .await
        {
            Ok(()) => {
                return_stack.pop();
                if let Err(err) = ctx.inventory.commit_place(reservation, &entered.bottle_id) {
                    tracing::warn!(bottle_id = %entered.bottle_id, error = %err, "ledger place failed");
                }
                let entry = ScannedBottle {
                    bottle_id: entered.bottle_id.clone(),
                    object_type: entered.object_type,
                    slot: back_slot.to_string(),
                    timestamp: Utc::now(),
                };
                handle.add_scanned(entry.clone());
                scanned.push(entry);
            }
            Err(err) => {
                // The stow failed with the bottle in hand: reverse the grab
                // and end with what was fully processed.
                ctx.inventory.cancel_reservation(reservation);
                failed.push(FailedBottle::new(
                    &entered.bottle_id,
                    "put_object",
                    err.code(),
                ));
                unwind(ctx, &mut return_stack, &mut failed, timeout).await;
                break;
            }
        }

        handle.advance_step(ScanStep::TurningBackFront, "");
        ctx.robot.turn_waist(0, true, timeout).await?;
    }

    if !scanned.is_empty() && !cancel.is_cancelled() {
        handle.advance_step(ScanStep::NavigatingToSplit, "");
        if let Err((step, code)) = approach(ctx, SPLIT_NAV, timeout).await {
            for bottle in &scanned {
                failed.push(FailedBottle::new(&bottle.bottle_id, step, code));
            }
            return Ok(outcome(&scanned, &failed, "split station unreachable"));
        }
        handle.advance_step(ScanStep::PuttingDown, "");
        for bottle in &scanned {
            if cancel.is_cancelled() {
                break;
            }
            let Some(target) = split_slot_for(ctx, bottle.object_type) else {
                failed.push(FailedBottle::new(
                    &bottle.bottle_id,
                    "reserve_split_slot",
                    ErrorCode::SlotFull,
                ));
                continue;
            };
            let site = PutSite {
                bottle_id: bottle.bottle_id.clone(),
                object_type: bottle.object_type,
                hand: Hand::Right,
                source_pose: bottle.slot.clone(),
                release_pose: target,
                navigation_pose: SPLIT_NAV.to_string(),
            };
            if let Err(entry) = put_single(ctx, &site, timeout).await {
                failed.push(entry);
            }
        }
    }

    Ok(outcome(&scanned, &failed, "scan session finished"))
}

/// First split-station slot that accepts the family and has room.
fn split_slot_for(ctx: &HandlerContext, object_type: ObjectType) -> Option<String> {
    ctx.inventory
        .slots_by_navigation(SPLIT_NAV)
        .into_iter()
        .find(|slot| {
            slot.accepts(object_type)
                && ctx
                    .inventory
                    .available_units(&slot.pose_name)
                    .unwrap_or(0)
                    > 0
        })
        .map(|slot| slot.pose_name)
}

/// Put every in-hand bottle back at its scan-table temp pose.
async fn unwind(
    ctx: &HandlerContext,
    return_stack: &mut Vec<ReturnItem>,
    failed: &mut Vec<FailedBottle>,
    timeout: Duration,
) {
    while let Some(item) = return_stack.pop() {
        tracing::info!(
            detect_pose = %item.detect_pose,
            "returning in-hand bottle to the scan table"
        );
        if let Err(err) = ctx
            .robot
            .put_object(
                item.object_type,
                &item.detect_pose,
                Hand::Right,
                SafePose::Preset,
                timeout,
            )
            .await
        {
            tracing::error!(
                detect_pose = %item.detect_pose,
                error = %err,
                "could not return bottle to the scan table"
            );
            failed.push(FailedBottle::new(
                &item.detect_pose,
                "return_to_scan_table",
                err.code(),
            ));
        }
    }
}

fn outcome(scanned: &[ScannedBottle], failed: &[FailedBottle], message: &str) -> Value {
    json!({
        "success": true,
        "message": message,
        "success_count": scanned.len(),
        "scanned_bottles": scanned,
        "failed_bottles": failed,
        "total": scanned.len() + failed.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::TaskEngine;
    use crate::testutil::{wait_for, wait_for_terminal, ScriptedRobot};
    use labcell_core::types::{Command, EnterIdParams, TaskStatus};
    use labcell_core::{ErrorCode, Inventory};
    use serde_json::Value;
    use std::sync::Arc;

    fn setup() -> (TaskEngine, Arc<Inventory>, Arc<ScriptedRobot>) {
        let inventory = Arc::new(Inventory::with_default_layout());
        let robot = ScriptedRobot::new();
        let engine = TaskEngine::new(inventory.clone(), robot.clone(), Duration::from_secs(10));
        (engine, inventory, robot)
    }

    fn scan_cmd() -> Command {
        Command::parse("SCAN_QRCODE", &Value::Null).unwrap()
    }

    fn enter(engine: &TaskEngine, bottle_id: &str, ty: ObjectType) -> Result<Value, CommandError> {
        engine.enter_id(EnterIdParams {
            bottle_id: bottle_id.to_string(),
            object_type: ty,
        })
    }

    #[test]
    fn test_enter_id_rendezvous_round_trip() {
        tokio_test::block_on(async {
            let (engine, inventory, robot) = setup();
            robot.push_detection("pose_0", ObjectType::GlassBottle500);

            let (task_id, _) = engine.submit("cmd-1", scan_cmd()).unwrap();
            let waiting = wait_for(&engine, &task_id, |record| {
                record.status == TaskStatus::Waiting
            })
            .await;
            assert_eq!(
                waiting.current_bottle_info.as_ref().unwrap().bottle_type,
                ObjectType::GlassBottle500
            );

            enter(&engine, "BTL-9", ObjectType::GlassBottle500).unwrap();
            let record = wait_for_terminal(&engine, &task_id).await;
            assert_eq!(record.status, TaskStatus::Completed);
            assert_eq!(record.scanned_bottles.len(), 1);
            assert_eq!(record.scanned_bottles[0].bottle_id, "BTL-9");

            // Delivered to the split station and tracked there.
            let bottle = inventory.lookup_bottle("BTL-9").unwrap();
            assert_eq!(bottle.location.as_deref(), Some("split_temp_001"));
            assert!(bottle.scanned_at.is_some());
        });
    }

    #[test]
    fn test_enter_id_type_mismatch_keeps_task_waiting() {
        tokio_test::block_on(async {
            let (engine, _inventory, robot) = setup();
            robot.push_detection("pose_0", ObjectType::GlassBottle500);

            let (task_id, _) = engine.submit("cmd-1", scan_cmd()).unwrap();
            wait_for(&engine, &task_id, |record| {
                record.status == TaskStatus::Waiting
            })
            .await;

            let err = enter(&engine, "BTL-9", ObjectType::GlassBottle1000).unwrap_err();
            assert_eq!(err.code(), ErrorCode::EnterIdTypeMismatch);
            assert_eq!(
                engine.status(&task_id).unwrap().status,
                TaskStatus::Waiting
            );

            // The matching retry completes the session.
            enter(&engine, "BTL-9", ObjectType::GlassBottle500).unwrap();
            let record = wait_for_terminal(&engine, &task_id).await;
            assert_eq!(record.status, TaskStatus::Completed);
        });
    }

    #[test]
    fn test_platform_full_triggers_return_and_wrap_up() {
        tokio_test::block_on(async {
            let (engine, inventory, robot) = setup();
            // Two 500s fit; the third detection finds the slot full.
            robot.push_detection("pose_0", ObjectType::GlassBottle500);
            robot.push_detection("pose_1", ObjectType::GlassBottle500);
            robot.push_detection("pose_2", ObjectType::GlassBottle500);

            let (task_id, _) = engine.submit("cmd-1", scan_cmd()).unwrap();
            for (already_scanned, id) in [(0, "S1"), (1, "S2")] {
                wait_for(&engine, &task_id, |record| {
                    record.status == TaskStatus::Waiting
                        && record.scanned_bottles.len() == already_scanned
                })
                .await;
                enter(&engine, id, ObjectType::GlassBottle500).unwrap();
            }

            let record = wait_for_terminal(&engine, &task_id).await;
            assert_eq!(record.status, TaskStatus::Completed);
            assert_eq!(record.scanned_bottles.len(), 2);

            let result = record.result.unwrap();
            let failed = result["failed_bottles"].as_array().unwrap();
            assert_eq!(failed.len(), 1);
            assert_eq!(failed[0]["bottle_id"], "pose_2");
            assert_eq!(failed[0]["step"], "reserve_back_slot");
            assert_eq!(failed[0]["code"], 2004);

            // The two committed bottles were delivered to the split station.
            assert_eq!(
                inventory.lookup_bottle("S1").unwrap().location.as_deref(),
                Some("split_temp_001")
            );
        });
    }

    #[test]
    fn test_failed_stow_reverses_the_grab() {
        tokio_test::block_on(async {
            let (engine, inventory, robot) = setup();
            robot.push_detection("pose_0", ObjectType::GlassBottle500);
            // First put_object is the stow onto the platform.
            robot.fail_on(
                "put_object",
                1,
                labcell_rpc::RpcError::Remote("slot blocked".to_string()),
            );

            let (task_id, _) = engine.submit("cmd-1", scan_cmd()).unwrap();
            wait_for(&engine, &task_id, |record| {
                record.status == TaskStatus::Waiting
            })
            .await;
            enter(&engine, "S1", ObjectType::GlassBottle500).unwrap();

            let record = wait_for_terminal(&engine, &task_id).await;
            assert_eq!(record.status, TaskStatus::Completed);
            assert!(record.scanned_bottles.is_empty());

            let result = record.result.unwrap();
            let failed = result["failed_bottles"].as_array().unwrap();
            assert_eq!(failed[0]["step"], "put_object");

            // The return put placed the bottle back at its detect pose.
            let puts = robot.args_of("put_object");
            assert_eq!(puts.last().unwrap()["strawberry"]["target_pose"], "pose_0");
            // Nothing was committed to the platform ledger.
            let back = inventory.lookup_slot("back_temp_500_001").unwrap();
            assert!(back.occupants.is_empty());
        });
    }

    #[test]
    fn test_cancel_while_waiting_unwinds_and_cancels() {
        tokio_test::block_on(async {
            let (engine, _inventory, robot) = setup();
            robot.push_detection("pose_0", ObjectType::GlassBottle500);

            let (task_id, _) = engine.submit("cmd-1", scan_cmd()).unwrap();
            wait_for(&engine, &task_id, |record| {
                record.status == TaskStatus::Waiting
            })
            .await;

            engine.cancel(&task_id).unwrap();
            let record = wait_for_terminal(&engine, &task_id).await;
            assert_eq!(record.status, TaskStatus::Cancelled);

            // The in-hand bottle went back to the scan table.
            let puts = robot.args_of("put_object");
            assert_eq!(puts.last().unwrap()["strawberry"]["target_pose"], "pose_0");

            // The rendezvous is empty again.
            let err = enter(&engine, "S1", ObjectType::GlassBottle500).unwrap_err();
            assert_eq!(err.code(), ErrorCode::NoWaitingTask);
        });
    }

    #[test]
    fn test_no_detection_twice_completes_empty_session() {
        tokio_test::block_on(async {
            let (engine, _inventory, robot) = setup();
            let (task_id, _) = engine.submit("cmd-1", scan_cmd()).unwrap();
            let record = wait_for_terminal(&engine, &task_id).await;
            assert_eq!(record.status, TaskStatus::Completed);
            assert!(record.scanned_bottles.is_empty());
            // No split trip for an empty session.
            assert_eq!(robot.args_of("navigation_to_pose").len(), 1);
            assert_eq!(robot.args_of("cv_detect").len(), 2);
        });
    }
}
