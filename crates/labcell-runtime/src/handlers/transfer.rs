//! TAKE_BOTTOL_FROM_SP_TO_SP: chained pickup + put batches.

use std::collections::{BTreeSet, HashSet};

use serde_json::Value;
use tokio_util::sync::CancellationToken;

use labcell_core::planner::{self, PutLeg};
use labcell_core::types::{CommandOutcome, TransferParams};
use labcell_core::CommandError;

use crate::engine::HandlerContext;

use super::{command_timeout, outcome_value, rejects_to_failures, run_pickup_legs, run_put_legs};

pub(crate) async fn run(
    ctx: &HandlerContext,
    params: TransferParams,
    cancel: &CancellationToken,
) -> Result<Value, CommandError> {
    let target_ids: Vec<String> = params
        .target_params
        .iter()
        .map(|target| target.bottle_id.clone())
        .collect();

    // A bottle named on one side but not the other is a malformed request,
    // not a planning problem.
    let targets: BTreeSet<&str> = target_ids.iter().map(String::as_str).collect();
    let releases: BTreeSet<&str> = params
        .release_params
        .iter()
        .map(|release| release.bottle_id.as_str())
        .collect();
    if targets != releases {
        let missing: Vec<&str> = targets.symmetric_difference(&releases).copied().collect();
        return Err(CommandError::BadRequest(format!(
            "target_params and release_params disagree on: {}",
            missing.join(", ")
        )));
    }

    let timeout = command_timeout(ctx, params.timeout);
    tracing::info!(count = target_ids.len(), "TRANSFER starting");

    let plan = planner::plan_transfer(&ctx.inventory, &target_ids, &params.release_params);
    let mut failed = rejects_to_failures(plan.rejected);

    let mut success = 0;
    for batch in &plan.batches {
        if cancel.is_cancelled() {
            break;
        }
        let failed_before: usize = failed.len();
        run_pickup_legs(ctx, &batch.pickup_legs, timeout, cancel, &mut failed).await;

        // Bottles that never boarded the platform must not be attempted on
        // the put side of this batch.
        let lost: HashSet<String> = failed[failed_before..]
            .iter()
            .map(|entry| entry.bottle_id.clone())
            .collect();
        let put_legs: Vec<PutLeg> = batch
            .put_legs
            .iter()
            .map(|leg| PutLeg {
                navigation_pose: leg.navigation_pose.clone(),
                puts: leg
                    .puts
                    .iter()
                    .filter(|site| !lost.contains(&site.bottle_id))
                    .cloned()
                    .collect(),
            })
            .filter(|leg| !leg.puts.is_empty())
            .collect();

        success += run_put_legs(ctx, &put_legs, timeout, cancel, &mut failed).await;
    }

    tracing::info!(success, failed = failed.len(), "TRANSFER finished");
    outcome_value(CommandOutcome::new(
        "TAKE_BOTTOL_FROM_SP_TO_SP",
        success,
        failed,
        target_ids.len(),
    ))
}

#[cfg(test)]
mod tests {
    use crate::engine::TaskEngine;
    use crate::testutil::{wait_for_terminal, ScriptedRobot};
    use labcell_core::types::{Bottle, Command, Hand, ObjectType, TaskStatus};
    use labcell_core::{ErrorCode, Inventory};
    use labcell_rpc::RpcError;
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;

    fn setup() -> (TaskEngine, Arc<Inventory>, Arc<ScriptedRobot>) {
        let inventory = Arc::new(Inventory::with_default_layout());
        for (id, pose) in [
            ("B1", "shelf_temp_1000_003"),
            ("B2", "shelf_temp_1000_004"),
        ] {
            inventory.register_bottle(Bottle::new(id, ObjectType::GlassBottle1000, Hand::Right));
            inventory.place_bottle(id, pose).unwrap();
        }
        let robot = ScriptedRobot::new();
        let engine = TaskEngine::new(inventory.clone(), robot.clone(), Duration::from_secs(10));
        (engine, inventory, robot)
    }

    fn transfer_cmd(pairs: &[(&str, &str)]) -> Command {
        Command::parse(
            "TAKE_BOTTOL_FROM_SP_TO_SP",
            &json!({
                "target_params": pairs
                    .iter()
                    .map(|(id, _)| json!({"bottle_id": id}))
                    .collect::<Vec<_>>(),
                "release_params": pairs
                    .iter()
                    .map(|(id, pose)| json!({"bottle_id": id, "release_pose": pose}))
                    .collect::<Vec<_>>(),
            }),
        )
        .unwrap()
    }

    #[test]
    fn test_transfer_end_to_end() {
        tokio_test::block_on(async {
            let (engine, inventory, _robot) = setup();
            let command = transfer_cmd(&[
                ("B1", "worktable_temp_001"),
                ("B2", "worktable_temp_002"),
            ]);
            let (task_id, _) = engine.submit("cmd-1", command).unwrap();
            let record = wait_for_terminal(&engine, &task_id).await;
            assert_eq!(record.status, TaskStatus::Completed);
            assert_eq!(record.result.unwrap()["success_count"], 2);

            assert_eq!(
                inventory.lookup_bottle("B1").unwrap().location.as_deref(),
                Some("worktable_temp_001")
            );
            // The platform is clear again.
            let back = inventory.lookup_slot("back_temp_1000_001").unwrap();
            assert!(back.occupants.is_empty());
        });
    }

    #[test]
    fn test_asymmetric_lists_are_code_1000() {
        tokio_test::block_on(async {
            let (engine, _inventory, _robot) = setup();
            let command = Command::parse(
                "TAKE_BOTTOL_FROM_SP_TO_SP",
                &json!({
                    "target_params": [{"bottle_id": "B1"}, {"bottle_id": "B2"}],
                    "release_params": [{"bottle_id": "B1", "release_pose": "worktable_temp_001"}],
                }),
            )
            .unwrap();
            let (task_id, _) = engine.submit("cmd-1", command).unwrap();
            let record = wait_for_terminal(&engine, &task_id).await;
            assert_eq!(record.status, TaskStatus::Failed);
            assert!(record.error_message.unwrap().contains("disagree"));
        });
    }

    #[test]
    fn test_failed_pickup_is_not_attempted_on_the_put_side() {
        tokio_test::block_on(async {
            let (engine, inventory, robot) = setup();
            robot.fail_on("grab_object", 1, RpcError::Remote("slipped".to_string()));

            let command = transfer_cmd(&[
                ("B1", "worktable_temp_001"),
                ("B2", "worktable_temp_002"),
            ]);
            let (task_id, _) = engine.submit("cmd-1", command).unwrap();
            let record = wait_for_terminal(&engine, &task_id).await;

            let result = record.result.unwrap();
            assert_eq!(result["success_count"], 1);
            let failed = result["failed_bottles"].as_array().unwrap();
            assert_eq!(failed.len(), 1);
            assert_eq!(failed[0]["bottle_id"], "B1");
            assert_eq!(
                failed[0]["code"].as_u64().unwrap(),
                ErrorCode::PrimitiveRemoteError.as_u16() as u64
            );

            // Exactly one grab on the put side (for B2), none for B1.
            assert_eq!(
                inventory.lookup_bottle("B1").unwrap().location.as_deref(),
                Some("shelf_temp_1000_003")
            );
            assert_eq!(
                inventory.lookup_bottle("B2").unwrap().location.as_deref(),
                Some("worktable_temp_002")
            );
        });
    }

    #[test]
    fn test_transfer_round_trip_restores_state() {
        tokio_test::block_on(async {
            let (engine, inventory, _robot) = setup();
            let before = inventory.summary(None, None, true).unwrap();

            let forward = transfer_cmd(&[("B1", "worktable_temp_001")]);
            let (task_id, _) = engine.submit("cmd-1", forward).unwrap();
            wait_for_terminal(&engine, &task_id).await;

            let back = transfer_cmd(&[("B1", "shelf_temp_1000_003")]);
            let (task_id, _) = engine.submit("cmd-2", back).unwrap();
            wait_for_terminal(&engine, &task_id).await;

            let after = inventory.summary(None, None, true).unwrap();
            // scanned_at is untouched by transfers, so the projections match
            // byte for byte.
            assert_eq!(before, after);
        });
    }
}
