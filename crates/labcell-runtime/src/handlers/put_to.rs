//! PUT_TO: bottles from the robot back platform into release slots.

use serde_json::Value;
use tokio_util::sync::CancellationToken;

use labcell_core::planner;
use labcell_core::types::{CommandOutcome, PutToParams};
use labcell_core::CommandError;

use crate::engine::HandlerContext;

use super::{command_timeout, outcome_value, rejects_to_failures, run_put_legs};

pub(crate) async fn run(
    ctx: &HandlerContext,
    params: PutToParams,
    cancel: &CancellationToken,
) -> Result<Value, CommandError> {
    let total = params.release_params.len();
    let timeout = command_timeout(ctx, params.timeout);
    tracing::info!(count = total, "PUT_TO starting");

    let plan = planner::plan_put(&ctx.inventory, &params.release_params);
    let mut failed = rejects_to_failures(plan.rejected);

    let success = run_put_legs(ctx, &plan.legs, timeout, cancel, &mut failed).await;

    tracing::info!(success, failed = failed.len(), "PUT_TO finished");
    outcome_value(CommandOutcome::new("PUT_TO", success, failed, total))
}

#[cfg(test)]
mod tests {
    use crate::engine::TaskEngine;
    use crate::testutil::{wait_for_terminal, ScriptedRobot};
    use labcell_core::types::{Bottle, Command, Hand, ObjectType, TaskStatus};
    use labcell_core::Inventory;
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;

    fn setup() -> (TaskEngine, Arc<Inventory>, Arc<ScriptedRobot>) {
        let inventory = Arc::new(Inventory::with_default_layout());
        for (id, ty, pose) in [
            ("B1", ObjectType::GlassBottle1000, "back_temp_1000_001"),
            ("B2", ObjectType::GlassBottle500, "back_temp_500_001"),
        ] {
            inventory.register_bottle(Bottle::new(id, ty, Hand::Right));
            inventory.place_bottle(id, pose).unwrap();
        }
        let robot = ScriptedRobot::new();
        let engine = TaskEngine::new(inventory.clone(), robot.clone(), Duration::from_secs(10));
        (engine, inventory, robot)
    }

    #[test]
    fn test_put_to_moves_bottles_off_the_platform() {
        tokio_test::block_on(async {
            let (engine, inventory, robot) = setup();
            let command = Command::parse(
                "PUT_TO",
                &json!({
                    "release_params": [
                        {"bottle_id": "B1", "release_pose": "worktable_temp_001"},
                        {"bottle_id": "B2", "release_pose": "worktable_temp_002"},
                    ],
                }),
            )
            .unwrap();

            let (task_id, _) = engine.submit("cmd-1", command).unwrap();
            let record = wait_for_terminal(&engine, &task_id).await;
            assert_eq!(record.status, TaskStatus::Completed);

            let result = record.result.unwrap();
            assert_eq!(result["success_count"], 2);

            assert_eq!(
                inventory.lookup_bottle("B1").unwrap().location.as_deref(),
                Some("worktable_temp_001")
            );
            assert_eq!(
                inventory.lookup_bottle("B2").unwrap().location.as_deref(),
                Some("worktable_temp_002")
            );
            // Both release poses share one waypoint: a single nav move.
            assert_eq!(robot.args_of("navigation_to_pose").len(), 1);
        });
    }

    #[test]
    fn test_put_to_full_release_slot_is_2002() {
        tokio_test::block_on(async {
            let (engine, inventory, _robot) = setup();
            // Fill the destination before the command runs.
            for id in ["F1", "F2"] {
                inventory.register_bottle(Bottle::new(id, ObjectType::GlassBottle250, Hand::Left));
                inventory.place_bottle(id, "worktable_temp_001").unwrap();
            }

            let command = Command::parse(
                "PUT_TO",
                &json!({
                    "release_params": [
                        {"bottle_id": "B1", "release_pose": "worktable_temp_001"},
                    ],
                }),
            )
            .unwrap();
            let (task_id, _) = engine.submit("cmd-1", command).unwrap();
            let record = wait_for_terminal(&engine, &task_id).await;
            assert_eq!(record.status, TaskStatus::Failed);

            let result = record.result.unwrap();
            assert_eq!(result["failed_bottles"][0]["code"], 2002);
            // The bottle never left the platform.
            assert_eq!(
                inventory.lookup_bottle("B1").unwrap().location.as_deref(),
                Some("back_temp_1000_001")
            );
        });
    }
}
