//! PICK_UP: requested bottles onto the robot back platform.

use serde_json::Value;
use tokio_util::sync::CancellationToken;

use labcell_core::planner;
use labcell_core::types::{CommandOutcome, PickUpParams};
use labcell_core::CommandError;

use crate::engine::HandlerContext;

use super::{command_timeout, outcome_value, rejects_to_failures, run_pickup_legs};

pub(crate) async fn run(
    ctx: &HandlerContext,
    params: PickUpParams,
    cancel: &CancellationToken,
) -> Result<Value, CommandError> {
    let bottle_ids: Vec<String> = params
        .target_params
        .iter()
        .map(|target| target.bottle_id.clone())
        .collect();
    let timeout = command_timeout(ctx, params.timeout);
    tracing::info!(count = bottle_ids.len(), "PICK_UP starting");

    let plan = planner::plan_pickup(&ctx.inventory, &bottle_ids);
    let mut failed = rejects_to_failures(plan.rejected);

    let success = run_pickup_legs(ctx, &plan.legs, timeout, cancel, &mut failed).await;

    tracing::info!(success, failed = failed.len(), "PICK_UP finished");
    outcome_value(CommandOutcome::new(
        "PICK_UP",
        success,
        failed,
        bottle_ids.len(),
    ))
}
