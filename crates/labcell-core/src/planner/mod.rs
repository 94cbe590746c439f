//! Navigation-minimizing route planner.
//!
//! All three variants group work by navigation pose so the number of legs in
//! a plan equals the number of distinct waypoints the non-rejected bottles
//! need, which is the lower bound on navigation moves. Groups are emitted
//! largest first to front-load yield when a run fails partway, and every
//! tie-break is lexicographic so plans are reproducible.
//!
//! The planner only simulates capacity; nothing is reserved here. Handlers
//! re-reserve against the live inventory as they walk the plan.

use std::collections::HashMap;

use crate::error::ErrorCode;
use crate::inventory::Inventory;
use crate::types::{Hand, ObjectType, ReleaseParam, SlotCategory};

/// Everything the handler needs to pick one bottle up.
#[derive(Debug, Clone, PartialEq)]
pub struct PickupSite {
    pub bottle_id: String,
    pub object_type: ObjectType,
    pub hand: Hand,
    pub target_pose: String,
    pub navigation_pose: String,
}

/// Everything the handler needs to put one bottle down.
#[derive(Debug, Clone, PartialEq)]
pub struct PutSite {
    pub bottle_id: String,
    pub object_type: ObjectType,
    pub hand: Hand,
    /// Where the bottle currently sits (normally a back-platform slot).
    pub source_pose: String,
    pub release_pose: String,
    pub navigation_pose: String,
}

/// A maximal contiguous sub-plan executed at one navigation pose.
#[derive(Debug, Clone, PartialEq)]
pub struct PickupLeg {
    pub navigation_pose: String,
    pub bottles: Vec<PickupSite>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PutLeg {
    pub navigation_pose: String,
    pub puts: Vec<PutSite>,
}

/// A bottle the planner could not route.
#[derive(Debug, Clone, PartialEq)]
pub struct PlanReject {
    pub bottle_id: String,
    pub code: ErrorCode,
}

impl PlanReject {
    fn new(bottle_id: impl Into<String>, code: ErrorCode) -> Self {
        Self {
            bottle_id: bottle_id.into(),
            code,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PickupPlan {
    pub legs: Vec<PickupLeg>,
    pub rejected: Vec<PlanReject>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PutPlan {
    pub legs: Vec<PutLeg>,
    pub rejected: Vec<PlanReject>,
}

/// One fill-the-platform round of a transfer: pickups, then puts.
#[derive(Debug, Clone, PartialEq)]
pub struct TransferBatch {
    pub pickup_legs: Vec<PickupLeg>,
    pub put_legs: Vec<PutLeg>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TransferPlan {
    pub batches: Vec<TransferBatch>,
    pub rejected: Vec<PlanReject>,
}

/// Variant A: route requested bottles onto the robot back platform.
pub fn plan_pickup(inventory: &Inventory, bottle_ids: &[String]) -> PickupPlan {
    let mut rejected = Vec::new();
    let mut sites = Vec::new();
    for bottle_id in bottle_ids {
        match resolve_pickup_site(inventory, bottle_id) {
            Ok(site) => sites.push(site),
            Err(code) => rejected.push(PlanReject::new(bottle_id, code)),
        }
    }

    let mut platform = PlatformSim::from_inventory(inventory);
    let mut legs = Vec::new();
    for group in nav_groups(sites) {
        let mut kept = Vec::new();
        for site in group.1 {
            if platform.take(site.object_type) {
                kept.push(site);
            } else {
                rejected.push(PlanReject::new(
                    site.bottle_id,
                    ErrorCode::PlatformOverCapacity,
                ));
            }
        }
        if !kept.is_empty() {
            legs.push(PickupLeg {
                navigation_pose: group.0,
                bottles: kept,
            });
        }
    }

    PickupPlan { legs, rejected }
}

/// Variant B: route bottles from wherever they sit to their release slots.
pub fn plan_put(inventory: &Inventory, release_params: &[ReleaseParam]) -> PutPlan {
    let mut rejected = Vec::new();
    let mut sites = Vec::new();
    let mut simulated: HashMap<String, usize> = HashMap::new();
    for param in release_params {
        match resolve_put_site(inventory, param, &mut simulated) {
            Ok(site) => sites.push(site),
            Err(code) => rejected.push(PlanReject::new(&param.bottle_id, code)),
        }
    }

    PutPlan {
        legs: put_legs(sites),
        rejected,
    }
}

/// Variant C: alternating pickup/put batches sized to the back platform.
pub fn plan_transfer(
    inventory: &Inventory,
    target_ids: &[String],
    release_params: &[ReleaseParam],
) -> TransferPlan {
    let release_map: HashMap<&str, &str> = release_params
        .iter()
        .map(|param| (param.bottle_id.as_str(), param.release_pose.as_str()))
        .collect();

    let mut rejected = Vec::new();
    let mut pending = Vec::new();
    let mut simulated: HashMap<String, usize> = HashMap::new();
    for bottle_id in target_ids {
        let site = match resolve_pickup_site(inventory, bottle_id) {
            Ok(site) => site,
            Err(code) => {
                rejected.push(PlanReject::new(bottle_id, code));
                continue;
            }
        };
        // Key symmetry is validated by the handler; a hole here means the
        // planner was called directly with asymmetric lists.
        let release_pose = match release_map.get(bottle_id.as_str()) {
            Some(pose) => (*pose).to_string(),
            None => {
                rejected.push(PlanReject::new(bottle_id, ErrorCode::BadRequest));
                continue;
            }
        };
        let param = ReleaseParam {
            bottle_id: bottle_id.clone(),
            release_pose,
        };
        match resolve_put_site(inventory, &param, &mut simulated) {
            Ok(put) => pending.push(TransferItem {
                pickup: site,
                release_pose: put.release_pose,
                release_nav: put.navigation_pose,
            }),
            Err(code) => rejected.push(PlanReject::new(bottle_id, code)),
        }
    }

    let mut batches = Vec::new();
    while !pending.is_empty() {
        let mut platform = PlatformSim::from_inventory(inventory);
        let selected = select_batch(&mut pending, &mut platform);
        if selected.is_empty() {
            // No pending bottle fits the platform at all; pre-existing
            // occupancy has starved the batch.
            for item in pending.drain(..) {
                rejected.push(PlanReject::new(
                    item.pickup.bottle_id,
                    ErrorCode::PlatformOverCapacity,
                ));
            }
            break;
        }

        let pickup_sites: Vec<PickupSite> =
            selected.iter().map(|item| item.pickup.clone()).collect();
        let put_sites: Vec<PutSite> = selected
            .iter()
            .map(|item| PutSite {
                bottle_id: item.pickup.bottle_id.clone(),
                object_type: item.pickup.object_type,
                hand: item.pickup.hand,
                source_pose: item.pickup.object_type.back_platform_slot().to_string(),
                release_pose: item.release_pose.clone(),
                navigation_pose: item.release_nav.clone(),
            })
            .collect();

        batches.push(TransferBatch {
            pickup_legs: nav_groups(pickup_sites)
                .into_iter()
                .map(|(navigation_pose, bottles)| PickupLeg {
                    navigation_pose,
                    bottles,
                })
                .collect(),
            put_legs: put_legs(put_sites),
        });
    }

    TransferPlan { batches, rejected }
}

struct TransferItem {
    pickup: PickupSite,
    release_pose: String,
    release_nav: String,
}

/// Per-type free units on the robot back platform.
struct PlatformSim {
    free: HashMap<ObjectType, usize>,
}

impl PlatformSim {
    fn from_inventory(inventory: &Inventory) -> Self {
        let free = ObjectType::ALL
            .iter()
            .map(|ty| {
                (
                    *ty,
                    inventory
                        .available_units(ty.back_platform_slot())
                        .unwrap_or(0),
                )
            })
            .collect();
        Self { free }
    }

    fn take(&mut self, object_type: ObjectType) -> bool {
        match self.free.get_mut(&object_type) {
            Some(units) if *units > 0 => {
                *units -= 1;
                true
            }
            _ => false,
        }
    }
}

fn resolve_pickup_site(inventory: &Inventory, bottle_id: &str) -> Result<PickupSite, ErrorCode> {
    let bottle = inventory
        .lookup_bottle(bottle_id)
        .map_err(|_| ErrorCode::BottleUnknown)?;
    // A bottle without a tracked location cannot be routed to.
    let target_pose = bottle.location.ok_or(ErrorCode::BottleUnknown)?;
    let slot = inventory
        .lookup_slot(&target_pose)
        .map_err(|_| ErrorCode::SlotUnknown)?;
    if slot.category == SlotCategory::BackPlatform {
        // Already riding on the robot; re-picking it is over-capacity by
        // definition.
        return Err(ErrorCode::PlatformOverCapacity);
    }
    Ok(PickupSite {
        bottle_id: bottle_id.to_string(),
        object_type: bottle.object_type,
        hand: bottle.hand,
        target_pose,
        navigation_pose: slot.navigation_pose,
    })
}

fn resolve_put_site(
    inventory: &Inventory,
    param: &ReleaseParam,
    simulated: &mut HashMap<String, usize>,
) -> Result<PutSite, ErrorCode> {
    let bottle = inventory
        .lookup_bottle(&param.bottle_id)
        .map_err(|_| ErrorCode::BottleUnknown)?;
    let source_pose = bottle.location.ok_or(ErrorCode::BottleUnknown)?;
    let slot = inventory
        .lookup_slot(&param.release_pose)
        .map_err(|_| ErrorCode::SlotUnknown)?;
    if !slot.accepts(bottle.object_type) {
        return Err(ErrorCode::TypeMismatch);
    }
    let planned = simulated.entry(param.release_pose.clone()).or_insert(0);
    let free = inventory
        .available_units(&param.release_pose)
        .unwrap_or(0)
        .saturating_sub(*planned);
    if free == 0 {
        return Err(ErrorCode::SlotFull);
    }
    *planned += 1;
    Ok(PutSite {
        bottle_id: param.bottle_id.clone(),
        object_type: bottle.object_type,
        hand: bottle.hand,
        source_pose,
        release_pose: param.release_pose.clone(),
        navigation_pose: slot.navigation_pose,
    })
}

/// Group pickup sites by navigation pose: groups largest first (nav name
/// breaking ties), same-type bottles consecutive within a group.
fn nav_groups(sites: Vec<PickupSite>) -> Vec<(String, Vec<PickupSite>)> {
    let mut groups: HashMap<String, Vec<PickupSite>> = HashMap::new();
    for site in sites {
        groups.entry(site.navigation_pose.clone()).or_default().push(site);
    }
    let mut ordered: Vec<(String, Vec<PickupSite>)> = groups.into_iter().collect();
    for (_, group) in ordered.iter_mut() {
        group.sort_by(|a, b| {
            a.object_type
                .cmp(&b.object_type)
                .then_with(|| a.bottle_id.cmp(&b.bottle_id))
        });
    }
    ordered.sort_by(|a, b| b.1.len().cmp(&a.1.len()).then_with(|| a.0.cmp(&b.0)));
    ordered
}

fn put_legs(sites: Vec<PutSite>) -> Vec<PutLeg> {
    let mut groups: HashMap<String, Vec<PutSite>> = HashMap::new();
    for site in sites {
        groups.entry(site.navigation_pose.clone()).or_default().push(site);
    }
    let mut ordered: Vec<(String, Vec<PutSite>)> = groups.into_iter().collect();
    for (_, group) in ordered.iter_mut() {
        group.sort_by(|a, b| {
            a.release_pose
                .cmp(&b.release_pose)
                .then_with(|| a.bottle_id.cmp(&b.bottle_id))
        });
    }
    ordered.sort_by(|a, b| b.1.len().cmp(&a.1.len()).then_with(|| a.0.cmp(&b.0)));
    ordered
        .into_iter()
        .map(|(navigation_pose, puts)| PutLeg {
            navigation_pose,
            puts,
        })
        .collect()
}

/// Fill the platform for one transfer batch.
///
/// Source-nav groups board largest first; when capacity is tight, bottles
/// whose destinations cluster (shared release nav, then shared release pose)
/// board before loners, so the following put sub-plan needs fewer moves.
fn select_batch(pending: &mut Vec<TransferItem>, platform: &mut PlatformSim) -> Vec<TransferItem> {
    let mut nav_counts: HashMap<&str, usize> = HashMap::new();
    let mut pose_counts: HashMap<&str, usize> = HashMap::new();
    for item in pending.iter() {
        *nav_counts.entry(item.release_nav.as_str()).or_insert(0) += 1;
        *pose_counts.entry(item.release_pose.as_str()).or_insert(0) += 1;
    }

    let mut source_groups: HashMap<String, Vec<usize>> = HashMap::new();
    for (index, item) in pending.iter().enumerate() {
        source_groups
            .entry(item.pickup.navigation_pose.clone())
            .or_default()
            .push(index);
    }
    let mut ordered_groups: Vec<(String, Vec<usize>)> = source_groups.into_iter().collect();
    ordered_groups.sort_by(|a, b| b.1.len().cmp(&a.1.len()).then_with(|| a.0.cmp(&b.0)));

    let mut selected_indices = Vec::new();
    for (_, mut indices) in ordered_groups {
        indices.sort_by(|&a, &b| {
            let item_a = &pending[a];
            let item_b = &pending[b];
            nav_counts[item_b.release_nav.as_str()]
                .cmp(&nav_counts[item_a.release_nav.as_str()])
                .then_with(|| {
                    pose_counts[item_b.release_pose.as_str()]
                        .cmp(&pose_counts[item_a.release_pose.as_str()])
                })
                .then_with(|| item_a.pickup.bottle_id.cmp(&item_b.pickup.bottle_id))
        });
        for index in indices {
            if platform.take(pending[index].pickup.object_type) {
                selected_indices.push(index);
            }
        }
    }

    selected_indices.sort_unstable();
    let mut selected = Vec::with_capacity(selected_indices.len());
    for index in selected_indices.into_iter().rev() {
        selected.push(pending.swap_remove(index));
    }
    selected.reverse();
    selected
}
