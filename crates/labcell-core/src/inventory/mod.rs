//! The authoritative bottle/slot ledger.
//!
//! One process-wide `Inventory` is shared as `Arc<Inventory>`; every
//! operation takes the internal lock for the duration of that operation only.
//! Reads hand out clones, so a snapshot is consistent for a single call and
//! nothing more.
//!
//! Reservations are ephemeral capacity holds: `reserve_slot` counts against
//! a slot's capacity without listing an occupant, and the hold is consumed by
//! `commit_place` or released by `cancel_reservation`. Callers own the
//! obligation to do one of the two.

use std::collections::HashMap;
use std::sync::RwLock;

use chrono::Utc;
use serde_json::{json, Value};
use thiserror::Error;

use crate::error::CommandError;
use crate::types::{Bottle, Hand, ObjectType, Slot, SlotCategory};

/// Navigation pose of slots that ride on the robot itself.
pub const ROBOT_NAV: &str = "robot";

#[derive(Debug, Clone, Error, PartialEq)]
pub enum InventoryError {
    #[error("unknown bottle: {0}")]
    UnknownBottle(String),
    #[error("unknown slot: {0}")]
    UnknownSlot(String),
    #[error("slot full: {0}")]
    SlotFull(String),
    #[error("{object_type} does not fit slot {pose_name}")]
    TypeMismatch {
        object_type: ObjectType,
        pose_name: String,
    },
    #[error("bottle {bottle_id} is not an occupant of {pose_name}")]
    NotOccupant {
        bottle_id: String,
        pose_name: String,
    },
}

impl InventoryError {
    /// Lift into the command-level error with the matching wire code.
    pub fn into_command_error(self, bottle_id: &str) -> CommandError {
        match self {
            InventoryError::UnknownBottle(id) => CommandError::BottleUnknown(id),
            InventoryError::UnknownSlot(pose) => CommandError::SlotUnknown(pose),
            InventoryError::SlotFull(pose) => CommandError::SlotFull(pose),
            InventoryError::TypeMismatch {
                object_type,
                pose_name,
            } => CommandError::TypeMismatch {
                bottle_id: bottle_id.to_string(),
                object_type,
                pose_name,
            },
            InventoryError::NotOccupant {
                bottle_id,
                pose_name,
            } => CommandError::Internal(format!(
                "bottle {bottle_id} is not an occupant of {pose_name}"
            )),
        }
    }
}

/// An ephemeral capacity hold on a slot.
#[derive(Debug, Clone, PartialEq)]
#[must_use = "a reservation must be committed or cancelled"]
pub struct Reservation {
    pub pose_name: String,
    pub object_type: ObjectType,
}

#[derive(Debug)]
struct SlotState {
    slot: Slot,
    reserved: usize,
}

impl SlotState {
    fn available(&self) -> usize {
        self.slot
            .capacity
            .saturating_sub(self.slot.occupants.len() + self.reserved)
    }
}

#[derive(Debug, Default)]
struct Tables {
    bottles: HashMap<String, Bottle>,
    slots: HashMap<String, SlotState>,
}

/// Process-wide bottle/slot state, mutated under one lock.
#[derive(Debug, Default)]
pub struct Inventory {
    tables: RwLock<Tables>,
}

impl Inventory {
    pub fn new() -> Self {
        Self::default()
    }

    /// The built-in workcell layout used when the config file carries no
    /// inventory section: shelf, worktable, scan-table detect, split-station
    /// and the four on-robot back-platform slots.
    pub fn with_default_layout() -> Self {
        let inventory = Self::new();
        let shelf = [
            ("shelf_temp_1000_001", ObjectType::GlassBottle1000),
            ("shelf_temp_1000_002", ObjectType::GlassBottle1000),
            ("shelf_temp_1000_003", ObjectType::GlassBottle1000),
            ("shelf_temp_1000_004", ObjectType::GlassBottle1000),
            ("shelf_temp_500_001", ObjectType::GlassBottle500),
            ("shelf_temp_500_002", ObjectType::GlassBottle500),
            ("shelf_temp_250_001", ObjectType::GlassBottle250),
            ("shelf_temp_250_002", ObjectType::GlassBottle250),
        ];
        for (pose, ty) in shelf {
            inventory.insert_slot(Slot::new(pose, SlotCategory::Shelf, "shelf", Some(ty), 2));
        }
        for pose in ["worktable_temp_001", "worktable_temp_002"] {
            inventory.insert_slot(Slot::new(pose, SlotCategory::Worktable, "worktable", None, 2));
        }
        let detect = [
            ("detect_temp_1000_001", ObjectType::GlassBottle1000),
            ("detect_temp_500_001", ObjectType::GlassBottle500),
            ("detect_temp_250_001", ObjectType::GlassBottle250),
        ];
        for (pose, ty) in detect {
            inventory.insert_slot(Slot::new(
                pose,
                SlotCategory::DetectTemp,
                "scan_table",
                Some(ty),
                2,
            ));
        }
        for ty in ObjectType::ALL {
            inventory.insert_slot(Slot::new(
                ty.back_platform_slot(),
                SlotCategory::BackPlatform,
                ROBOT_NAV,
                Some(ty),
                2,
            ));
        }
        for pose in ["split_temp_001", "split_temp_002"] {
            inventory.insert_slot(Slot::new(pose, SlotCategory::Worktable, "split_table", None, 2));
        }

        for (id, pose) in [
            ("glass_bottle_1000_001", "shelf_temp_1000_001"),
            ("glass_bottle_1000_002", "shelf_temp_1000_002"),
        ] {
            inventory.register_bottle(Bottle::new(id, ObjectType::GlassBottle1000, Hand::Right));
            inventory
                .place_bottle(id, pose)
                .expect("default layout placement is within capacity");
        }
        inventory
    }

    /// Add or replace a slot definition.
    pub fn insert_slot(&self, slot: Slot) {
        let mut tables = self.tables.write().expect("inventory lock poisoned");
        tables.slots.insert(
            slot.pose_name.clone(),
            SlotState { slot, reserved: 0 },
        );
    }

    /// Register a bottle; returns false when the id was already known (the
    /// existing record, including its location, wins).
    pub fn register_bottle(&self, bottle: Bottle) -> bool {
        let mut tables = self.tables.write().expect("inventory lock poisoned");
        if tables.bottles.contains_key(&bottle.bottle_id) {
            return false;
        }
        tables.bottles.insert(bottle.bottle_id.clone(), bottle);
        true
    }

    pub fn lookup_bottle(&self, bottle_id: &str) -> Result<Bottle, InventoryError> {
        let tables = self.tables.read().expect("inventory lock poisoned");
        tables
            .bottles
            .get(bottle_id)
            .cloned()
            .ok_or_else(|| InventoryError::UnknownBottle(bottle_id.to_string()))
    }

    pub fn lookup_slot(&self, pose_name: &str) -> Result<Slot, InventoryError> {
        let tables = self.tables.read().expect("inventory lock poisoned");
        tables
            .slots
            .get(pose_name)
            .map(|state| state.slot.clone())
            .ok_or_else(|| InventoryError::UnknownSlot(pose_name.to_string()))
    }

    pub fn slots_by_navigation(&self, navigation_pose: &str) -> Vec<Slot> {
        let tables = self.tables.read().expect("inventory lock poisoned");
        let mut slots: Vec<Slot> = tables
            .slots
            .values()
            .filter(|state| state.slot.navigation_pose == navigation_pose)
            .map(|state| state.slot.clone())
            .collect();
        slots.sort_by(|a, b| a.pose_name.cmp(&b.pose_name));
        slots
    }

    /// Free units of a slot with live reservations counted in.
    pub fn available_units(&self, pose_name: &str) -> Result<usize, InventoryError> {
        let tables = self.tables.read().expect("inventory lock poisoned");
        tables
            .slots
            .get(pose_name)
            .map(SlotState::available)
            .ok_or_else(|| InventoryError::UnknownSlot(pose_name.to_string()))
    }

    /// Hold one unit of capacity for a bottle that is about to arrive.
    pub fn reserve_slot(
        &self,
        pose_name: &str,
        bottle_id: &str,
    ) -> Result<Reservation, InventoryError> {
        let object_type = self.lookup_bottle(bottle_id)?.object_type;
        self.reserve_slot_for_type(pose_name, object_type)
    }

    /// Same hold, for flows where the bottle id is not known yet (the scan
    /// session learns it only after ENTER_ID).
    pub fn reserve_slot_for_type(
        &self,
        pose_name: &str,
        object_type: ObjectType,
    ) -> Result<Reservation, InventoryError> {
        let mut tables = self.tables.write().expect("inventory lock poisoned");
        let state = tables
            .slots
            .get_mut(pose_name)
            .ok_or_else(|| InventoryError::UnknownSlot(pose_name.to_string()))?;
        if !state.slot.accepts(object_type) {
            return Err(InventoryError::TypeMismatch {
                object_type,
                pose_name: pose_name.to_string(),
            });
        }
        if state.available() == 0 {
            return Err(InventoryError::SlotFull(pose_name.to_string()));
        }
        state.reserved += 1;
        Ok(Reservation {
            pose_name: pose_name.to_string(),
            object_type,
        })
    }

    /// Consume a reservation: the bottle physically arrived at the slot.
    pub fn commit_place(
        &self,
        reservation: Reservation,
        bottle_id: &str,
    ) -> Result<(), InventoryError> {
        let mut tables = self.tables.write().expect("inventory lock poisoned");
        if !tables.bottles.contains_key(bottle_id) {
            // Leave the hold in place; the caller still owns it.
            return Err(InventoryError::UnknownBottle(bottle_id.to_string()));
        }
        let previous = tables
            .bottles
            .get(bottle_id)
            .and_then(|bottle| bottle.location.clone());
        if let Some(old_pose) = previous {
            if let Some(old_state) = tables.slots.get_mut(&old_pose) {
                old_state.slot.occupants.retain(|id| id != bottle_id);
                tracing::debug!(bottle_id, %old_pose, "detached bottle from previous slot");
            }
        }
        let state = tables
            .slots
            .get_mut(&reservation.pose_name)
            .ok_or_else(|| InventoryError::UnknownSlot(reservation.pose_name.clone()))?;
        state.reserved = state.reserved.saturating_sub(1);
        state.slot.occupants.push(bottle_id.to_string());
        let pose_name = reservation.pose_name;
        if let Some(bottle) = tables.bottles.get_mut(bottle_id) {
            bottle.location = Some(pose_name);
        }
        Ok(())
    }

    /// Release a hold that will not be used.
    pub fn cancel_reservation(&self, reservation: Reservation) {
        let mut tables = self.tables.write().expect("inventory lock poisoned");
        if let Some(state) = tables.slots.get_mut(&reservation.pose_name) {
            state.reserved = state.reserved.saturating_sub(1);
        }
    }

    /// The bottle physically left the slot (e.g. after a successful grab).
    pub fn commit_remove(&self, pose_name: &str, bottle_id: &str) -> Result<(), InventoryError> {
        let mut tables = self.tables.write().expect("inventory lock poisoned");
        if !tables.bottles.contains_key(bottle_id) {
            return Err(InventoryError::UnknownBottle(bottle_id.to_string()));
        }
        let state = tables
            .slots
            .get_mut(pose_name)
            .ok_or_else(|| InventoryError::UnknownSlot(pose_name.to_string()))?;
        let before = state.slot.occupants.len();
        state.slot.occupants.retain(|id| id != bottle_id);
        if state.slot.occupants.len() == before {
            return Err(InventoryError::NotOccupant {
                bottle_id: bottle_id.to_string(),
                pose_name: pose_name.to_string(),
            });
        }
        if let Some(bottle) = tables.bottles.get_mut(bottle_id) {
            bottle.location = None;
        }
        Ok(())
    }

    /// One-shot reserve + commit, used by bootstrap seeding.
    pub fn place_bottle(&self, bottle_id: &str, pose_name: &str) -> Result<(), InventoryError> {
        let reservation = self.reserve_slot(pose_name, bottle_id)?;
        match self.commit_place(reservation.clone(), bottle_id) {
            Ok(()) => Ok(()),
            Err(err) => {
                self.cancel_reservation(reservation);
                Err(err)
            }
        }
    }

    pub fn mark_scanned(&self, bottle_id: &str) -> Result<(), InventoryError> {
        let mut tables = self.tables.write().expect("inventory lock poisoned");
        let bottle = tables
            .bottles
            .get_mut(bottle_id)
            .ok_or_else(|| InventoryError::UnknownBottle(bottle_id.to_string()))?;
        bottle.scanned_at = Some(Utc::now());
        Ok(())
    }

    /// JSON projection for BOTTLE_GET: by bottle, by slot, or everything.
    pub fn summary(
        &self,
        bottle_id: Option<&str>,
        pose_name: Option<&str>,
        detail: bool,
    ) -> Result<Value, InventoryError> {
        let tables = self.tables.read().expect("inventory lock poisoned");

        if let Some(id) = bottle_id {
            let bottle = tables
                .bottles
                .get(id)
                .ok_or_else(|| InventoryError::UnknownBottle(id.to_string()))?;
            return Ok(if detail {
                bottle_detail(&tables, bottle)
            } else {
                json!({ "bottle_id": bottle.bottle_id })
            });
        }

        if let Some(pose) = pose_name {
            let state = tables
                .slots
                .get(pose)
                .ok_or_else(|| InventoryError::UnknownSlot(pose.to_string()))?;
            let occupants: Vec<&Bottle> = state
                .slot
                .occupants
                .iter()
                .filter_map(|id| tables.bottles.get(id))
                .collect();
            return Ok(if detail {
                json!({
                    "pose_name": state.slot.pose_name,
                    "category": state.slot.category,
                    "navigation_pose": state.slot.navigation_pose,
                    "accepted_type": state.slot.accepted_type,
                    "capacity": state.slot.capacity,
                    "count": state.slot.occupants.len(),
                    "available": state.available(),
                    "bottles": occupants
                        .iter()
                        .map(|b| bottle_detail(&tables, b))
                        .collect::<Vec<_>>(),
                })
            } else {
                json!({
                    "pose_name": state.slot.pose_name,
                    "bottle_ids": state.slot.occupants,
                })
            });
        }

        let mut ids: Vec<&String> = tables.bottles.keys().collect();
        ids.sort();
        Ok(if detail {
            json!({
                "total_count": ids.len(),
                "bottles": ids
                    .iter()
                    .filter_map(|id| tables.bottles.get(*id))
                    .map(|b| bottle_detail(&tables, b))
                    .collect::<Vec<_>>(),
            })
        } else {
            json!({ "total_count": ids.len(), "bottle_ids": ids })
        })
    }
}

fn bottle_detail(tables: &Tables, bottle: &Bottle) -> Value {
    let navigation_pose = bottle
        .location
        .as_deref()
        .and_then(|pose| tables.slots.get(pose))
        .map(|state| state.slot.navigation_pose.clone());
    json!({
        "bottle_id": bottle.bottle_id,
        "object_type": bottle.object_type,
        "hand": bottle.hand,
        "location": bottle.location,
        "target_pose": bottle.location,
        "navigation_pose": navigation_pose,
        "scanned_at": bottle.scanned_at,
    })
}
