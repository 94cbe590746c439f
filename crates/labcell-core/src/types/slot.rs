//! Storage slots (target poses) distributed around the workcell.

use serde::{Deserialize, Serialize};

use super::ObjectType;

/// Where in the workcell a slot physically lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotCategory {
    Shelf,
    BackPlatform,
    Worktable,
    ScanTable,
    DetectTemp,
}

/// A named fixed point where bottles are grabbed from or placed into.
///
/// `navigation_pose` is the waypoint the robot base must reach before the
/// slot is workable; back-platform slots ride on the robot itself and use the
/// reserved waypoint `"robot"`. When `accepted_type` is `None` the slot is
/// untyped and accepts any bottle family.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Slot {
    pub pose_name: String,
    pub category: SlotCategory,
    pub navigation_pose: String,
    #[serde(default)]
    pub accepted_type: Option<ObjectType>,
    pub capacity: usize,
    #[serde(default)]
    pub occupants: Vec<String>,
}

impl Slot {
    pub fn new(
        pose_name: impl Into<String>,
        category: SlotCategory,
        navigation_pose: impl Into<String>,
        accepted_type: Option<ObjectType>,
        capacity: usize,
    ) -> Self {
        Self {
            pose_name: pose_name.into(),
            category,
            navigation_pose: navigation_pose.into(),
            accepted_type,
            capacity: capacity.max(1),
            occupants: Vec::new(),
        }
    }

    /// Whether the bottle family fits this slot.
    pub fn accepts(&self, object_type: ObjectType) -> bool {
        self.accepted_type.map_or(true, |ty| ty == object_type)
    }

    pub fn is_full(&self) -> bool {
        self.occupants.len() >= self.capacity
    }

    pub fn available(&self) -> usize {
        self.capacity.saturating_sub(self.occupants.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_untyped_slot_accepts_everything() {
        let slot = Slot::new("worktable_temp_001", SlotCategory::Worktable, "worktable", None, 2);
        for ty in ObjectType::ALL {
            assert!(slot.accepts(ty));
        }
    }

    #[test]
    fn test_typed_slot_rejects_other_families() {
        let slot = Slot::new(
            "shelf_temp_1000_001",
            SlotCategory::Shelf,
            "shelf",
            Some(ObjectType::GlassBottle1000),
            2,
        );
        assert!(slot.accepts(ObjectType::GlassBottle1000));
        assert!(!slot.accepts(ObjectType::GlassBottle250));
    }

    #[test]
    fn test_capacity_is_clamped_to_one() {
        let slot = Slot::new("x", SlotCategory::Shelf, "shelf", None, 0);
        assert_eq!(slot.capacity, 1);
        assert_eq!(slot.available(), 1);
    }
}
