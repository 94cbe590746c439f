//! Bottle identity and the closed object-type family.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// The bottle families the workcell handles. Every slot that is typed
/// accepts exactly one of these, and the robot back platform carries one
/// temp slot per family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ObjectType {
    #[serde(rename = "glass_bottle_1000")]
    GlassBottle1000,
    #[serde(rename = "glass_bottle_500")]
    GlassBottle500,
    #[serde(rename = "glass_bottle_250")]
    GlassBottle250,
    #[serde(rename = "glass_bottle_100")]
    GlassBottle100,
}

impl ObjectType {
    /// All families, in wire-name order.
    pub const ALL: [ObjectType; 4] = [
        ObjectType::GlassBottle1000,
        ObjectType::GlassBottle500,
        ObjectType::GlassBottle250,
        ObjectType::GlassBottle100,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectType::GlassBottle1000 => "glass_bottle_1000",
            ObjectType::GlassBottle500 => "glass_bottle_500",
            ObjectType::GlassBottle250 => "glass_bottle_250",
            ObjectType::GlassBottle100 => "glass_bottle_100",
        }
    }

    /// The robot back-platform temp slot that stores this family.
    pub fn back_platform_slot(&self) -> &'static str {
        match self {
            ObjectType::GlassBottle1000 => "back_temp_1000_001",
            ObjectType::GlassBottle500 => "back_temp_500_001",
            ObjectType::GlassBottle250 => "back_temp_250_001",
            ObjectType::GlassBottle100 => "back_temp_100_001",
        }
    }
}

impl fmt::Display for ObjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which manipulator a bottle prefers.
///
/// The vendor documentation is self-contradictory about which physical arm
/// "left" and "right" denote, so the value is serialized verbatim and never
/// interpreted anywhere in this workspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Hand {
    Left,
    Right,
    Both,
}

impl Hand {
    pub fn as_str(&self) -> &'static str {
        match self {
            Hand::Left => "left",
            Hand::Right => "right",
            Hand::Both => "both",
        }
    }
}

impl fmt::Display for Hand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A physical sample bottle known to the inventory.
///
/// `location` is the pose_name of the slot currently holding the bottle, or
/// `None` while the bottle is unassigned (e.g. in the robot's hand). At most
/// one slot lists a given bottle as an occupant at any time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bottle {
    pub bottle_id: String,
    pub object_type: ObjectType,
    pub hand: Hand,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub scanned_at: Option<DateTime<Utc>>,
}

impl Bottle {
    pub fn new(bottle_id: impl Into<String>, object_type: ObjectType, hand: Hand) -> Self {
        Self {
            bottle_id: bottle_id.into(),
            object_type,
            hand,
            location: None,
            scanned_at: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_type_wire_names_round_trip() {
        for ty in ObjectType::ALL {
            let json = serde_json::to_string(&ty).unwrap();
            assert_eq!(json, format!("\"{}\"", ty.as_str()));
            let back: ObjectType = serde_json::from_str(&json).unwrap();
            assert_eq!(back, ty);
        }
    }

    #[test]
    fn test_hand_is_serialized_verbatim() {
        assert_eq!(serde_json::to_string(&Hand::Right).unwrap(), "\"right\"");
        assert_eq!(serde_json::to_string(&Hand::Both).unwrap(), "\"both\"");
    }

    #[test]
    fn test_back_platform_slot_per_family() {
        assert_eq!(
            ObjectType::GlassBottle500.back_platform_slot(),
            "back_temp_500_001"
        );
    }
}
