//! Configuration loading and validation.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use thiserror::Error;

use crate::{InventoryConfig, LabcellConfig};

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Load and validate the full configuration from a YAML file.
pub fn load_config(path: &Path) -> Result<LabcellConfig, ConfigError> {
    let content = fs::read_to_string(path)?;
    let config: LabcellConfig = serde_yaml::from_str(&content)?;
    validate_config(&config)?;
    Ok(config)
}

fn validate_config(config: &LabcellConfig) -> Result<(), ConfigError> {
    if config.version == 0 {
        return Err(ConfigError::Invalid(
            "version must be greater than 0".to_string(),
        ));
    }

    if config.app.name.trim().is_empty() {
        return Err(ConfigError::Invalid(
            "app.name must not be empty".to_string(),
        ));
    }

    if config.http.listen.parse::<std::net::SocketAddr>().is_err() {
        return Err(ConfigError::Invalid(format!(
            "http.listen '{}' is not a socket address",
            config.http.listen
        )));
    }

    if config.robot.host.trim().is_empty() {
        return Err(ConfigError::Invalid(
            "robot.host must not be empty".to_string(),
        ));
    }
    if config.robot.retry_interval_secs == 0 {
        return Err(ConfigError::Invalid(
            "robot.retry_interval_secs must be > 0".to_string(),
        ));
    }
    if config.robot.default_timeout_secs == 0 {
        return Err(ConfigError::Invalid(
            "robot.default_timeout_secs must be > 0".to_string(),
        ));
    }

    if let Some(inventory) = &config.inventory {
        validate_inventory(inventory)?;
    }

    Ok(())
}

fn validate_inventory(inventory: &InventoryConfig) -> Result<(), ConfigError> {
    let mut capacities: HashMap<&str, usize> = HashMap::new();
    for slot in &inventory.slots {
        if slot.pose_name.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "inventory.slots[].pose_name must not be empty".to_string(),
            ));
        }
        if slot.navigation_pose.trim().is_empty() {
            return Err(ConfigError::Invalid(format!(
                "inventory.slots[{}].navigation_pose must not be empty",
                slot.pose_name
            )));
        }
        if slot.capacity == 0 {
            return Err(ConfigError::Invalid(format!(
                "inventory.slots[{}].capacity must be > 0",
                slot.pose_name
            )));
        }
        if capacities
            .insert(slot.pose_name.as_str(), slot.capacity)
            .is_some()
        {
            return Err(ConfigError::Invalid(format!(
                "inventory.slots[{}] declared twice",
                slot.pose_name
            )));
        }
    }

    let slot_types: HashMap<&str, _> = inventory
        .slots
        .iter()
        .map(|slot| (slot.pose_name.as_str(), slot.accepted_type))
        .collect();

    let mut seen_bottles = HashMap::new();
    let mut occupancy: HashMap<&str, usize> = HashMap::new();
    for bottle in &inventory.bottles {
        if bottle.bottle_id.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "inventory.bottles[].bottle_id must not be empty".to_string(),
            ));
        }
        if seen_bottles
            .insert(bottle.bottle_id.as_str(), ())
            .is_some()
        {
            return Err(ConfigError::Invalid(format!(
                "inventory.bottles[{}] declared twice",
                bottle.bottle_id
            )));
        }
        let Some(location) = &bottle.location else {
            continue;
        };
        let Some(accepted) = slot_types.get(location.as_str()) else {
            return Err(ConfigError::Invalid(format!(
                "inventory.bottles[{}].location '{}' is not a declared slot",
                bottle.bottle_id, location
            )));
        };
        if accepted.map_or(false, |ty| ty != bottle.object_type) {
            return Err(ConfigError::Invalid(format!(
                "inventory.bottles[{}] does not fit slot '{}'",
                bottle.bottle_id, location
            )));
        }
        let used = occupancy.entry(location.as_str()).or_insert(0);
        *used += 1;
        if *used > capacities[location.as_str()] {
            return Err(ConfigError::Invalid(format!(
                "inventory slot '{}' is seeded over capacity",
                location
            )));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(yaml: &str) -> Result<LabcellConfig, ConfigError> {
        let config: LabcellConfig = serde_yaml::from_str(yaml)?;
        validate_config(&config)?;
        Ok(config)
    }

    #[test]
    fn test_minimal_file_uses_defaults() {
        let config = parse("version: 1\n").unwrap();
        assert_eq!(config.app.name, "labcell");
        assert_eq!(config.http.listen, "127.0.0.1:8090");
        assert_eq!(config.robot.port, 9090);
        assert_eq!(config.robot.retry_interval_secs, 5);
        assert_eq!(config.robot.max_retry_attempts, None);
        assert!(config.inventory.is_none());
    }

    #[test]
    fn test_zero_retry_interval_is_rejected() {
        let err = parse("robot:\n  retry_interval_secs: 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_bad_listen_address_is_rejected() {
        let err = parse("http:\n  listen: not-an-addr\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_inventory_seed_round_trip() {
        let config = parse(
            r#"
inventory:
  slots:
    - pose_name: shelf_temp_1000_001
      category: shelf
      navigation_pose: shelf
      accepted_type: glass_bottle_1000
      capacity: 2
  bottles:
    - bottle_id: glass_bottle_1000_001
      object_type: glass_bottle_1000
      hand: right
      location: shelf_temp_1000_001
"#,
        )
        .unwrap();
        let inventory = config.inventory.unwrap();
        assert_eq!(inventory.slots.len(), 1);
        assert_eq!(inventory.bottles.len(), 1);
    }

    #[test]
    fn test_bottle_in_unknown_slot_is_rejected() {
        let err = parse(
            r#"
inventory:
  bottles:
    - bottle_id: b1
      object_type: glass_bottle_500
      location: nowhere
"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_seeding_over_capacity_is_rejected() {
        let err = parse(
            r#"
inventory:
  slots:
    - pose_name: s1
      category: shelf
      navigation_pose: shelf
      capacity: 1
  bottles:
    - bottle_id: b1
      object_type: glass_bottle_500
      location: s1
    - bottle_id: b2
      object_type: glass_bottle_500
      location: s1
"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_type_mismatch_seed_is_rejected() {
        let err = parse(
            r#"
inventory:
  slots:
    - pose_name: s1
      category: shelf
      navigation_pose: shelf
      accepted_type: glass_bottle_1000
  bottles:
    - bottle_id: b1
      object_type: glass_bottle_250
      location: s1
"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }
}
