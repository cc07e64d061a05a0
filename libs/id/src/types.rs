//! Typed ID definitions for fleet resources.
//!
//! Each ID type has a unique prefix that identifies the resource type.

use crate::define_id;

// =============================================================================
// Cluster Placement
// =============================================================================

define_id!(NodeId, "node");
define_id!(FleetId, "flt");
define_id!(ReservationId, "rsv");

// =============================================================================
// Workloads
// =============================================================================

define_id!(MachineId, "mach");
define_id!(InstanceId, "inst");

// =============================================================================
// Events
// =============================================================================

define_id!(InstanceEventId, "evt");

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instance_id_roundtrip() {
        let id = InstanceId::new();
        let s = id.to_string();
        assert!(s.starts_with("inst_"));
        let parsed: InstanceId = s.parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_machine_id_invalid_prefix() {
        let result: Result<MachineId, _> = "inst_01HV4Z2WQXKJNM8GPQY6VBKC3D".parse();
        let err = result.unwrap_err();
        assert!(err.is_prefix_error());
        assert!(matches!(
            err,
            crate::IdError::InvalidPrefix {
                expected: "mach",
                ..
            }
        ));
    }

    #[test]
    fn test_missing_separator() {
        let result: Result<NodeId, _> = "node01HV4Z2WQXKJNM8GPQY6VBKC3D".parse();
        assert!(matches!(
            result.unwrap_err(),
            crate::IdError::MissingSeparator
        ));
    }

    #[test]
    fn test_empty() {
        let result: Result<FleetId, _> = "".parse();
        assert!(matches!(result.unwrap_err(), crate::IdError::Empty));
    }

    #[test]
    fn test_invalid_ulid() {
        let result: Result<ReservationId, _> = "rsv_invalid".parse();
        assert!(matches!(
            result.unwrap_err(),
            crate::IdError::InvalidUlid(_)
        ));
    }

    #[test]
    fn test_json_is_string_form() {
        let id = InstanceEventId::new();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{id}\""));
        let parsed: InstanceEventId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_ids_sort_by_creation_time() {
        let first = InstanceId::new();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let second = InstanceId::new();
        assert!(first < second);
        assert!(first.to_string() < second.to_string());
    }

    #[test]
    fn test_all_id_prefixes_unique() {
        let prefixes = [
            NodeId::PREFIX,
            FleetId::PREFIX,
            ReservationId::PREFIX,
            MachineId::PREFIX,
            InstanceId::PREFIX,
            InstanceEventId::PREFIX,
        ];

        let unique: std::collections::HashSet<_> = prefixes.iter().collect();
        assert_eq!(prefixes.len(), unique.len(), "Duplicate ID prefixes found!");
    }
}
