//! Device records handed over by the render pipeline.
//!
//! A record is produced fresh every cycle and never mutated afterwards; the
//! daemon shares each one behind an `Arc` for the duration of a cycle.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::RecordError;

/// All records of one cycle, keyed by device id.
pub type DeviceRecords = BTreeMap<String, Arc<DeviceRecord>>;

/// IP address family of a management address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum AddressFamily {
    /// IPv4, serialized as `"4"`.
    #[serde(rename = "4")]
    V4,
    /// IPv6, serialized as `"6"`.
    #[serde(rename = "6")]
    V6,
}

/// Order in which address families are tried when connecting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FamilyOrder {
    /// All IPv4 addresses, then all IPv6 addresses.
    V4First,
    /// All IPv6 addresses, then all IPv4 addresses.
    V6First,
}

impl FamilyOrder {
    /// Returns the families in preference order.
    pub fn families(&self) -> [AddressFamily; 2] {
        match self {
            FamilyOrder::V4First => [AddressFamily::V4, AddressFamily::V6],
            FamilyOrder::V6First => [AddressFamily::V6, AddressFamily::V4],
        }
    }
}

/// Fully resolved description of one device plus its target configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRecord {
    /// Inventory id.
    pub id: String,
    /// Hardware serial number.
    pub serial: String,
    /// Host name of the device.
    pub nodename: String,
    /// Driver key selecting the deployment protocol.
    pub usecase: String,
    /// Management addresses grouped by family.
    #[serde(default)]
    pub addresses: BTreeMap<AddressFamily, Vec<IpAddr>>,
    /// Rendered configuration text; absent while not yet renderable.
    #[serde(default, rename = "config")]
    pub rendered: Option<String>,
    /// Whether the device may be deployed to.
    #[serde(default)]
    pub deploy: bool,
    /// Default gateway, when the inventory knows one.
    #[serde(default)]
    pub gateway: Option<IpAddr>,
}

impl DeviceRecord {
    /// Returns the addresses of one family.
    pub fn addresses_of(&self, family: AddressFamily) -> &[IpAddr] {
        self.addresses
            .get(&family)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Returns every address in the given family preference order.
    pub fn addresses_in(&self, order: FamilyOrder) -> Vec<IpAddr> {
        order
            .families()
            .iter()
            .flat_map(|family| self.addresses_of(*family).iter().copied())
            .collect()
    }

    /// Returns true if the record carries rendered configuration text.
    pub fn is_renderable(&self) -> bool {
        self.rendered.is_some()
    }
}

/// Parses a JSON object of device id to record into [`DeviceRecords`].
///
/// Each map key must equal the `id` inside its record.
pub fn parse_records(json: &str) -> Result<DeviceRecords, RecordError> {
    let raw: BTreeMap<String, DeviceRecord> = serde_json::from_str(json)?;

    let mut records = DeviceRecords::new();
    for (key, record) in raw {
        if key != record.id {
            return Err(RecordError::KeyMismatch {
                key,
                id: record.id,
            });
        }
        records.insert(key, Arc::new(record));
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn sample_json() -> &'static str {
        r#"{
            "d1": {
                "id": "d1",
                "serial": "JN1234",
                "nodename": "sw-hall-a",
                "usecase": "access-switch_juniper_ex3300-48p",
                "addresses": {"4": ["10.0.0.5"], "6": ["2001:db8::5"]},
                "config": "system { host-name sw-hall-a; }",
                "deploy": true
            },
            "d2": {
                "id": "d2",
                "serial": "MT0001",
                "nodename": "core-1",
                "usecase": "core-switch_mellanox_sn2410",
                "addresses": {"6": ["2001:db8::1"]},
                "config": null
            }
        }"#
    }

    #[test]
    fn test_parse_records() {
        let records = parse_records(sample_json()).unwrap();
        assert_eq!(records.len(), 2);

        let d1 = &records["d1"];
        assert_eq!(d1.serial, "JN1234");
        assert!(d1.deploy);
        assert!(d1.is_renderable());

        let d2 = &records["d2"];
        assert!(!d2.deploy);
        assert!(!d2.is_renderable());
        assert_eq!(d2.gateway, None);
    }

    #[test]
    fn test_family_order() {
        let records = parse_records(sample_json()).unwrap();
        let d1 = &records["d1"];

        let v4_first: Vec<String> = d1
            .addresses_in(FamilyOrder::V4First)
            .iter()
            .map(|a| a.to_string())
            .collect();
        assert_eq!(v4_first, vec!["10.0.0.5", "2001:db8::5"]);

        let v6_first: Vec<String> = d1
            .addresses_in(FamilyOrder::V6First)
            .iter()
            .map(|a| a.to_string())
            .collect();
        assert_eq!(v6_first, vec!["2001:db8::5", "10.0.0.5"]);
    }

    #[test]
    fn test_missing_family_is_empty() {
        let records = parse_records(sample_json()).unwrap();
        assert!(records["d2"].addresses_of(AddressFamily::V4).is_empty());
    }

    #[test]
    fn test_mismatching_key_rejected() {
        let json = r#"{"x": {"id": "y", "serial": "s", "nodename": "n", "usecase": "u"}}"#;
        let err = parse_records(json).unwrap_err();
        assert!(matches!(err, RecordError::KeyMismatch { ref key, ref id } if key == "x" && id == "y"));
        assert!(err.to_string().contains("mismatching id"));
    }

    #[test]
    fn test_malformed_json_rejected() {
        let err = parse_records("[1, 2]").unwrap_err();
        assert!(matches!(err, RecordError::Json(_)));
    }
}
