//! Parsing of the launcher's XML device and simulator listings.

use super::{DeviceClass, DeviceState, HardwareDevice, SimulatorDevice};
use crate::xml::Element;
use std::collections::HashSet;
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimRuntime {
    pub name: String,
    pub identifier: String,
    pub version: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimDeviceType {
    pub name: String,
    pub identifier: String,
    pub product_family_id: String,
    pub min_runtime_version: i64,
    pub max_runtime_version: i64,
    pub supports_64bits: bool,
}

/// A watch simulator (gizmo) paired with a phone simulator (companion).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimDevicePair {
    pub udid: String,
    pub companion: String,
    pub gizmo: String,
}

/// Everything the simulator listing reports.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SimulatorListing {
    pub runtimes: Vec<SimRuntime>,
    pub device_types: Vec<SimDeviceType>,
    pub devices: Vec<SimulatorDevice>,
    pub pairs: Vec<SimDevicePair>,
}

fn text(node: &Element, name: &str) -> String {
    node.child_text(name).unwrap_or_default().to_string()
}

fn number(node: &Element, name: &str) -> i64 {
    node.child_text(name)
        .and_then(|v| v.parse().ok())
        .unwrap_or(0)
}

fn flag(node: &Element, name: &str) -> Option<bool> {
    node.child_text(name).map(|v| v.eq_ignore_ascii_case("true"))
}

/// Parse `/MTouch/Simulator`.
pub fn parse_simulators(root: &Element) -> SimulatorListing {
    let mut listing = SimulatorListing::default();

    for node in root.select("/MTouch/Simulator/SupportedRuntimes/SimRuntime") {
        listing.runtimes.push(SimRuntime {
            name: text(node, "Name"),
            identifier: text(node, "Identifier"),
            version: number(node, "Version"),
        });
    }

    for node in root.select("/MTouch/Simulator/SupportedDeviceTypes/SimDeviceType") {
        listing.device_types.push(SimDeviceType {
            name: text(node, "Name"),
            identifier: text(node, "Identifier"),
            product_family_id: text(node, "ProductFamilyId"),
            min_runtime_version: number(node, "MinRuntimeVersion"),
            max_runtime_version: number(node, "MaxRuntimeVersion"),
            supports_64bits: flag(node, "Supports64Bits").unwrap_or(false),
        });
    }

    for node in root.select("/MTouch/Simulator/AvailableDevices/SimDevice") {
        listing.devices.push(SimulatorDevice {
            udid: node.attr("UDID").unwrap_or_default().to_string(),
            name: node.attr("Name").unwrap_or_default().to_string(),
            sim_runtime: text(node, "SimRuntime"),
            sim_device_type: text(node, "SimDeviceType"),
            state: DeviceState::parse(node.attr("State").unwrap_or_default()),
            data_path: PathBuf::from(text(node, "DataPath")),
            log_path: PathBuf::from(text(node, "LogPath")),
        });
    }

    let mut seen = HashSet::new();
    for node in root.select("/MTouch/Simulator/AvailableDevicePairs/SimDevicePair") {
        let pair = SimDevicePair {
            udid: node.attr("UDID").unwrap_or_default().to_string(),
            companion: text(node, "Companion"),
            gizmo: text(node, "Gizmo"),
        };
        if seen.insert((pair.gizmo.clone(), pair.companion.clone())) {
            listing.pairs.push(pair);
        }
    }

    listing
}

/// Parse `/MTouch/Device`, dropping locked devices (unless `include_locked`)
/// and devices that report they cannot be debugged.
pub fn parse_devices(root: &Element, include_locked: bool) -> Vec<HardwareDevice> {
    let mut devices = Vec::new();
    for node in root.select("/MTouch/Device") {
        let class = text(node, "DeviceClass");
        let Ok(device_class) = class.parse::<DeviceClass>() else {
            tracing::debug!(class = %class, "skipping device of unknown class");
            continue;
        };

        let device = HardwareDevice {
            device_identifier: text(node, "DeviceIdentifier"),
            device_class,
            companion_identifier: node
                .child_text("CompanionIdentifier")
                .filter(|c| !c.is_empty())
                .map(str::to_string),
            name: text(node, "Name"),
            build_version: text(node, "BuildVersion"),
            product_version: text(node, "ProductVersion"),
            product_type: text(node, "ProductType"),
            interface_type: node
                .child_text("InterfaceType")
                .filter(|c| !c.is_empty())
                .map(str::to_string),
            is_usable_for_debugging: flag(node, "IsUsableForDebugging"),
            is_locked: flag(node, "IsLocked").unwrap_or(false),
            is_paired: flag(node, "IsPaired").unwrap_or(false),
        };

        if device.is_locked && !include_locked {
            tracing::debug!(device = %device.name, "skipping locked device");
            continue;
        }
        if device.is_usable_for_debugging == Some(false) {
            tracing::debug!(device = %device.name, "skipping device not usable for debugging");
            continue;
        }
        devices.push(device);
    }
    devices
}
