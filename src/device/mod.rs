//! Hardware devices and simulators, and the registries that find them.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

pub mod hardware;
pub mod listing;
pub mod simulator;

pub use hardware::HardwareDeviceRegistry;
pub use simulator::{SimulatorRegistry, SimulatorSelector};

/// Hardware device class as reported by the device listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceClass {
    IPhone,
    IPad,
    IPod,
    Watch,
    AppleTV,
    XrOS,
}

impl FromStr for DeviceClass {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, ()> {
        match s.trim().to_ascii_lowercase().as_str() {
            "iphone" => Ok(DeviceClass::IPhone),
            "ipad" => Ok(DeviceClass::IPad),
            "ipod" => Ok(DeviceClass::IPod),
            "watch" => Ok(DeviceClass::Watch),
            "appletv" => Ok(DeviceClass::AppleTV),
            "xros" | "realitydevice" => Ok(DeviceClass::XrOS),
            _ => Err(()),
        }
    }
}

impl fmt::Display for DeviceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DeviceClass::IPhone => "iPhone",
            DeviceClass::IPad => "iPad",
            DeviceClass::IPod => "iPod",
            DeviceClass::Watch => "Watch",
            DeviceClass::AppleTV => "AppleTV",
            DeviceClass::XrOS => "xrOS",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Architecture {
    Arm64,
    Arm64_32,
    ArmV7k,
}

/// A physical device attached over USB or the network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HardwareDevice {
    pub device_identifier: String,
    pub device_class: DeviceClass,
    pub companion_identifier: Option<String>,
    pub name: String,
    pub build_version: String,
    pub product_version: String,
    pub product_type: String,
    pub interface_type: Option<String>,
    pub is_usable_for_debugging: Option<bool>,
    pub is_locked: bool,
    pub is_paired: bool,
}

impl HardwareDevice {
    /// CPU architecture derived from the product type, e.g. `Watch4,1`.
    pub fn architecture(&self) -> Architecture {
        if self.device_class != DeviceClass::Watch {
            return Architecture::Arm64;
        }
        let major: u32 = self
            .product_type
            .trim_start_matches(|c: char| !c.is_ascii_digit())
            .split(',')
            .next()
            .and_then(|m| m.parse().ok())
            .unwrap_or(0);
        if major >= 4 {
            Architecture::Arm64_32
        } else {
            Architecture::ArmV7k
        }
    }

    pub fn is_wireless(&self) -> bool {
        self.interface_type
            .as_deref()
            .is_some_and(|t| t.eq_ignore_ascii_case("wifi"))
    }

    pub fn os_version(&self) -> String {
        self.product_version.clone()
    }
}

/// Simulator lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeviceState {
    #[default]
    Unknown,
    Shutdown,
    Booting,
    Booted,
    ShuttingDown,
}

impl DeviceState {
    /// Parse the listing's state attribute, anything unrecognized is `Unknown`.
    pub fn parse(s: &str) -> Self {
        match s.trim() {
            "Booting" => DeviceState::Booting,
            "Booted" => DeviceState::Booted,
            "ShuttingDown" => DeviceState::ShuttingDown,
            "Shutdown" => DeviceState::Shutdown,
            _ => DeviceState::Unknown,
        }
    }
}

/// A simulator instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimulatorDevice {
    pub udid: String,
    pub name: String,
    /// e.g. `com.apple.CoreSimulator.SimRuntime.iOS-17-0`
    pub sim_runtime: String,
    /// e.g. `com.apple.CoreSimulator.SimDeviceType.iPhone-X`
    pub sim_device_type: String,
    pub state: DeviceState,
    pub data_path: PathBuf,
    pub log_path: PathBuf,
}

const RUNTIME_PREFIX: &str = "com.apple.CoreSimulator.SimRuntime.";

impl SimulatorDevice {
    pub fn system_log(&self) -> PathBuf {
        self.log_path.join("system.log")
    }

    pub fn tcc_database(&self) -> PathBuf {
        self.data_path
            .join("data")
            .join("Library")
            .join("TCC")
            .join("TCC.db")
    }

    pub fn is_watch(&self) -> bool {
        self.sim_runtime.starts_with("com.apple.CoreSimulator.SimRuntime.watchOS")
    }

    /// Human readable OS, e.g. `iOS 17.0`.
    pub fn os_version(&self) -> String {
        let runtime = self
            .sim_runtime
            .strip_prefix(RUNTIME_PREFIX)
            .unwrap_or(&self.sim_runtime);
        match runtime.split_once('-') {
            Some((os, version)) => format!("{} {}", os, version.replace('-', ".")),
            None => runtime.to_string(),
        }
    }
}

/// Either kind of device a run can target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Device {
    Hardware(HardwareDevice),
    Simulator(SimulatorDevice),
}

impl Device {
    pub fn name(&self) -> &str {
        match self {
            Device::Hardware(d) => &d.name,
            Device::Simulator(s) => &s.name,
        }
    }

    /// Device identifier or simulator UDID.
    pub fn identifier(&self) -> &str {
        match self {
            Device::Hardware(d) => &d.device_identifier,
            Device::Simulator(s) => &s.udid,
        }
    }

    pub fn os_version(&self) -> String {
        match self {
            Device::Hardware(d) => d.os_version(),
            Device::Simulator(s) => s.os_version(),
        }
    }

    pub fn as_hardware(&self) -> Option<&HardwareDevice> {
        match self {
            Device::Hardware(d) => Some(d),
            Device::Simulator(_) => None,
        }
    }

    pub fn as_simulator(&self) -> Option<&SimulatorDevice> {
        match self {
            Device::Simulator(s) => Some(s),
            Device::Hardware(_) => None,
        }
    }
}

impl From<HardwareDevice> for Device {
    fn from(d: HardwareDevice) -> Self {
        Device::Hardware(d)
    }
}

impl From<SimulatorDevice> for Device {
    fn from(s: SimulatorDevice) -> Self {
        Device::Simulator(s)
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name(), self.identifier())
    }
}

/// A temporary listing file, removed when dropped.
pub(crate) struct TempListing(pub PathBuf);

impl TempListing {
    pub fn new(prefix: &str) -> Self {
        Self(std::env::temp_dir().join(format!("{}-{}.xml", prefix, uuid::Uuid::new_v4())))
    }
}

impl Drop for TempListing {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.0);
    }
}
