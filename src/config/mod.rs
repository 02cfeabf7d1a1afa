//! Configuration types, loaded from a standalone TOML file with env overrides.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

pub mod env;
mod loader;
pub use loader::ConfigLoader;

/// Complete configuration for a runner session.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// External tool locations.
    #[serde(default)]
    pub tools: ToolsConfig,

    /// Wall-clock limits, in seconds.
    #[serde(default)]
    pub timeouts: TimeoutsConfig,

    /// Test result listener configuration.
    #[serde(default)]
    pub listener: ListenerConfig,

    /// Simulator resolution configuration.
    #[serde(default)]
    pub simulator: SimulatorConfig,

    /// Launch behavior.
    #[serde(default)]
    pub run: RunConfig,

    /// Run artifact output.
    #[serde(default)]
    pub logs: LogsConfig,

    /// Enable verbose diagnostics.
    #[serde(default)]
    pub verbose: bool,
}

/// External tool locations.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ToolsConfig {
    /// The mlaunch launcher binary.
    pub mlaunch: PathBuf,

    /// Root of the Xcode installation (the `.app` directory).
    pub xcode_root: PathBuf,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            mlaunch: PathBuf::from("mlaunch"),
            xcode_root: PathBuf::from("/Applications/Xcode.app"),
        }
    }
}

/// Wall-clock limits in seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct TimeoutsConfig {
    /// Overall app run timeout.
    pub run: u64,

    /// How long the test payload has to connect to the listener.
    pub launch: u64,

    /// App installation.
    pub install: u64,

    /// App removal.
    pub uninstall: u64,

    /// Device and simulator listing.
    pub listing: u64,

    /// Simulator boot.
    pub boot: u64,
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            run: 15 * 60,
            launch: 5 * 60,
            install: 15 * 60,
            uninstall: 3 * 60,
            listing: 6 * 60,
            boot: 30,
        }
    }
}

impl TimeoutsConfig {
    pub fn run(&self) -> Duration {
        Duration::from_secs(self.run)
    }

    pub fn launch(&self) -> Duration {
        Duration::from_secs(self.launch)
    }

    pub fn install(&self) -> Duration {
        Duration::from_secs(self.install)
    }

    pub fn uninstall(&self) -> Duration {
        Duration::from_secs(self.uninstall)
    }

    pub fn listing(&self) -> Duration {
        Duration::from_secs(self.listing)
    }

    pub fn boot(&self) -> Duration {
        Duration::from_secs(self.boot)
    }
}

/// Test result listener configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ListenerConfig {
    /// How results travel from the app back to the host.
    pub transport: ListenerTransport,

    /// Reach hardware devices through a TCP tunnel instead of the network.
    pub use_tunnel: bool,

    /// Result document flavor the payload is asked to produce.
    pub xml_jargon: XmlResultJargon,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            transport: ListenerTransport::Tcp,
            use_tunnel: false,
            xml_jargon: XmlResultJargon::XUnit,
        }
    }
}

/// Test result transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ListenerTransport {
    /// The app connects to a TCP listener on the host.
    #[default]
    Tcp,
    /// The app writes results into a file the host watches.
    File,
}

impl std::str::FromStr for ListenerTransport {
    type Err = crate::core::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "tcp" => Ok(ListenerTransport::Tcp),
            "file" => Ok(ListenerTransport::File),
            _ => Err(crate::core::Error::InvalidConfig {
                field: "listener.transport".to_string(),
                value: s.to_string(),
            }),
        }
    }
}

/// Result document flavor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum XmlResultJargon {
    TouchUnit,
    NUnitV2,
    NUnitV3,
    #[default]
    XUnit,
    Trx,
    /// No XML, plain text results only.
    Missing,
}

impl fmt::Display for XmlResultJargon {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            XmlResultJargon::TouchUnit => "TouchUnit",
            XmlResultJargon::NUnitV2 => "NUnitV2",
            XmlResultJargon::NUnitV3 => "NUnitV3",
            XmlResultJargon::XUnit => "xUnit",
            XmlResultJargon::Trx => "Trx",
            XmlResultJargon::Missing => "Missing",
        };
        f.write_str(name)
    }
}

impl std::str::FromStr for XmlResultJargon {
    type Err = crate::core::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "touchunit" => Ok(XmlResultJargon::TouchUnit),
            "nunitv2" => Ok(XmlResultJargon::NUnitV2),
            "nunitv3" => Ok(XmlResultJargon::NUnitV3),
            "xunit" => Ok(XmlResultJargon::XUnit),
            "trx" => Ok(XmlResultJargon::Trx),
            "missing" => Ok(XmlResultJargon::Missing),
            _ => Err(crate::core::Error::InvalidConfig {
                field: "listener.xml-jargon".to_string(),
                value: s.to_string(),
            }),
        }
    }
}

/// Simulator resolution configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct SimulatorConfig {
    /// How many times the whole find-or-create resolution is attempted.
    pub retry_count: u32,

    /// Create simulators (and pairs) that do not exist yet.
    pub create_if_needed: bool,

    /// Erase the simulator before preparing it.
    pub reset: bool,

    /// Device type for phone simulators, e.g.
    /// `com.apple.CoreSimulator.SimDeviceType.iPhone-15`.
    pub device_type: Option<String>,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            retry_count: 3,
            create_if_needed: true,
            reset: false,
            device_type: None,
        }
    }
}

/// Launch behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct RunConfig {
    /// Ask the app to echo a per-run tag when it is about to exit.
    pub signal_app_end: bool,

    /// Block until the launched app exits.
    pub wait_for_exit: bool,

    /// Include wireless devices when listing hardware.
    pub include_wireless: bool,

    /// Include locked devices when listing hardware.
    pub include_locked: bool,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            signal_app_end: false,
            wait_for_exit: true,
            include_wireless: false,
            include_locked: false,
        }
    }
}

/// Run artifact output.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct LogsConfig {
    /// Directory all run logs are written into.
    pub directory: PathBuf,
}

impl Default for LogsConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("logs"),
        }
    }
}
