//! Where a bundle runs: platform, OS family and optional OS version.

use crate::core::error::{Error, Result};
use std::fmt;
use std::str::FromStr;

/// How the bundle is hosted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Platform {
    Simulator,
    Device,
    /// Desktop-hosted (Mac Catalyst).
    Desktop,
}

/// Operating system family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OsFamily {
    IOS,
    TvOS,
    WatchOS,
    XrOS,
}

impl OsFamily {
    /// Name used in simulator runtime identifiers.
    pub fn runtime_name(&self) -> &'static str {
        match self {
            OsFamily::IOS => "iOS",
            OsFamily::TvOS => "tvOS",
            OsFamily::WatchOS => "watchOS",
            OsFamily::XrOS => "xrOS",
        }
    }
}

/// Which device classes and launch strategy a run uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RunMode {
    IOS,
    TvOS,
    WatchOS,
    XrOS,
    MacCatalyst,
}

/// An immutable `(platform, OS family, OS version)` run target.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TestTarget {
    pub platform: Platform,
    pub family: OsFamily,
    /// e.g. `"17.2"`; `None` picks the newest available.
    pub os_version: Option<String>,
}

impl TestTarget {
    pub fn new(platform: Platform, family: OsFamily) -> Self {
        Self {
            platform,
            family,
            os_version: None,
        }
    }

    pub fn simulator(family: OsFamily) -> Self {
        Self::new(Platform::Simulator, family)
    }

    pub fn device(family: OsFamily) -> Self {
        Self::new(Platform::Device, family)
    }

    pub fn mac_catalyst() -> Self {
        Self::new(Platform::Desktop, OsFamily::IOS)
    }

    pub fn with_os_version(mut self, version: impl Into<String>) -> Self {
        self.os_version = Some(version.into());
        self
    }

    pub fn is_simulator(&self) -> bool {
        self.platform == Platform::Simulator
    }

    pub fn is_device(&self) -> bool {
        self.platform == Platform::Device
    }

    pub fn is_desktop(&self) -> bool {
        self.platform == Platform::Desktop
    }

    pub fn is_watch(&self) -> bool {
        self.family == OsFamily::WatchOS && !self.is_desktop()
    }

    pub fn run_mode(&self) -> RunMode {
        if self.is_desktop() {
            return RunMode::MacCatalyst;
        }
        match self.family {
            OsFamily::IOS => RunMode::IOS,
            OsFamily::TvOS => RunMode::TvOS,
            OsFamily::WatchOS => RunMode::WatchOS,
            OsFamily::XrOS => RunMode::XrOS,
        }
    }

    /// `com.apple.CoreSimulator.SimRuntime.<OS>-`
    pub fn runtime_prefix(&self) -> String {
        format!(
            "com.apple.CoreSimulator.SimRuntime.{}-",
            self.family.runtime_name()
        )
    }

    fn base_name(&self) -> &'static str {
        match (self.platform, self.family) {
            (Platform::Desktop, _) => "maccatalyst",
            (Platform::Simulator, OsFamily::IOS) => "ios-simulator-64",
            (Platform::Simulator, OsFamily::TvOS) => "tvos-simulator",
            (Platform::Simulator, OsFamily::WatchOS) => "watchos-simulator",
            (Platform::Simulator, OsFamily::XrOS) => "xros-simulator",
            (Platform::Device, OsFamily::IOS) => "ios-device",
            (Platform::Device, OsFamily::TvOS) => "tvos-device",
            (Platform::Device, OsFamily::WatchOS) => "watchos-device",
            (Platform::Device, OsFamily::XrOS) => "xros-device",
        }
    }
}

impl fmt::Display for TestTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.os_version {
            Some(v) => write!(f, "{}_{}", self.base_name(), v),
            None => f.write_str(self.base_name()),
        }
    }
}

impl FromStr for TestTarget {
    type Err = Error;

    /// Parses names like `ios-simulator-64`, `tvos-device` or
    /// `ios-simulator-64_17.2`.
    fn from_str(s: &str) -> Result<Self> {
        let (name, version) = match s.split_once('_') {
            Some((name, version)) if !version.is_empty() => (name, Some(version.to_string())),
            _ => (s, None),
        };

        let target = match name.to_lowercase().as_str() {
            "ios-simulator" | "ios-simulator-64" => TestTarget::simulator(OsFamily::IOS),
            "tvos-simulator" => TestTarget::simulator(OsFamily::TvOS),
            "watchos-simulator" => TestTarget::simulator(OsFamily::WatchOS),
            "xros-simulator" => TestTarget::simulator(OsFamily::XrOS),
            "ios-device" => TestTarget::device(OsFamily::IOS),
            "tvos-device" => TestTarget::device(OsFamily::TvOS),
            "watchos-device" => TestTarget::device(OsFamily::WatchOS),
            "xros-device" => TestTarget::device(OsFamily::XrOS),
            "maccatalyst" => TestTarget::mac_catalyst(),
            _ => {
                return Err(Error::InvalidConfig {
                    field: "target".to_string(),
                    value: s.to_string(),
                });
            }
        };

        Ok(Self {
            os_version: version,
            ..target
        })
    }
}

/// Numeric components of a dotted version, `None` if any part is not a number.
pub fn parse_version(version: &str) -> Option<Vec<u64>> {
    let parts: Option<Vec<u64>> = version
        .trim()
        .split(['.', '-'])
        .map(|p| p.parse().ok())
        .collect();
    parts.filter(|p| !p.is_empty())
}

/// Sort key placing unparseable versions after every parseable one.
pub fn version_order(version: &str) -> (bool, Vec<u64>) {
    match parse_version(version) {
        Some(v) => (false, v),
        None => (true, Vec::new()),
    }
}
