//! Registry of connected hardware devices.

use super::listing::parse_devices;
use super::{DeviceClass, HardwareDevice, TempListing};
use crate::core::error::{Error, Result};
use crate::logs::Log;
use crate::process::{MlaunchArgument, MlaunchArguments, OutputSinks, ProcessManager};
use crate::target::{RunMode, version_order};
use crate::xml::Element;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

const LISTING_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Default)]
struct Cache {
    loaded: bool,
    devices: Vec<HardwareDevice>,
}

/// Loads the device listing once and answers device queries from the cache.
pub struct HardwareDeviceRegistry {
    processes: Arc<dyn ProcessManager>,
    cache: Mutex<Cache>,
}

/// Device classes a run mode can use.
pub fn device_classes(run_mode: RunMode) -> Result<&'static [DeviceClass]> {
    match run_mode {
        RunMode::IOS => Ok(&[DeviceClass::IPhone, DeviceClass::IPad, DeviceClass::IPod]),
        RunMode::WatchOS => Ok(&[DeviceClass::Watch]),
        RunMode::TvOS => Ok(&[DeviceClass::AppleTV]),
        RunMode::XrOS => Ok(&[DeviceClass::XrOS]),
        RunMode::MacCatalyst => Err(Error::unsupported("Mac Catalyst runs on the host")),
    }
}

impl HardwareDeviceRegistry {
    pub fn new(processes: Arc<dyn ProcessManager>) -> Self {
        Self {
            processes,
            cache: Mutex::new(Cache::default()),
        }
    }

    /// Populate the cache. A no-op once loaded unless `force_refresh`.
    ///
    /// Concurrent callers wait for the load in progress instead of listing
    /// devices twice.
    pub async fn load_devices(
        &self,
        log: &Log,
        include_locked: bool,
        force_refresh: bool,
        include_wireless: bool,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut cache = self.cache.lock().await;
        if cache.loaded && !force_refresh {
            return Ok(());
        }
        cache.loaded = false;
        cache.devices.clear();

        let listing = TempListing::new("devices");
        let args = MlaunchArguments::new()
            .with(MlaunchArgument::ListDevices(listing.0.clone()))
            .with(MlaunchArgument::ListWirelessDevices(include_wireless))
            .with(MlaunchArgument::XmlOutputFormat)
            .with(MlaunchArgument::ListExtraData);

        let result = self
            .processes
            .execute_mlaunch(
                &args,
                OutputSinks::single(log),
                LISTING_TIMEOUT,
                &Default::default(),
                cancel.clone(),
            )
            .await?;
        if !result.succeeded() {
            log.write_line("Failed to list devices.");
            return Err(Error::no_device("Failed to list devices."));
        }

        let root = Element::parse_file(&listing.0).inspect_err(|e| {
            log.write_line(format!("Failed to parse device list: {}", e));
        })?;
        let devices = parse_devices(&root, include_locked);
        log.write_line(format!("Found {} devices", devices.len()));
        if !devices.is_empty() {
            let names: Vec<&str> = devices.iter().map(|d| d.name.as_str()).collect();
            log.write_line(format!("Found following devices: '{}'", names.join("', '")));
        }

        cache.devices = devices;
        cache.loaded = true;
        Ok(())
    }

    /// Snapshot of the cached devices.
    pub async fn connected_devices(&self) -> Vec<HardwareDevice> {
        self.cache.lock().await.devices.clone()
    }

    /// Forget the cached listing.
    pub async fn reset(&self) {
        let mut cache = self.cache.lock().await;
        cache.loaded = false;
        cache.devices.clear();
    }

    /// Pick a device for `run_mode`. With several candidates the one with
    /// the lowest product version wins.
    pub async fn find_device(
        &self,
        run_mode: RunMode,
        log: &Log,
        include_locked: bool,
        include_wireless: bool,
        cancel: &CancellationToken,
    ) -> Result<HardwareDevice> {
        let classes = device_classes(run_mode)?;
        self.load_devices(log, include_locked, false, include_wireless, cancel)
            .await?;

        let devices = self.connected_devices().await;
        select_device(&devices, classes, log)
    }

    /// The phone a watch is paired with.
    pub async fn find_companion_device(
        &self,
        log: &Log,
        device: &HardwareDevice,
        cancel: &CancellationToken,
    ) -> Result<HardwareDevice> {
        self.load_devices(log, false, false, true, cancel).await?;
        let devices = self.connected_devices().await;
        let companions: Vec<&HardwareDevice> = devices
            .iter()
            .filter(|d| {
                device.companion_identifier.as_deref() == Some(d.device_identifier.as_str())
            })
            .collect();

        match companions.as_slice() {
            [] => Err(Error::no_device(format!(
                "Could not find the companion device for '{}'",
                device.name
            ))),
            [first, rest @ ..] => {
                if !rest.is_empty() {
                    log.write_line(format!(
                        "Found {} companion devices for {}, using the first one",
                        companions.len(),
                        device.name
                    ));
                }
                Ok((*first).clone())
            }
        }
    }
}

/// Filter by class and pick the lowest parseable product version.
/// Devices with an unparseable version sort after all others.
pub fn select_device(
    devices: &[HardwareDevice],
    classes: &[DeviceClass],
    log: &Log,
) -> Result<HardwareDevice> {
    let compatible: Vec<&HardwareDevice> = devices
        .iter()
        .filter(|d| classes.contains(&d.device_class) && d.is_usable_for_debugging != Some(false))
        .collect();

    let class_names: Vec<String> = classes.iter().map(|c| c.to_string()).collect();
    let Some(selected) = compatible
        .iter()
        .min_by(|a, b| version_key(a).cmp(&version_key(b)))
    else {
        return Err(Error::no_device(format!(
            "Could not find any applicable devices with device class(es): {}",
            class_names.join(", ")
        )));
    };

    if compatible.len() > 1 {
        let names: Vec<&str> = compatible.iter().map(|d| d.name.as_str()).collect();
        log.write_line(format!(
            "Found {} devices for device class(es) '{}': '{}'. Selected: '{}' (because it has the lowest version).",
            compatible.len(),
            class_names.join("', '"),
            names.join("', '"),
            selected.name
        ));
    }
    Ok((*selected).clone())
}

/// `(unparseable, version)`: parseable versions order first, ascending.
fn version_key(device: &HardwareDevice) -> (bool, Vec<u64>) {
    version_order(&device.product_version)
}
