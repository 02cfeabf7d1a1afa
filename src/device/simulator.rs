//! Simulator lifecycle and the simulator registry.

use super::listing::{SimDevicePair, SimulatorListing, parse_simulators};
use super::{DeviceState, SimulatorDevice, TempListing};
use crate::core::error::{Error, Result};
use crate::logs::Log;
use crate::process::{MlaunchArgument, MlaunchArguments, OutputSinks, ProcessCommand, ProcessManager};
use crate::target::{OsFamily, TestTarget, version_order};
use crate::tcc::TccAuthorizer;
use crate::xml::Element;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

const SIMCTL_TIMEOUT: Duration = Duration::from_secs(60);
const BOOT_TIMEOUT: Duration = Duration::from_secs(30);
const TCC_CREATION_TIMEOUT: Duration = Duration::from_secs(60);

/// Pairing failures that go away with a fresh watch simulator.
const PAIRING_CAPACITY_ERRORS: &[&str] = &[
    "At least one of the requested devices is already paired with the maximum number of supported devices and cannot accept another pairing.",
    "The selected devices are already paired with each other.",
];

fn simctl(args: &[&str]) -> Vec<String> {
    std::iter::once("simctl")
        .chain(args.iter().copied())
        .map(str::to_string)
        .collect()
}

impl SimulatorDevice {
    /// Shut down, erase, then boot and shut down once more so the fresh
    /// device is known to work. Failures are ignored.
    pub async fn erase(&self, processes: &dyn ProcessManager, log: &Log, cancel: &CancellationToken) -> Result<()> {
        for action in ["shutdown", "erase", "boot", "shutdown"] {
            processes
                .execute_xcode_command(simctl(&[action, &self.udid]), log, SIMCTL_TIMEOUT, cancel.clone())
                .await?;
        }
        Ok(())
    }

    pub async fn shutdown(&mut self, processes: &dyn ProcessManager, log: &Log, cancel: &CancellationToken) -> Result<()> {
        processes
            .execute_xcode_command(simctl(&["shutdown", &self.udid]), log, SIMCTL_TIMEOUT, cancel.clone())
            .await?;
        self.state = DeviceState::Shutdown;
        Ok(())
    }

    /// Stop the simulator service and every simulator process on the host.
    pub async fn kill_everything(&mut self, processes: &dyn ProcessManager, log: &Log, cancel: &CancellationToken) -> Result<()> {
        let launchctl = ProcessCommand::new("/bin/launchctl")
            .args(["remove", "com.apple.CoreSimulator.CoreSimulatorService"])
            .timeout(Duration::from_secs(10));
        processes
            .execute(launchctl, OutputSinks::single(log), cancel.clone())
            .await?;

        let killall = ProcessCommand::new("/usr/bin/killall")
            .args([
                "-9",
                "iPhone Simulator",
                "iOS Simulator",
                "Simulator",
                "Simulator (Watch)",
                "com.apple.CoreSimulator.CoreSimulatorService",
                "ibtoold",
            ])
            .timeout(Duration::from_secs(10));
        processes
            .execute(killall, OutputSinks::single(log), cancel.clone())
            .await?;
        self.state = DeviceState::Shutdown;

        if let Some(home) = std::env::var_os("HOME") {
            let saved_state = PathBuf::from(home).join("Library").join("Saved Application State");
            for dir in ["com.apple.watchsimulator.savedState", "com.apple.iphonesimulator.savedState"] {
                let dir = saved_state.join(dir);
                if !dir.is_dir() {
                    continue;
                }
                if let Err(e) = std::fs::remove_dir_all(&dir) {
                    log.write_line(format!("Could not delete the directory '{}': {}", dir.display(), e));
                }
            }
        }
        Ok(())
    }

    /// Get the simulator into a clean state with permissions granted to
    /// `bundle_ids`. Returns whether permissions were stored.
    pub async fn prepare(
        &mut self,
        processes: Arc<dyn ProcessManager>,
        bundle_ids: &[String],
        reset: bool,
        log: &Log,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        if reset {
            self.kill_everything(processes.as_ref(), log, cancel).await?;
            self.erase(processes.as_ref(), log, cancel).await?;
        }

        let database = self.tcc_database();
        if !database.exists() {
            log.write_line("Booting the simulator to create TCC.db");
            processes
                .execute_xcode_command(simctl(&["boot", &self.udid]), log, SIMCTL_TIMEOUT, cancel.clone())
                .await?;
            let started = Instant::now();
            while !database.exists() && started.elapsed() < TCC_CREATION_TIMEOUT && !cancel.is_cancelled() {
                tokio::time::sleep(Duration::from_millis(250)).await;
            }
        }

        let mut result = true;
        if database.exists() {
            log.write_line(format!(
                "TCC.db found for the simulator {} (SimRuntime={} and SimDeviceType={})",
                self.udid, self.sim_runtime, self.sim_device_type
            ));
            let ids: Vec<String> = bundle_ids.iter().filter(|id| !id.is_empty()).cloned().collect();
            if !ids.is_empty() {
                result = TccAuthorizer::new(processes.clone())
                    .authorize(&self.sim_runtime, &database, &self.udid, &ids, log, cancel)
                    .await;
            }
        } else {
            log.write_line(format!("TCC.db not found for the simulator {}", self.udid));
        }

        self.kill_everything(processes.as_ref(), log, cancel).await?;
        self.shutdown(processes.as_ref(), log, cancel).await?;
        Ok(result)
    }

    /// Boot through the launcher. Failure is logged and reported as `false`.
    pub async fn boot(&mut self, processes: &dyn ProcessManager, log: &Log, cancel: &CancellationToken) -> Result<bool> {
        if self.state == DeviceState::Booted {
            log.write_line(format!("Simulator '{}' is already booted", self.name));
            return Ok(true);
        }

        log.write_line(format!("Booting simulator '{}'", self.name));
        let args = MlaunchArguments::new()
            .with(MlaunchArgument::SimulatorUdid(self.udid.clone()))
            .with(MlaunchArgument::LaunchSimulator);
        let started = Instant::now();
        let result = processes
            .execute_mlaunch(&args, OutputSinks::single(log), BOOT_TIMEOUT, &Default::default(), cancel.clone())
            .await?;
        if !result.succeeded() {
            log.write_line(format!("Failed to boot the simulator '{}'", self.name));
            return Ok(false);
        }

        log.write_line(format!(
            "Simulator '{}' booted in {} seconds",
            self.name,
            started.elapsed().as_secs()
        ));
        self.state = DeviceState::Booted;
        Ok(true)
    }

    /// Where an installed app lives inside the simulator.
    pub async fn app_bundle_path(
        &self,
        processes: &dyn ProcessManager,
        bundle_id: &str,
        log: &Log,
        cancel: &CancellationToken,
    ) -> Result<PathBuf> {
        log.write_line(format!("Querying '{}' for bundle path of '{}'..", self.name, bundle_id));
        let output = Log::memory();
        let command = processes
            .xcrun_command(simctl(&["get_app_container", &self.udid, bundle_id]))
            .timeout(Duration::from_secs(30));
        let result = processes
            .execute(command, OutputSinks::new(log.clone(), output.clone(), output.clone()), cancel.clone())
            .await?;
        if !result.succeeded() {
            return Err(Error::process(format!(
                "Failed to get information for '{}'. Please check the app is installed",
                bundle_id
            )));
        }
        let path = output.contents()?.trim().to_string();
        log.write_line(format!("Found installed app bundle at '{}'", path));
        Ok(PathBuf::from(path))
    }
}

/// Chooses runtimes and device types for a target.
#[derive(Debug, Clone)]
pub struct SimulatorSelector {
    phone_device_type: String,
}

impl Default for SimulatorSelector {
    fn default() -> Self {
        Self::new(None)
    }
}

impl SimulatorSelector {
    /// `phone_device_type` overrides the iPhone model used for iOS runs.
    pub fn new(phone_device_type: Option<String>) -> Self {
        Self {
            phone_device_type: phone_device_type
                .unwrap_or_else(|| "com.apple.CoreSimulator.SimDeviceType.iPhone-X".to_string()),
        }
    }

    pub fn device_type(&self, family: OsFamily) -> String {
        match family {
            OsFamily::IOS => self.phone_device_type.clone(),
            OsFamily::TvOS => "com.apple.CoreSimulator.SimDeviceType.Apple-TV-1080p".to_string(),
            OsFamily::WatchOS => {
                "com.apple.CoreSimulator.SimDeviceType.Apple-Watch-Series-3-38mm".to_string()
            }
            OsFamily::XrOS => "com.apple.CoreSimulator.SimDeviceType.Apple-Vision-Pro".to_string(),
        }
    }

    /// Watch runs need a phone to pair with.
    pub fn companion_family(&self, target: &TestTarget) -> Option<OsFamily> {
        target.is_watch().then_some(OsFamily::IOS)
    }

    /// A booted simulator if there is one, otherwise the first.
    pub fn select<'a>(&self, devices: &'a [SimulatorDevice]) -> Option<&'a SimulatorDevice> {
        devices
            .iter()
            .find(|d| d.state == DeviceState::Booted)
            .or_else(|| devices.first())
    }
}

#[derive(Debug, Default)]
struct Cache {
    loaded: bool,
    listing: SimulatorListing,
}

/// Loads the simulator listing once and finds, creates and pairs simulators.
pub struct SimulatorRegistry {
    processes: Arc<dyn ProcessManager>,
    selector: SimulatorSelector,
    listing_timeout: Duration,
    cache: Mutex<Cache>,
}

impl SimulatorRegistry {
    pub fn new(processes: Arc<dyn ProcessManager>, selector: SimulatorSelector) -> Self {
        Self {
            processes,
            selector,
            listing_timeout: Duration::from_secs(360),
            cache: Mutex::new(Cache::default()),
        }
    }

    pub fn with_listing_timeout(mut self, timeout: Duration) -> Self {
        self.listing_timeout = timeout;
        self
    }

    /// Populate the cache; a no-op once loaded unless `force_refresh`.
    pub async fn load_devices(&self, log: &Log, force_refresh: bool, cancel: &CancellationToken) -> Result<()> {
        let mut cache = self.cache.lock().await;
        if cache.loaded && !force_refresh {
            return Ok(());
        }
        cache.loaded = false;
        cache.listing = SimulatorListing::default();

        let listing = TempListing::new("simulators");
        let args = MlaunchArguments::new()
            .with(MlaunchArgument::ListSimulators(listing.0.clone()))
            .with(MlaunchArgument::XmlOutputFormat);
        let result = self
            .processes
            .execute_mlaunch(&args, OutputSinks::single(log), self.listing_timeout, &Default::default(), cancel.clone())
            .await?;
        if !result.succeeded() {
            // The listing is often complete even when mlaunch fails.
            log.write_line(format!("Listing simulators exited with {}", result.exit_code));
        }

        let has_content = std::fs::metadata(&listing.0).map(|m| m.len() > 0).unwrap_or(false);
        if !has_content {
            let reason = if result.timed_out {
                "mlaunch timed out".to_string()
            } else {
                format!("mlaunch exited with {}", result.exit_code)
            };
            return Err(Error::no_device(format!(
                "Failed to list simulators - no XML with devices found. {}",
                reason
            )));
        }

        let root = Element::parse_file(&listing.0)?;
        let parsed = parse_simulators(&root);
        log.write_line(format!(
            "Found {} simulators, {} runtimes, {} device types and {} pairs",
            parsed.devices.len(),
            parsed.runtimes.len(),
            parsed.device_types.len(),
            parsed.pairs.len()
        ));
        cache.listing = parsed;
        cache.loaded = true;
        Ok(())
    }

    /// Snapshot of the cached listing.
    pub async fn listing(&self) -> SimulatorListing {
        self.cache.lock().await.listing.clone()
    }

    pub async fn reset(&self) {
        let mut cache = self.cache.lock().await;
        cache.loaded = false;
        cache.listing = SimulatorListing::default();
    }

    async fn ensure_loaded(&self, log: &Log, cancel: &CancellationToken) -> Result<SimulatorListing> {
        self.load_devices(log, false, cancel).await?;
        Ok(self.listing().await)
    }

    fn create_name(listing: &SimulatorListing, device_type: &str, runtime: &str) -> String {
        let last_segment = |id: &str| id.rsplit('.').next().unwrap_or(id).to_string();
        let runtime_name = listing
            .runtimes
            .iter()
            .find(|r| r.identifier == runtime)
            .map(|r| r.name.clone())
            .unwrap_or_else(|| last_segment(runtime));
        let device_name = listing
            .device_types
            .iter()
            .find(|t| t.identifier == device_type)
            .map(|t| t.name.clone())
            .unwrap_or_else(|| last_segment(device_type));
        format!("{} ({}) - created by device-test-runner", device_name, runtime_name)
    }

    fn matching(listing: &SimulatorListing, runtime: &str, device_type: &str) -> Vec<SimulatorDevice> {
        listing
            .devices
            .iter()
            .filter(|d| d.sim_runtime == runtime && d.sim_device_type == device_type)
            .cloned()
            .collect()
    }

    /// Every simulator with this runtime and device type. One is created
    /// when none exist (or always, with `force`).
    async fn find_or_create_devices(
        &self,
        log: &Log,
        runtime: &str,
        device_type: &str,
        force: bool,
        create_if_needed: bool,
        cancel: &CancellationToken,
    ) -> Result<Vec<SimulatorDevice>> {
        let listing = self.ensure_loaded(log, cancel).await?;
        if !force {
            let devices = Self::matching(&listing, runtime, device_type);
            if !devices.is_empty() || !create_if_needed {
                return Ok(devices);
            }
        }

        let name = Self::create_name(&listing, device_type, runtime);
        let rv = self
            .processes
            .execute_xcode_command(
                simctl(&["create", &name, device_type, runtime]),
                log,
                SIMCTL_TIMEOUT,
                cancel.clone(),
            )
            .await?;
        if !rv.succeeded() {
            let message = format!(
                "Could not create device\nruntime: {}\ndevice type: {}",
                runtime, device_type
            );
            log.write_line(&message);
            return Err(Error::no_device(message));
        }

        self.load_devices(log, true, cancel).await?;
        let devices = Self::matching(&self.listing().await, runtime, device_type);
        if devices.is_empty() {
            let message = format!(
                "Simulator not found after creating it\nruntime: {}\ndevice type: {}",
                runtime, device_type
            );
            log.write_line(&message);
            return Err(Error::no_device(message));
        }
        Ok(devices)
    }

    /// Pair `device` (or a freshly created watch when `create_device`) with
    /// `companion`. Returns whether a pair now exists.
    async fn create_device_pair(
        &self,
        log: &Log,
        device: Option<&SimulatorDevice>,
        companion: &SimulatorDevice,
        runtime: &str,
        device_type: &str,
        create_device: bool,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        let mut create_device = create_device;
        let mut given = device.cloned();

        loop {
            let device = if create_device {
                let candidates = self
                    .find_or_create_devices(log, runtime, device_type, true, true, cancel)
                    .await?;
                let pairs = self.listing().await.pairs;
                let unpaired = candidates.into_iter().find(|c| {
                    !pairs.iter().any(|p| p.gizmo == c.udid)
                        && given.as_ref().is_none_or(|g| g.udid != c.udid)
                });
                match unpaired {
                    Some(d) => d,
                    None => return Ok(false),
                }
            } else {
                match given.clone() {
                    Some(d) => d,
                    None => return Ok(false),
                }
            };

            log.write_line(format!(
                "Creating device pair for '{}' and '{}'",
                device.name, companion.name
            ));
            let pair_log = Log::memory();
            let mirror = log.clone();
            let _mirror = pair_log.on_line(move |line| mirror.write_line(line));
            let rv = self
                .processes
                .execute_xcode_command(
                    simctl(&["pair", &device.udid, &companion.udid]),
                    &pair_log,
                    SIMCTL_TIMEOUT,
                    cancel.clone(),
                )
                .await?;
            if rv.succeeded() {
                return Ok(true);
            }

            let output = pair_log.contents()?;
            if !create_device && PAIRING_CAPACITY_ERRORS.iter().any(|e| output.contains(e)) {
                log.write_line(format!(
                    "Could not create device pair for '{}' ({}) and '{}' ({}), but will create a new watch device and try again.",
                    device.name, device.udid, companion.name, companion.udid
                ));
                given = Some(device);
                create_device = true;
                continue;
            }

            log.write_line(format!(
                "Could not create device pair for '{}' ({}) and '{}' ({})",
                device.name, device.udid, companion.name, companion.udid
            ));
            return Ok(false);
        }
    }

    fn pairs_between(
        pairs: &[SimDevicePair],
        devices: &[SimulatorDevice],
        companions: &[SimulatorDevice],
    ) -> Option<SimDevicePair> {
        pairs
            .iter()
            .find(|p| {
                devices.iter().any(|d| d.udid == p.gizmo)
                    && companions.iter().any(|c| c.udid == p.companion)
            })
            .cloned()
    }

    async fn find_or_create_device_pair(
        &self,
        log: &Log,
        devices: &[SimulatorDevice],
        companions: &[SimulatorDevice],
        cancel: &CancellationToken,
    ) -> Result<Option<SimDevicePair>> {
        let listing = self.listing().await;
        if let Some(pair) = Self::pairs_between(&listing.pairs, devices, companions) {
            return Ok(Some(pair));
        }

        let (Some(first), Some(companion)) = (devices.first(), companions.first()) else {
            return Ok(None);
        };
        let unpaired = devices
            .iter()
            .find(|d| !listing.pairs.iter().any(|p| p.gizmo == d.udid));

        let created = self
            .create_device_pair(
                log,
                unpaired,
                companion,
                &first.sim_runtime,
                &first.sim_device_type,
                unpaired.is_none(),
                cancel,
            )
            .await?;
        if !created {
            return Ok(None);
        }

        self.load_devices(log, true, cancel).await?;
        let listing = self.listing().await;
        // A freshly created watch is not in `devices` yet.
        let devices = Self::matching(&listing, &first.sim_runtime, &first.sim_device_type);
        Ok(Self::pairs_between(&listing.pairs, &devices, companions))
    }

    /// Runtime identifier for `family`, `version` or the newest (oldest with
    /// `min_version`) available. An explicit `version` always wins.
    async fn runtime_for(
        &self,
        family: OsFamily,
        version: Option<&str>,
        min_version: bool,
        log: &Log,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let prefix = TestTarget::simulator(family).runtime_prefix();
        let version = match version {
            Some(v) => {
                if min_version {
                    log.write_line(format!(
                        "Using the requested {} runtime {} instead of the oldest available",
                        family.runtime_name(),
                        v
                    ));
                }
                v.to_string()
            }
            None => {
                let listing = self.ensure_loaded(log, cancel).await?;
                // Unparseable versions come last either way; ties keep listing order.
                let chosen = listing
                    .runtimes
                    .iter()
                    .filter_map(|r| r.identifier.strip_prefix(prefix.as_str()))
                    .min_by(|a, b| {
                        let (a, b) = (version_order(a), version_order(b));
                        if min_version {
                            a.cmp(&b)
                        } else {
                            a.0.cmp(&b.0).then_with(|| b.1.cmp(&a.1))
                        }
                    });
                chosen
                    .map(|v| v.to_string())
                    .ok_or_else(|| {
                        Error::no_device(format!(
                            "Failed to find a suitable OS runtime version for {}",
                            family.runtime_name()
                        ))
                    })?
            }
        };
        Ok(format!("{}{}", prefix, version.replace('.', "-")))
    }

    /// Resolve the simulator for `target` and, for watch targets, the phone
    /// it is paired with.
    pub async fn find_simulators(
        &self,
        target: &TestTarget,
        log: &Log,
        create_if_needed: bool,
        min_version: bool,
        cancel: &CancellationToken,
    ) -> Result<(SimulatorDevice, Option<SimulatorDevice>)> {
        let runtime = self
            .runtime_for(target.family, target.os_version.as_deref(), min_version, log, cancel)
            .await?;
        let device_type = self.selector.device_type(target.family);
        let devices = self
            .find_or_create_devices(log, &runtime, &device_type, false, create_if_needed, cancel)
            .await?;
        if devices.is_empty() {
            return Err(Error::no_device(format!(
                "Could not find or create devices\nruntime: {}\ndevice type: {}",
                runtime, device_type
            )));
        }

        let Some(companion_family) = self.selector.companion_family(target) else {
            let simulator = self.selector.select(&devices).cloned().ok_or_else(|| {
                Error::no_device(format!("Could not find simulator\nruntime: {}", runtime))
            })?;
            log.write_line(format!("Found simulator: {} {}", simulator.name, simulator.udid));
            return Ok((simulator, None));
        };

        let companion_runtime = self
            .runtime_for(companion_family, None, min_version, log, cancel)
            .await?;
        let companion_type = self.selector.device_type(companion_family);
        let companions = self
            .find_or_create_devices(log, &companion_runtime, &companion_type, false, create_if_needed, cancel)
            .await?;
        if companions.is_empty() {
            return Err(Error::no_device(format!(
                "Could not find or create companion devices\nruntime: {}\ndevice type: {}",
                companion_runtime, companion_type
            )));
        }

        let pair = self
            .find_or_create_device_pair(log, &devices, &companions, cancel)
            .await?
            .ok_or_else(|| {
                Error::no_device(format!(
                    "Could not find or create device pair\nruntime: {}\ndevice type: {}",
                    companion_runtime, companion_type
                ))
            })?;

        let listing = self.listing().await;
        let find = |udid: &str| listing.devices.iter().find(|d| d.udid == udid).cloned();
        let (Some(simulator), Some(companion)) = (find(&pair.gizmo), find(&pair.companion)) else {
            return Err(Error::no_device(format!("Pair {} refers to unknown simulators", pair.udid)));
        };
        log.write_line(format!("Found simulator: {} {}", simulator.name, simulator.udid));
        log.write_line(format!(
            "Found companion simulator: {} {}",
            companion.name, companion.udid
        ));
        Ok((simulator, Some(companion)))
    }

    /// [`find_simulators`](Self::find_simulators), attempted up to
    /// `retry_count` times.
    pub async fn find_simulators_with_retry(
        &self,
        target: &TestTarget,
        log: &Log,
        retry_count: u32,
        create_if_needed: bool,
        min_version: bool,
        cancel: &CancellationToken,
    ) -> Result<(SimulatorDevice, Option<SimulatorDevice>)> {
        if retry_count < 1 {
            return Err(Error::InvalidConfig {
                field: "simulator.retry-count".to_string(),
                value: retry_count.to_string(),
            });
        }

        for attempt in 1..=retry_count {
            match self
                .find_simulators(target, log, create_if_needed, min_version, cancel)
                .await
            {
                Ok(found) => return Ok(found),
                Err(e) => {
                    log.write_line(format!(
                        "Failed to find/create simulator (attempt {}/{}):\n{}",
                        attempt, retry_count, e
                    ));
                    tracing::warn!(attempt, retry_count, error = %e, "simulator resolution failed");
                    if cancel.is_cancelled() {
                        break;
                    }
                }
            }
        }
        Err(Error::no_device("Failed to find/create suitable simulator"))
    }

    /// The phone simulator a watch simulator is paired with.
    pub async fn find_companion_device(
        &self,
        log: &Log,
        device: &SimulatorDevice,
        cancel: &CancellationToken,
    ) -> Result<SimulatorDevice> {
        let listing = self.ensure_loaded(log, cancel).await?;
        let pair = listing
            .pairs
            .iter()
            .find(|p| p.gizmo == device.udid)
            .ok_or_else(|| Error::no_device(format!("'{}' is not paired", device.name)))?;
        listing
            .devices
            .iter()
            .find(|d| d.udid == pair.companion)
            .cloned()
            .ok_or_else(|| Error::no_device(format!("Companion of '{}' not found", device.name)))
    }
}
