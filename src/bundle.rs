//! Identity of the app bundle being run.

use crate::core::error::{Error, Result};
use crate::target::TestTarget;
use std::path::{Path, PathBuf};

/// App extension kinds the launcher knows how to host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Extension {
    /// Launched through the Today view.
    TodayExtension,
    /// Not launchable by this tool.
    WatchKit2,
}

/// Immutable description of an app bundle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppBundleInformation {
    pub app_name: String,
    pub bundle_identifier: String,
    pub app_path: PathBuf,
    /// What is actually launched. Differs from `app_path` for watch apps,
    /// whose launchable bundle is nested under `Watch/`.
    pub launch_app_path: PathBuf,
    pub supports_32bit: bool,
    pub extension: Option<Extension>,
    pub bundle_executable: Option<String>,
}

impl AppBundleInformation {
    pub fn new(
        app_name: impl Into<String>,
        bundle_identifier: impl Into<String>,
        app_path: impl Into<PathBuf>,
    ) -> Self {
        let app_path = app_path.into();
        Self {
            app_name: app_name.into(),
            bundle_identifier: bundle_identifier.into(),
            launch_app_path: app_path.clone(),
            app_path,
            supports_32bit: false,
            extension: None,
            bundle_executable: None,
        }
    }

    /// Bundle known only by identifier, e.g. for an already installed app.
    pub fn from_bundle_id(bundle_identifier: impl Into<String>) -> Self {
        let id = bundle_identifier.into();
        Self::new(id.clone(), id, PathBuf::new())
    }

    /// Bundle at `app_path`, named after the directory stem.
    pub fn from_app_path(app_path: impl Into<PathBuf>, bundle_identifier: impl Into<String>) -> Self {
        let app_path = app_path.into();
        let name = app_path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self::new(name, bundle_identifier, app_path)
    }

    pub fn with_launch_app_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.launch_app_path = path.into();
        self
    }

    pub fn with_extension(mut self, extension: Extension) -> Self {
        self.extension = Some(extension);
        self
    }

    pub fn with_bundle_executable(mut self, executable: impl Into<String>) -> Self {
        self.bundle_executable = Some(executable.into());
        self
    }

    pub fn with_32bit_support(mut self, supported: bool) -> Self {
        self.supports_32bit = supported;
        self
    }

    /// For watch targets, point the launch path at the nested `Watch/*.app`.
    pub fn for_target(self, target: &TestTarget) -> Result<Self> {
        if !target.is_watch() || self.app_path.as_os_str().is_empty() {
            return Ok(self);
        }
        let watch_app = find_watch_app(&self.app_path)?;
        Ok(self.with_launch_app_path(watch_app))
    }

    /// Fail unless the bundle directory exists.
    pub fn ensure_exists(&self) -> Result<()> {
        if self.app_path.is_dir() {
            Ok(())
        } else {
            Err(Error::BundleNotFound(self.app_path.clone()))
        }
    }

    /// Executable inside a desktop bundle: `Contents/MacOS/<executable>`.
    pub fn desktop_executable(&self) -> PathBuf {
        let exe = self
            .bundle_executable
            .clone()
            .unwrap_or_else(|| self.app_name.clone());
        self.launch_app_path.join("Contents").join("MacOS").join(exe)
    }

    /// Process name used to filter system logs.
    pub fn process_name(&self) -> &str {
        self.bundle_executable.as_deref().unwrap_or(&self.app_name)
    }
}

fn find_watch_app(app_path: &Path) -> Result<PathBuf> {
    let watch_dir = app_path.join("Watch");
    let mut apps: Vec<PathBuf> = std::fs::read_dir(&watch_dir)
        .map_err(|_| Error::BundleNotFound(watch_dir.clone()))?
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| p.is_dir() && p.extension().is_some_and(|e| e == "app"))
        .collect();
    apps.sort();
    apps.into_iter()
        .next()
        .ok_or(Error::BundleNotFound(watch_dir))
}
