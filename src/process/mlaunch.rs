//! Typed mlaunch command-line arguments.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// One mlaunch argument. Each renders to one or two argv entries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MlaunchArgument {
    SdkRoot(PathBuf),
    ListDevices(PathBuf),
    ListWirelessDevices(bool),
    ListSimulators(PathBuf),
    ListCrashReports(PathBuf),
    XmlOutputFormat,
    ListExtraData,
    Timeout(Duration),
    /// Simulator selector, `--device=:v2:udid=<udid>`.
    SimulatorUdid(String),
    DeviceName(String),
    InstallAppOnDevice(PathBuf),
    InstallAppOnSimulator(PathBuf),
    UninstallAppFromDevice(String),
    DownloadCrashReport(String),
    DownloadCrashReportTo(PathBuf),
    LaunchSimulator,
    LaunchSimulatorBundleId(String),
    LaunchDeviceBundleId(String),
    LaunchSimulatorExtension { launch_path: String, bundle_id: String },
    LaunchDeviceExtension { launch_path: String, bundle_id: String },
    DisableMemoryLimits,
    WaitForExit,
    AttachNativeDebugger,
    LogDevice,
    TcpTunnel(u16),
    SetEnv { name: String, value: String },
    AppArgument(String),
    Verbose,
}

impl MlaunchArgument {
    pub fn set_env(name: impl Into<String>, value: impl Into<String>) -> Self {
        MlaunchArgument::SetEnv {
            name: name.into(),
            value: value.into(),
        }
    }

    /// Render to argv entries.
    pub fn to_args(&self) -> Vec<String> {
        use MlaunchArgument::*;

        let single = |s: String| vec![s];
        match self {
            SdkRoot(p) => vec!["--sdkroot".into(), p.display().to_string()],
            ListDevices(p) => single(format!("--listdev={}", p.display())),
            ListWirelessDevices(b) => single(format!("--list-wireless-devices={}", b)),
            ListSimulators(p) => single(format!("--listsim={}", p.display())),
            ListCrashReports(p) => single(format!("--list-crash-reports={}", p.display())),
            XmlOutputFormat => single("--output-format=XML".into()),
            ListExtraData => single("--list-extra-data".into()),
            Timeout(d) => single(format!("--timeout={}", d.as_secs())),
            SimulatorUdid(udid) => single(format!("--device=:v2:udid={}", udid)),
            DeviceName(name) => vec!["--devname".into(), name.clone()],
            InstallAppOnDevice(p) => vec!["--installdev".into(), p.display().to_string()],
            InstallAppOnSimulator(p) => vec!["--installsim".into(), p.display().to_string()],
            UninstallAppFromDevice(id) => vec!["--uninstalldevbundleid".into(), id.clone()],
            DownloadCrashReport(name) => single(format!("--download-crash-report={}", name)),
            DownloadCrashReportTo(p) => {
                single(format!("--download-crash-report-to={}", p.display()))
            }
            LaunchSimulator => single("--launchsimulator".into()),
            LaunchSimulatorBundleId(id) => single(format!("--launchsimbundleid={}", id)),
            LaunchDeviceBundleId(id) => vec!["--launchdevbundleid".into(), id.clone()],
            LaunchSimulatorExtension {
                launch_path,
                bundle_id,
            } => vec![
                format!("--launchsimbundleid=todayviewforextensions:{}", bundle_id),
                format!("--observe-extension={}", launch_path),
            ],
            LaunchDeviceExtension {
                launch_path,
                bundle_id,
            } => vec![
                "--launchdevbundleid".into(),
                format!("todayviewforextensions:{}", bundle_id),
                format!("--observe-extension={}", launch_path),
            ],
            DisableMemoryLimits => single("--disable-memory-limits".into()),
            WaitForExit => single("--wait-for-exit".into()),
            AttachNativeDebugger => single("--attach-native-debugger".into()),
            LogDevice => single("--logdev".into()),
            TcpTunnel(port) => single(format!("--tcp-tunnel={}:{}", port, port)),
            SetEnv { name, value } => single(format!("-setenv={}={}", name, value)),
            AppArgument(arg) => single(format!("-argument={}", arg)),
            Verbose => single("-v".into()),
        }
    }
}

/// Ordered mlaunch argument list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MlaunchArguments(Vec<MlaunchArgument>);

impl MlaunchArguments {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, arg: MlaunchArgument) {
        self.0.push(arg);
    }

    pub fn with(mut self, arg: MlaunchArgument) -> Self {
        self.0.push(arg);
        self
    }

    pub fn iter(&self) -> impl Iterator<Item = &MlaunchArgument> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Value of the environment variable already set through `-setenv`, if any.
    pub fn env_value(&self, name: &str) -> Option<&str> {
        self.0.iter().find_map(|a| match a {
            MlaunchArgument::SetEnv { name: n, value } if n == name => Some(value.as_str()),
            _ => None,
        })
    }

    pub fn to_args(&self) -> Vec<String> {
        self.0.iter().flat_map(MlaunchArgument::to_args).collect()
    }
}

impl Extend<MlaunchArgument> for MlaunchArguments {
    fn extend<T: IntoIterator<Item = MlaunchArgument>>(&mut self, iter: T) {
        self.0.extend(iter);
    }
}

impl FromIterator<MlaunchArgument> for MlaunchArguments {
    fn from_iter<T: IntoIterator<Item = MlaunchArgument>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl fmt::Display for MlaunchArguments {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rendered: Vec<String> = self
            .to_args()
            .into_iter()
            .map(|a| {
                if a.contains(' ') {
                    format!("\"{}\"", a)
                } else {
                    a
                }
            })
            .collect();
        f.write_str(&rendered.join(" "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use MlaunchArgument::*;

    #[test]
    fn test_equal_sign_and_space_forms() {
        assert_eq!(
            ListSimulators(PathBuf::from("/tmp/sims.xml")).to_args(),
            vec!["--listsim=/tmp/sims.xml"]
        );
        assert_eq!(
            DeviceName("Tim's iPhone".into()).to_args(),
            vec!["--devname", "Tim's iPhone"]
        );
        assert_eq!(
            SimulatorUdid("ABC-123".into()).to_args(),
            vec!["--device=:v2:udid=ABC-123"]
        );
        assert_eq!(TcpTunnel(51234).to_args(), vec!["--tcp-tunnel=51234:51234"]);
        assert_eq!(
            MlaunchArgument::set_env("NUNIT_AUTOEXIT", "true").to_args(),
            vec!["-setenv=NUNIT_AUTOEXIT=true"]
        );
    }

    #[test]
    fn test_extension_launch() {
        let arg = LaunchSimulatorExtension {
            launch_path: "/apps/Ext.appex".into(),
            bundle_id: "com.example.ext".into(),
        };
        assert_eq!(
            arg.to_args(),
            vec![
                "--launchsimbundleid=todayviewforextensions:com.example.ext",
                "--observe-extension=/apps/Ext.appex",
            ]
        );
    }

    #[test]
    fn test_arguments_display_quotes_spaces() {
        let args = MlaunchArguments::new()
            .with(DeviceName("My iPad".into()))
            .with(WaitForExit);
        assert_eq!(args.to_string(), "--devname \"My iPad\" --wait-for-exit");
        assert_eq!(args.len(), 2);
    }

    #[test]
    fn test_env_value_lookup() {
        let args = MlaunchArguments::new()
            .with(MlaunchArgument::set_env("NUNIT_HOSTPORT", "1020"))
            .with(AppArgument("--verbose".into()));
        assert_eq!(args.env_value("NUNIT_HOSTPORT"), Some("1020"));
        assert_eq!(args.env_value("NUNIT_HOSTNAME"), None);
    }
}
