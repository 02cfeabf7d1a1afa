use device_test_runner::config::{ConfigLoader, ListenerTransport, XmlResultJargon};
use device_test_runner::runner::{RunOptions, TestOptions};
use device_test_runner::{Config, Error, builder};
use std::path::PathBuf;
use std::time::Duration;

#[test]
fn test_full_config_parsing() {
    let toml_str = r#"
verbose = true

[tools]
mlaunch = "/opt/mlaunch/bin/mlaunch"
xcode-root = "/Applications/Xcode_15.2.app"

[timeouts]
run = 1200
launch = 120
install = 600

[listener]
transport = "file"
use-tunnel = true
xml-jargon = "nunitv3"

[simulator]
retry-count = 5
create-if-needed = false
reset = true
device-type = "com.apple.CoreSimulator.SimDeviceType.iPhone-15"

[run]
signal-app-end = true
wait-for-exit = false
include-wireless = true

[logs]
directory = "artifacts"
"#;
    let config: Config = toml::from_str(toml_str).unwrap();

    assert!(config.verbose);
    assert_eq!(config.tools.mlaunch, PathBuf::from("/opt/mlaunch/bin/mlaunch"));
    assert_eq!(config.tools.xcode_root, PathBuf::from("/Applications/Xcode_15.2.app"));
    assert_eq!(config.timeouts.run(), Duration::from_secs(1200));
    assert_eq!(config.timeouts.launch(), Duration::from_secs(120));
    assert_eq!(config.timeouts.install(), Duration::from_secs(600));
    assert_eq!(config.timeouts.uninstall(), Duration::from_secs(180));
    assert_eq!(config.listener.transport, ListenerTransport::File);
    assert!(config.listener.use_tunnel);
    assert_eq!(config.listener.xml_jargon, XmlResultJargon::NUnitV3);
    assert_eq!(config.simulator.retry_count, 5);
    assert!(!config.simulator.create_if_needed);
    assert!(config.simulator.reset);
    assert!(config.run.signal_app_end);
    assert!(!config.run.wait_for_exit);
    assert!(config.run.include_wireless);
    assert!(!config.run.include_locked);
    assert_eq!(config.logs.directory, PathBuf::from("artifacts"));

    let run = RunOptions::from_config(&config);
    assert_eq!(run.timeout, Duration::from_secs(1200));
    assert!(!run.wait_for_exit);
    assert!(run.signal_app_end);

    let test = TestOptions::from_config(&config);
    assert_eq!(test.launch_timeout, Duration::from_secs(120));
    assert_eq!(test.transport, ListenerTransport::File);
    assert!(test.use_tunnel);
}

#[test]
fn test_config_file_drives_the_session() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = dir.path().join("device-test-runner.toml");
    std::fs::write(
        &config_path,
        format!(
            "[logs]\ndirectory = \"{}\"\n\n[timeouts]\nlisting = 30\n",
            dir.path().join("session-logs").display()
        ),
    )
    .unwrap();

    let config = ConfigLoader::new().config_file(&config_path).no_env().load().unwrap();
    assert_eq!(config.timeouts.listing(), Duration::from_secs(30));

    let orchestrator = builder().with_config(config).build().unwrap();
    assert!(dir.path().join("session-logs").join("main.log").exists());
    assert_eq!(orchestrator.context().config.timeouts.listing, 30);
}

#[test]
fn test_config_in_base_dir_is_found() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("device-test-runner.toml"),
        "[listener]\nxml-jargon = \"touchunit\"\n",
    )
    .unwrap();

    let config = ConfigLoader::new().base_dir(dir.path()).no_env().load().unwrap();
    assert_eq!(config.listener.xml_jargon, XmlResultJargon::TouchUnit);

    let empty = tempfile::tempdir().unwrap();
    let config = ConfigLoader::new().base_dir(empty.path()).no_env().load().unwrap();
    assert_eq!(config.listener.xml_jargon, XmlResultJargon::XUnit);
}

#[test]
fn test_missing_config_file() {
    let result = builder().from_config_file("/nonexistent/device-test-runner.toml");
    assert!(matches!(result.err(), Some(Error::FileNotFound(_))));
}

#[test]
fn test_invalid_config_value() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = dir.path().join("bad.toml");
    std::fs::write(&config_path, "[listener]\ntransport = \"carrier-pigeon\"\n").unwrap();

    let err = ConfigLoader::new().config_file(&config_path).no_env().load().unwrap_err();
    assert!(err.to_string().contains("invalid config file"), "{}", err);
}
