//! Environment variable processing for runtime configuration overrides.
//!
//! Env var prefix: `DEVICE_TEST_RUNNER_`
//!
//! - `DEVICE_TEST_RUNNER_PROFILE` selects a configuration profile
//! - `DEVICE_TEST_RUNNER_MLAUNCH` overrides the mlaunch binary
//! - `DEVICE_TEST_RUNNER_XCODE_ROOT` overrides the Xcode root
//! - `DEVICE_TEST_RUNNER_LOG_DIR` overrides the log directory
//! - `DEVICE_TEST_RUNNER_TIMEOUT` overrides the run timeout (seconds)
//! - `DEVICE_TEST_RUNNER_LAUNCH_TIMEOUT` overrides the test launch timeout (seconds)
//! - `DEVICE_TEST_RUNNER_TRANSPORT` selects the listener transport (tcp/file)
//! - `DEVICE_TEST_RUNNER_USE_TUNNEL` enables the TCP tunnel (1/true/yes or 0/false/no)
//! - `DEVICE_TEST_RUNNER_SIGNAL_APP_END` enables the app end tag (1/true/yes)
//! - `DEVICE_TEST_RUNNER_VERBOSE` enables verbose output (1/true/yes)

use super::{Config, ListenerTransport};

const PREFIX: &str = "DEVICE_TEST_RUNNER_";

/// Read the active profile name from `DEVICE_TEST_RUNNER_PROFILE`.
pub fn get_profile_name() -> Option<String> {
    env_str("PROFILE")
}

/// Apply individual env var overrides to a config.
///
/// Each override is applied only if the env var is set and parses correctly.
/// Invalid values are silently ignored.
pub fn apply_env_overrides(config: &mut Config) {
    if let Some(val) = env_str("MLAUNCH") {
        config.tools.mlaunch = val.into();
    }

    if let Some(val) = env_str("XCODE_ROOT") {
        config.tools.xcode_root = val.into();
    }

    if let Some(val) = env_str("LOG_DIR") {
        config.logs.directory = val.into();
    }

    if let Some(val) = env_parse::<u64>("TIMEOUT") {
        config.timeouts.run = val;
    }

    if let Some(val) = env_parse::<u64>("LAUNCH_TIMEOUT") {
        config.timeouts.launch = val;
    }

    if let Some(transport) = env_str("TRANSPORT").and_then(|v| v.parse::<ListenerTransport>().ok()) {
        config.listener.transport = transport;
    }

    if let Some(val) = env_bool("USE_TUNNEL") {
        config.listener.use_tunnel = val;
    }

    if let Some(val) = env_bool("SIGNAL_APP_END") {
        config.run.signal_app_end = val;
    }

    if let Some(val) = env_bool("VERBOSE") {
        config.verbose = val;
    }
}

/// Summarize which env var overrides are currently active.
///
/// Returns a list of `(env_var_name, value)` pairs.
pub fn detect_active_overrides() -> Vec<(String, String)> {
    let keys = [
        "PROFILE",
        "MLAUNCH",
        "XCODE_ROOT",
        "LOG_DIR",
        "TIMEOUT",
        "LAUNCH_TIMEOUT",
        "TRANSPORT",
        "USE_TUNNEL",
        "SIGNAL_APP_END",
        "VERBOSE",
    ];

    let mut active = Vec::new();
    for key in keys {
        let full = format!("{PREFIX}{key}");
        if let Ok(val) = std::env::var(&full) {
            if !val.is_empty() {
                active.push((full, val));
            }
        }
    }
    active
}

// --- helpers ---

fn env_str(suffix: &str) -> Option<String> {
    std::env::var(format!("{PREFIX}{suffix}"))
        .ok()
        .filter(|s| !s.is_empty())
}

fn env_parse<T: std::str::FromStr>(suffix: &str) -> Option<T> {
    env_str(suffix).and_then(|s| s.parse().ok())
}

fn env_bool(suffix: &str) -> Option<bool> {
    env_str(suffix).map(|s| matches!(s.to_lowercase().as_str(), "1" | "true" | "yes"))
}
