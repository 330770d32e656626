//! Optional config file: `~/.bdg/config.toml`.
//!
//! Supplies launch defaults under the usual precedence chain: CLI flags >
//! environment > config file > built-in defaults. A missing or unreadable
//! file is treated as empty.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::ipc::StartSessionConfig;

/// Parsed config file. Every field optional; absent sections default.
#[derive(Debug, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub launch: LaunchSection,
    #[serde(default)]
    pub connection: ConnectionSection,
}

#[derive(Debug, Default, Deserialize)]
pub struct LaunchSection {
    pub headless: Option<bool>,
    pub include_all: Option<bool>,
    pub max_body_size: Option<u64>,
    pub chrome_flags: Option<Vec<String>>,
    pub user_data_dir: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ConnectionSection {
    pub port: Option<u16>,
    pub timeout_secs: Option<u64>,
}

/// Default config file location.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::home_dir().map(|h| h.join(".bdg").join("config.toml"))
}

/// Load the config file, treating a missing or malformed file as empty.
#[must_use]
pub fn load_config(path: Option<&Path>) -> ConfigFile {
    let path = match path {
        Some(p) => p.to_path_buf(),
        None => match default_config_path() {
            Some(p) => p,
            None => return ConfigFile::default(),
        },
    };
    let Ok(contents) = std::fs::read_to_string(&path) else {
        return ConfigFile::default();
    };
    toml::from_str(&contents).unwrap_or_else(|e| {
        eprintln!("warning: ignoring malformed config {}: {e}", path.display());
        ConfigFile::default()
    })
}

/// Fill config-file defaults into a start configuration for every field the
/// CLI left unset.
pub fn apply_launch_defaults(config: &mut StartSessionConfig, file: &ConfigFile) {
    if config.port.is_none() {
        config.port = file.connection.port;
    }
    if config.timeout_secs.is_none() {
        config.timeout_secs = file.connection.timeout_secs;
    }
    if config.user_data_dir.is_none() {
        config.user_data_dir = file.launch.user_data_dir.clone();
    }
    if !config.include_all {
        config.include_all = file.launch.include_all.unwrap_or(false);
    }
    if config.headless {
        // Only the config file can default a session to headed; an explicit
        // `--headed` flag already cleared this.
        config.headless = file.launch.headless.unwrap_or(true);
    }
    if let Some(max) = file.launch.max_body_size {
        // The CLI default is the protocol default; the file overrides it
        // only when the flag was not given (caller handles the flag case).
        if config.max_body_size == crate::ipc::StartSessionConfig::new("").max_body_size {
            config.max_body_size = max;
        }
    }
    if config.chrome_flags.is_empty() {
        if let Some(flags) = &file.launch.chrome_flags {
            config.chrome_flags.clone_from(flags);
        }
    }
}
