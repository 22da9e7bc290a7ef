//! Kiosk configuration loading and filesystem locations.
//!
//! Everything lives under `~/.baylock/`:
//! - `kiosk.toml` kiosk identity, upstream endpoints, extension + timing knobs
//! - `daemon.sock` daemon IPC socket
//! - `bookings-cache.json` last snapshot, used when starting offline
//! - `logs/` display log files

use std::env;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use baylock_protocol::{DisplayConfig, ExtensionSettings};
use fs_err as fs;
use serde::{Deserialize, Serialize};

use crate::error::{KioskError, Result};

pub const CONFIG_ENV: &str = "BAYLOCK_CONFIG";
pub const SOCKET_ENV: &str = "BAYLOCK_SOCKET";
const BAYLOCK_DIR: &str = ".baylock";
const CONFIG_FILE: &str = "kiosk.toml";
const SOCKET_FILE: &str = "daemon.sock";
const CACHE_FILE: &str = "bookings-cache.json";

pub const EXAMPLE_CONFIG: &str = r#"# baylock kiosk configuration
bay_id = "bay-1"
location_id = "location-1"
api_base_url = "https://bookings.example.com/api"
relay_ip = "192.168.1.50"

[extension]
enabled = true
trigger_minutes = 5
options = [15, 30, 45, 60]
min_gap_minutes = 15
result_display_secs = 5

[timing]
recheck_secs = 5
refresh_hours = 6
heartbeat_minutes = 5
"#;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Local re-check interval while locked.
    pub recheck_secs: u64,
    /// Full booking refresh interval; heals missed pushes.
    pub refresh_hours: u64,
    pub heartbeat_minutes: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            recheck_secs: 5,
            refresh_hours: 6,
            heartbeat_minutes: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KioskConfig {
    pub bay_id: String,
    pub location_id: String,
    pub api_base_url: String,
    pub relay_ip: String,
    #[serde(default)]
    pub extension: ExtensionSettings,
    #[serde(default)]
    pub timing: TimingConfig,
}

impl KioskConfig {
    pub fn validate(&self) -> Result<()> {
        require("bay_id", &self.bay_id)?;
        require("location_id", &self.location_id)?;
        require("api_base_url", &self.api_base_url)?;
        require("relay_ip", &self.relay_ip)?;

        let url = self.api_base_url.trim();
        let host = url
            .strip_prefix("https://")
            .or_else(|| url.strip_prefix("http://"))
            .ok_or_else(|| invalid("api_base_url", "must be an http or https URL"))?;
        if host.is_empty() || host.starts_with('/') {
            return Err(invalid("api_base_url", "must include a host"));
        }

        self.relay_ip
            .trim()
            .parse::<Ipv4Addr>()
            .map_err(|_| invalid("relay_ip", "must be a valid IPv4 address"))?;

        if self.timing.recheck_secs == 0 {
            return Err(invalid("timing.recheck_secs", "must be positive"));
        }
        if self.timing.refresh_hours == 0 {
            return Err(invalid("timing.refresh_hours", "must be positive"));
        }
        if self.timing.heartbeat_minutes == 0 {
            return Err(invalid("timing.heartbeat_minutes", "must be positive"));
        }
        if self.extension.enabled && self.extension.options.is_empty() {
            return Err(invalid("extension.options", "must list at least one choice"));
        }
        Ok(())
    }

    /// Base URL without a trailing slash.
    pub fn api_base(&self) -> &str {
        self.api_base_url.trim().trim_end_matches('/')
    }

    pub fn display_config(&self) -> DisplayConfig {
        DisplayConfig {
            bay_id: self.bay_id.clone(),
            location_id: self.location_id.clone(),
            recheck_secs: self.timing.recheck_secs,
            extension: self.extension.clone(),
        }
    }
}

/// Returns `~/.baylock`.
pub fn baylock_dir() -> Result<PathBuf> {
    dirs::home_dir()
        .map(|home| home.join(BAYLOCK_DIR))
        .ok_or(KioskError::HomeDirNotFound)
}

pub fn config_path() -> Result<PathBuf> {
    if let Ok(path) = env::var(CONFIG_ENV) {
        return Ok(PathBuf::from(path));
    }
    Ok(baylock_dir()?.join(CONFIG_FILE))
}

pub fn socket_path() -> Result<PathBuf> {
    if let Ok(path) = env::var(SOCKET_ENV) {
        return Ok(PathBuf::from(path));
    }
    Ok(baylock_dir()?.join(SOCKET_FILE))
}

pub fn cache_path() -> Result<PathBuf> {
    Ok(baylock_dir()?.join(CACHE_FILE))
}

pub fn logs_dir() -> Result<PathBuf> {
    Ok(baylock_dir()?.join("logs"))
}

/// Loads and validates the kiosk configuration.
pub fn load_config(path: &Path) -> Result<KioskConfig> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Err(KioskError::ConfigMissing(path.to_path_buf()))
        }
        Err(err) => {
            return Err(KioskError::Io {
                context: format!("reading {}", path.display()),
                source: err,
            })
        }
    };

    let config: KioskConfig =
        toml::from_str(&content).map_err(|err| KioskError::ConfigMalformed {
            path: path.to_path_buf(),
            details: err.to_string(),
        })?;
    config.validate()?;
    Ok(config)
}

/// Writes [`EXAMPLE_CONFIG`] to `path` unless a file already exists there.
pub fn write_example_config(path: &Path) -> Result<bool> {
    if path.exists() {
        return Ok(false);
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|err| KioskError::Io {
            context: "creating config directory".to_string(),
            source: err,
        })?;
    }
    fs::write(path, EXAMPLE_CONFIG).map_err(|err| KioskError::Io {
        context: format!("writing {}", path.display()),
        source: err,
    })?;
    Ok(true)
}

fn require(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(invalid(field, "is required"));
    }
    Ok(())
}

fn invalid(field: &str, reason: &str) -> KioskError {
    KioskError::ConfigInvalid {
        field: field.to_string(),
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(dir: &Path, content: &str) -> PathBuf {
        let path = dir.join("kiosk.toml");
        fs::write(&path, content).expect("write config");
        path
    }

    #[test]
    fn example_config_is_valid() {
        let config: KioskConfig = toml::from_str(EXAMPLE_CONFIG).expect("parse example");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn missing_sections_take_defaults() {
        let temp = tempfile::tempdir().expect("temp dir");
        let path = write(
            temp.path(),
            r#"
bay_id = "bay-7"
location_id = "loc-2"
api_base_url = "http://10.0.0.2:3000/"
relay_ip = "10.0.0.9"
"#,
        );
        let config = load_config(&path).expect("load");
        assert_eq!(config.extension, ExtensionSettings::default());
        assert_eq!(config.timing, TimingConfig::default());
        assert_eq!(config.api_base(), "http://10.0.0.2:3000");
    }

    #[test]
    fn partial_extension_section_fills_defaults() {
        let temp = tempfile::tempdir().expect("temp dir");
        let path = write(
            temp.path(),
            r#"
bay_id = "bay-7"
location_id = "loc-2"
api_base_url = "https://api.example.com"
relay_ip = "10.0.0.9"

[extension]
trigger_minutes = 10
"#,
        );
        let config = load_config(&path).expect("load");
        assert_eq!(config.extension.trigger_minutes, 10);
        assert_eq!(config.extension.options, vec![15, 30, 45, 60]);
        assert_eq!(config.extension.min_gap_minutes, 15);
    }

    #[test]
    fn missing_file_is_reported() {
        let temp = tempfile::tempdir().expect("temp dir");
        let err = load_config(&temp.path().join("nope.toml")).unwrap_err();
        assert!(matches!(err, KioskError::ConfigMissing(_)));
    }

    #[test]
    fn malformed_toml_is_reported() {
        let temp = tempfile::tempdir().expect("temp dir");
        let path = write(temp.path(), "bay_id = ");
        assert!(matches!(
            load_config(&path).unwrap_err(),
            KioskError::ConfigMalformed { .. }
        ));
    }

    #[test]
    fn rejects_bad_relay_ip_and_url() {
        let mut config: KioskConfig = toml::from_str(EXAMPLE_CONFIG).expect("parse example");
        config.relay_ip = "300.1.1.1".to_string();
        assert!(config.validate().is_err());

        let mut config: KioskConfig = toml::from_str(EXAMPLE_CONFIG).expect("parse example");
        config.api_base_url = "ftp://example.com".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_blank_bay() {
        let mut config: KioskConfig = toml::from_str(EXAMPLE_CONFIG).expect("parse example");
        config.bay_id = "  ".to_string();
        assert!(matches!(
            config.validate().unwrap_err(),
            KioskError::ConfigInvalid { ref field, .. } if field == "bay_id"
        ));
    }

    #[test]
    fn example_is_written_once() {
        let temp = tempfile::tempdir().expect("temp dir");
        let path = temp.path().join("nested").join("kiosk.toml");
        assert!(write_example_config(&path).expect("write"));
        assert!(!write_example_config(&path).expect("second write"));
        assert!(load_config(&path).is_ok());
    }
}
