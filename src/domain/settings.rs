use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSettings {
    #[serde(default = "default_level")]
    pub level: String, // "trace", "debug", "info", "warn", "error"
    #[serde(default = "default_false")]
    pub file_logging_enabled: bool,
    #[serde(default = "default_true")]
    pub console_logging_enabled: bool,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    #[serde(default = "default_prefix")]
    pub file_name_prefix: String,
    #[serde(default = "default_true")]
    pub show_file_line: bool,
    #[serde(default = "default_false")]
    pub show_thread_ids: bool,
    #[serde(default = "default_true")]
    pub show_target: bool,
    #[serde(default = "default_true")]
    pub ansi_colors: bool,
    #[serde(default = "default_rotation")]
    pub rotation: String, // "daily", "hourly", "minutely", "never"
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: default_level(),
            file_logging_enabled: default_false(),
            console_logging_enabled: default_true(),
            log_dir: default_log_dir(),
            file_name_prefix: default_prefix(),
            show_file_line: default_true(),
            show_thread_ids: default_false(),
            show_target: default_true(),
            ansi_colors: default_true(),
            rotation: default_rotation(),
        }
    }
}

fn default_level() -> String {
    "info".to_string()
}
fn default_true() -> bool {
    true
}
fn default_false() -> bool {
    false
}
fn default_log_dir() -> String {
    "logs".to_string()
}
fn default_prefix() -> String {
    "ble_notify_client".to_string()
}
fn default_rotation() -> String {
    "daily".to_string()
}

/// Well-known bus name of the BlueZ daemon
pub const BLUEZ_SERVICE: &str = "org.bluez";

/// Base path under which adapters and devices live
pub const BLUEZ_PATH: &str = "/org/bluez";

/// Object manager root, used for the initial snapshot and add/remove signals
pub const ROOT_PATH: &str = "/";

/// Target peripheral, advertised in its UUID list
pub const DEVICE_UUID: &str = "0003cbbb-0000-1000-8000-00805f9b0131";

/// Characteristic the peripheral sends notifications on
pub const READ_CHAR_UUID: &str = "0003caa2-0000-1000-8000-00805f9b0131";

/// Characteristic accepting 4-byte command writes
pub const WRITE_CHAR_UUID: &str = "0003cbb1-0000-1000-8000-00805f9b0131";

/// Where the daemon lives and which peripheral/characteristics we want.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BleSettings {
    #[serde(default = "default_service_name")]
    pub service_name: String,
    #[serde(default = "default_base_path")]
    pub base_path: String,
    #[serde(default = "default_root_path")]
    pub root_path: String,
    #[serde(default = "default_device_uuid")]
    pub device_uuid: String,
    #[serde(default = "default_read_uuid")]
    pub read_char_uuid: String,
    #[serde(default = "default_write_uuid")]
    pub write_char_uuid: String,
}

impl Default for BleSettings {
    fn default() -> Self {
        Self {
            service_name: default_service_name(),
            base_path: default_base_path(),
            root_path: default_root_path(),
            device_uuid: default_device_uuid(),
            read_char_uuid: default_read_uuid(),
            write_char_uuid: default_write_uuid(),
        }
    }
}

fn default_service_name() -> String {
    BLUEZ_SERVICE.to_string()
}
fn default_base_path() -> String {
    BLUEZ_PATH.to_string()
}
fn default_root_path() -> String {
    ROOT_PATH.to_string()
}
fn default_device_uuid() -> String {
    DEVICE_UUID.to_string()
}
fn default_read_uuid() -> String {
    READ_CHAR_UUID.to_string()
}
fn default_write_uuid() -> String {
    WRITE_CHAR_UUID.to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    // Logging Settings
    #[serde(default)]
    pub log_settings: LogSettings,

    // BLE target
    #[serde(default)]
    pub ble: BleSettings,

    // Demo responder: colours written back on "0" notifications
    #[serde(default = "default_palette")]
    pub command_palette: Vec<u32>,
    #[serde(default = "default_notification_limit")]
    pub notification_limit: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_settings: LogSettings::default(),
            ble: BleSettings::default(),
            command_palette: default_palette(),
            notification_limit: default_notification_limit(),
        }
    }
}

fn default_palette() -> Vec<u32> {
    // Red, green, blue
    vec![0xFF00_0080, 0x00FF_0080, 0x0000_FF80]
}
fn default_notification_limit() -> u32 {
    6
}

pub struct SettingsService {
    settings: Settings,
    settings_path: PathBuf,
}

impl SettingsService {
    pub fn new() -> anyhow::Result<Self> {
        let settings_path = Self::get_settings_path()?;
        Ok(Self::with_path(settings_path))
    }

    /// Load from an explicit file, falling back to defaults if it is missing
    /// or unreadable.
    pub fn with_path(settings_path: PathBuf) -> Self {
        let settings = Self::load_from_file(&settings_path).unwrap_or_default();
        Self {
            settings,
            settings_path,
        }
    }

    fn get_settings_path() -> anyhow::Result<PathBuf> {
        let mut path = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        path.push("BleNotifyClient");
        fs::create_dir_all(&path)?;
        path.push("settings.json");
        Ok(path)
    }

    fn load_from_file(path: &Path) -> anyhow::Result<Settings> {
        let contents = fs::read_to_string(path)?;
        let settings = serde_json::from_str(&contents)?;
        Ok(settings)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(&self.settings)?;
        fs::write(&self.settings_path, json)?;
        Ok(())
    }

    pub fn get(&self) -> &Settings {
        &self.settings
    }

    pub fn get_mut(&mut self) -> &mut Settings {
        &mut self.settings
    }

    pub fn path(&self) -> &Path {
        &self.settings_path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, r#"{ "ble": { "device_uuid": "0000feed-0000-1000-8000-00805f9b34fb" } }"#)
            .unwrap();

        let service = SettingsService::with_path(path);
        let settings = service.get();

        assert_eq!(settings.ble.device_uuid, "0000feed-0000-1000-8000-00805f9b34fb");
        assert_eq!(settings.ble.service_name, "org.bluez");
        assert_eq!(settings.ble.read_char_uuid, READ_CHAR_UUID);
        assert_eq!(settings.notification_limit, 6);
        assert_eq!(settings.command_palette.len(), 3);
        assert_eq!(settings.log_settings.level, "info");
    }

    #[test]
    fn test_saved_changes_survive_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");

        let mut service = SettingsService::with_path(path.clone());
        service.get_mut().notification_limit = 12;
        service.get_mut().log_settings.rotation = "hourly".into();
        service.save().unwrap();

        let reloaded = SettingsService::with_path(path);
        assert_eq!(reloaded.get().notification_limit, 12);
        assert_eq!(reloaded.get().log_settings.rotation, "hourly");
    }

    #[test]
    fn test_corrupt_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, "{ not json").unwrap();

        let service = SettingsService::with_path(path);
        assert_eq!(service.get().ble, BleSettings::default());
    }

    #[test]
    fn test_ble_defaults_target_bluez() {
        let ble = BleSettings::default();

        assert_eq!(ble.service_name, BLUEZ_SERVICE);
        assert_eq!(ble.base_path, "/org/bluez");
        assert_eq!(ble.root_path, "/");
        assert_eq!(ble.device_uuid, DEVICE_UUID);
        assert_eq!(ble.write_char_uuid, WRITE_CHAR_UUID);
    }
}
