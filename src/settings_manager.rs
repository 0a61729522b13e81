use serde::{Deserialize, Serialize};
use std::fs::{self, create_dir_all};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct AppSettings {
  /// Executable that establishes the tunnel.
  #[serde(default = "default_worker_binary")]
  pub worker_binary: PathBuf,
  /// Privilege escalation prefix placed before the worker binary. Empty runs
  /// the worker directly (useful when already root).
  #[serde(default = "default_elevation")]
  pub elevation: Vec<String>,
  #[serde(default = "default_connect_timeout_secs")]
  pub connect_timeout_secs: u64,
  #[serde(default = "default_terminate_grace_ms")]
  pub terminate_grace_ms: u64,
  /// Read-only profiles shared by all users of the machine.
  #[serde(default = "default_global_profiles_path")]
  pub global_profiles_path: Option<PathBuf>,
  #[serde(default = "default_log_level")]
  pub log_level: String, // "error", "warn", "info", "debug" or "trace"
}

fn default_worker_binary() -> PathBuf {
  PathBuf::from("openfortivpn")
}

fn default_elevation() -> Vec<String> {
  vec!["sudo".to_string(), "-n".to_string(), "--".to_string()]
}

fn default_connect_timeout_secs() -> u64 {
  30
}

fn default_terminate_grace_ms() -> u64 {
  3000
}

fn default_global_profiles_path() -> Option<PathBuf> {
  Some(PathBuf::from("/etc/vpnkeeper/profiles.json"))
}

fn default_log_level() -> String {
  "info".to_string()
}

impl Default for AppSettings {
  fn default() -> Self {
    Self {
      worker_binary: default_worker_binary(),
      elevation: default_elevation(),
      connect_timeout_secs: default_connect_timeout_secs(),
      terminate_grace_ms: default_terminate_grace_ms(),
      global_profiles_path: default_global_profiles_path(),
      log_level: default_log_level(),
    }
  }
}

impl AppSettings {
  pub fn connect_timeout(&self) -> Duration {
    Duration::from_secs(self.connect_timeout_secs.max(1))
  }

  pub fn terminate_grace(&self) -> Duration {
    Duration::from_millis(self.terminate_grace_ms)
  }

  pub fn log_level_filter(&self) -> log::LevelFilter {
    self.log_level.parse().unwrap_or(log::LevelFilter::Info)
  }
}

pub struct SettingsManager {
  settings_dir: PathBuf,
}

impl Default for SettingsManager {
  fn default() -> Self {
    Self::new()
  }
}

impl SettingsManager {
  pub fn new() -> Self {
    Self {
      settings_dir: crate::app_dirs::settings_dir(),
    }
  }

  pub fn with_dir(dir: &Path) -> Self {
    Self {
      settings_dir: dir.to_path_buf(),
    }
  }

  pub fn get_settings_file(&self) -> PathBuf {
    self.settings_dir.join("app_settings.json")
  }

  /// Never fails: a missing or corrupt file yields defaults, which are
  /// written back so the operator sees every available key.
  pub fn load_settings(&self) -> AppSettings {
    let settings_file = self.get_settings_file();

    if !settings_file.exists() {
      return AppSettings::default();
    }

    let content = match fs::read_to_string(&settings_file) {
      Ok(content) => content,
      Err(e) => {
        log::warn!("Failed to read settings file, using defaults: {e}");
        return AppSettings::default();
      }
    };

    // Parse the settings file - serde will use default values for missing fields
    match serde_json::from_str::<AppSettings>(&content) {
      Ok(settings) => {
        if let Err(e) = self.save_settings(&settings) {
          log::warn!("Failed to update settings file with defaults: {e}");
        }
        settings
      }
      Err(e) => {
        log::warn!("Failed to parse settings file, using defaults: {e}");
        let default_settings = AppSettings::default();

        if let Err(save_error) = self.save_settings(&default_settings) {
          log::warn!("Failed to save default settings: {save_error}");
        }

        default_settings
      }
    }
  }

  pub fn save_settings(&self, settings: &AppSettings) -> Result<(), Box<dyn std::error::Error>> {
    create_dir_all(&self.settings_dir)?;

    let json = serde_json::to_string_pretty(settings)?;
    fs::write(self.get_settings_file(), json)?;
    Ok(())
  }
}
