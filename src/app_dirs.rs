use directories::BaseDirs;
use std::path::PathBuf;
use std::sync::OnceLock;

static BASE_DIRS: OnceLock<Option<BaseDirs>> = OnceLock::new();

fn base_dirs() -> Option<&'static BaseDirs> {
  BASE_DIRS.get_or_init(BaseDirs::new).as_ref()
}

pub fn app_name() -> &'static str {
  if cfg!(debug_assertions) {
    "vpnkeeper-dev"
  } else {
    "vpnkeeper"
  }
}

pub fn data_dir() -> PathBuf {
  #[cfg(test)]
  {
    if let Some(dir) = TEST_DATA_DIR.with(|cell| cell.borrow().clone()) {
      return dir;
    }
  }

  if let Ok(dir) = std::env::var("VPNKEEPER_DATA_DIR") {
    return PathBuf::from(dir);
  }

  match base_dirs() {
    Some(dirs) => dirs.data_local_dir().join(app_name()),
    None => std::env::temp_dir().join(app_name()),
  }
}

/// Default location of the local profile store.
pub fn store_file() -> PathBuf {
  data_dir().join("profiles.json")
}

pub fn settings_dir() -> PathBuf {
  data_dir().join("settings")
}

pub fn log_file() -> PathBuf {
  data_dir().join(format!("{}.log", app_name()))
}

/// Control socket of the running instance.
pub fn control_socket() -> PathBuf {
  data_dir().join(format!("{}.sock", app_name()))
}

/// Name of the system-wide instance lock.
pub fn instance_lock_name() -> String {
  format!("{}.instance", app_name())
}

#[cfg(test)]
thread_local! {
  static TEST_DATA_DIR: std::cell::RefCell<Option<PathBuf>> = const { std::cell::RefCell::new(None) };
}

#[cfg(test)]
pub struct TestDirGuard;

#[cfg(test)]
impl Drop for TestDirGuard {
  fn drop(&mut self) {
    TEST_DATA_DIR.with(|cell| *cell.borrow_mut() = None);
  }
}

#[cfg(test)]
pub fn set_test_data_dir(dir: PathBuf) -> TestDirGuard {
  TEST_DATA_DIR.with(|cell| *cell.borrow_mut() = Some(dir));
  TestDirGuard
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_app_name() {
    let name = app_name();
    assert!(
      name == "vpnkeeper" || name == "vpnkeeper-dev",
      "app_name should be vpnkeeper or vpnkeeper-dev, got: {name}"
    );
  }

  #[test]
  fn test_file_helpers_live_in_data_dir() {
    let tmp = PathBuf::from("/tmp/test-vpnkeeper-data");
    let _guard = set_test_data_dir(tmp.clone());
    assert_eq!(store_file(), tmp.join("profiles.json"));
    assert_eq!(settings_dir(), tmp.join("settings"));
    assert!(log_file().starts_with(&tmp));
    assert!(control_socket().starts_with(&tmp));
  }

  #[test]
  fn test_guard_cleanup() {
    let original = data_dir();
    {
      let _guard = set_test_data_dir(PathBuf::from("/tmp/test-vpnkeeper-cleanup"));
      assert_eq!(data_dir(), PathBuf::from("/tmp/test-vpnkeeper-cleanup"));
    }
    assert_eq!(data_dir(), original);
  }
}
